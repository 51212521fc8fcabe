use thiserror::Error;

use canopy_controller::ControllerError;
use canopy_crypto::CryptoError;
use canopy_protocol::ProtocolError;
use canopy_refstore::RefStoreError;
use canopy_types::Address;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unsigned tx")]
    UnsignedTx,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer is self")]
    PeerIsSelf,

    #[error("no peers provide state uri {0}")]
    NoPeersForStateUri(String),

    #[error("could not reach recipient {0}")]
    RecipientUnreachable(Address),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    RefStore(#[from] RefStoreError),

    #[error(transparent)]
    Wire(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
