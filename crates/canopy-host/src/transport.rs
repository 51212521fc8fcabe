use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use canopy_protocol::{EncryptedTx, Msg};
use canopy_tx::Tx;
use canopy_types::{Address, Hash, TxId};

use crate::error::HostResult;

/// Boxed future used by transport handler callbacks.
pub type BoxFuture<T = ()> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type PeerHandle = Arc<dyn Peer>;

pub type TxHandler = Arc<dyn Fn(Tx, PeerHandle) -> BoxFuture + Send + Sync>;
pub type PrivateTxHandler = Arc<dyn Fn(EncryptedTx, PeerHandle) -> BoxFuture + Send + Sync>;
pub type AckHandler = Arc<dyn Fn(TxId, PeerHandle) -> BoxFuture + Send + Sync>;
pub type VerifyAddressHandler = Arc<dyn Fn(Vec<u8>, PeerHandle) -> BoxFuture + Send + Sync>;
pub type FetchRefHandler = Arc<dyn Fn(Hash, PeerHandle) -> BoxFuture + Send + Sync>;
pub type FetchHistoryHandler = Arc<dyn Fn(String, PeerHandle) -> BoxFuture + Send + Sync>;

/// The `(transport name, reachable address)` identity pair used to
/// deduplicate peer instances across connections.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerTuple {
    pub transport_name: String,
    pub reachable_at: String,
}

/// One remote host as seen over one transport.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Stable identifier within the transport.
    fn id(&self) -> String;

    fn transport_name(&self) -> &str;

    /// The connection string this peer is reachable at.
    fn reachable_at(&self) -> String;

    /// The verified address, once a challenge has succeeded.
    fn address(&self) -> Option<Address>;

    fn set_address(&self, address: Address);

    async fn ensure_connected(&self) -> HostResult<()>;

    async fn write_msg(&self, msg: Msg) -> HostResult<()>;

    async fn read_msg(&self) -> HostResult<Msg>;

    async fn close_conn(&self) -> HostResult<()>;

    fn tuple(&self) -> PeerTuple {
        PeerTuple {
            transport_name: self.transport_name().to_string(),
            reachable_at: self.reachable_at(),
        }
    }
}

/// A message-passing surface the host multiplexes.
///
/// Discovery methods return channels of peers; producers must close the
/// channel when exhausted, and dropping the receiver is the consumer's
/// early-stop signal.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> HostResult<()>;

    fn set_tx_handler(&self, handler: TxHandler);
    fn set_private_tx_handler(&self, handler: PrivateTxHandler);
    fn set_ack_handler(&self, handler: AckHandler);
    fn set_verify_address_handler(&self, handler: VerifyAddressHandler);
    fn set_fetch_ref_handler(&self, handler: FetchRefHandler);
    fn set_fetch_history_handler(&self, handler: FetchHistoryHandler);

    /// A peer handle for an explicit connection string.
    async fn get_peer_by_conn_strings(&self, reachable_at: &str) -> HostResult<PeerHandle>;

    /// Peers willing to serve a state URI.
    async fn providers_of_state_uri(&self, state_uri: &str)
        -> HostResult<mpsc::Receiver<PeerHandle>>;

    /// Peers holding a content-addressed ref.
    async fn providers_of_ref(&self, hash: &Hash) -> HostResult<mpsc::Receiver<PeerHandle>>;

    /// Peers currently subscribed to a state URI through us.
    async fn subscribers_to_state_uri(
        &self,
        state_uri: &str,
    ) -> HostResult<mpsc::Receiver<PeerHandle>>;

    /// Peers claiming to own an address (unverified; the host runs the
    /// challenge).
    async fn peers_claiming_address(
        &self,
        address: &Address,
    ) -> HostResult<mpsc::Receiver<PeerHandle>>;

    /// Advertise that we now hold a ref.
    async fn announce_ref(&self, hash: &Hash) -> HostResult<()>;
}
