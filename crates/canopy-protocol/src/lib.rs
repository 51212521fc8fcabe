//! The canopy wire protocol: length-prefixed JSON messages.
//!
//! Every peer connection carries a stream of [`Msg`] frames: a little-endian
//! u64 byte length followed by the JSON body, tagged
//! `{"type": ..., "payload": ...}`. Large blobs move as `fetch ref
//! response` header/body chunk sequences of at most [`REF_CHUNK_SIZE`]
//! bytes.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, encode, read_msg, write_msg, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    EncryptedTx, FetchRefResponse, FetchRefResponseBody, FetchRefResponseHeader, Msg,
    VerifyAddressResponse, REF_CHUNK_SIZE,
};
