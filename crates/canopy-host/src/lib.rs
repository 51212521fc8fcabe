//! The canopy host: the orchestrator that ties controllers, transports, and
//! the ref store into a gossiping peer.
//!
//! A [`Host`] multiplexes any number of [`Transport`]s, keeps outbound
//! subscriptions alive, rebroadcasts txs to subscribers that have not seen
//! them, routes private txs to verified recipients via sealed boxes, and
//! fetches missing refs in the background.

pub mod error;
pub mod host;
pub mod links;
pub mod peer_store;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use error::{HostError, HostResult};
pub use host::Host;
pub use links::{parse_link, refs_in_diff, Link};
pub use peer_store::{PeerStore, StoredPeer};
pub use transport::{
    AckHandler, BoxFuture, FetchHistoryHandler, FetchRefHandler, Peer, PeerHandle, PeerTuple,
    PrivateTxHandler, Transport, TxHandler, VerifyAddressHandler,
};
