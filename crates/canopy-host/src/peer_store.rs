use std::collections::HashMap;
use std::sync::RwLock;

use canopy_crypto::{EncryptingPublicKey, SigningPublicKey};
use canopy_types::Address;

use crate::transport::PeerTuple;

/// A peer the host has verified credentials for.
#[derive(Clone)]
pub struct StoredPeer {
    pub tuple: PeerTuple,
    pub address: Option<Address>,
    pub signing_pubkey: Option<SigningPublicKey>,
    pub encrypting_pubkey: Option<EncryptingPublicKey>,
}

/// Known peers keyed by `(transport, reachable address)`.
///
/// Reachable addresses are recorded as soon as a peer is dialed; signing and
/// encrypting keys only after a successful identity challenge.
#[derive(Default)]
pub struct PeerStore {
    peers: RwLock<HashMap<PeerTuple, StoredPeer>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reachable_address(&self, tuple: PeerTuple) {
        self.peers
            .write()
            .expect("peer store lock poisoned")
            .entry(tuple.clone())
            .or_insert(StoredPeer {
                tuple,
                address: None,
                signing_pubkey: None,
                encrypting_pubkey: None,
            });
    }

    pub fn add_verified_credentials(
        &self,
        tuple: PeerTuple,
        address: Address,
        signing_pubkey: SigningPublicKey,
        encrypting_pubkey: EncryptingPublicKey,
    ) {
        let mut peers = self.peers.write().expect("peer store lock poisoned");
        let entry = peers.entry(tuple.clone()).or_insert(StoredPeer {
            tuple,
            address: None,
            signing_pubkey: None,
            encrypting_pubkey: None,
        });
        entry.address = Some(address);
        entry.signing_pubkey = Some(signing_pubkey);
        entry.encrypting_pubkey = Some(encrypting_pubkey);
    }

    /// Verified peers claiming the given address.
    pub fn peers_with_address(&self, address: &Address) -> Vec<StoredPeer> {
        self.peers
            .read()
            .expect("peer store lock poisoned")
            .values()
            .filter(|p| p.address.as_ref() == Some(address))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
