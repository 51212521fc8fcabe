use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use canopy_crypto::{keccak256, CryptoError, Signature, SigningKeypair};
use canopy_types::{Address, Hash, TxId};

use crate::patch::Patch;

/// A signed, parented transaction: the unit of replication.
///
/// Txs form a per-state-URI DAG through `parents`. A non-empty `recipients`
/// list marks the tx private: it is delivered only to those addresses and
/// its patches are rooted under [`private_root_key_for_recipients`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tx {
    pub id: TxId,
    pub parents: Vec<TxId>,
    pub from: Address,
    #[serde(default, skip_serializing_if = "Signature::is_empty")]
    pub sig: Signature,
    #[serde(rename = "url")]
    pub state_uri: String,
    pub patches: Vec<Patch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<Address>,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub valid: bool,
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

impl Tx {
    pub fn new(id: TxId, parents: Vec<TxId>, from: Address, state_uri: &str, patches: Vec<Patch>) -> Self {
        Self {
            id,
            parents,
            from,
            sig: Signature::default(),
            state_uri: state_uri.to_string(),
            patches,
            recipients: Vec::new(),
            checkpoint: false,
            valid: false,
            hash: OnceLock::new(),
        }
    }

    /// The genesis tx for a state URI: the well-known ID, no parents, no
    /// signature.
    pub fn genesis(state_uri: &str, patches: Vec<Patch>) -> Self {
        Self::new(TxId::genesis(), Vec::new(), Address::zero(), state_uri, patches)
    }

    pub fn is_genesis(&self) -> bool {
        self.id == TxId::genesis()
    }

    pub fn is_private(&self) -> bool {
        !self.recipients.is_empty()
    }

    /// The canonical hash: Keccak-256 over
    /// `id ‖ parents ‖ state URI ‖ patch text ‖ recipients`.
    ///
    /// The `checkpoint` flag and the signature itself are excluded. Computed
    /// lazily and memoized.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(self.id.as_bytes());
            for parent in &self.parents {
                bytes.extend_from_slice(parent.as_bytes());
            }
            bytes.extend_from_slice(self.state_uri.as_bytes());
            for patch in &self.patches {
                bytes.extend_from_slice(patch.to_string().as_bytes());
            }
            for recipient in &self.recipients {
                bytes.extend_from_slice(recipient.as_bytes());
            }
            keccak256(&bytes)
        })
    }

    /// Sign the canonical hash, filling `sig`.
    pub fn sign_with(&mut self, keypair: &SigningKeypair) -> Result<(), CryptoError> {
        self.sig = keypair.sign_hash(&self.hash())?;
        Ok(())
    }

    /// The private root keypath string for this tx's recipients.
    pub fn private_root_key(&self) -> String {
        private_root_key_for_recipients(&self.recipients)
    }
}

/// The subtree root a private tx addresses:
/// `"private-" + hex(keccak256(concat(sorted recipient addresses)))`.
/// Sorting makes the key independent of the order recipients were listed in.
pub fn private_root_key_for_recipients(recipients: &[Address]) -> String {
    let mut sorted: Vec<&Address> = recipients.iter().collect();
    sorted.sort();
    let mut bytes = Vec::with_capacity(sorted.len() * 20);
    for addr in sorted {
        bytes.extend_from_slice(addr.as_bytes());
    }
    format!("private-{}", keccak256(&bytes).to_hex())
}
