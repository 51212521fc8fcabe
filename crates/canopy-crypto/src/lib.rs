//! Cryptographic capabilities for canopy hosts.
//!
//! Three capabilities, matching what the replication engine requires and
//! nothing more:
//!
//! - [`SigningKeypair`] — ECDSA over secp256k1 with public-key *recovery*,
//!   so a tx carries only `(hash, sig)` and the signer's [`Address`] is
//!   derived, never trusted from the payload.
//! - [`EncryptingKeypair`] — authenticated encryption to a recipient public
//!   key (NaCl box), used to seal private txs.
//! - [`keccak256`] / [`Keccak256Hasher`] — the content digest for refs and
//!   canonical tx hashes.
//!
//! [`Address`]: canopy_types::Address

pub mod encrypt;
pub mod error;
pub mod hasher;
pub mod signer;

pub use encrypt::{EncryptingKeypair, EncryptingPublicKey};
pub use error::CryptoError;
pub use hasher::{keccak256, Keccak256Hasher};
pub use signer::{
    generate_challenge, recover_signing_pubkey, Signature, SigningKeypair, SigningPublicKey,
};
