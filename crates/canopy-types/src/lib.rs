//! Foundation types for the canopy state-synchronization engine.
//!
//! This crate provides the identity, addressing, and document-model types
//! used throughout the canopy system. Every other canopy crate depends on
//! `canopy-types`.
//!
//! # Key Types
//!
//! - [`Keypath`] — Byte-encoded path addressing a node in a document tree
//! - [`Range`] — Half-open `[start, end)` interval over sequence indices
//! - [`Value`] — JSON-shaped variant held at document leaves and subtrees
//! - [`Hash`] — Keccak-256 digest (content addresses, tx hashes)
//! - [`Address`] — 20-byte account address recovered from a signature
//! - [`TxId`] — Caller-supplied 32-byte transaction identifier
//! - [`Version`] — 32-byte state-tree version identifier

pub mod error;
pub mod id;
pub mod keypath;
pub mod value;

pub use error::TypeError;
pub use id::{Address, Hash, TxId, Version};
pub use keypath::{Keypath, Range, INDEX_PREFIX, KEYPATH_SEPARATOR};
pub use value::Value;
