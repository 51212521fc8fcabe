//! Content-addressed blob storage for canopy refs.
//!
//! A ref is an opaque binary blob addressed by its Keccak-256 hash. Blobs
//! land in a flat directory as `ref-<hex hash>`, written via a temp file
//! that streams through the hasher and is renamed into place on completion.
//! A `metadata.json` sidecar records each blob's content type.

pub mod error;
pub mod store;

pub use error::{RefStoreError, RefStoreResult};
pub use store::RefStore;
