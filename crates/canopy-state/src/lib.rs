//! The canopy state tree: an in-memory, copy-on-write document store
//! addressed by keypath.
//!
//! A document is a tree of maps, ordered sequences, and leaf values. The
//! tree keeps four parallel structures keyed by absolute keypath (the sorted
//! keypath list, leaf values, node kinds, sequence lengths) plus a
//! [`Diff`] of keypaths added and removed since the last reset.
//!
//! [`MemoryNode`] is a cursor into the tree; [`StateTree`] layers committed
//! versions and checkpoints on top so readers get stable snapshots while a
//! single writer stages the next transaction.

pub mod diff;
pub mod error;
pub mod memory;
pub mod versioned;

pub use diff::Diff;
pub use error::{StateError, StateResult};
pub use memory::{DepthFirstIterator, MemoryNode, NodeInfo, NodeType, ValueKind};
pub use versioned::{IndexStore, StateTree};
