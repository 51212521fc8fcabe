//! Merge strategies, access control, and indexing for canopy documents.
//!
//! The [`BehaviorTree`] is an ordered registry keyed by keypath prefix:
//! every registered prefix has exactly one [`Resolver`], zero or more
//! [`Validator`]s, and zero or more named [`Indexer`]s. The controller
//! processes plugins deepest prefix first, peeling off the patches under
//! each prefix and handing them over with relativized keypaths.
//!
//! Plugins are configured *from document state*: a subtree's `Merge-Type`,
//! `Validator`, and `Indexes/<name>` children hold configs whose
//! `Content-Type` names a constructor in the [`PluginRegistry`].

pub mod error;
pub mod indexer;
pub mod registry;
pub mod resolver;
pub mod tree;
pub mod validator;

pub use error::{BehaviorError, BehaviorResult};
pub use indexer::KeypathIndexer;
pub use registry::PluginRegistry;
pub use resolver::{LastWriterResolver, Resolver};
pub use tree::BehaviorTree;
pub use validator::{PermissionsValidator, Validator};

use canopy_state::MemoryNode;
use canopy_types::Value;

/// Builds a secondary index over a subtree: a map from query parameter to
/// the location of the matching content.
pub trait Indexer: Send + Sync {
    fn build_index(&self, state: &MemoryNode) -> BehaviorResult<Value>;
}
