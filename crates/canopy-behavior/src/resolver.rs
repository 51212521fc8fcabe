use canopy_state::MemoryNode;
use canopy_tx::Patch;
use canopy_types::{Address, TxId};

use crate::error::BehaviorResult;

/// Merges a tx's patches into a subtree.
///
/// A resolver may inspect the whole subtree it is mounted on, but must be
/// deterministic given the subtree state and the patches.
pub trait Resolver: Send + Sync {
    fn resolve_state(
        &self,
        state: &mut MemoryNode,
        from: Address,
        tx_id: TxId,
        parents: &[TxId],
        patches: &[Patch],
    ) -> BehaviorResult<()>;
}

impl std::fmt::Debug for dyn Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Resolver")
    }
}

/// The default merge strategy: apply patches in order, last writer wins.
///
/// Mounted at the root keypath of every controller; richer strategies are
/// mounted by `Merge-Type` configs.
#[derive(Debug, Default)]
pub struct LastWriterResolver;

impl Resolver for LastWriterResolver {
    fn resolve_state(
        &self,
        state: &mut MemoryNode,
        _from: Address,
        _tx_id: TxId,
        _parents: &[TxId],
        patches: &[Patch],
    ) -> BehaviorResult<()> {
        for patch in patches {
            state.set(&patch.keypath, patch.range, patch.val.clone())?;
        }
        Ok(())
    }
}
