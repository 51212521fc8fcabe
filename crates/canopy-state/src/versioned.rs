use std::collections::HashMap;
use std::sync::RwLock;

use canopy_types::{Keypath, Version};

use crate::error::{StateError, StateResult};
use crate::memory::MemoryNode;

/// A versioned state tree: the committed current state plus named
/// checkpoints.
///
/// Readers take copy-on-write snapshots and never block the writer. Writers
/// stage changes on a [`writable`] working copy and [`commit`] it; committing
/// consumes the working copy so a committed backing is never mutated again
/// (checkpoints stay stable by construction).
///
/// [`writable`]: StateTree::writable
/// [`commit`]: StateTree::commit
#[derive(Default)]
pub struct StateTree {
    current: RwLock<MemoryNode>,
    versions: RwLock<HashMap<Version, MemoryNode>>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only snapshot of the given version; `None` (or the
    /// [`Version::current`] sentinel) reads the current state.
    pub fn state_at_version(&self, version: Option<&Version>) -> StateResult<MemoryNode> {
        match version {
            None => Ok(self.snapshot_current()),
            Some(v) if *v == Version::current() => Ok(self.snapshot_current()),
            Some(v) => {
                let versions = self.versions.read().expect("state lock poisoned");
                let node = versions.get(v).ok_or(StateError::UnknownVersion(*v))?;
                Ok(node
                    .copy_to_memory(&Keypath::root(), None)
                    .expect("root snapshot cannot fail"))
            }
        }
    }

    /// A writable working copy of the current state, with a clean diff.
    ///
    /// The copy is detached immediately so that cursors repositioned into it
    /// share its backing: resolvers mutate subtree cursors and the working
    /// copy must observe those writes.
    pub fn writable(&self) -> MemoryNode {
        let mut node = self.snapshot_current();
        node.detach();
        node
    }

    /// Commit a working copy as the new current state.
    ///
    /// Taking the node by value is what keeps committed backings immutable:
    /// no handle to the working copy survives the commit.
    pub fn commit(&self, mut node: MemoryNode) {
        node.reset_diff();
        *self.current.write().expect("state lock poisoned") = node;
    }

    /// Checkpoint: record the state at `from` (default current) under
    /// `new_version`.
    pub fn copy_version(&self, new_version: Version, from: Option<&Version>) -> StateResult<()> {
        let snapshot = self.state_at_version(from)?;
        self.versions
            .write()
            .expect("state lock poisoned")
            .insert(new_version, snapshot);
        Ok(())
    }

    /// Returns `true` if the named checkpoint exists.
    pub fn have_version(&self, version: &Version) -> bool {
        *version == Version::current()
            || self
                .versions
                .read()
                .expect("state lock poisoned")
                .contains_key(version)
    }

    fn snapshot_current(&self) -> MemoryNode {
        self.current
            .read()
            .expect("state lock poisoned")
            .copy_to_memory(&Keypath::root(), None)
            .expect("root snapshot cannot fail")
    }
}

/// Lazily-built secondary indices, keyed by `(version, keypath, index name)`.
#[derive(Default)]
pub struct IndexStore {
    indices: RwLock<HashMap<(Version, Keypath, String), MemoryNode>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index node, if it has been built for this version.
    pub fn index_at_version(
        &self,
        version: &Version,
        keypath: &Keypath,
        index_name: &str,
    ) -> Option<MemoryNode> {
        let indices = self.indices.read().expect("index lock poisoned");
        let node = indices.get(&(*version, keypath.clone(), index_name.to_string()))?;
        Some(
            node.copy_to_memory(&Keypath::root(), None)
                .expect("root snapshot cannot fail"),
        )
    }

    /// Record a freshly-built index node.
    pub fn store_index(
        &self,
        version: Version,
        keypath: Keypath,
        index_name: String,
        node: MemoryNode,
    ) {
        self.indices
            .write()
            .expect("index lock poisoned")
            .insert((version, keypath, index_name), node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::Value;

    fn kp(s: &str) -> Keypath {
        Keypath::from(s)
    }

    #[test]
    fn writable_commit_read_back() {
        let tree = StateTree::new();
        let mut state = tree.writable();
        state.set(&kp("a"), None, Value::Uint(1)).unwrap();
        tree.commit(state);

        let read = tree.state_at_version(None).unwrap();
        assert_eq!(read.uint_value(&kp("a")), Some(1));
    }

    #[test]
    fn uncommitted_changes_are_invisible() {
        let tree = StateTree::new();
        let mut state = tree.writable();
        state.set(&kp("a"), None, Value::Uint(1)).unwrap();

        let read = tree.state_at_version(None).unwrap();
        assert_eq!(read.uint_value(&kp("a")), None);
    }

    #[test]
    fn committed_diff_starts_clean() {
        let tree = StateTree::new();
        let mut state = tree.writable();
        state.set(&kp("a"), None, Value::Uint(1)).unwrap();
        tree.commit(state);

        let next = tree.writable();
        assert!(next.diff().is_empty());
    }

    #[test]
    fn checkpoint_is_stable_across_later_commits() {
        let tree = StateTree::new();
        let mut state = tree.writable();
        state.set(&kp("a"), None, Value::Uint(1)).unwrap();
        tree.commit(state);

        let v1 = Version::from_bytes([1u8; 32]);
        tree.copy_version(v1, None).unwrap();

        let mut state = tree.writable();
        state.set(&kp("a"), None, Value::Uint(2)).unwrap();
        tree.commit(state);

        let old = tree.state_at_version(Some(&v1)).unwrap();
        assert_eq!(old.uint_value(&kp("a")), Some(1));
        let new = tree.state_at_version(None).unwrap();
        assert_eq!(new.uint_value(&kp("a")), Some(2));
    }

    #[test]
    fn unknown_version_errors() {
        let tree = StateTree::new();
        let err = tree
            .state_at_version(Some(&Version::from_bytes([9u8; 32])))
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownVersion(_)));
    }

    #[test]
    fn current_sentinel_reads_current() {
        let tree = StateTree::new();
        let mut state = tree.writable();
        state.set(&kp("k"), None, Value::Bool(true)).unwrap();
        tree.commit(state);

        let read = tree.state_at_version(Some(&Version::current())).unwrap();
        assert_eq!(read.value(&kp("k"), None).unwrap(), Some(Value::Bool(true)));
        assert!(tree.have_version(&Version::current()));
    }

    #[test]
    fn index_store_roundtrip() {
        let store = IndexStore::new();
        let version = Version::current();
        assert!(store.index_at_version(&version, &kp("room"), "by-name").is_none());

        let mut index = MemoryNode::new();
        index.set(&kp("alice"), None, Value::String("members[0]".into())).unwrap();
        store.store_index(version, kp("room"), "by-name".into(), index);

        let read = store
            .index_at_version(&version, &kp("room"), "by-name")
            .unwrap();
        assert_eq!(read.string_value(&kp("alice")), Some("members[0]".into()));
    }
}
