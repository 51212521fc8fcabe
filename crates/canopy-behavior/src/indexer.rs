use std::collections::BTreeMap;

use canopy_state::MemoryNode;
use canopy_tx::canonical_keypath_string;
use canopy_types::{Keypath, Value};

use crate::error::{BehaviorError, BehaviorResult};
use crate::Indexer;

/// Indexes a subtree's children by the value of a field inside each child.
///
/// Config shape (mounted at `Indexes/<name>`):
///
/// ```json
/// { "Content-Type": "indexer/keypath", "keypath": "sender" }
/// ```
///
/// The built index maps each observed field value to the canonical keypath
/// of the child holding it (later children win on collisions).
pub struct KeypathIndexer {
    field: Keypath,
}

impl KeypathIndexer {
    pub fn new(field: Keypath) -> Self {
        Self { field }
    }

    pub fn from_config(config: &Value) -> BehaviorResult<Self> {
        let field = config
            .get("keypath")
            .and_then(Value::as_str)
            .ok_or_else(|| BehaviorError::BadConfig("missing 'keypath' field".into()))?;
        Ok(Self::new(Keypath::from(field)))
    }
}

impl Indexer for KeypathIndexer {
    fn build_index(&self, state: &MemoryNode) -> BehaviorResult<Value> {
        let mut index = BTreeMap::new();
        for child in state.subkeys() {
            let node = state.at_keypath(&child, None);
            if let Some(key) = node.string_value(&self.field) {
                index.insert(key, Value::String(canonical_keypath_string(&child)));
            }
        }
        Ok(Value::Map(index))
    }
}
