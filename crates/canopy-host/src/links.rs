use std::collections::HashSet;

use canopy_controller::{INDEXES_KEY, MERGE_TYPE_KEY, VALIDATOR_KEY};
use canopy_state::MemoryNode;
use canopy_types::{Hash, Keypath};

/// A leaf string of this form references a content-addressed blob.
pub const REF_LINK_PREFIX: &str = "ref:";
/// A leaf string of this form references another document keypath.
pub const STATE_LINK_PREFIX: &str = "state:";

/// The kinds of links a document leaf can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Link {
    Ref(Hash),
    Path(String),
    None,
}

/// Classify a leaf string.
pub fn parse_link(s: &str) -> Link {
    if let Some(hex) = s.strip_prefix(REF_LINK_PREFIX) {
        match Hash::from_hex(hex) {
            Ok(hash) => Link::Ref(hash),
            Err(_) => Link::None,
        }
    } else if let Some(path) = s.strip_prefix(STATE_LINK_PREFIX) {
        Link::Path(path.to_string())
    } else {
        Link::None
    }
}

/// Returns `true` if the keypath sits inside a plugin config subtree
/// (`Merge-Type`, `Validator`, or `Indexes`). Refs there are critical: the
/// controller cannot honor the document's semantics without them.
pub fn is_plugin_config_keypath(keypath: &Keypath) -> bool {
    keypath.parts().iter().any(|part| {
        matches!(
            String::from_utf8_lossy(part.as_bytes()).as_ref(),
            MERGE_TYPE_KEY | VALIDATOR_KEY | INDEXES_KEY
        )
    })
}

/// Ref links among the diff's added keypaths: `(all, critical)`, each
/// deduplicated and sorted.
pub fn refs_in_diff(state: &MemoryNode) -> (Vec<Hash>, Vec<Hash>) {
    let mut all = HashSet::new();
    let mut critical = HashSet::new();

    for keypath in state.diff().added() {
        let Some(leaf) = state.string_value(keypath) else {
            continue;
        };
        if let Link::Ref(hash) = parse_link(&leaf) {
            all.insert(hash);
            if is_plugin_config_keypath(keypath) {
                critical.insert(hash);
            }
        }
    }

    let mut all: Vec<Hash> = all.into_iter().collect();
    all.sort();
    let mut critical: Vec<Hash> = critical.into_iter().collect();
    critical.sort();
    (all, critical)
}
