use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::trace;

use canopy_types::{Keypath, Range, Value};

use crate::diff::Diff;
use crate::error::{StateError, StateResult};

/// Kind of a node in the state tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    Map,
    Slice,
    Value,
}

/// Kind of the value held at a `NodeType::Value` node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Uint,
    Int,
    Float,
    String,
    Bytes,
}

/// Node kind, value kind, and length, as reported by [`MemoryNode::node_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub value_kind: Option<ValueKind>,
    pub length: u64,
}

/// The shared backing of a state tree: four parallel structures keyed by
/// absolute keypath, plus the diff.
///
/// The keypath list is kept sorted; the contiguous run of keypaths sharing a
/// byte prefix is located by binary search and then filtered on segment
/// boundaries.
#[derive(Clone, Debug, Default)]
struct Backing {
    keypaths: Vec<Keypath>,
    values: HashMap<Keypath, Value>,
    node_types: HashMap<Keypath, NodeType>,
    slice_lengths: HashMap<Keypath, u64>,
    diff: Diff,
}

impl Backing {
    /// Index range of keypaths whose raw bytes start with `prefix`'s bytes.
    /// Callers still need the segment-boundary check for true descendants.
    fn byte_prefix_run(&self, prefix: &Keypath) -> (usize, usize) {
        if prefix.is_root() {
            return (0, self.keypaths.len());
        }
        let start = self
            .keypaths
            .partition_point(|kp| kp.as_bytes() < prefix.as_bytes());
        let mut end = start;
        while end < self.keypaths.len() && self.keypaths[end].as_bytes().starts_with(prefix.as_bytes())
        {
            end += 1;
        }
        (start, end)
    }

    /// Visit every keypath at or under `prefix`, in sorted order.
    fn scan_prefix(&self, prefix: &Keypath, mut f: impl FnMut(&Keypath)) {
        let (start, end) = self.byte_prefix_run(prefix);
        for kp in &self.keypaths[start..end] {
            if kp.starts_with(prefix) {
                f(kp);
            }
        }
    }

    /// Merge already-collected new keypaths into the sorted list.
    fn insert_keypaths(&mut self, mut new: Vec<Keypath>) {
        if new.is_empty() {
            return;
        }
        new.sort();
        new.dedup();

        let old = std::mem::take(&mut self.keypaths);
        let mut merged = Vec::with_capacity(old.len() + new.len());
        let mut old_iter = old.into_iter().peekable();
        let mut new_iter = new.into_iter().peekable();
        loop {
            match (old_iter.peek(), new_iter.peek()) {
                (Some(a), Some(b)) => match a.cmp(b) {
                    std::cmp::Ordering::Less => merged.push(old_iter.next().unwrap()),
                    std::cmp::Ordering::Greater => merged.push(new_iter.next().unwrap()),
                    std::cmp::Ordering::Equal => {
                        merged.push(old_iter.next().unwrap());
                        new_iter.next();
                    }
                },
                (Some(_), None) => merged.push(old_iter.next().unwrap()),
                (None, Some(_)) => merged.push(new_iter.next().unwrap()),
                (None, None) => break,
            }
        }
        self.keypaths = merged;
    }

    /// Duplicate only the subtree under `prefix` (absolute keys preserved).
    fn copy_prefix(&self, prefix: &Keypath) -> Backing {
        let mut copy = Backing {
            diff: self.diff.clone(),
            ..Backing::default()
        };
        self.scan_prefix(prefix, |kp| {
            copy.keypaths.push(kp.clone());
            if let Some(nt) = self.node_types.get(kp) {
                copy.node_types.insert(kp.clone(), *nt);
                match nt {
                    NodeType::Value => {
                        if let Some(v) = self.values.get(kp) {
                            copy.values.insert(kp.clone(), v.clone());
                        }
                    }
                    NodeType::Slice => {
                        if let Some(len) = self.slice_lengths.get(kp) {
                            copy.slice_lengths.insert(kp.clone(), *len);
                        }
                    }
                    NodeType::Map => {}
                }
            }
        });
        copy
    }

    /// Remove the subtree rooted at `abs`. Returns the removed keypaths.
    fn delete_subtree(&mut self, abs: &Keypath) -> Vec<Keypath> {
        let (start, end) = self.byte_prefix_run(abs);
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for kp in &self.keypaths[start..end] {
            if kp.starts_with(abs) {
                removed.push(kp.clone());
            } else {
                kept.push(kp.clone());
            }
        }
        self.keypaths.splice(start..end, kept);
        for kp in &removed {
            self.values.remove(kp);
            self.node_types.remove(kp);
            self.slice_lengths.remove(kp);
        }
        self.diff.remove_many(removed.iter().cloned());
        removed
    }

    /// Insert a subtree rooted at `abs` without touching ancestors. The
    /// caller is responsible for `abs` being vacant.
    fn set_raw(&mut self, abs: &Keypath, value: &Value) {
        let mut entries = Vec::new();
        walk_value(abs, value, &mut entries);
        let mut new_keypaths = Vec::with_capacity(entries.len());
        for (kp, nt, leaf, slice_len) in entries {
            self.node_types.insert(kp.clone(), nt);
            if let Some(v) = leaf {
                self.values.insert(kp.clone(), v);
            }
            if let Some(len) = slice_len {
                self.slice_lengths.insert(kp.clone(), len);
            }
            new_keypaths.push(kp);
        }
        self.diff.add_many(new_keypaths.iter().cloned());
        self.insert_keypaths(new_keypaths);
    }
}

type WalkEntry = (Keypath, NodeType, Option<Value>, Option<u64>);

/// Emit one entry per node of `value`, rooted at `base`.
fn walk_value(base: &Keypath, value: &Value, out: &mut Vec<WalkEntry>) {
    match value {
        Value::Map(m) => {
            out.push((base.clone(), NodeType::Map, None, None));
            for (key, child) in m {
                walk_value(&base.push(&Keypath::from(key.as_str())), child, out);
            }
        }
        Value::Seq(s) => {
            out.push((base.clone(), NodeType::Slice, None, Some(s.len() as u64)));
            for (i, child) in s.iter().enumerate() {
                walk_value(&base.push_index(i as u64), child, out);
            }
        }
        leaf => out.push((base.clone(), NodeType::Value, Some(leaf.clone()), None)),
    }
}

fn value_kind(value: &Value) -> ValueKind {
    match value {
        Value::Null => ValueKind::Null,
        Value::Bool(_) => ValueKind::Bool,
        Value::Uint(_) => ValueKind::Uint,
        Value::Int(_) => ValueKind::Int,
        Value::Float(_) => ValueKind::Float,
        Value::String(_) => ValueKind::String,
        Value::Bytes(_) => ValueKind::Bytes,
        Value::Seq(_) | Value::Map(_) => unreachable!("containers are not leaf values"),
    }
}

/// A cursor into the state tree at some keypath, with an optional range.
///
/// Cursors created from the same tree share their backing structures.
/// [`copy_to_memory`] returns a copy-on-write cursor: the first mutation
/// duplicates only the subtree under the cursor, so snapshots pay only for
/// divergence.
///
/// [`copy_to_memory`]: MemoryNode::copy_to_memory
#[derive(Clone, Debug)]
pub struct MemoryNode {
    backing: Arc<RwLock<Backing>>,
    keypath: Keypath,
    range: Option<Range>,
    copied: bool,
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNode {
    /// A fresh, empty tree rooted at the root keypath.
    pub fn new() -> Self {
        Self {
            backing: Arc::new(RwLock::new(Backing::default())),
            keypath: Keypath::root(),
            range: None,
            copied: false,
        }
    }

    /// The cursor's absolute keypath.
    pub fn keypath(&self) -> &Keypath {
        &self.keypath
    }

    /// Reposition the cursor. The new cursor shares this one's backing.
    pub fn at_keypath(&self, keypath: &Keypath, rng: Option<Range>) -> MemoryNode {
        MemoryNode {
            backing: Arc::clone(&self.backing),
            keypath: self.keypath.push(keypath),
            range: rng,
            copied: self.copied,
        }
    }

    /// A copy-on-write snapshot of the subtree at `keypath`.
    pub fn copy_to_memory(&self, keypath: &Keypath, rng: Option<Range>) -> StateResult<MemoryNode> {
        let rng = self.resolve_range(rng)?;
        Ok(MemoryNode {
            backing: Arc::clone(&self.backing),
            keypath: self.keypath.push(keypath),
            range: rng,
            copied: true,
        })
    }

    fn resolve_range(&self, rng: Option<Range>) -> StateResult<Option<Range>> {
        let rng = match (rng, self.range) {
            (Some(_), Some(_)) => return Err(StateError::InvalidRange),
            (Some(r), None) => Some(r),
            (None, own) => own,
        };
        if let Some(r) = rng {
            if !r.valid() {
                return Err(StateError::InvalidRange);
            }
        }
        Ok(rng)
    }

    /// Sever sharing now instead of at the first mutation.
    ///
    /// Cursors taken from a detached node (via [`at_keypath`]) share its
    /// private backing, so mutations through them stay visible to the node.
    /// A transaction's working state relies on that.
    ///
    /// [`at_keypath`]: MemoryNode::at_keypath
    pub fn detach(&mut self) {
        self.check_copied();
    }

    fn check_copied(&mut self) {
        if !self.copied {
            return;
        }
        let fresh = self.backing.read().expect("state lock poisoned").copy_prefix(&self.keypath);
        trace!(keypath = %self.keypath, "copy-on-write fault");
        self.backing = Arc::new(RwLock::new(fresh));
        self.copied = false;
    }

    /// Returns `true` if a node exists at `keypath` (relative to the cursor).
    pub fn exists(&self, keypath: &Keypath) -> bool {
        let abs = self.keypath.push(keypath);
        self.backing
            .read()
            .expect("state lock poisoned")
            .node_types
            .contains_key(&abs)
    }

    /// Node kind, value kind, and length at the cursor's keypath.
    pub fn node_info(&self) -> StateResult<NodeInfo> {
        let b = self.backing.read().expect("state lock poisoned");
        match b.node_types.get(&self.keypath) {
            None => Err(StateError::NotFound),
            Some(NodeType::Map) => Ok(NodeInfo {
                node_type: NodeType::Map,
                value_kind: None,
                length: 0,
            }),
            Some(NodeType::Slice) => Ok(NodeInfo {
                node_type: NodeType::Slice,
                value_kind: None,
                length: b.slice_lengths.get(&self.keypath).copied().unwrap_or(0),
            }),
            Some(NodeType::Value) => {
                let v = b.values.get(&self.keypath).ok_or(StateError::NotFound)?;
                let length = match v {
                    Value::String(s) => s.len() as u64,
                    _ => 0,
                };
                Ok(NodeInfo {
                    node_type: NodeType::Value,
                    value_kind: Some(value_kind(v)),
                    length,
                })
            }
        }
    }

    /// Byte length of the content at the cursor (string length or sequence
    /// length; 0 otherwise).
    pub fn content_length(&self) -> u64 {
        self.node_info().map(|info| info.length).unwrap_or(0)
    }

    pub fn uint_value(&self, keypath: &Keypath) -> Option<u64> {
        self.leaf(keypath).and_then(|v| v.as_u64())
    }

    pub fn int_value(&self, keypath: &Keypath) -> Option<i64> {
        self.leaf(keypath).and_then(|v| v.as_i64())
    }

    pub fn float_value(&self, keypath: &Keypath) -> Option<f64> {
        self.leaf(keypath).and_then(|v| v.as_f64())
    }

    pub fn string_value(&self, keypath: &Keypath) -> Option<String> {
        self.leaf(keypath).and_then(|v| v.as_str().map(str::to_string))
    }

    fn leaf(&self, keypath: &Keypath) -> Option<Value> {
        let abs = self.keypath.push(keypath);
        self.backing
            .read()
            .expect("state lock poisoned")
            .values
            .get(&abs)
            .cloned()
    }

    /// Materialize the subtree at `keypath` into a [`Value`].
    pub fn value(&self, keypath: &Keypath, rng: Option<Range>) -> StateResult<Option<Value>> {
        let rng = self.resolve_range(rng)?;
        let abs = self.keypath.push(keypath);
        let b = self.backing.read().expect("state lock poisoned");

        match b.node_types.get(&abs) {
            None => Ok(None),
            Some(NodeType::Value) => {
                let Some(v) = b.values.get(&abs) else {
                    return Ok(None);
                };
                match (v, rng) {
                    (Value::String(s), Some(r)) => {
                        let (start, end) = r.indices_for_length(s.len() as u64)?;
                        let sub = std::str::from_utf8(&s.as_bytes()[start as usize..end as usize])
                            .map_err(|_| StateError::InvalidStringSplice)?;
                        Ok(Some(Value::String(sub.to_string())))
                    }
                    (_, Some(_)) => Err(StateError::RangeOverNonSlice),
                    (v, None) => Ok(Some(v.clone())),
                }
            }
            Some(NodeType::Map) => {
                if rng.is_some() {
                    return Err(StateError::RangeOverNonSlice);
                }
                let mut root = Value::Map(BTreeMap::new());
                b.scan_prefix(&abs, |kp| {
                    let rel = kp.relative_to(&abs);
                    if rel.is_root() {
                        return;
                    }
                    set_value_at(&mut root, &rel.parts(), node_placeholder(&b, kp));
                });
                Ok(Some(root))
            }
            Some(NodeType::Slice) => {
                let len = b.slice_lengths.get(&abs).copied().unwrap_or(0);
                let (start, end) = match rng {
                    Some(r) => r.indices_for_length(len)?,
                    None => (0, len),
                };
                let mut root = Value::Seq(vec![Value::Null; (end - start) as usize]);
                b.scan_prefix(&abs, |kp| {
                    let rel = kp.relative_to(&abs);
                    if rel.is_root() {
                        return;
                    }
                    let mut parts = rel.parts();
                    let Some(idx) = parts[0].as_index() else {
                        return;
                    };
                    if idx < start || idx >= end {
                        return;
                    }
                    parts[0] = Keypath::index(idx - start);
                    set_value_at(&mut root, &parts, node_placeholder(&b, kp));
                });
                Ok(Some(root))
            }
        }
    }

    /// Unique immediate child segments of the cursor's keypath.
    pub fn subkeys(&self) -> Vec<Keypath> {
        let b = self.backing.read().expect("state lock poisoned");
        let mut seen = Vec::new();
        b.scan_prefix(&self.keypath, |kp| {
            let rel = kp.relative_to(&self.keypath);
            if let Some(first) = rel.part(0) {
                if seen.last() != Some(&first) {
                    seen.push(first);
                }
            }
        });
        seen.dedup();
        seen
    }

    /// Set the subtree at `keypath` to `value`.
    ///
    /// Any existing subtree is deleted first; missing ancestors materialize
    /// as maps; every new keypath is recorded in the diff. With a range, the
    /// target must be a sequence (splice) or a string leaf (substring
    /// replacement).
    pub fn set(&mut self, keypath: &Keypath, rng: Option<Range>, value: Value) -> StateResult<()> {
        let rng = self.resolve_range(rng)?;
        if let Some(r) = rng {
            return self.splice(keypath, r, Some(value));
        }

        self.check_copied();
        let abs = self.keypath.push(keypath);

        // Clear whatever was there.
        self.backing
            .write()
            .expect("state lock poisoned")
            .delete_subtree(&abs);

        // Ancestors that exist as non-maps are replaced.
        let ancestors = ancestors_of(&abs);
        let conflicting: Vec<Keypath> = {
            let b = self.backing.read().expect("state lock poisoned");
            ancestors
                .iter()
                .filter(|kp| {
                    matches!(
                        b.node_types.get(*kp),
                        Some(NodeType::Slice) | Some(NodeType::Value)
                    )
                })
                .cloned()
                .collect()
        };

        let mut b = self.backing.write().expect("state lock poisoned");
        for kp in conflicting {
            b.delete_subtree(&kp);
        }
        let mut new_ancestors = Vec::new();
        for kp in ancestors {
            if !b.node_types.contains_key(&kp) {
                b.node_types.insert(kp.clone(), NodeType::Map);
                new_ancestors.push(kp);
            }
        }
        b.diff.add_many(new_ancestors.iter().cloned());
        b.insert_keypaths(new_ancestors);

        b.set_raw(&abs, &value);
        Ok(())
    }

    /// Delete the subtree at `keypath`, or splice a range out of a sequence
    /// or string leaf.
    pub fn delete(&mut self, keypath: &Keypath, rng: Option<Range>) -> StateResult<()> {
        let rng = self.resolve_range(rng)?;
        match rng {
            None => {
                self.check_copied();
                let abs = self.keypath.push(keypath);
                self.backing
                    .write()
                    .expect("state lock poisoned")
                    .delete_subtree(&abs);
                Ok(())
            }
            Some(r) => self.splice(keypath, r, None),
        }
    }

    /// Shared machinery for ranged set (insert/replace) and ranged delete.
    /// `new_value: None` deletes the range; `Some(Value::Seq(...))` replaces
    /// it; a string leaf accepts `Some(Value::String(...))`.
    fn splice(&mut self, keypath: &Keypath, rng: Range, new_value: Option<Value>) -> StateResult<()> {
        self.check_copied();
        let abs = self.keypath.push(keypath);

        let nt = {
            let b = self.backing.read().expect("state lock poisoned");
            b.node_types.get(&abs).copied()
        };

        match nt {
            None if rng.size() == 0 && rng.start == 0 && new_value.is_some() => {
                // Splicing into a nonexistent node at [0:0) creates the
                // sequence first.
                self.set(keypath, None, Value::Seq(Vec::new()))?;
                self.splice_sequence(&abs, rng, new_value)
            }
            Some(NodeType::Slice) => self.splice_sequence(&abs, rng, new_value),
            Some(NodeType::Value) => self.splice_string(&abs, rng, new_value),
            _ => Err(StateError::RangeOverNonSlice),
        }
    }

    fn splice_sequence(
        &mut self,
        abs: &Keypath,
        rng: Range,
        new_value: Option<Value>,
    ) -> StateResult<()> {
        let elems = match new_value {
            None => Vec::new(),
            Some(Value::Seq(s)) => s,
            Some(other) => return Err(StateError::SpliceNonSequence(other.kind())),
        };

        let mut b = self.backing.write().expect("state lock poisoned");
        let old_len = b.slice_lengths.get(abs).copied().unwrap_or(0);
        let (start, end) = rng.indices_for_length(old_len)?;
        let removed_count = end - start;
        let new_len = old_len - removed_count + elems.len() as u64;

        // Drop the replaced children.
        for i in start..end {
            b.delete_subtree(&abs.push_index(i));
        }

        // Extract the tail so it can be renumbered without collisions.
        let mut tail: Vec<(u64, Vec<WalkEntry>)> = Vec::new();
        for i in end..old_len {
            let child = abs.push_index(i);
            let mut entries = Vec::new();
            b.scan_prefix(&child, |kp| {
                let nt = b.node_types[kp];
                entries.push((
                    kp.relative_to(&child),
                    nt,
                    b.values.get(kp).cloned(),
                    b.slice_lengths.get(kp).copied(),
                ));
            });
            b.delete_subtree(&child);
            tail.push((i, entries));
        }

        // Insert the new elements.
        for (j, elem) in elems.iter().enumerate() {
            b.set_raw(&abs.push_index(start + j as u64), elem);
        }

        // Reinsert the tail at its shifted indices.
        for (old_idx, entries) in tail {
            let new_child = abs.push_index(old_idx - removed_count + elems.len() as u64);
            let mut new_keypaths = Vec::with_capacity(entries.len());
            for (suffix, nt, leaf, slice_len) in entries {
                let kp = new_child.push(&suffix);
                b.node_types.insert(kp.clone(), nt);
                if let Some(v) = leaf {
                    b.values.insert(kp.clone(), v);
                }
                if let Some(len) = slice_len {
                    b.slice_lengths.insert(kp.clone(), len);
                }
                new_keypaths.push(kp);
            }
            b.diff.add_many(new_keypaths.iter().cloned());
            b.insert_keypaths(new_keypaths);
        }

        b.slice_lengths.insert(abs.clone(), new_len);
        Ok(())
    }

    fn splice_string(
        &mut self,
        abs: &Keypath,
        rng: Range,
        new_value: Option<Value>,
    ) -> StateResult<()> {
        let insert = match new_value {
            None => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => return Err(StateError::SpliceNonSequence(other.kind())),
        };

        let mut b = self.backing.write().expect("state lock poisoned");
        let Some(Value::String(s)) = b.values.get(abs) else {
            return Err(StateError::RangeOverNonSlice);
        };
        let (start, end) = rng.indices_for_length(s.len() as u64)?;

        let mut bytes = s.as_bytes()[..start as usize].to_vec();
        bytes.extend_from_slice(insert.as_bytes());
        bytes.extend_from_slice(&s.as_bytes()[end as usize..]);
        let spliced = String::from_utf8(bytes).map_err(|_| StateError::InvalidStringSplice)?;

        b.values.insert(abs.clone(), Value::String(spliced));
        b.diff.add(abs.clone());
        Ok(())
    }

    /// Iterate the subtree at `keypath` deepest/rightmost first (the reverse
    /// of sorted order), so the caller may delete as it iterates.
    ///
    /// The prefetch arguments are hints for disk-backed trees and are
    /// ignored here.
    pub fn depth_first_iterator(
        &self,
        keypath: &Keypath,
        _prefetch_values: bool,
        _prefetch_size: usize,
    ) -> DepthFirstIterator {
        let abs = self.keypath.push(keypath);
        let b = self.backing.read().expect("state lock poisoned");
        let mut keypaths = Vec::new();
        b.scan_prefix(&abs, |kp| keypaths.push(kp.clone()));
        DepthFirstIterator {
            template: MemoryNode {
                backing: Arc::clone(&self.backing),
                keypath: Keypath::root(),
                range: None,
                copied: self.copied,
            },
            pos: keypaths.len(),
            keypaths,
        }
    }

    /// Snapshot of the diff accumulated since the last reset.
    pub fn diff(&self) -> Diff {
        self.backing.read().expect("state lock poisoned").diff.clone()
    }

    /// Toggle diff recording (copy-on-write applies first).
    pub fn set_diff_enabled(&mut self, enabled: bool) {
        self.check_copied();
        self.backing
            .write()
            .expect("state lock poisoned")
            .diff
            .set_enabled(enabled);
    }

    /// Clear the diff (copy-on-write applies first).
    pub fn reset_diff(&mut self) {
        self.check_copied();
        self.backing.write().expect("state lock poisoned").diff.clear();
    }

    #[cfg(test)]
    fn keypath_count(&self) -> usize {
        self.backing.read().unwrap().keypaths.len()
    }
}

fn node_placeholder(b: &Backing, kp: &Keypath) -> Value {
    match b.node_types.get(kp) {
        Some(NodeType::Map) => Value::Map(BTreeMap::new()),
        Some(NodeType::Slice) => {
            let len = b.slice_lengths.get(kp).copied().unwrap_or(0) as usize;
            Value::Seq(vec![Value::Null; len])
        }
        Some(NodeType::Value) => b.values.get(kp).cloned().unwrap_or(Value::Null),
        None => Value::Null,
    }
}

/// Proper ancestors of `abs`, shallowest first, including the root.
fn ancestors_of(abs: &Keypath) -> Vec<Keypath> {
    let parts = abs.parts();
    if parts.is_empty() {
        return Vec::new();
    }
    let mut ancestors = vec![Keypath::root()];
    let mut current = Keypath::root();
    for part in &parts[..parts.len() - 1] {
        current = current.push(part);
        ancestors.push(current.clone());
    }
    ancestors
}

/// Write `value` into a partially-built container at the given relative
/// parts. Parents appear before children in sorted scan order, so the
/// containers along the way already exist.
fn set_value_at(root: &mut Value, parts: &[Keypath], value: Value) {
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        let next = match part.as_index() {
            Some(idx) => match current {
                Value::Seq(s) => s.get_mut(idx as usize),
                _ => None,
            },
            None => match current {
                Value::Map(m) => m.get_mut(&String::from_utf8_lossy(part.as_bytes()).into_owned()),
                _ => None,
            },
        };
        match next {
            Some(v) => current = v,
            None => return,
        }
    }

    let last = &parts[parts.len() - 1];
    match last.as_index() {
        Some(idx) => {
            if let Value::Seq(s) = current {
                if let Some(slot) = s.get_mut(idx as usize) {
                    *slot = value;
                }
            }
        }
        None => {
            if let Value::Map(m) = current {
                m.insert(String::from_utf8_lossy(last.as_bytes()).into_owned(), value);
            }
        }
    }
}

/// Iterator over a subtree in reverse sorted order. Operates on a snapshot
/// of the keypath list taken at creation.
pub struct DepthFirstIterator {
    template: MemoryNode,
    keypaths: Vec<Keypath>,
    pos: usize,
}

impl DepthFirstIterator {
    /// Jump so that the next yielded node is `keypath`, if present.
    pub fn seek_to(&mut self, keypath: &Keypath) {
        if let Some(idx) = self.keypaths.iter().position(|kp| kp == keypath) {
            self.pos = idx + 1;
        } else {
            self.pos = 0;
        }
    }
}

impl Iterator for DepthFirstIterator {
    type Item = MemoryNode;

    fn next(&mut self) -> Option<MemoryNode> {
        if self.pos == 0 {
            return None;
        }
        self.pos -= 1;
        let mut node = self.template.clone();
        node.keypath = self.keypaths[self.pos].clone();
        Some(node)
    }
}
