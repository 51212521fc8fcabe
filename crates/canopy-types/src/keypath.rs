use std::fmt;

use crate::error::TypeError;

/// Byte separating keypath segments.
pub const KEYPATH_SEPARATOR: u8 = b'/';

/// Reserved first byte of an index segment. The remaining 8 bytes are the
/// index as a big-endian u64, so index segments sort numerically inside the
/// lexicographic keypath order.
pub const INDEX_PREFIX: u8 = 0xfe;

/// A byte-encoded path addressing a node in a document tree.
///
/// A keypath is `/`-separated segments; the empty keypath is the tree root.
/// Sequence elements are addressed by index segments
/// ([`INDEX_PREFIX`] + big-endian u64). Keypaths order lexicographically on
/// their raw bytes, which the state tree exploits for prefix scans.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keypath(Vec<u8>);

impl Keypath {
    /// The root (empty) keypath.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns `true` if this is the root keypath.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// A single-segment keypath addressing a sequence index.
    pub fn index(idx: u64) -> Self {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(INDEX_PREFIX);
        bytes.extend_from_slice(&idx.to_be_bytes());
        Self(bytes)
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Byte length of the encoded keypath.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join `other` onto this keypath.
    pub fn push(&self, other: &Keypath) -> Keypath {
        if self.0.is_empty() {
            return other.clone();
        }
        if other.0.is_empty() {
            return self.clone();
        }
        let mut bytes = Vec::with_capacity(self.0.len() + 1 + other.0.len());
        bytes.extend_from_slice(&self.0);
        bytes.push(KEYPATH_SEPARATOR);
        bytes.extend_from_slice(&other.0);
        Keypath(bytes)
    }

    /// Join an index segment onto this keypath.
    pub fn push_index(&self, idx: u64) -> Keypath {
        self.push(&Keypath::index(idx))
    }

    /// Returns `true` if this keypath equals `prefix` or descends from it.
    ///
    /// The check is on segment boundaries: `foo/barbaz` does not start with
    /// `foo/bar`.
    pub fn starts_with(&self, prefix: &Keypath) -> bool {
        if prefix.0.is_empty() {
            return true;
        }
        if !self.0.starts_with(&prefix.0) {
            return false;
        }
        self.0.len() == prefix.0.len() || self.0[prefix.0.len()] == KEYPATH_SEPARATOR
    }

    /// This keypath re-rooted under `prefix`.
    ///
    /// `a/b/c`.relative_to(`a`) is `b/c`; relative to itself it is the root.
    /// The caller is expected to have checked [`starts_with`] first.
    ///
    /// [`starts_with`]: Keypath::starts_with
    pub fn relative_to(&self, prefix: &Keypath) -> Keypath {
        if prefix.0.is_empty() {
            return self.clone();
        }
        if self.0.len() <= prefix.0.len() {
            return Keypath::root();
        }
        let mut rest = &self.0[prefix.0.len()..];
        if rest.first() == Some(&KEYPATH_SEPARATOR) {
            rest = &rest[1..];
        }
        Keypath(rest.to_vec())
    }

    /// The segments of this keypath, in order.
    pub fn parts(&self) -> Vec<Keypath> {
        let mut parts = Vec::new();
        let mut rest = &self.0[..];
        while !rest.is_empty() {
            let seg_len = segment_len(rest);
            parts.push(Keypath(rest[..seg_len].to_vec()));
            rest = &rest[seg_len..];
            if rest.first() == Some(&KEYPATH_SEPARATOR) {
                rest = &rest[1..];
            }
        }
        parts
    }

    /// The `i`-th segment, if present.
    pub fn part(&self, i: usize) -> Option<Keypath> {
        self.parts().into_iter().nth(i)
    }

    /// Number of segments.
    pub fn num_parts(&self) -> usize {
        self.parts().len()
    }

    /// Split into parent keypath and final segment. The root splits into
    /// `(root, None)`.
    pub fn pop(&self) -> (Keypath, Option<Keypath>) {
        let parts = self.parts();
        match parts.split_last() {
            None => (Keypath::root(), None),
            Some((last, init)) => {
                let mut parent = Keypath::root();
                for p in init {
                    parent = parent.push(p);
                }
                (parent, Some(last.clone()))
            }
        }
    }

    /// If this is a single index segment, the decoded index.
    pub fn as_index(&self) -> Option<u64> {
        if self.0.len() == 9 && self.0[0] == INDEX_PREFIX {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&self.0[1..]);
            Some(u64::from_be_bytes(arr))
        } else {
            None
        }
    }
}

fn segment_len(bytes: &[u8]) -> usize {
    if bytes.first() == Some(&INDEX_PREFIX) && bytes.len() >= 9 {
        return 9;
    }
    bytes
        .iter()
        .position(|&b| b == KEYPATH_SEPARATOR)
        .unwrap_or(bytes.len())
}

impl From<&str> for Keypath {
    fn from(s: &str) -> Self {
        Keypath(s.as_bytes().to_vec())
    }
}

impl From<String> for Keypath {
    fn from(s: String) -> Self {
        Keypath(s.into_bytes())
    }
}

impl From<&[u8]> for Keypath {
    fn from(bytes: &[u8]) -> Self {
        Keypath(bytes.to_vec())
    }
}

impl fmt::Display for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts().iter().enumerate() {
            match part.as_index() {
                Some(idx) => write!(f, "[{idx}]")?,
                None => {
                    if i > 0 {
                        write!(f, "/")?;
                    }
                    write!(f, "{}", String::from_utf8_lossy(&part.0))?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypath({self})")
    }
}

/// Half-open interval `[start, end)` over sequence indices or string bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// A range is valid when it is non-inverted.
    pub fn valid(&self) -> bool {
        self.start <= self.end
    }

    /// Number of elements covered.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if the range fits a sequence of the given length.
    pub fn valid_for_length(&self, length: u64) -> bool {
        self.valid() && self.end <= length
    }

    /// Resolve to concrete `(start, end)` indices for a sequence of the
    /// given length.
    pub fn indices_for_length(&self, length: u64) -> Result<(u64, u64), TypeError> {
        if !self.valid_for_length(length) {
            return Err(TypeError::InvalidRange);
        }
        Ok((self.start, self.end))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_empty() {
        assert!(Keypath::root().is_root());
        assert_eq!(Keypath::root().num_parts(), 0);
    }

    #[test]
    fn push_joins_with_separator() {
        let kp = Keypath::from("foo").push(&Keypath::from("bar"));
        assert_eq!(kp.as_bytes(), b"foo/bar");
    }

    #[test]
    fn push_onto_root_is_identity() {
        let kp = Keypath::root().push(&Keypath::from("foo"));
        assert_eq!(kp, Keypath::from("foo"));
        let kp = Keypath::from("foo").push(&Keypath::root());
        assert_eq!(kp, Keypath::from("foo"));
    }

    #[test]
    fn starts_with_respects_segment_boundaries() {
        let kp = Keypath::from("foo/barbaz");
        assert!(kp.starts_with(&Keypath::from("foo")));
        assert!(!kp.starts_with(&Keypath::from("foo/bar")));
        assert!(kp.starts_with(&Keypath::from("foo/barbaz")));
        assert!(kp.starts_with(&Keypath::root()));
    }

    #[test]
    fn relative_to_strips_prefix() {
        let kp = Keypath::from("a/b/c");
        assert_eq!(kp.relative_to(&Keypath::from("a")), Keypath::from("b/c"));
        assert_eq!(kp.relative_to(&Keypath::from("a/b")), Keypath::from("c"));
        assert_eq!(kp.relative_to(&kp), Keypath::root());
        assert_eq!(kp.relative_to(&Keypath::root()), kp);
    }

    #[test]
    fn parts_splits_segments() {
        let kp = Keypath::from("a/b").push_index(3).push(&Keypath::from("c"));
        let parts = kp.parts();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], Keypath::from("a"));
        assert_eq!(parts[1], Keypath::from("b"));
        assert_eq!(parts[2].as_index(), Some(3));
        assert_eq!(parts[3], Keypath::from("c"));
    }

    #[test]
    fn part_indexes_into_segments() {
        let kp = Keypath::from("x/y/z");
        assert_eq!(kp.part(1), Some(Keypath::from("y")));
        assert_eq!(kp.part(5), None);
    }

    #[test]
    fn pop_splits_parent_and_last() {
        let (parent, last) = Keypath::from("a/b/c").pop();
        assert_eq!(parent, Keypath::from("a/b"));
        assert_eq!(last, Some(Keypath::from("c")));

        let (parent, last) = Keypath::root().pop();
        assert!(parent.is_root());
        assert_eq!(last, None);
    }

    #[test]
    fn index_segments_sort_numerically() {
        let base = Keypath::from("seq");
        let kp1 = base.push_index(1);
        let kp2 = base.push_index(2);
        let kp10 = base.push_index(10);
        assert!(kp1 < kp2);
        assert!(kp2 < kp10);
    }

    #[test]
    fn index_roundtrip() {
        assert_eq!(Keypath::index(42).as_index(), Some(42));
        assert_eq!(Keypath::from("foo").as_index(), None);
    }

    #[test]
    fn display_renders_indices_in_brackets() {
        let kp = Keypath::from("messages").push_index(0).push(&Keypath::from("text"));
        assert_eq!(kp.to_string(), "messages[0]/text");
    }

    #[test]
    fn range_validity() {
        assert!(Range::new(0, 0).valid());
        assert!(Range::new(2, 5).valid());
        assert!(!Range::new(5, 2).valid());
    }

    #[test]
    fn range_indices_for_length() {
        let rng = Range::new(1, 3);
        assert_eq!(rng.indices_for_length(5).unwrap(), (1, 3));
        assert_eq!(rng.indices_for_length(2), Err(TypeError::InvalidRange));
    }

    #[test]
    fn range_size() {
        assert_eq!(Range::new(2, 7).size(), 5);
    }
}
