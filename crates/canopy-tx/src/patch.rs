use std::fmt;

use canopy_types::{Keypath, Range, Value};

use crate::error::{TxError, TxResult};

/// One element of a tx payload: `(keypath, optional range, value)`.
///
/// The canonical textual form (used both when hashing a tx for signing and
/// on the wire) joins keypath segments with `.` (quoting a segment as
/// `["…"]` when it contains a dot), renders index segments as `[n]`, appends
/// an optional `[start:end]` range, then ` = <json>`:
///
/// ```text
/// .messages[0:0] = [{"text":"hi"}]
/// .room["weird.key"].title = "hello"
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub keypath: Keypath,
    pub range: Option<Range>,
    pub val: Value,
}

impl Patch {
    pub fn new(keypath: Keypath, range: Option<Range>, val: Value) -> Self {
        Self { keypath, range, val }
    }

    /// Rebase the patch under `prefix`, making its keypath relative.
    pub fn relative_to(&self, prefix: &Keypath) -> Patch {
        Patch {
            keypath: self.keypath.relative_to(prefix),
            range: self.range,
            val: self.val.clone(),
        }
    }
}

/// The canonical dotted rendering of a keypath (`.a.b[2]["weird.key"]`),
/// shared by the patch textual form and permission-rule matching.
pub fn canonical_keypath_string(keypath: &Keypath) -> String {
    let mut s = String::new();
    for part in keypath.parts() {
        match part.as_index() {
            Some(idx) => s.push_str(&format!("[{idx}]")),
            None => {
                let seg = String::from_utf8_lossy(part.as_bytes());
                if seg.contains('.') {
                    s.push_str(&format!("[\"{seg}\"]"));
                } else {
                    s.push('.');
                    s.push_str(&seg);
                }
            }
        }
    }
    s
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", canonical_keypath_string(&self.keypath))?;
        if let Some(rng) = self.range {
            write!(f, "[{}:{}]", rng.start, rng.end)?;
        }
        let json = serde_json::to_string(&self.val).map_err(|_| fmt::Error)?;
        write!(f, " = {json}")
    }
}

impl serde::Serialize for Patch {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Patch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize;
        let s = String::deserialize(deserializer)?;
        parse_patch(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse the canonical textual patch form.
pub fn parse_patch(input: &str) -> TxResult<Patch> {
    let bytes = input.as_bytes();
    let mut keypath = Keypath::root();
    let mut range: Option<Range> = None;
    let mut i = 0;

    loop {
        match bytes.get(i) {
            Some(b' ') | Some(b'=') | None => break,

            Some(_) if range.is_some() => {
                return Err(malformed(i, "range must be the last keypath element"));
            }

            Some(b'.') => {
                i += 1;
                let start = i;
                while i < bytes.len() && !matches!(bytes[i], b'.' | b'[' | b' ' | b'=') {
                    i += 1;
                }
                if i == start {
                    return Err(malformed(start, "empty keypath segment"));
                }
                keypath = keypath.push(&Keypath::from(&input[start..i]));
            }

            Some(b'[') => {
                i += 1;
                if bytes.get(i) == Some(&b'"') {
                    // Quoted segment: ["..."]
                    i += 1;
                    let start = i;
                    let Some(close) = input[start..].find("\"]") else {
                        return Err(malformed(start, "unterminated quoted segment"));
                    };
                    keypath = keypath.push(&Keypath::from(&input[start..start + close]));
                    i = start + close + 2;
                } else {
                    let start = i;
                    let Some(close) = input[start..].find(']') else {
                        return Err(malformed(start, "unterminated bracket"));
                    };
                    let inner = &input[start..start + close];
                    i = start + close + 1;

                    if let Some((lo, hi)) = inner.split_once(':') {
                        let start_idx = lo
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| malformed(start, "bad range start"))?;
                        let end_idx = hi
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| malformed(start, "bad range end"))?;
                        let rng = Range::new(start_idx, end_idx);
                        if !rng.valid() {
                            return Err(malformed(start, "inverted range"));
                        }
                        range = Some(rng);
                    } else {
                        let idx = inner
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| malformed(start, "bad index segment"))?;
                        keypath = keypath.push_index(idx);
                    }
                }
            }

            Some(_) => return Err(malformed(i, "unexpected character in keypath")),
        }
    }

    while bytes.get(i) == Some(&b' ') {
        i += 1;
    }
    if bytes.get(i) != Some(&b'=') {
        return Err(malformed(i, "expected '='"));
    }
    i += 1;

    let val: Value = serde_json::from_str(input[i..].trim())?;
    Ok(Patch::new(keypath, range, val))
}

fn malformed(at: usize, reason: &str) -> TxError {
    TxError::MalformedPatch {
        at,
        reason: reason.to_string(),
    }
}
