use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A JSON-shaped variant: the material held at document leaves and the shape
/// of whole materialized subtrees.
///
/// Deserialization follows JSON: non-negative integers decode as [`Uint`],
/// negative ones as [`Int`], other numbers as [`Float`], arrays as [`Seq`].
/// [`Bytes`] is only constructed programmatically and serializes as a number
/// array.
///
/// [`Uint`]: Value::Uint
/// [`Int`]: Value::Int
/// [`Float`]: Value::Float
/// [`Seq`]: Value::Seq
/// [`Bytes`]: Value::Bytes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    String(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Uint(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Map lookup, `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Short kind name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Uint(_) => "uint",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Seq(_) => "seq",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Uint(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(s: Vec<Value>) -> Self {
        Value::Seq(s)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn json_scalars_decode() {
        assert_eq!(parse("null"), Value::Null);
        assert_eq!(parse("true"), Value::Bool(true));
        assert_eq!(parse("42"), Value::Uint(42));
        assert_eq!(parse("-3"), Value::Int(-3));
        assert_eq!(parse("1.5"), Value::Float(1.5));
        assert_eq!(parse("\"hi\""), Value::String("hi".into()));
    }

    #[test]
    fn json_containers_decode() {
        let v = parse(r#"{"a": [1, {"b": null}]}"#);
        let seq = v.get("a").unwrap().as_seq().unwrap();
        assert_eq!(seq[0], Value::Uint(1));
        assert!(seq[1].get("b").unwrap().is_null());
    }

    #[test]
    fn json_roundtrip() {
        let v = parse(r#"{"x": 1, "y": [true, "z", -2], "w": null}"#);
        let encoded = serde_json::to_string(&v).unwrap();
        assert_eq!(parse(&encoded), v);
    }

    #[test]
    fn map_keys_are_sorted() {
        let v = parse(r#"{"b": 1, "a": 2}"#);
        let keys: Vec<&String> = v.as_map().unwrap().keys().collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn accessors_reject_wrong_kind() {
        assert_eq!(Value::Bool(true).as_u64(), None);
        assert_eq!(Value::Uint(1).as_str(), None);
        assert_eq!(Value::Null.get("k"), None);
    }

    #[test]
    fn int_accessor_coerces_uint() {
        assert_eq!(Value::Uint(7).as_i64(), Some(7));
        assert_eq!(Value::Uint(u64::MAX).as_i64(), None);
    }

    #[test]
    fn kind_names() {
        assert_eq!(parse("[]").kind(), "seq");
        assert_eq!(parse("{}").kind(), "map");
        assert_eq!(Value::Bytes(vec![1]).kind(), "bytes");
    }
}
