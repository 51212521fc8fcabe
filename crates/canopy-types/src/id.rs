use std::fmt;

use rand::RngCore;

use crate::error::TypeError;

macro_rules! hex_newtype {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// The zero value. Represents "unset".
            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            /// Returns `true` if every byte is zero.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; $len]
            }

            /// Wrap a raw byte array.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Hex-encoded string representation.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Short hex representation (first 8 characters) for logging.
            pub fn short_hex(&self) -> String {
                hex::encode(&self.0[..4])
            }

            /// Parse from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, TypeError> {
                let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
                if bytes.len() != $len {
                    return Err(TypeError::InvalidLength {
                        expected: $len,
                        actual: bytes.len(),
                    });
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                use serde::Deserialize;
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(
    /// Keccak-256 digest: content addresses of refs and canonical tx hashes.
    Hash,
    32
);

hex_newtype!(
    /// 20-byte account address, recovered from a transaction signature.
    Address,
    20
);

hex_newtype!(
    /// Caller-supplied 32-byte transaction identifier.
    TxId,
    32
);

hex_newtype!(
    /// 32-byte state-tree version identifier.
    ///
    /// Checkpointing a tx copies the current version under the tx's ID, so
    /// `TxId` converts losslessly into `Version`.
    Version,
    32
);

impl TxId {
    /// The well-known genesis tx ID (`"genesis"` zero-padded).
    pub fn genesis() -> Self {
        Self::from_static("genesis")
    }

    /// An ID whose leading bytes are the given string, zero-padded.
    ///
    /// Panics if the string is longer than 32 bytes; intended for static
    /// well-known IDs and tests.
    pub fn from_static(s: &str) -> Self {
        assert!(s.len() <= 32, "static tx id too long");
        let mut arr = [0u8; 32];
        arr[..s.len()].copy_from_slice(s.as_bytes());
        Self(arr)
    }

    /// A fresh random ID.
    pub fn random() -> Self {
        let mut arr = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut arr);
        Self(arr)
    }
}

impl Version {
    /// The sentinel naming the mutable current version of a state tree.
    pub fn current() -> Self {
        let mut arr = [0u8; 32];
        arr[..7].copy_from_slice(b"current");
        Self(arr)
    }
}

impl From<TxId> for Version {
    fn from(id: TxId) -> Self {
        Self(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let h = Hash::from_bytes([7u8; 32]);
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = Hash::from_hex("abcd").unwrap_err();
        assert!(matches!(err, TypeError::InvalidLength { .. }));
    }

    #[test]
    fn from_hex_rejects_bad_chars() {
        let err = Address::from_hex("zz").unwrap_err();
        assert!(matches!(err, TypeError::InvalidHex(_)));
    }

    #[test]
    fn serde_is_hex_string() {
        let id = TxId::from_static("one");
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"6f6e65"));
        let parsed: TxId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn genesis_is_stable() {
        assert_eq!(TxId::genesis(), TxId::from_static("genesis"));
        assert_ne!(TxId::genesis(), TxId::zero());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(TxId::random(), TxId::random());
    }

    #[test]
    fn checkpoint_version_from_tx_id() {
        let id = TxId::from_static("chk");
        let v: Version = id.into();
        assert_eq!(v.as_bytes(), id.as_bytes());
    }

    #[test]
    fn short_hex_is_8_chars() {
        assert_eq!(Hash::from_bytes([0xab; 32]).short_hex().len(), 8);
    }
}
