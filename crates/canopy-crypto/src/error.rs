use thiserror::Error;

/// Errors from signing, recovery, and sealed-box operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid length: expected {expected}, actual {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("seal failed")]
    SealFailed,

    #[error("open failed")]
    OpenFailed,
}
