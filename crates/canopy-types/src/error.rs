use thiserror::Error;

/// Errors from the foundation types.
///
/// [`TypeError::NotFound`] is the shared not-found sentinel: state reads,
/// tx-store fetches, and index queries all surface it so callers can
/// classify by kind rather than by message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("not found")]
    NotFound,

    #[error("invalid range")]
    InvalidRange,

    #[error("range over non-slice")]
    RangeOverNonSlice,

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected}, actual {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
