use thiserror::Error;

use canopy_types::TypeError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("not found")]
    NotFound,

    #[error("invalid range")]
    InvalidRange,

    #[error("range over non-slice")]
    RangeOverNonSlice,

    #[error("range splice expects a sequence value, got {0}")]
    SpliceNonSequence(&'static str),

    #[error("string splice produced invalid utf-8")]
    InvalidStringSplice,

    #[error("unknown version {0}")]
    UnknownVersion(canopy_types::Version),
}

impl From<TypeError> for StateError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::NotFound => StateError::NotFound,
            TypeError::RangeOverNonSlice => StateError::RangeOverNonSlice,
            _ => StateError::InvalidRange,
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;
