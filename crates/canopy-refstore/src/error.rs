use thiserror::Error;

use canopy_types::Hash;

#[derive(Debug, Error)]
pub enum RefStoreError {
    #[error("ref not found: {0}")]
    NotFound(Hash),

    #[error("metadata: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RefStoreResult<T> = Result<T, RefStoreError>;
