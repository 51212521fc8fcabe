use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("malformed patch at byte {at}: {reason}")]
    MalformedPatch { at: usize, reason: String },

    #[error("patch value is not valid json: {0}")]
    BadValue(#[from] serde_json::Error),
}

pub type TxResult<T> = Result<T, TxError>;
