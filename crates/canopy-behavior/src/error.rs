use thiserror::Error;

use canopy_state::StateError;

#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("unknown plugin type: {0}")]
    UnknownPluginType(String),

    #[error("bad plugin config: {0}")]
    BadConfig(String),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type BehaviorResult<T> = Result<T, BehaviorError>;
