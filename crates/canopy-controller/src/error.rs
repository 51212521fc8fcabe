use thiserror::Error;

use canopy_behavior::BehaviorError;
use canopy_state::StateError;
use canopy_types::{Hash, TxId};

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Fatal: a non-genesis tx arrived with no parents.
    #[error("tx must have parents")]
    MissingParents,

    /// Retryable: a parent is unknown or not yet valid. The tx stays in the
    /// mempool until the parent lands.
    #[error("no parent yet: {0}")]
    NoParentYet(TxId),

    /// Retryable: the tx references refs the host has not downloaded yet.
    /// The mempool reprocesses on the ref-download signal.
    #[error("missing critical refs ({} refs)", .0.len())]
    MissingCriticalRefs(Vec<Hash>),

    /// Fatal: the signature does not recover to the claimed sender.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Behavior(#[from] BehaviorError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("not found")]
    NotFound,

    #[error("tx store: {0}")]
    Store(String),
}

impl ControllerError {
    /// Retryable errors keep the tx in the mempool; everything else drops it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::NoParentYet(_) | ControllerError::MissingCriticalRefs(_)
        )
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
