use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// Not enough free units. An ordinary outcome; callers may offer the waitlist.
    #[error("no capacity on {resource_id}: {available_units} free, {required_units} required")]
    Conflict {
        resource_id: Ulid,
        available_units: u32,
        required_units: u32,
    },

    #[error("cannot {action} {id} in state {state}: {reason}")]
    InvalidStateTransition {
        id: Ulid,
        state: &'static str,
        action: &'static str,
        reason: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("duplicate of open waitlist entry {0}")]
    Duplicate(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Infrastructure failures abort a tick; everything else is a per-item outcome.
    pub fn is_store(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
