//! Engine error taxonomy.
//!
//! Validation and lookup failures are rejected synchronously; storage
//! failures propagate as fatal for the triggering request. Stale or
//! duplicate deliveries are *not* errors — the controller no-ops on them.

use thiserror::Error;

use crate::domain::StateId;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state machine not found: {0}")]
    MachineNotFound(String),

    #[error("state {1} not found in machine {0}")]
    StateNotFound(String, StateId),

    #[error("event '{1}' not found in machine {0}")]
    EventNotFound(String, String),

    #[error("duplicate submission: {0}")]
    DuplicateMachine(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    /// Event-data update against a state that is not in an updatable status.
    #[error("update forbidden: {0}")]
    UpdateForbidden(String),

    /// Replay budget of the dependent state is spent.
    #[error("replay retries exhausted for state {1} in machine {0}")]
    ReplayRetriesExhausted(String, StateId),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// HTTP-style status code for the (external) resource layer.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::MachineNotFound(_)
            | EngineError::StateNotFound(_, _)
            | EngineError::EventNotFound(_, _) => 404,
            EngineError::DuplicateMachine(_) => 409,
            EngineError::InvalidDefinition(_) | EngineError::Malformed(_) => 400,
            EngineError::UpdateForbidden(_) | EngineError::ReplayRetriesExhausted(_, _) => 403,
            EngineError::Storage(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_outcomes() {
        assert_eq!(
            EngineError::MachineNotFound("x".into()).status_code(),
            404
        );
        assert_eq!(
            EngineError::DuplicateMachine("x".into()).status_code(),
            409
        );
        assert_eq!(EngineError::Malformed("x".into()).status_code(), 400);
        assert_eq!(
            EngineError::UpdateForbidden("x".into()).status_code(),
            403
        );
        assert_eq!(
            EngineError::Storage(anyhow::anyhow!("db down")).status_code(),
            500
        );
    }
}
