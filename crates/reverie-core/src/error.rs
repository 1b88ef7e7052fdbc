//! Error types for Reverie
//!
//! Four families, handled at different distances from the caller:
//! - `Refused`: admission backpressure or malformed input, returned as a value
//! - `InvalidTransition`: illegal plan change requested by the execution side
//! - `PersistenceError`: snapshot / restore failures, the only kind that escalates
//! - `Error`: umbrella for call sites that mix the above

use crate::types::{PlanStatus, StepTier};
use thiserror::Error;
use uuid::Uuid;

/// Why an observation was not admitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefusalReason {
    #[error("insufficient energy: need {required:.2}, have {available:.2}")]
    InsufficientEnergy { required: f64, available: f64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RefusalReason {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, RefusalReason::InsufficientEnergy { .. })
    }
}

/// An observation the buffer declined. The buffer never blocks; callers retry later.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("observation {observation_id} refused: {reason}")]
pub struct Refused {
    pub observation_id: Uuid,
    pub reason: RefusalReason,
}

impl Refused {
    pub fn insufficient_energy(observation_id: Uuid, required: f64, available: f64) -> Self {
        Self {
            observation_id,
            reason: RefusalReason::InsufficientEnergy {
                required,
                available,
            },
        }
    }

    pub fn invalid_input(observation_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            observation_id,
            reason: RefusalReason::InvalidInput(message.into()),
        }
    }
}

/// A plan change that the state machine does not allow. State is left unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidTransition {
    #[error("plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("plan {plan_id} has no step {step} ({len} steps)")]
    StepOutOfRange { plan_id: Uuid, step: usize, len: usize },

    #[error("plan {plan_id} step {step} is already complete")]
    StepAlreadyComplete { plan_id: Uuid, step: usize },

    #[error("plan {plan_id} {tier} step {step} waits on incomplete steps {pending:?}")]
    DependenciesIncomplete {
        plan_id: Uuid,
        step: usize,
        tier: StepTier,
        pending: Vec<usize>,
    },

    #[error("plan {plan_id} is {status} and accepts no further changes")]
    Terminal { plan_id: Uuid, status: PlanStatus },

    #[error("plan {plan_id} cannot move from {from} to {to}")]
    IllegalStatusChange {
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
    },
}

/// Snapshot and restore failures.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown schema version {found} (supported: {supported})")]
    UnknownSchemaVersion { found: u32, supported: u32 },

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("snapshot timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Refused(#[from] Refused),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_is_distinguished_from_invalid_input() {
        let starved = Refused::insufficient_energy(Uuid::nil(), 1.0, 0.0);
        let malformed = Refused::invalid_input(Uuid::nil(), "intensity out of range");
        assert!(starved.reason.is_backpressure());
        assert!(!malformed.reason.is_backpressure());
    }

    #[test]
    fn refused_display_names_reason() {
        let r = Refused::insufficient_energy(Uuid::nil(), 2.5, 1.0);
        let text = r.to_string();
        assert!(text.contains("insufficient energy"));
        assert!(text.contains("2.50"));
    }

    #[test]
    fn umbrella_error_wraps_transition() {
        let e: Error = InvalidTransition::PlanNotFound(Uuid::nil()).into();
        assert!(matches!(e, Error::InvalidTransition(_)));
        assert!(e.to_string().contains("plan not found"));
    }
}
