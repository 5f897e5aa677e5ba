//! Kernel Errors
//!
//! Typed errors surfaced by the kernel. Transition conflicts (a CAS write
//! that loses a race) are deliberately absent: those are reported as
//! `Ok(None)` / `Ok(false)` by the store and services.

use thiserror::Error;

use crate::interrupts::InterruptType;
use crate::plan::ValidationError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] ValidationError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid interrupt: {0}")]
    InvalidInterrupt(String),

    #[error("{kind} interrupt already pending for plan execution '{plan_execution_id}'")]
    DuplicateInterrupt {
        kind: InterruptType,
        plan_execution_id: String,
    },

    #[error("invalid resource constraint: {0}")]
    InvalidConstraint(String),

    #[error("facilitation timed out after {0} ms")]
    FacilitationTimeout(u64),

    #[error("no facilitator applicable for plan node '{0}'")]
    NoApplicableFacilitator(String),

    #[error("task dispatch timed out after {0} ms")]
    DispatchTimeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("step error: {0}")]
    Step(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for plan execution '{0}'")]
    WaitTimeout(String),

    #[error("kernel event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl KernelError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = KernelError::not_found("node execution", "abc");
        assert_eq!(err.to_string(), "node execution 'abc' not found");
    }

    #[test]
    fn test_duplicate_interrupt_message() {
        let err = KernelError::DuplicateInterrupt {
            kind: InterruptType::Abort,
            plan_execution_id: "pe-1".to_string(),
        };
        assert!(err.to_string().contains("ABORT"));
        assert!(err.to_string().contains("pe-1"));
    }

    #[test]
    fn test_validation_error_converts() {
        let err: KernelError = ValidationError::EmptyPlan.into();
        assert!(matches!(err, KernelError::InvalidPlan(_)));
    }
}
