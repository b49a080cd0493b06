use thiserror::Error;
use uuid::Uuid;

/// Main error type for state machine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Retry limit exceeded for execution {execution_id}: {retry_count}/{max_retry_count}")]
    RetryLimitExceeded {
        execution_id: Uuid,
        retry_count: u32,
        max_retry_count: u32,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Retry limit reached: {retry_count}/{max_retry_count}")]
    RetryLimitReached { retry_count: u32, max_retry_count: u32 },

    #[error("Step {step_number} is mandatory and not skippable")]
    NotSkippable { step_number: u32 },

    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Invalid state for guard check: {state}")]
    InvalidState { state: String },
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        Self::GuardFailed {
            reason: err.to_string(),
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

/// Helper function to create business rule violation errors
pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}
