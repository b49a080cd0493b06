use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::FailureKind;

/// Events that can trigger step execution state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StepEvent {
    /// Start processing the step on the allocated resource
    Start { resource: Option<String> },
    /// Mark step as complete with optional results
    Complete(Option<Value>),
    /// Mark step as failed
    Fail { reason: String, kind: FailureKind },
    /// Return a failed step to pending for another attempt
    Retry,
    /// Skip a pending or failed step
    Skip(SkipReason),
    /// Cancel a pending or failed step
    Cancel,
}

impl StepEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::Retry => "retry",
            Self::Skip(_) => "skip",
            Self::Cancel => "cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn start(resource: Option<String>) -> Self {
        Self::Start { resource }
    }

    pub fn complete_with_results(results: Value) -> Self {
        Self::Complete(Some(results))
    }

    pub fn executor_failure(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            kind: FailureKind::Executor,
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            kind: FailureKind::Timeout,
        }
    }

    pub fn dispatch_failure(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            kind: FailureKind::Dispatch,
        }
    }
}

/// Why a step is being skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Operator request
    Operator,
    /// Failed step exhausted its retries but the order may continue without it
    RetriesExhausted,
    /// `OnCondition` gate evaluated false
    ConditionNotMet,
    /// Belongs to the branch a decision did not take
    BranchNotTaken,
    /// Optional step left over when the order completed
    OrderCompleted,
}

impl SkipReason {
    /// Reasons that require the step itself to permit skipping.
    pub fn requires_skippable_step(&self) -> bool {
        matches!(self, Self::Operator | Self::RetriesExhausted | Self::ConditionNotMet)
    }
}

/// Events that can trigger work order state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkOrderEvent {
    Schedule,
    /// First step started
    Start,
    Complete,
    Fail(String),
    Cancel,
    Hold,
    Resume,
}

impl WorkOrderEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Hold => "hold",
            Self::Resume => "resume",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_) | Self::Cancel)
    }
}
