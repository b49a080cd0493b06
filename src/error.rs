//! Error types for the MES core.
//!
//! Component errors live next to their components; [`MesError`] aggregates
//! them for the orchestrator's public operations.

use thiserror::Error;
use uuid::Uuid;

use crate::allocation::AllocationError;
use crate::graph::GraphValidationErrors;
use crate::orchestration::DispatchError;
use crate::persistence::PersistenceError;
use crate::state_machine::{GuardError, StateMachineError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MesError {
    #[error("Graph validation error: {0}")]
    GraphValidation(#[from] GraphValidationErrors),

    #[error("Resource unavailable for execution {execution_id}: {reason}")]
    ResourceUnavailable { execution_id: Uuid, reason: String },

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Work order {work_order_id} is {status} and cannot accept {operation}")]
    InvalidWorkOrderState {
        work_order_id: Uuid,
        status: String,
        operation: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MesError {
    /// Transient conditions the next scheduler pass (or a caller retry) may resolve.
    ///
    /// Retryable errors never consume a step's retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            MesError::ResourceUnavailable { .. } => true,
            MesError::Allocation(err) => err.is_retryable(),
            MesError::Persistence(PersistenceError::ConcurrentModification { .. }) => true,
            _ => false,
        }
    }
}

impl From<GuardError> for MesError {
    fn from(err: GuardError) -> Self {
        MesError::StateMachine(StateMachineError::from(err))
    }
}

impl From<config::ConfigError> for MesError {
    fn from(err: config::ConfigError) -> Self {
        MesError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for MesError {
    fn from(err: serde_json::Error) -> Self {
        MesError::InvalidInput(format!("JSON serialization error: {err}"))
    }
}

pub type MesResult<T> = anyhow::Result<T, MesError>;
