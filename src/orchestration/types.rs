//! # Orchestration Types
//!
//! Shared shapes passed between the scheduler, the lifecycle controller and
//! the orchestrator facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step_executor::{DispatchError, StepOutcome};
use crate::models::{ExecutionId, StepExecution, WorkOrder, WorkOrderId};
use crate::state_machine::{ExecutionStatus, WorkOrderStatus};

/// Executor result delivered back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub execution_id: ExecutionId,
    pub work_order_id: WorkOrderId,
    pub attempt: u32,
    pub result: Result<StepOutcome, DispatchError>,
}

/// What one scheduler invocation did for an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerPassResult {
    /// Steps handed to an executor
    pub dispatched: Vec<u32>,
    /// Wait and decision steps completed without dispatch
    pub resolved: Vec<u32>,
    pub skipped: Vec<u32>,
    /// Steps whose dispatch failed before reaching an executor
    pub failed: Vec<u32>,
    /// Eligible steps left Pending, with the reason
    pub blocked: Vec<(u32, String)>,
}

impl SchedulerPassResult {
    pub fn made_progress(&self) -> bool {
        !(self.dispatched.is_empty() && self.resolved.is_empty() && self.skipped.is_empty() && self.failed.is_empty())
    }

    pub fn absorb(&mut self, other: SchedulerPassResult) {
        self.dispatched.extend(other.dispatched);
        self.resolved.extend(other.resolved);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        // Only the latest pass's blockers are still current.
        self.blocked = other.blocked;
    }
}

/// Action the lifecycle controller took after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizationAction {
    Completed,
    Failed,
    Cancelled,
    /// Termination requested; waiting for in-flight steps
    Draining,
    /// Still running; progress updated
    Continued,
    NoAction,
}

/// How a failed step is handled once its failure is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureResolution {
    /// Back to Pending, dispatchable from `eligible_at`
    Retry { eligible_at: Option<DateTime<Utc>> },
    /// Retries exhausted on a step the order can do without
    Skip,
    /// Retries exhausted on a mandatory step
    FailOrder(String),
    /// Automatic retry disabled; the step waits for an operator
    AwaitOperator,
}

/// Per-step view exposed by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusReport {
    pub execution_id: ExecutionId,
    pub step_number: u32,
    pub name: String,
    pub status: ExecutionStatus,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub last_error: Option<String>,
    pub assigned_resource: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Operator-facing status of a work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderStatusReport {
    pub work_order_id: WorkOrderId,
    pub order_number: String,
    pub status: WorkOrderStatus,
    pub progress_percentage: f64,
    pub current_step: u32,
    pub cancellation_requested: bool,
    pub failure_reason: Option<String>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub steps: Vec<StepStatusReport>,
}

impl WorkOrderStatusReport {
    pub fn build(order: &WorkOrder, executions: &[StepExecution], graph: &crate::graph::StepGraph) -> Self {
        let steps = executions
            .iter()
            .map(|execution| {
                let definition = graph.step(execution.step_number);
                StepStatusReport {
                    execution_id: execution.id,
                    step_number: execution.step_number,
                    name: definition.map(|d| d.name.clone()).unwrap_or_default(),
                    status: execution.status,
                    retry_count: execution.retry_count,
                    max_retry_count: definition.map(|d| d.max_retry_count).unwrap_or_default(),
                    last_error: execution.error_message.clone(),
                    assigned_resource: execution.assigned_resource.clone(),
                    started_at: execution.started_at,
                    ended_at: execution.ended_at,
                }
            })
            .collect();

        Self {
            work_order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            progress_percentage: order.progress_percentage,
            current_step: order.current_step,
            cancellation_requested: order.cancellation_requested(),
            failure_reason: order.failure_reason.clone(),
            actual_start: order.actual_start,
            actual_end: order.actual_end,
            steps,
        }
    }

    pub fn step(&self, step_number: u32) -> Option<&StepStatusReport> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }
}

/// An InProgress attempt found past its timeout by the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOutStep {
    pub work_order_id: WorkOrderId,
    pub execution_id: Uuid,
    pub step_number: u32,
    pub attempt: u32,
    pub timeout_seconds: u64,
}

/// Result of advancing one order: the scheduler passes plus finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceOutcome {
    pub pass: SchedulerPassResult,
    pub action: FinalizationAction,
}

impl AdvanceOutcome {
    pub fn idle() -> Self {
        Self {
            pass: SchedulerPassResult::default(),
            action: FinalizationAction::NoAction,
        }
    }
}
