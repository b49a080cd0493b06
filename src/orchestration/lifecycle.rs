//! # Work Order Lifecycle
//!
//! Decides what happens to a work order after its steps move: progress,
//! completion, failure and cooperative cancellation, and the retry policy
//! applied to each failed step.
//!
//! Termination is cooperative. Cancelling (or failing) an order first records
//! a pending outcome; Pending and Failed steps are cancelled at once, while
//! in-flight steps are left to finish or time out. Only when nothing is in
//! progress are the order's resources released and its status made terminal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::context::OrchestrationContext;
use super::types::{FailureResolution, FinalizationAction};
use crate::allocation::ResourceAllocator;
use crate::config::RetryConfig;
use crate::constants::events;
use crate::error::MesResult;
use crate::events::AuditEntry;
use crate::graph::StepGraph;
use crate::logging::log_work_order_operation;
use crate::models::{PendingOutcome, StepDefinition, StepExecution, WorkOrder};
use crate::state_machine::{
    ExecutionStatus, SkipReason, StepEvent, StepStateMachine, WorkOrderEvent, WorkOrderGuardContext,
    WorkOrderStateMachine, WorkOrderStatus,
};

/// `completed mandatory / total mandatory * 100`; an order with no mandatory
/// steps counts as done.
pub fn progress_percentage(graph: &StepGraph, executions: &[StepExecution]) -> f64 {
    let total = graph.mandatory_step_count();
    if total == 0 {
        return 100.0;
    }
    let done = executions
        .iter()
        .filter(|execution| {
            execution.status.satisfies_dependencies()
                && graph
                    .step(execution.step_number)
                    .is_some_and(StepDefinition::counts_as_mandatory)
        })
        .count();
    done as f64 / total as f64 * 100.0
}

/// Retry policy for a step that has just been marked Failed.
pub fn resolve_failure(
    config: &RetryConfig,
    definition: &StepDefinition,
    execution: &StepExecution,
    now: DateTime<Utc>,
) -> FailureResolution {
    if execution.retry_count < definition.max_retry_count {
        if !config.auto_retry {
            return FailureResolution::AwaitOperator;
        }
        let backoff = config.backoff_for(execution.retry_count);
        let eligible_at = chrono::Duration::from_std(backoff)
            .ok()
            .filter(|delay| !delay.is_zero())
            .map(|delay| now + delay);
        return FailureResolution::Retry { eligible_at };
    }

    if definition.may_be_skipped() {
        return FailureResolution::Skip;
    }

    FailureResolution::FailOrder(format!(
        "Step {} ({}) failed after {} retries: {}",
        definition.step_number,
        definition.name,
        execution.retry_count,
        execution.error_message.as_deref().unwrap_or("unknown error"),
    ))
}

/// Moves a work order toward its terminal state once its steps allow it.
pub struct WorkOrderFinalizer {
    context: OrchestrationContext,
    allocator: Arc<ResourceAllocator>,
}

impl WorkOrderFinalizer {
    pub fn new(context: OrchestrationContext, allocator: Arc<ResourceAllocator>) -> Self {
        Self { context, allocator }
    }

    /// Evaluate the order after a scheduler pass. Mutates `order` and
    /// `executions` and persists both.
    pub async fn finalize(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
    ) -> MesResult<FinalizationAction> {
        if order.is_terminal() {
            return Ok(FinalizationAction::NoAction);
        }

        if let Some(outcome) = order.pending_outcome.clone() {
            return self.drain(order, graph, executions, outcome).await;
        }

        let progress = progress_percentage(graph, executions);
        if (progress - order.progress_percentage).abs() > f64::EPSILON {
            order.record_progress(progress);
            order.updated_at = self.context.now();
            self.context.work_orders.update_work_order(order).await?;
        }

        if order.status != WorkOrderStatus::InProgress || !Self::mandatory_steps_done(graph, executions) {
            return Ok(FinalizationAction::Continued);
        }

        self.complete(order, graph, executions).await
    }

    fn mandatory_steps_done(graph: &StepGraph, executions: &[StepExecution]) -> bool {
        !executions.iter().any(|e| e.status == ExecutionStatus::InProgress)
            && executions.iter().all(|execution| {
                execution.status.satisfies_dependencies()
                    || !graph
                        .step(execution.step_number)
                        .is_some_and(StepDefinition::counts_as_mandatory)
            })
    }

    async fn complete(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
    ) -> MesResult<FinalizationAction> {
        let now = self.context.now();

        // Optional steps that never got to run are closed out.
        let mut leftovers = Vec::new();
        for execution in executions.iter_mut() {
            if !matches!(execution.status, ExecutionStatus::Pending | ExecutionStatus::Failed) {
                continue;
            }
            let Some(definition) = graph.step(execution.step_number) else {
                continue;
            };
            StepStateMachine::new(execution, definition).transition(StepEvent::Skip(SkipReason::OrderCompleted), now)?;
            leftovers.push(execution.clone());
        }
        if !leftovers.is_empty() {
            self.context.work_orders.update_executions(&leftovers).await?;
        }

        WorkOrderStateMachine::new(order)
            .with_steps(WorkOrderGuardContext {
                graph,
                executions: &*executions,
            })
            .transition(WorkOrderEvent::Complete, now)?;

        let completed_stock = self.allocator.complete_for_work_order(order.id).await?;
        if let Err(err) = self.allocator.record_usage(order.pallet_id).await {
            warn!(work_order_id = %order.id, pallet_id = order.pallet_id, error = %err, "Failed to record pallet usage");
        }
        self.context.work_orders.update_work_order(order).await?;

        log_work_order_operation(
            "complete",
            Some(order.id),
            Some(&order.order_number),
            "completed",
            Some(&format!("{} stock unit(s) completed", completed_stock.len())),
        );
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_COMPLETED, format!("Work order {} completed", order.order_number))
                .for_order(order.id)
                .with_details(serde_json::json!({
                    "duration_seconds": order.duration().map(|d| d.num_seconds()),
                    "skipped_optional_steps": leftovers.iter().map(|e| e.step_number).collect::<Vec<_>>(),
                })),
        );
        Ok(FinalizationAction::Completed)
    }

    async fn drain(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
        outcome: PendingOutcome,
    ) -> MesResult<FinalizationAction> {
        let now = self.context.now();

        // A failing order keeps its Failed steps so their last error stays visible.
        let cancel_failed = matches!(outcome, PendingOutcome::Cancelled);
        let mut cancelled = Vec::new();
        for execution in executions.iter_mut() {
            let cancellable = match execution.status {
                ExecutionStatus::Pending => true,
                ExecutionStatus::Failed => cancel_failed,
                _ => false,
            };
            if !cancellable {
                continue;
            }
            let Some(definition) = graph.step(execution.step_number) else {
                continue;
            };
            StepStateMachine::new(execution, definition).transition(StepEvent::Cancel, now)?;
            self.context.record(
                AuditEntry::info(events::STEP_CANCELLED, format!("Step {} cancelled", execution.step_number))
                    .for_step(order.id, execution.id, execution.step_number),
            );
            cancelled.push(execution.clone());
        }
        if !cancelled.is_empty() {
            self.context.work_orders.update_executions(&cancelled).await?;
        }

        let in_flight: Vec<u32> = executions
            .iter()
            .filter(|execution| execution.status == ExecutionStatus::InProgress)
            .map(|execution| execution.step_number)
            .collect();
        if !in_flight.is_empty() {
            info!(
                work_order_id = %order.id,
                in_flight = ?in_flight,
                "Waiting for in-flight steps before terminating work order"
            );
            return Ok(FinalizationAction::Draining);
        }

        self.release_resources(order).await?;

        let (event, action, audit_event) = match &outcome {
            PendingOutcome::Cancelled => (WorkOrderEvent::Cancel, FinalizationAction::Cancelled, events::WORK_ORDER_CANCELLED),
            PendingOutcome::Failed(reason) => (
                WorkOrderEvent::Fail(reason.clone()),
                FinalizationAction::Failed,
                events::WORK_ORDER_FAILED,
            ),
        };
        WorkOrderStateMachine::new(order).transition(event, now)?;
        order.record_progress(progress_percentage(graph, executions));
        self.context.work_orders.update_work_order(order).await?;

        log_work_order_operation(
            "finalize",
            Some(order.id),
            Some(&order.order_number),
            &order.status.to_string(),
            order.failure_reason.as_deref(),
        );
        let entry = match outcome {
            PendingOutcome::Cancelled => {
                AuditEntry::warning(audit_event, format!("Work order {} cancelled", order.order_number))
            }
            PendingOutcome::Failed(reason) => {
                AuditEntry::error(audit_event, format!("Work order {} failed: {reason}", order.order_number))
            }
        };
        self.context.record(entry.for_order(order.id));
        Ok(action)
    }

    /// Undo the order's occupancy changes and return its stock to Available.
    async fn release_resources(&self, order: &mut WorkOrder) -> MesResult<()> {
        let ledger = std::mem::take(&mut order.occupancy_ledger);
        for (pallet_id, delta) in ledger {
            let change = self.allocator.update_occupancy(pallet_id, -delta).await?;
            if change.applied_delta() != -delta {
                warn!(
                    work_order_id = %order.id,
                    pallet_id = pallet_id,
                    expected = -delta,
                    applied = change.applied_delta(),
                    "Occupancy rollback was clamped"
                );
            }
        }

        let released = self.allocator.release_for_work_order(order.id).await?;
        info!(work_order_id = %order.id, released = released.len(), "Released work order stock");
        Ok(())
    }
}
