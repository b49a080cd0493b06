//! # Execution Scheduler
//!
//! Runs scheduler passes for one work order and applies step outcomes.
//!
//! Callers hold the order's lock for the whole call, so passes for one order
//! never interleave. A pass takes the classification from
//! [`ViableStepDiscovery`], then for each step: resolves wait and decision
//! steps in place, allocates resources and dispatches executor steps, or
//! leaves the step Pending with a reason. Passes repeat until one changes
//! nothing, which is how an `Immediate` step and its successor start together.
//!
//! Retryable allocation errors leave the step Pending and do not consume a
//! retry. Executor failures, dispatch errors and timeouts do.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::context::OrchestrationContext;
use super::lifecycle::resolve_failure;
use super::step_executor::{ActionPayload, AssignedResource, DispatchError, DispatchRequest, StepOutcome};
use super::types::{CompletionMessage, FailureResolution, SchedulerPassResult};
use super::viable_step_discovery::{CandidateAction, ViableStepDiscovery};
use crate::allocation::{AllocationError, AllocationResult, ResourceAllocator};
use crate::constants::events;
use crate::error::{MesError, MesResult};
use crate::events::{AuditEntry, AuditLevel};
use crate::graph::{condition_context, StepGraph};
use crate::logging::{log_allocation_operation, log_step_operation};
use crate::models::{ActionType, ExecutionId, PendingOutcome, StepDefinition, StepExecution, WorkOrder};
use crate::state_machine::{
    ExecutionStatus, SkipReason, StepEvent, StepStateMachine, WorkOrderEvent, WorkOrderStateMachine,
};

enum DispatchDisposition {
    Dispatched,
    Unavailable(String),
    Failed,
}

pub struct ExecutionScheduler {
    context: OrchestrationContext,
    allocator: Arc<ResourceAllocator>,
    completions: mpsc::Sender<CompletionMessage>,
}

impl ExecutionScheduler {
    pub fn new(
        context: OrchestrationContext,
        allocator: Arc<ResourceAllocator>,
        completions: mpsc::Sender<CompletionMessage>,
    ) -> Self {
        Self {
            context,
            allocator,
            completions,
        }
    }

    /// Run passes until one makes no progress.
    #[instrument(skip_all, fields(work_order_id = %order.id))]
    pub async fn schedule(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
    ) -> MesResult<SchedulerPassResult> {
        // Every progressing pass moves at least one attempt forward, and
        // attempts are bounded by the retry budgets.
        let max_passes = graph
            .steps()
            .iter()
            .map(|step| step.max_retry_count as usize + 2)
            .sum::<usize>()
            + 1;

        let mut total = SchedulerPassResult::default();
        for _ in 0..max_passes {
            if !order.accepts_dispatch() {
                break;
            }
            let pass = self.run_pass(order, graph, executions).await?;
            let progressed = pass.made_progress();
            total.absorb(pass);
            if !progressed {
                break;
            }
        }

        if !total.blocked.is_empty() {
            debug!(work_order_id = %order.id, blocked = ?total.blocked, "Steps left pending");
        }
        Ok(total)
    }

    async fn run_pass(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
    ) -> MesResult<SchedulerPassResult> {
        let context = condition_context(&order.parameters, executions);
        let viable = ViableStepDiscovery::find_viable_steps(graph, executions, &context, self.context.now());

        let mut result = SchedulerPassResult::default();
        for candidate in viable {
            if !order.accepts_dispatch() {
                break;
            }
            let Some(index) = executions.iter().position(|e| e.id == candidate.execution_id) else {
                continue;
            };
            let Some(definition) = graph.step(candidate.step_number) else {
                continue;
            };
            let step_number = candidate.step_number;

            match candidate.action {
                CandidateAction::Dispatch => {
                    match self.dispatch_step(order, definition, &mut executions[index]).await? {
                        DispatchDisposition::Dispatched => result.dispatched.push(step_number),
                        DispatchDisposition::Unavailable(reason) => result.blocked.push((step_number, reason)),
                        DispatchDisposition::Failed => result.failed.push(step_number),
                    }
                }
                CandidateAction::ResolveSignal { producer } => {
                    self.resolve_in_process(order, definition, &mut executions[index], json!({ "signal_from": producer }))
                        .await?;
                    result.resolved.push(step_number);
                }
                CandidateAction::SkipUnreachable { producer } => {
                    info!(
                        work_order_id = %order.id,
                        step_number = step_number,
                        producer = producer,
                        "Wait step can no longer be signalled"
                    );
                    self.skip(order, definition, &mut executions[index], SkipReason::BranchNotTaken).await?;
                    result.skipped.push(step_number);
                }
                CandidateAction::ResolveDecision { outcome } => {
                    self.resolve_in_process(order, definition, &mut executions[index], json!({ "outcome": outcome }))
                        .await?;
                    result.resolved.push(step_number);

                    for untaken in graph.untaken_branch(definition, outcome) {
                        let Some(branch_step) = graph.step(untaken) else {
                            continue;
                        };
                        if let Some(execution) = executions
                            .iter_mut()
                            .find(|e| e.step_number == untaken && e.status == ExecutionStatus::Pending)
                        {
                            self.skip(order, branch_step, execution, SkipReason::BranchNotTaken).await?;
                            result.skipped.push(untaken);
                        }
                    }
                }
                CandidateAction::SkipConditionNotMet => {
                    self.skip(order, definition, &mut executions[index], SkipReason::ConditionNotMet).await?;
                    result.skipped.push(step_number);
                }
                CandidateAction::Blocked(reason) => result.blocked.push((step_number, reason)),
            }
        }
        Ok(result)
    }

    async fn dispatch_step(
        &self,
        order: &mut WorkOrder,
        definition: &StepDefinition,
        execution: &mut StepExecution,
    ) -> MesResult<DispatchDisposition> {
        let payload = match ActionPayload::resolve(definition) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail_before_dispatch(order, definition, execution, err.to_string()).await?;
                return Ok(DispatchDisposition::Failed);
            }
        };

        let resource = match self.claim(order, definition, execution.id).await {
            Ok(resource) => resource,
            Err(err @ MesError::ResourceUnavailable { .. }) => {
                let reason = err.to_string();
                log_allocation_operation(
                    "allocate",
                    definition.resource_code().as_deref().unwrap_or("-"),
                    "unavailable",
                    Some(&reason),
                );
                self.context.record(
                    AuditEntry::warning(
                        events::STEP_RESOURCE_UNAVAILABLE,
                        format!("Step {} waiting for resources: {reason}", definition.step_number),
                    )
                    .for_step(order.id, execution.id, definition.step_number)
                    .with_details(json!({ "retry_count": execution.retry_count })),
                );
                return Ok(DispatchDisposition::Unavailable(reason));
            }
            Err(err) => {
                self.fail_before_dispatch(order, definition, execution, err.to_string()).await?;
                return Ok(DispatchDisposition::Failed);
            }
        };

        self.ensure_started(order).await?;
        let now = self.context.now();
        StepStateMachine::new(execution, definition).transition(StepEvent::start(resource.code.clone()), now)?;
        self.context.work_orders.update_execution(execution).await?;
        order.current_step = definition.step_number;
        order.updated_at = now;
        self.context.work_orders.update_work_order(order).await?;

        log_step_operation(
            "dispatch",
            Some(order.id),
            Some(execution.id),
            Some(definition.step_number),
            "in_progress",
            resource.code.as_deref(),
        );
        self.context.record(
            AuditEntry::info(
                events::STEP_STARTED,
                format!("Step {} ({}) started", definition.step_number, definition.name),
            )
            .for_step(order.id, execution.id, definition.step_number)
            .with_resource(resource.code.clone().unwrap_or_default())
            .with_details(json!({ "attempt": execution.attempt(), "target_system": definition.target_system })),
        );

        self.spawn_dispatch(DispatchRequest {
            execution_id: execution.id,
            work_order_id: order.id,
            attempt: execution.attempt(),
            step: definition.clone(),
            resource,
            payload,
        });
        Ok(DispatchDisposition::Dispatched)
    }

    /// Retryable allocation failures come back as [`MesError::ResourceUnavailable`].
    async fn claim(
        &self,
        order: &WorkOrder,
        definition: &StepDefinition,
        execution_id: ExecutionId,
    ) -> MesResult<AssignedResource> {
        self.allocate(order, definition).await.map_err(|err| {
            if err.is_retryable() {
                MesError::ResourceUnavailable {
                    execution_id,
                    reason: err.to_string(),
                }
            } else {
                MesError::Allocation(err)
            }
        })
    }

    /// Claim what the step's action needs before it is dispatched.
    async fn allocate(&self, order: &WorkOrder, definition: &StepDefinition) -> AllocationResult<AssignedResource> {
        let mut resource = AssignedResource {
            code: definition.resource_code(),
            location_id: None,
            pallet_id: order.pallet_id,
            stock_unit_id: order.stock_unit_id,
        };

        match definition.action {
            ActionType::Move | ActionType::ChargeMove | ActionType::Transfer => {
                if let Some(code) = resource.code.as_deref() {
                    let target = self.allocator.location_by_code(code).await?;
                    let reason = format!("{} step {}", order.order_number, definition.step_number);
                    let moved = self.allocator.move_pallet(order.pallet_id, target.id, Some(&reason)).await?;
                    resource.location_id = Some(moved.to);
                }
            }
            ActionType::Load | ActionType::StationUnload => {
                let pallet = self.allocator.store().pallet(order.pallet_id).await?;
                if pallet.current_location_id.is_none() {
                    return Err(AllocationError::PalletNotPlaced { pallet_id: pallet.id });
                }
                if pallet.is_full() {
                    return Err(AllocationError::PalletFull { pallet_id: pallet.id });
                }
                resource.location_id = pallet.current_location_id;
            }
            ActionType::Unload | ActionType::StationLoad => {
                let pallet = self.allocator.store().pallet(order.pallet_id).await?;
                resource.location_id = pallet.current_location_id;
            }
            ActionType::Process | ActionType::Inspect => {
                self.allocator
                    .mark_in_process(order.stock_unit_id, definition.step_number)
                    .await?;
            }
            ActionType::Notify | ActionType::WaitForSignal | ActionType::CheckCondition => {}
        }
        Ok(resource)
    }

    fn spawn_dispatch(&self, request: DispatchRequest) {
        let executor = Arc::clone(&self.context.executor);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let execution_id = request.execution_id;
            let work_order_id = request.work_order_id;
            let attempt = request.attempt;
            let result = executor.dispatch(request).await;
            let message = CompletionMessage {
                execution_id,
                work_order_id,
                attempt,
                result,
            };
            if completions.send(message).await.is_err() {
                debug!(execution_id = %execution_id, "Completion channel closed; outcome dropped");
            }
        });
    }

    /// Created/Scheduled → InProgress on the order's first started step.
    async fn ensure_started(&self, order: &mut WorkOrder) -> MesResult<()> {
        if !order.status.is_waiting_to_start() {
            return Ok(());
        }
        WorkOrderStateMachine::new(order).transition(WorkOrderEvent::Start, self.context.now())?;
        self.context.work_orders.update_work_order(order).await?;
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_STARTED, format!("Work order {} started", order.order_number))
                .for_order(order.id),
        );
        Ok(())
    }

    async fn resolve_in_process(
        &self,
        order: &mut WorkOrder,
        definition: &StepDefinition,
        execution: &mut StepExecution,
        result: serde_json::Value,
    ) -> MesResult<()> {
        self.ensure_started(order).await?;
        let now = self.context.now();
        {
            let mut machine = StepStateMachine::new(execution, definition);
            machine.transition(StepEvent::start(None), now)?;
            machine.transition(StepEvent::complete_with_results(result.clone()), now)?;
        }
        self.context.work_orders.update_execution(execution).await?;

        self.context.record(
            AuditEntry::info(
                events::STEP_COMPLETED,
                format!("Step {} ({}) resolved", definition.step_number, definition.name),
            )
            .for_step(order.id, execution.id, definition.step_number)
            .with_details(result),
        );
        Ok(())
    }

    async fn skip(
        &self,
        order: &WorkOrder,
        definition: &StepDefinition,
        execution: &mut StepExecution,
        reason: SkipReason,
    ) -> MesResult<()> {
        StepStateMachine::new(execution, definition).transition(StepEvent::Skip(reason), self.context.now())?;
        self.context.work_orders.update_execution(execution).await?;
        self.context.record(
            AuditEntry::info(
                events::STEP_SKIPPED,
                format!("Step {} ({}) skipped", definition.step_number, definition.name),
            )
            .for_step(order.id, execution.id, definition.step_number)
            .with_details(json!({ "reason": reason })),
        );
        Ok(())
    }

    async fn fail_before_dispatch(
        &self,
        order: &mut WorkOrder,
        definition: &StepDefinition,
        execution: &mut StepExecution,
        reason: String,
    ) -> MesResult<()> {
        warn!(
            work_order_id = %order.id,
            step_number = definition.step_number,
            reason = %reason,
            "Step could not be dispatched"
        );
        StepStateMachine::new(execution, definition)
            .transition(StepEvent::dispatch_failure(reason.clone()), self.context.now())?;
        self.context.record(
            AuditEntry::error(
                events::STEP_FAILED,
                format!("Step {} could not be dispatched: {reason}", definition.step_number),
            )
            .for_step(order.id, execution.id, definition.step_number),
        );
        self.apply_failure_policy(order, definition, execution).await?;
        Ok(())
    }

    /// Apply an executor outcome. Returns false when the outcome belongs to an
    /// attempt that is no longer in flight.
    #[instrument(skip(self, order, graph, executions, result), fields(work_order_id = %order.id))]
    pub async fn apply_outcome(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
        execution_id: ExecutionId,
        attempt: u32,
        result: Result<StepOutcome, DispatchError>,
    ) -> MesResult<bool> {
        let Some(index) = self.in_flight_index(order, executions, execution_id, attempt) else {
            return Ok(false);
        };
        let definition = Self::definition(graph, &executions[index])?;
        let now = self.context.now();

        match result {
            Ok(StepOutcome::Success(data)) => {
                let execution = &mut executions[index];
                StepStateMachine::new(execution, definition).transition(StepEvent::Complete(data), now)?;
                self.context.work_orders.update_execution(execution).await?;
                log_step_operation(
                    "complete",
                    Some(order.id),
                    Some(execution.id),
                    Some(definition.step_number),
                    "completed",
                    None,
                );
                self.context.record(
                    AuditEntry::info(
                        events::STEP_COMPLETED,
                        format!("Step {} ({}) completed", definition.step_number, definition.name),
                    )
                    .for_step(order.id, execution.id, definition.step_number)
                    .with_details(json!({ "duration_ms": execution.duration().map(|d| d.num_milliseconds()) })),
                );
                self.apply_completion_effects(order, graph, definition, executions).await?;
            }
            Ok(StepOutcome::Failure(reason)) => {
                self.fail_in_flight(order, graph, definition, executions, index, StepEvent::executor_failure(reason))
                    .await?;
            }
            Err(err) => {
                self.fail_in_flight(order, graph, definition, executions, index, StepEvent::dispatch_failure(err.to_string()))
                    .await?;
            }
        }
        Ok(true)
    }

    /// Fail an in-flight attempt that exceeded its timeout.
    pub async fn apply_timeout(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
        execution_id: ExecutionId,
        attempt: u32,
        timeout_seconds: u64,
    ) -> MesResult<bool> {
        let Some(index) = self.in_flight_index(order, executions, execution_id, attempt) else {
            return Ok(false);
        };
        let definition = Self::definition(graph, &executions[index])?;
        self.context.record(
            AuditEntry::warning(
                events::STEP_TIMED_OUT,
                format!("Step {} exceeded its {timeout_seconds}s timeout", definition.step_number),
            )
            .for_step(order.id, execution_id, definition.step_number)
            .with_details(json!({ "attempt": attempt })),
        );
        let event = StepEvent::timeout(format!("Timeout after {timeout_seconds}s"));
        self.fail_in_flight(order, graph, definition, executions, index, event).await?;
        Ok(true)
    }

    fn in_flight_index(
        &self,
        order: &WorkOrder,
        executions: &[StepExecution],
        execution_id: ExecutionId,
        attempt: u32,
    ) -> Option<usize> {
        let index = executions.iter().position(|e| e.id == execution_id)?;
        let execution = &executions[index];
        if execution.status == ExecutionStatus::InProgress && execution.attempt() == attempt {
            return Some(index);
        }
        debug!(
            execution_id = %execution_id,
            attempt = attempt,
            current_attempt = execution.attempt(),
            status = %execution.status,
            "Ignoring outcome for an attempt that is no longer in flight"
        );
        self.context.record(
            AuditEntry::new(
                AuditLevel::Debug,
                events::STEP_LATE_OUTCOME_IGNORED,
                format!("Late outcome for step {} ignored", execution.step_number),
            )
            .for_step(order.id, execution_id, execution.step_number)
            .with_details(json!({ "attempt": attempt, "current_attempt": execution.attempt() })),
        );
        None
    }

    fn definition<'g>(graph: &'g StepGraph, execution: &StepExecution) -> MesResult<&'g StepDefinition> {
        graph.step(execution.step_number).ok_or_else(|| {
            MesError::Internal(format!(
                "Execution {} references step {} missing from graph {}",
                execution.id, execution.step_number, graph.id
            ))
        })
    }

    async fn fail_in_flight(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        definition: &StepDefinition,
        executions: &mut [StepExecution],
        index: usize,
        event: StepEvent,
    ) -> MesResult<()> {
        let reason = event.error_message().unwrap_or_default().to_string();
        {
            let execution = &mut executions[index];
            StepStateMachine::new(execution, definition).transition(event, self.context.now())?;
            log_step_operation(
                "fail",
                Some(order.id),
                Some(execution.id),
                Some(definition.step_number),
                "failed",
                Some(&reason),
            );
            self.context.record(
                AuditEntry::error(
                    events::STEP_FAILED,
                    format!("Step {} ({}) failed: {reason}", definition.step_number, definition.name),
                )
                .for_step(order.id, execution.id, definition.step_number)
                .with_details(json!({ "attempt": execution.attempt(), "kind": execution.failure_kind })),
            );
        }
        self.release_process_hold(order, graph, definition, executions).await;
        self.apply_failure_policy(order, definition, &mut executions[index]).await
    }

    /// Retry, skip or fail the order for a step that was just marked Failed.
    async fn apply_failure_policy(
        &self,
        order: &mut WorkOrder,
        definition: &StepDefinition,
        execution: &mut StepExecution,
    ) -> MesResult<()> {
        // A terminating order does not retry; draining cancels the step.
        if order.is_draining() {
            self.context.work_orders.update_execution(execution).await?;
            return Ok(());
        }

        let now = self.context.now();
        match resolve_failure(&self.context.config.retry, definition, execution, now) {
            FailureResolution::Retry { eligible_at } => {
                StepStateMachine::new(execution, definition).transition(StepEvent::Retry, now)?;
                execution.next_eligible_at = eligible_at;
                self.context.record(
                    AuditEntry::info(
                        events::STEP_RETRY_SCHEDULED,
                        format!(
                            "Step {} retry {}/{}",
                            definition.step_number, execution.retry_count, definition.max_retry_count
                        ),
                    )
                    .for_step(order.id, execution.id, definition.step_number)
                    .with_details(json!({ "eligible_at": eligible_at })),
                );
            }
            FailureResolution::Skip => {
                self.context.record(
                    AuditEntry::warning(
                        events::STEP_RETRY_EXHAUSTED,
                        format!("Step {} exhausted its retries and is skipped", definition.step_number),
                    )
                    .for_step(order.id, execution.id, definition.step_number),
                );
                StepStateMachine::new(execution, definition)
                    .transition(StepEvent::Skip(SkipReason::RetriesExhausted), now)?;
            }
            FailureResolution::FailOrder(reason) => {
                self.context.record(
                    AuditEntry::error(events::STEP_RETRY_EXHAUSTED, reason.clone())
                        .for_step(order.id, execution.id, definition.step_number),
                );
                order.pending_outcome = Some(PendingOutcome::Failed(reason));
                order.updated_at = now;
                self.context.work_orders.update_work_order(order).await?;
            }
            FailureResolution::AwaitOperator => {
                self.context.record(
                    AuditEntry::warning(
                        events::STEP_FAILED,
                        format!("Step {} failed; waiting for operator retry", definition.step_number),
                    )
                    .for_step(order.id, execution.id, definition.step_number),
                );
            }
        }
        self.context.work_orders.update_execution(execution).await?;
        Ok(())
    }

    /// Resource changes that take effect when a step physically completes.
    async fn apply_completion_effects(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        definition: &StepDefinition,
        executions: &[StepExecution],
    ) -> MesResult<()> {
        if definition.action.holds_stock() {
            self.release_process_hold(order, graph, definition, executions).await;
            return Ok(());
        }
        let delta = definition.action.occupancy_delta();
        if delta == 0 {
            return Ok(());
        }

        match self.allocator.update_occupancy(order.pallet_id, delta).await {
            Ok(change) => {
                order.record_occupancy(order.pallet_id, change.applied_delta());
                order.updated_at = self.context.now();
                self.context.work_orders.update_work_order(order).await?;
            }
            Err(err) => {
                // The physical step already happened; record the mismatch and move on.
                warn!(
                    work_order_id = %order.id,
                    pallet_id = order.pallet_id,
                    step_number = definition.step_number,
                    error = %err,
                    "Occupancy update after step completion failed"
                );
            }
        }
        Ok(())
    }

    /// Return the stock from InProcess to Reserved once no other process
    /// step of the order is still running.
    async fn release_process_hold(
        &self,
        order: &WorkOrder,
        graph: &StepGraph,
        definition: &StepDefinition,
        executions: &[StepExecution],
    ) {
        if !definition.action.holds_stock() {
            return;
        }
        let still_processing = executions.iter().any(|execution| {
            execution.status == ExecutionStatus::InProgress
                && execution.step_number != definition.step_number
                && graph
                    .step(execution.step_number)
                    .is_some_and(|other| other.action.holds_stock())
        });
        if still_processing {
            return;
        }
        if let Err(err) = self.allocator.finish_processing(order.stock_unit_id).await {
            debug!(work_order_id = %order.id, error = %err, "Stock not released from processing");
        }
    }
}
