//! # Orchestrator
//!
//! Public entry point for work order execution. Owns the scheduler, the
//! lifecycle controller, the timeout sweeper and the allocator, and exposes
//! the operations the surrounding application calls.
//!
//! ## Single writer per order
//!
//! Every operation that reads and then writes an order's executions does so
//! under that order's async mutex (`order_locks`). Scheduler passes, outcome
//! handling, timeouts and operator commands for one order therefore never
//! interleave; different orders run concurrently. Physical resources shared
//! between orders are guarded separately by the allocator's lock table.
//!
//! ## Event flow
//!
//! Dispatch is fire-and-forget: executor results arrive on an internal
//! channel as [`CompletionMessage`]s. [`Orchestrator::run`] drains that
//! channel and ticks the timeout sweep; tests and embedders may instead pump
//! it with [`Orchestrator::handle_next_outcome`] or
//! [`Orchestrator::run_until_settled`], or report outcomes directly through
//! [`Orchestrator::handle_outcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::context::OrchestrationContext;
use super::lifecycle::WorkOrderFinalizer;
use super::scheduler::ExecutionScheduler;
use super::step_executor::StepOutcome;
use super::timeout_sweeper::TimeoutSweeper;
use super::types::{AdvanceOutcome, CompletionMessage, TimedOutStep, WorkOrderStatusReport};
use crate::allocation::ResourceAllocator;
use crate::constants::events;
use crate::error::{MesError, MesResult};
use crate::events::{AuditEntry, AuditLevel};
use crate::graph::StepGraph;
use crate::logging::{log_error, log_work_order_operation};
use crate::models::work_order::{next_order_number, order_number_prefix};
use crate::models::{
    ExecutionId, GraphId, PendingOutcome, Priority, ProductId, StepExecution, StockId, StockUnit, WorkOrder,
    WorkOrderId,
};
use crate::state_machine::{
    ExecutionStatus, SkipReason, StepEvent, StepStateMachine, WorkOrderEvent, WorkOrderStateMachine,
    WorkOrderStatus,
};

/// Writer lock on one order. The map entry is dropped with the last guard so
/// finished orders do not keep a mutex alive.
struct OrderGuard<'a> {
    locks: &'a DashMap<WorkOrderId, Arc<Mutex<()>>>,
    work_order_id: WorkOrderId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.work_order_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct Orchestrator {
    context: OrchestrationContext,
    allocator: Arc<ResourceAllocator>,
    scheduler: ExecutionScheduler,
    finalizer: WorkOrderFinalizer,
    sweeper: TimeoutSweeper,
    order_locks: DashMap<WorkOrderId, Arc<Mutex<()>>>,
    /// Serializes order-number allocation.
    creation_lock: Mutex<()>,
    completions: Mutex<mpsc::Receiver<CompletionMessage>>,
}

impl Orchestrator {
    pub fn new(context: OrchestrationContext) -> Self {
        let allocator = Arc::new(ResourceAllocator::new(
            Arc::clone(&context.inventory),
            Arc::clone(&context.clock),
            Arc::clone(&context.audit),
            context.config.lock_timeout(),
        ));
        let (sender, receiver) = mpsc::channel(context.config.events.channel_capacity);

        Self {
            scheduler: ExecutionScheduler::new(context.clone(), Arc::clone(&allocator), sender),
            finalizer: WorkOrderFinalizer::new(context.clone(), Arc::clone(&allocator)),
            sweeper: TimeoutSweeper::new(context.clone()),
            allocator,
            context,
            order_locks: DashMap::new(),
            creation_lock: Mutex::new(()),
            completions: Mutex::new(receiver),
        }
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.context
    }

    /// Allocator for registering and inspecting physical resources.
    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    /// Take the single-writer lock of one order.
    async fn lock_order(&self, work_order_id: WorkOrderId) -> OrderGuard<'_> {
        let mutex = Arc::clone(self.order_locks.entry(work_order_id).or_default().value());
        OrderGuard {
            locks: &self.order_locks,
            work_order_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Number of orders with a live writer lock entry.
    pub fn locked_order_count(&self) -> usize {
        self.order_locks.len()
    }

    /// Store a validated graph so orders can be created against it.
    /// `created_at` is stamped from the orchestrator's clock.
    pub async fn register_graph(&self, mut graph: StepGraph) -> MesResult<Arc<StepGraph>> {
        graph.created_at = self.context.now();
        let graph = self.context.graphs.insert_graph(graph).await?;
        info!(graph_id = %graph.id, code = %graph.code, steps = graph.len(), "Registered step graph");
        Ok(graph)
    }

    /// Create an order for a specific Available stock unit, reserving it.
    #[instrument(skip(self))]
    pub async fn create_work_order(
        &self,
        graph_id: GraphId,
        stock_unit_id: StockId,
        priority: u8,
    ) -> MesResult<WorkOrder> {
        let priority = Priority::new(priority)?;
        let graph = self.active_graph(graph_id).await?;
        let work_order_id = Uuid::new_v4();
        let unit = self.allocator.re_reserve(stock_unit_id, Some(work_order_id)).await?;
        self.insert_reserved_order(work_order_id, &graph, unit, priority).await
    }

    /// Create an order for the oldest Available unit of `product_id`.
    #[instrument(skip(self))]
    pub async fn create_work_order_for_product(
        &self,
        graph_id: GraphId,
        product_id: ProductId,
        priority: u8,
    ) -> MesResult<WorkOrder> {
        let priority = Priority::new(priority)?;
        let graph = self.active_graph(graph_id).await?;
        let work_order_id = Uuid::new_v4();
        let unit = self.allocator.reserve_stock_for(product_id, Some(work_order_id)).await?;
        self.insert_reserved_order(work_order_id, &graph, unit, priority).await
    }

    async fn active_graph(&self, graph_id: GraphId) -> MesResult<Arc<StepGraph>> {
        let graph = self.context.graphs.graph(graph_id).await?;
        if !graph.is_active {
            return Err(MesError::InvalidInput(format!("Step graph {} is inactive", graph.code)));
        }
        Ok(graph)
    }

    async fn insert_reserved_order(
        &self,
        work_order_id: WorkOrderId,
        graph: &StepGraph,
        unit: StockUnit,
        priority: Priority,
    ) -> MesResult<WorkOrder> {
        let result = self.insert_order(work_order_id, graph, &unit, priority).await;
        if result.is_err() {
            if let Err(err) = self.allocator.release_stock(unit.id).await {
                warn!(stock_id = %unit.id, error = %err, "Could not release stock after failed order creation");
            }
        }
        result
    }

    async fn insert_order(
        &self,
        work_order_id: WorkOrderId,
        graph: &StepGraph,
        unit: &StockUnit,
        priority: Priority,
    ) -> MesResult<WorkOrder> {
        let _guard = self.creation_lock.lock().await;
        let now = self.context.now();
        let prefix = order_number_prefix(now.date_naive());
        let existing = self.context.work_orders.order_numbers_with_prefix(&prefix).await?;
        let order_number = next_order_number(now.date_naive(), existing.iter().map(String::as_str));

        let mut order = WorkOrder::new(
            order_number,
            format!("{} / {}", graph.name, unit.stock_number),
            graph.id,
            unit.id,
            unit.pallet_id,
            priority,
            now,
        );
        order.id = work_order_id;

        let executions = graph
            .steps()
            .iter()
            .map(|step| StepExecution::new(order.id, step.step_number, now))
            .collect();
        self.context.work_orders.insert_work_order(order.clone(), executions).await?;

        log_work_order_operation(
            "create",
            Some(order.id),
            Some(&order.order_number),
            "created",
            Some(&graph.code),
        );
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_CREATED, format!("Work order {} created", order.order_number))
                .for_order(order.id)
                .with_resource(unit.stock_number.clone())
                .with_details(json!({ "graph": graph.code, "priority": priority.value(), "steps": graph.len() })),
        );
        Ok(order)
    }

    /// Created → Scheduled with a planned start.
    pub async fn schedule_work_order(&self, work_order_id: WorkOrderId, at: DateTime<Utc>) -> MesResult<WorkOrder> {
        let _guard = self.lock_order(work_order_id).await;

        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        let now = self.context.now();
        WorkOrderStateMachine::new(&mut order)
            .transition(WorkOrderEvent::Schedule, now)
            .map_err(|_| Self::invalid_state(&order, "schedule"))?;
        order.scheduled_start = Some(at);
        self.context.work_orders.update_work_order(&order).await?;
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_SCHEDULED, format!("Work order {} scheduled", order.order_number))
                .for_order(order.id)
                .with_details(json!({ "scheduled_start": at })),
        );
        Ok(order)
    }

    /// Release the order for dispatch. It turns InProgress when its first
    /// step starts.
    #[instrument(skip(self))]
    pub async fn start_work_order(&self, work_order_id: WorkOrderId) -> MesResult<AdvanceOutcome> {
        let _guard = self.lock_order(work_order_id).await;

        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        if !order.status.is_waiting_to_start() || order.is_draining() {
            return Err(Self::invalid_state(&order, "start"));
        }
        if order.start_requested_at.is_none() {
            order.start_requested_at = Some(self.context.now());
            order.updated_at = self.context.now();
            self.context.work_orders.update_work_order(&order).await?;
            log_work_order_operation("start", Some(order.id), Some(&order.order_number), "start_requested", None);
            self.context.record(
                AuditEntry::info(
                    events::WORK_ORDER_START_REQUESTED,
                    format!("Work order {} released for execution", order.order_number),
                )
                .for_order(order.id),
            );
        }
        self.advance_locked(work_order_id).await
    }

    /// Request cancellation. Pending steps are cancelled at once; in-flight
    /// steps finish (or time out) before resources are released.
    #[instrument(skip(self))]
    pub async fn cancel_work_order(&self, work_order_id: WorkOrderId) -> MesResult<AdvanceOutcome> {
        self.request_termination(work_order_id, PendingOutcome::Cancelled, "cancel")
            .await
    }

    async fn request_termination(
        &self,
        work_order_id: WorkOrderId,
        outcome: PendingOutcome,
        operation: &str,
    ) -> MesResult<AdvanceOutcome> {
        let _guard = self.lock_order(work_order_id).await;

        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        if order.is_terminal() {
            return Err(Self::invalid_state(&order, operation));
        }
        if order.pending_outcome.is_none() {
            order.pending_outcome = Some(outcome);
            order.updated_at = self.context.now();
            self.context.work_orders.update_work_order(&order).await?;
            log_work_order_operation(operation, Some(order.id), Some(&order.order_number), "draining", None);
            self.context.record(
                AuditEntry::warning(
                    events::WORK_ORDER_CANCEL_REQUESTED,
                    format!("Cancellation requested for {}", order.order_number),
                )
                .for_order(order.id),
            );
        }
        self.advance_locked(work_order_id).await
    }

    /// Scheduled/InProgress → OnHold. In-flight steps still report back, but
    /// nothing new is dispatched.
    pub async fn hold_work_order(&self, work_order_id: WorkOrderId) -> MesResult<WorkOrder> {
        let _guard = self.lock_order(work_order_id).await;

        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        WorkOrderStateMachine::new(&mut order)
            .transition(WorkOrderEvent::Hold, self.context.now())
            .map_err(|_| Self::invalid_state(&order, "hold"))?;
        self.context.work_orders.update_work_order(&order).await?;
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_HELD, format!("Work order {} on hold", order.order_number))
                .for_order(order.id),
        );
        Ok(order)
    }

    pub async fn resume_work_order(&self, work_order_id: WorkOrderId) -> MesResult<AdvanceOutcome> {
        let _guard = self.lock_order(work_order_id).await;

        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        WorkOrderStateMachine::new(&mut order)
            .transition(WorkOrderEvent::Resume, self.context.now())
            .map_err(|_| Self::invalid_state(&order, "resume"))?;
        self.context.work_orders.update_work_order(&order).await?;
        self.context.record(
            AuditEntry::info(events::WORK_ORDER_RESUMED, format!("Work order {} resumed", order.order_number))
                .for_order(order.id),
        );
        self.advance_locked(work_order_id).await
    }

    /// Operator retry of a Failed step. The retry guard enforces the budget.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, execution_id: ExecutionId) -> MesResult<AdvanceOutcome> {
        self.operator_step_event(execution_id, StepEvent::Retry, "retry").await
    }

    /// Operator skip of a Pending or Failed step the order can do without.
    #[instrument(skip(self))]
    pub async fn skip_step(&self, execution_id: ExecutionId) -> MesResult<AdvanceOutcome> {
        self.operator_step_event(execution_id, StepEvent::Skip(SkipReason::Operator), "skip")
            .await
    }

    async fn operator_step_event(
        &self,
        execution_id: ExecutionId,
        event: StepEvent,
        operation: &str,
    ) -> MesResult<AdvanceOutcome> {
        let work_order_id = self.context.work_orders.execution(execution_id).await?.work_order_id;
        let _guard = self.lock_order(work_order_id).await;

        let order = self.context.work_orders.work_order(work_order_id).await?;
        if order.is_terminal() || order.is_draining() {
            return Err(Self::invalid_state(&order, operation));
        }
        let graph = self.context.graphs.graph(order.graph_id).await?;
        let mut execution = self.context.work_orders.execution(execution_id).await?;
        let definition = graph.step(execution.step_number).ok_or_else(|| {
            MesError::Internal(format!("Step {} missing from graph {}", execution.step_number, graph.code))
        })?;

        let audit_event = match &event {
            StepEvent::Retry => events::STEP_RETRY_SCHEDULED,
            _ => events::STEP_SKIPPED,
        };
        StepStateMachine::new(&mut execution, definition).transition(event, self.context.now())?;
        execution.next_eligible_at = None;
        self.context.work_orders.update_execution(&execution).await?;
        self.context.record(
            AuditEntry::info(
                audit_event,
                format!("Operator {operation} of step {} ({})", definition.step_number, definition.name),
            )
            .for_step(order.id, execution.id, definition.step_number),
        );

        self.advance_locked(work_order_id).await
    }

    pub async fn work_order(&self, work_order_id: WorkOrderId) -> MesResult<WorkOrder> {
        Ok(self.context.work_orders.work_order(work_order_id).await?)
    }

    pub async fn get_status(&self, work_order_id: WorkOrderId) -> MesResult<WorkOrderStatusReport> {
        let order = self.context.work_orders.work_order(work_order_id).await?;
        let graph = self.context.graphs.graph(order.graph_id).await?;
        let executions = self.context.work_orders.executions_for(work_order_id).await?;
        Ok(WorkOrderStatusReport::build(&order, &executions, &graph))
    }

    /// Report an executor outcome for `attempt` of an execution. Returns
    /// false when the attempt is no longer in flight and the outcome was
    /// ignored.
    pub async fn handle_outcome(
        &self,
        execution_id: ExecutionId,
        attempt: u32,
        outcome: StepOutcome,
    ) -> MesResult<bool> {
        let work_order_id = self.context.work_orders.execution(execution_id).await?.work_order_id;
        self.handle_completion(CompletionMessage {
            execution_id,
            work_order_id,
            attempt,
            result: Ok(outcome),
        })
        .await
    }

    async fn handle_completion(&self, message: CompletionMessage) -> MesResult<bool> {
        let _guard = self.lock_order(message.work_order_id).await;

        let mut order = self.context.work_orders.work_order(message.work_order_id).await?;
        let graph = self.context.graphs.graph(order.graph_id).await?;
        let mut executions = self.context.work_orders.executions_for(order.id).await?;

        let applied = self
            .scheduler
            .apply_outcome(
                &mut order,
                &graph,
                &mut executions,
                message.execution_id,
                message.attempt,
                message.result,
            )
            .await?;
        if applied {
            self.advance_loaded(&mut order, &graph, &mut executions).await?;
        }
        Ok(applied)
    }

    /// Merge `{key: value}` into the execution's data (JSON merge patch).
    pub async fn append_execution_data(
        &self,
        execution_id: ExecutionId,
        key: &str,
        value: Value,
    ) -> MesResult<StepExecution> {
        let work_order_id = self.context.work_orders.execution(execution_id).await?.work_order_id;
        let _guard = self.lock_order(work_order_id).await;

        let mut execution = self.context.work_orders.execution(execution_id).await?;
        let mut patch = serde_json::Map::new();
        patch.insert(key.to_string(), value);
        execution.merge_execution_data(&Value::Object(patch));
        execution.updated_at = self.context.now();
        self.context.work_orders.update_execution(&execution).await?;

        self.context.record(
            AuditEntry::new(
                AuditLevel::Debug,
                events::STEP_DATA_APPENDED,
                format!("Data '{key}' appended to step {}", execution.step_number),
            )
            .for_step(work_order_id, execution.id, execution.step_number),
        );
        Ok(execution)
    }

    /// Fail every timed-out attempt, then give every active order a pass so
    /// retries whose backoff elapsed and steps blocked on resources are
    /// picked up.
    #[instrument(skip(self))]
    pub async fn sweep_timeouts(&self) -> MesResult<Vec<TimedOutStep>> {
        let expired = self.sweeper.scan().await?;
        for timed_out in &expired {
            if let Err(err) = self.apply_timeout(timed_out).await {
                log_error("orchestrator", "sweep_timeouts", &err.to_string(), Some(&timed_out.execution_id.to_string()));
            }
        }

        let active: Vec<WorkOrderId> = self
            .context
            .work_orders
            .work_orders()
            .await?
            .into_iter()
            .filter(|order| !order.is_terminal())
            .map(|order| order.id)
            .collect();
        for (work_order_id, result) in active.iter().zip(join_all(active.iter().map(|id| self.advance(*id))).await) {
            if let Err(err) = result {
                log_error("orchestrator", "advance", &err.to_string(), Some(&work_order_id.to_string()));
            }
        }
        Ok(expired)
    }

    async fn apply_timeout(&self, timed_out: &TimedOutStep) -> MesResult<bool> {
        let _guard = self.lock_order(timed_out.work_order_id).await;

        let mut order = self.context.work_orders.work_order(timed_out.work_order_id).await?;
        let graph = self.context.graphs.graph(order.graph_id).await?;
        let mut executions = self.context.work_orders.executions_for(order.id).await?;
        let applied = self
            .scheduler
            .apply_timeout(
                &mut order,
                &graph,
                &mut executions,
                timed_out.execution_id,
                timed_out.attempt,
                timed_out.timeout_seconds,
            )
            .await?;
        if applied {
            self.advance_loaded(&mut order, &graph, &mut executions).await?;
        }
        Ok(applied)
    }

    /// Highest priority order waiting to start; ties go to the earliest
    /// planned (or created) order. Scheduled orders wait for their start time.
    pub async fn next_executable_order(&self) -> MesResult<Option<WorkOrder>> {
        let now = self.context.now();
        Ok(self
            .context
            .work_orders
            .work_orders()
            .await?
            .into_iter()
            .filter(|order| !order.is_draining())
            .filter(|order| match order.status {
                WorkOrderStatus::Created => true,
                WorkOrderStatus::Scheduled => order.scheduled_start.map_or(true, |at| at <= now),
                _ => false,
            })
            .min_by_key(WorkOrder::scheduling_key))
    }

    /// Run scheduler passes and finalization for one order.
    pub async fn advance(&self, work_order_id: WorkOrderId) -> MesResult<AdvanceOutcome> {
        let _guard = self.lock_order(work_order_id).await;
        self.advance_locked(work_order_id).await
    }

    async fn advance_locked(&self, work_order_id: WorkOrderId) -> MesResult<AdvanceOutcome> {
        let mut order = self.context.work_orders.work_order(work_order_id).await?;
        if order.is_terminal() {
            return Ok(AdvanceOutcome::idle());
        }
        let graph = self.context.graphs.graph(order.graph_id).await?;
        let mut executions = self.context.work_orders.executions_for(work_order_id).await?;
        self.advance_loaded(&mut order, &graph, &mut executions).await
    }

    async fn advance_loaded(
        &self,
        order: &mut WorkOrder,
        graph: &StepGraph,
        executions: &mut [StepExecution],
    ) -> MesResult<AdvanceOutcome> {
        let pass = self.scheduler.schedule(order, graph, executions).await?;
        let action = self.finalizer.finalize(order, graph, executions).await?;
        debug!(
            work_order_id = %order.id,
            dispatched = ?pass.dispatched,
            resolved = ?pass.resolved,
            action = ?action,
            "Advanced work order"
        );
        Ok(AdvanceOutcome { pass, action })
    }

    /// Apply the next executor result, waiting at most `wait`. `None` when
    /// nothing arrived.
    pub async fn handle_next_outcome(&self, wait: Duration) -> MesResult<Option<bool>> {
        let message = {
            let mut completions = self.completions.lock().await;
            match tokio::time::timeout(wait, completions.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => return Ok(None),
            }
        };
        self.handle_completion(message).await.map(Some)
    }

    /// Pump outcomes until the order is terminal, or nothing is in flight and
    /// another pass dispatches nothing, or `max_wait` elapses.
    ///
    /// Must not be called while [`Orchestrator::run`] owns the outcome channel.
    pub async fn run_until_settled(
        &self,
        work_order_id: WorkOrderId,
        max_wait: Duration,
    ) -> MesResult<WorkOrderStatusReport> {
        let deadline = Instant::now() + max_wait;
        self.advance(work_order_id).await?;

        while Instant::now() < deadline {
            if self.work_order(work_order_id).await?.is_terminal() {
                break;
            }
            if self.handle_next_outcome(self.context.config.idle_wait()).await?.is_some() {
                continue;
            }

            let in_flight = self
                .context
                .work_orders
                .executions_for(work_order_id)
                .await?
                .iter()
                .any(|execution| execution.status == ExecutionStatus::InProgress);
            if in_flight {
                continue;
            }
            let outcome = self.advance(work_order_id).await?;
            if !outcome.pass.made_progress() {
                break;
            }
        }
        self.get_status(work_order_id).await
    }

    /// Event loop: apply executor results as they arrive and sweep timeouts
    /// on the configured interval, until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MesResult<()> {
        let mut completions = self.completions.lock().await;
        let mut sweep = tokio::time::interval(self.context.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(environment = %self.context.config.environment, "Orchestrator running");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = completions.recv() => {
                    let Some(message) = message else { break };
                    let execution_id = message.execution_id;
                    if let Err(err) = self.handle_completion(message).await {
                        log_error("orchestrator", "handle_completion", &err.to_string(), Some(&execution_id.to_string()));
                    }
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep_timeouts().await {
                        error!(error = %err, "Timeout sweep failed");
                    }
                }
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    fn invalid_state(order: &WorkOrder, operation: &str) -> MesError {
        MesError::InvalidWorkOrderState {
            work_order_id: order.id,
            status: order.status.to_string(),
            operation: operation.to_string(),
        }
    }
}
