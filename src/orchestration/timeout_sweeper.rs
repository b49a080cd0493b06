//! Periodic scan for in-flight steps that outlived their timeout.
//!
//! The sweeper only finds them. The orchestrator applies each timeout under
//! the owning order's lock, where a late attempt check discards anything
//! that resolved in the meantime.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, instrument};

use super::context::OrchestrationContext;
use super::types::TimedOutStep;
use crate::error::MesResult;
use crate::graph::StepGraph;
use crate::models::{GraphId, StepDefinition};
use crate::state_machine::{timed_out, ExecutionStatus};

pub struct TimeoutSweeper {
    context: OrchestrationContext,
}

impl TimeoutSweeper {
    pub fn new(context: OrchestrationContext) -> Self {
        Self { context }
    }

    /// Every InProgress attempt older than its step's timeout.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> MesResult<Vec<TimedOutStep>> {
        let now = self.context.now();
        let in_flight = self
            .context
            .work_orders
            .executions_with_status(ExecutionStatus::InProgress)
            .await?;

        let mut graphs: HashMap<GraphId, Arc<StepGraph>> = HashMap::new();
        let mut graph_of_order = HashMap::new();
        let mut expired = Vec::new();

        for execution in in_flight {
            let graph_id = match graph_of_order.get(&execution.work_order_id) {
                Some(graph_id) => *graph_id,
                None => {
                    let order = self.context.work_orders.work_order(execution.work_order_id).await?;
                    graph_of_order.insert(order.id, order.graph_id);
                    order.graph_id
                }
            };
            let graph = match graphs.get(&graph_id) {
                Some(graph) => Arc::clone(graph),
                None => {
                    let graph = self.context.graphs.graph(graph_id).await?;
                    graphs.insert(graph_id, Arc::clone(&graph));
                    graph
                }
            };
            let Some(definition) = graph.step(execution.step_number) else {
                continue;
            };

            if let Some(limit) = self.effective_timeout(definition) {
                if timed_out(&execution, limit, now) {
                    expired.push(TimedOutStep {
                        work_order_id: execution.work_order_id,
                        execution_id: execution.id,
                        step_number: execution.step_number,
                        attempt: execution.attempt(),
                        timeout_seconds: u64::try_from(limit.num_seconds()).unwrap_or_default(),
                    });
                }
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Found timed out steps");
        }
        Ok(expired)
    }

    /// The step's own timeout, else the configured default. `None` is unlimited.
    fn effective_timeout(&self, definition: &StepDefinition) -> Option<Duration> {
        definition.timeout().or_else(|| {
            let seconds = self.context.config.timeouts.default_step_timeout_seconds;
            (seconds > 0).then(|| Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::MesConfig;
    use crate::models::{ActionType, GraphSource, Priority, StepExecution, StepKind, WorkOrder};
    use crate::orchestration::step_executor::SimulatedExecutor;
    use crate::persistence::{GraphStore, InMemoryStore, WorkOrderStore};
    use chrono::Utc;
    use uuid::Uuid;

    async fn fixture(step_timeout: u64, default_timeout: u64) -> (Arc<ManualClock>, TimeoutSweeper, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut config = MesConfig::default();
        config.timeouts.default_step_timeout_seconds = default_timeout;
        let context = OrchestrationContext::in_memory(store.clone(), Arc::new(SimulatedExecutor::default()), config)
            .with_clock(clock.clone());

        let step = StepDefinition::new(1, "weld", StepKind::Process, ActionType::Process)
            .at("WS-A")
            .timeout_seconds(step_timeout);
        let graph = store
            .insert_graph(StepGraph::new("G", "one", GraphSource::Scenario, vec![step]).expect("graph"))
            .await
            .expect("insert graph");

        let order = WorkOrder::new(
            "WO-1".into(),
            "order".into(),
            graph.id,
            Uuid::new_v4(),
            1,
            Priority::default(),
            clock.now(),
        );
        let mut execution = StepExecution::new(order.id, 1, clock.now());
        execution.status = ExecutionStatus::InProgress;
        execution.started_at = Some(clock.now());
        let execution_id = execution.id;
        store.insert_work_order(order, vec![execution]).await.expect("insert order");

        (clock, TimeoutSweeper::new(context), execution_id)
    }

    #[tokio::test]
    async fn test_step_timeout_is_detected() {
        let (clock, sweeper, execution_id) = fixture(10, 0).await;
        assert!(sweeper.scan().await.expect("scan").is_empty());

        clock.advance(Duration::seconds(11));
        let expired = sweeper.scan().await.expect("scan");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].execution_id, execution_id);
        assert_eq!(expired[0].attempt, 0);
        assert_eq!(expired[0].timeout_seconds, 10);
    }

    #[tokio::test]
    async fn test_default_timeout_applies_only_when_configured() {
        let (clock, unlimited, _) = fixture(0, 0).await;
        clock.advance(Duration::hours(10));
        assert!(unlimited.scan().await.expect("scan").is_empty());

        let (clock, defaulted, _) = fixture(0, 60).await;
        clock.advance(Duration::seconds(61));
        assert_eq!(defaulted.scan().await.expect("scan").len(), 1);
    }
}
