//! # Viable Step Discovery
//!
//! Decides, from the graph and the order's current executions, what the
//! scheduler may do next with each Pending step. Pure: no I/O, no mutation.
//!
//! A Pending step is considered once its predecessors are satisfied (see
//! [`StepGraph::predecessors_satisfied`]) and any retry backoff has passed.
//! Wait and decision steps resolve without an executor; everything else is
//! dispatched, subject to the rule that at most one non-parallel step of an
//! order is in progress at any time.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::coordination::{SignalCoordinator, SignalState};
use crate::graph::StepGraph;
use crate::models::{ExecutionId, JoinCondition, StepDefinition, StepExecution, StepKind};
use crate::state_machine::ExecutionStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateAction {
    /// Allocate resources and hand to the executor
    Dispatch,
    /// Wait step whose producer completed
    ResolveSignal { producer: u32 },
    /// Wait step whose producer can no longer complete
    SkipUnreachable { producer: u32 },
    /// Decision step with its evaluated outcome
    ResolveDecision { outcome: bool },
    /// Skippable step whose condition gate is false
    SkipConditionNotMet,
    /// Left Pending for now
    Blocked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViableStep {
    pub execution_id: ExecutionId,
    pub step_number: u32,
    pub attempt: u32,
    pub action: CandidateAction,
}

pub struct ViableStepDiscovery;

impl ViableStepDiscovery {
    /// Classify every Pending step of the order whose predecessors are satisfied.
    pub fn find_viable_steps(
        graph: &StepGraph,
        executions: &[StepExecution],
        context: &Value,
        now: DateTime<Utc>,
    ) -> Vec<ViableStep> {
        let mut non_parallel_running = executions
            .iter()
            .filter(|execution| execution.status == ExecutionStatus::InProgress)
            .filter_map(|execution| graph.step(execution.step_number))
            .find(|definition| !definition.allow_parallel)
            .map(|definition| definition.step_number);

        let mut viable = Vec::new();
        for execution in executions {
            if execution.status != ExecutionStatus::Pending || execution.is_backing_off(now) {
                continue;
            }
            let Some(definition) = graph.step(execution.step_number) else {
                continue;
            };
            if !graph.predecessors_satisfied(definition, executions) {
                continue;
            }

            let action = Self::classify(graph, definition, executions, context, &mut non_parallel_running);
            if let Some(action) = action {
                debug!(
                    work_order_id = %execution.work_order_id,
                    step_number = execution.step_number,
                    action = ?action,
                    "Found viable step"
                );
                viable.push(ViableStep {
                    execution_id: execution.id,
                    step_number: execution.step_number,
                    attempt: execution.attempt(),
                    action,
                });
            }
        }
        viable
    }

    fn classify(
        graph: &StepGraph,
        definition: &StepDefinition,
        executions: &[StepExecution],
        context: &Value,
        non_parallel_running: &mut Option<u32>,
    ) -> Option<CandidateAction> {
        match &definition.kind {
            StepKind::Wait { .. } => {
                return match SignalCoordinator::evaluate(graph, definition, executions) {
                    SignalState::Satisfied { producer } => Some(CandidateAction::ResolveSignal { producer }),
                    SignalState::Unreachable { producer, .. } => Some(CandidateAction::SkipUnreachable { producer }),
                    SignalState::Waiting { .. } | SignalState::NotApplicable => None,
                };
            }
            StepKind::Decision { .. } => {
                let outcome = graph.decide(definition, context);
                return Some(CandidateAction::ResolveDecision { outcome });
            }
            StepKind::Transport | StepKind::Process | StepKind::Inspection | StepKind::Parallel | StepKind::Notify => {}
        }

        if definition.join == JoinCondition::OnCondition && !graph.condition_holds(definition, context) {
            return Some(if definition.may_be_skipped() {
                CandidateAction::SkipConditionNotMet
            } else {
                CandidateAction::Blocked("condition not met".to_string())
            });
        }

        if !definition.allow_parallel {
            if let Some(running) = *non_parallel_running {
                return Some(CandidateAction::Blocked(format!("non-parallel step {running} in progress")));
            }
            *non_parallel_running = Some(definition.step_number);
        }
        Some(CandidateAction::Dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, DecisionBranches, GraphSource};
    use serde_json::json;
    use uuid::Uuid;

    fn transport(n: u32) -> StepDefinition {
        StepDefinition::new(n, format!("move {n}"), StepKind::Transport, ActionType::Move).at("LZ-A")
    }

    fn executions(graph: &StepGraph, statuses: &[ExecutionStatus]) -> Vec<StepExecution> {
        let order = Uuid::new_v4();
        graph
            .steps()
            .iter()
            .zip(statuses)
            .map(|(step, status)| {
                let mut execution = StepExecution::new(order, step.step_number, Utc::now());
                execution.status = *status;
                execution
            })
            .collect()
    }

    fn actions(viable: &[ViableStep]) -> Vec<(u32, CandidateAction)> {
        viable.iter().map(|v| (v.step_number, v.action.clone())).collect()
    }

    #[test]
    fn test_only_one_non_parallel_step_dispatched() {
        let steps = vec![
            transport(1),
            transport(2).depends_on([1]),
            transport(3).depends_on([1]),
            transport(4).depends_on([1]).parallel(),
        ];
        let graph = StepGraph::new("G", "fan", GraphSource::Scenario, steps).expect("graph");
        use ExecutionStatus::*;
        let execs = executions(&graph, &[Completed, Pending, Pending, Pending]);

        let viable = ViableStepDiscovery::find_viable_steps(&graph, &execs, &Value::Null, Utc::now());
        assert_eq!(
            actions(&viable),
            vec![
                (2, CandidateAction::Dispatch),
                (3, CandidateAction::Blocked("non-parallel step 2 in progress".into())),
                (4, CandidateAction::Dispatch),
            ]
        );
    }

    #[test]
    fn test_running_parallel_step_does_not_block_non_parallel() {
        let steps = vec![
            transport(1).parallel().join(JoinCondition::Immediate),
            transport(2),
        ];
        let graph = StepGraph::new("G", "immediate", GraphSource::Scenario, steps).expect("graph");
        let execs = executions(&graph, &[ExecutionStatus::InProgress, ExecutionStatus::Pending]);
        let viable = ViableStepDiscovery::find_viable_steps(&graph, &execs, &Value::Null, Utc::now());
        assert_eq!(actions(&viable), vec![(2, CandidateAction::Dispatch)]);
    }

    #[test]
    fn test_wait_step_follows_its_producer() {
        let steps = vec![
            transport(1).parallel().parallel_id("WELD").join(JoinCondition::Immediate),
            transport(2),
            StepDefinition::new(3, "wait", StepKind::Wait { wait_for_step_number: 1 }, ActionType::WaitForSignal)
                .parallel_id("WELD")
                .join(JoinCondition::OnCondition),
        ];
        let graph = StepGraph::new("G", "wait", GraphSource::Scenario, steps).expect("graph");
        use ExecutionStatus::*;

        let waiting = executions(&graph, &[InProgress, Completed, Pending]);
        assert!(ViableStepDiscovery::find_viable_steps(&graph, &waiting, &Value::Null, Utc::now()).is_empty());

        let failed = executions(&graph, &[Failed, Completed, Pending]);
        assert!(ViableStepDiscovery::find_viable_steps(&graph, &failed, &Value::Null, Utc::now()).is_empty());

        let done = executions(&graph, &[Completed, Completed, Pending]);
        assert_eq!(
            actions(&ViableStepDiscovery::find_viable_steps(&graph, &done, &Value::Null, Utc::now())),
            vec![(3, CandidateAction::ResolveSignal { producer: 1 })]
        );

        let skipped = executions(&graph, &[Skipped, Completed, Pending]);
        assert_eq!(
            actions(&ViableStepDiscovery::find_viable_steps(&graph, &skipped, &Value::Null, Utc::now())),
            vec![(3, CandidateAction::SkipUnreachable { producer: 1 })]
        );
    }

    #[test]
    fn test_decision_and_condition_gates() {
        let steps = vec![
            StepDefinition::new(
                1,
                "passed?",
                StepKind::Decision {
                    branches: DecisionBranches {
                        when_true: vec![2],
                        when_false: vec![3],
                    },
                },
                ActionType::CheckCondition,
            )
            .condition("quality == 'good'"),
            transport(2).depends_on([1]),
            transport(3).depends_on([1]).join(JoinCondition::OnCondition).condition("rework == true").skippable(),
        ];
        let graph = StepGraph::new("G", "decide", GraphSource::Recipe, steps).expect("graph");
        use ExecutionStatus::*;

        let start = executions(&graph, &[Pending, Pending, Pending]);
        let viable = ViableStepDiscovery::find_viable_steps(&graph, &start, &json!({ "quality": "good" }), Utc::now());
        assert_eq!(actions(&viable), vec![(1, CandidateAction::ResolveDecision { outcome: true })]);

        let decided = executions(&graph, &[Completed, Pending, Pending]);
        let viable = ViableStepDiscovery::find_viable_steps(&graph, &decided, &json!({ "rework": false }), Utc::now());
        assert_eq!(
            actions(&viable),
            vec![(2, CandidateAction::Dispatch), (3, CandidateAction::SkipConditionNotMet)]
        );
    }

    #[test]
    fn test_backing_off_step_is_not_viable() {
        let graph = StepGraph::new("G", "one", GraphSource::Scenario, vec![transport(1)]).expect("graph");
        let mut execs = executions(&graph, &[ExecutionStatus::Pending]);
        let now = Utc::now();
        execs[0].next_eligible_at = Some(now + chrono::Duration::seconds(5));
        assert!(ViableStepDiscovery::find_viable_steps(&graph, &execs, &Value::Null, now).is_empty());
    }
}
