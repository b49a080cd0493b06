//! # Step Graph
//!
//! Validated, ordered set of step definitions with predecessor resolution.
//!
//! A predecessor `P` satisfies its successor when `P` is Completed or
//! Skipped, or when `P` joins `Immediate` and has merely started. The
//! successor's own [`JoinCondition`] then aggregates: `OnAnyComplete` needs
//! one satisfied predecessor, every other join needs all of them, and
//! `OnCondition` additionally needs its gate (a wait signal or a condition
//! expression) to hold.

pub mod condition;
pub mod validation;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use condition::{Condition, ConditionError};
pub use validation::{GraphValidationError, GraphValidationErrors, ParsedConditions};

use crate::coordination::SignalCoordinator;
use crate::models::{GraphId, GraphSource, JoinCondition, StepDefinition, StepExecution, StepKind};
use crate::state_machine::ExecutionStatus;

/// Status lookup by step number.
pub trait StepStatusLookup {
    fn status_of(&self, step_number: u32) -> Option<ExecutionStatus>;
}

impl StepStatusLookup for HashMap<u32, ExecutionStatus> {
    fn status_of(&self, step_number: u32) -> Option<ExecutionStatus> {
        self.get(&step_number).copied()
    }
}

impl StepStatusLookup for [StepExecution] {
    fn status_of(&self, step_number: u32) -> Option<ExecutionStatus> {
        self.iter()
            .find(|execution| execution.step_number == step_number)
            .map(|execution| execution.status)
    }
}

/// Unvalidated graph as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGraphDefinition {
    pub code: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub source: GraphSource,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepGraph {
    pub id: GraphId,
    pub code: String,
    pub name: String,
    pub version: String,
    pub source: GraphSource,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    steps: Vec<StepDefinition>,
    #[serde(skip)]
    conditions: ParsedConditions,
}

impl StepGraph {
    /// Validate and build a graph; steps are stored in step-number order.
    ///
    /// Recipe timeouts given in minutes are folded into `timeout_seconds`.
    /// `created_at` is provisional until the graph is registered.
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        source: GraphSource,
        mut steps: Vec<StepDefinition>,
    ) -> Result<Self, GraphValidationErrors> {
        let conditions = validation::validate_steps(source, &steps)?;
        steps.sort_by_key(|step| step.step_number);
        if source == GraphSource::Recipe {
            steps.iter_mut().for_each(StepDefinition::normalise_timeout);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            version: default_version(),
            source,
            is_active: true,
            created_at: Utc::now(),
            steps,
            conditions,
        })
    }

    pub fn from_definition(definition: StepGraphDefinition) -> Result<Self, GraphValidationErrors> {
        let mut graph = Self::new(definition.code, definition.name, definition.source, definition.steps)?;
        graph.version = definition.version;
        Ok(graph)
    }

    pub fn from_json(json: &str) -> Result<Self, crate::error::MesError> {
        let definition: StepGraphDefinition = serde_json::from_str(json)?;
        Ok(Self::from_definition(definition)?)
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step numbers are contiguous from 1, so lookup is positional.
    pub fn step(&self, step_number: u32) -> Option<&StepDefinition> {
        let index = usize::try_from(step_number.checked_sub(1)?).ok()?;
        self.steps.get(index)
    }

    pub fn mandatory_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|step| step.counts_as_mandatory())
    }

    pub fn mandatory_step_count(&self) -> usize {
        self.mandatory_steps().count()
    }

    pub fn predecessors(&self, step_number: u32) -> Vec<u32> {
        self.step(step_number).map(StepDefinition::predecessors).unwrap_or_default()
    }

    /// Steps that list `step_number` among their predecessors.
    pub fn successors(&self, step_number: u32) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|step| step.predecessors().contains(&step_number))
            .map(|step| step.step_number)
            .collect()
    }

    /// Does predecessor `pred` in `status` satisfy its successors?
    pub fn predecessor_satisfies(pred: &StepDefinition, status: ExecutionStatus) -> bool {
        status.satisfies_dependencies()
            || (pred.join == JoinCondition::Immediate && status == ExecutionStatus::InProgress)
    }

    /// Aggregate predecessor state under `step`'s join condition. Gates are
    /// evaluated separately.
    pub fn predecessors_satisfied<L>(&self, step: &StepDefinition, statuses: &L) -> bool
    where
        L: StepStatusLookup + ?Sized,
    {
        let predecessors = step.predecessors();
        if predecessors.is_empty() {
            return true;
        }

        let mut satisfied = predecessors.iter().map(|&number| {
            match (self.step(number), statuses.status_of(number)) {
                (Some(pred), Some(status)) => Self::predecessor_satisfies(pred, status),
                _ => false,
            }
        });

        match step.join {
            JoinCondition::OnAnyComplete => satisfied.any(|ok| ok),
            JoinCondition::OnComplete
            | JoinCondition::OnAllComplete
            | JoinCondition::OnCondition
            | JoinCondition::Immediate => satisfied.all(|ok| ok),
        }
    }

    /// Steps not yet completed whose predecessors are satisfied and whose gate
    /// holds, treating `completed` as the only finished steps.
    pub fn next_candidates(&self, completed: &BTreeSet<u32>, context: &Value) -> Vec<&StepDefinition> {
        let statuses: HashMap<u32, ExecutionStatus> = completed
            .iter()
            .map(|&number| (number, ExecutionStatus::Completed))
            .collect();
        self.next_candidates_with(&statuses, context)
    }

    /// Pending (or not yet instantiated) steps whose predecessors are
    /// satisfied under `statuses` and whose gate holds.
    pub fn next_candidates_with<L>(&self, statuses: &L, context: &Value) -> Vec<&StepDefinition>
    where
        L: StepStatusLookup + ?Sized,
    {
        self.steps
            .iter()
            .filter(|step| {
                matches!(
                    statuses.status_of(step.step_number),
                    None | Some(ExecutionStatus::Pending)
                )
            })
            .filter(|step| self.predecessors_satisfied(*step, statuses))
            .filter(|step| self.gate_holds(step, statuses, context))
            .collect()
    }

    /// Wait steps need their signal; `OnCondition` steps need their expression.
    pub fn gate_holds<L>(&self, step: &StepDefinition, statuses: &L, context: &Value) -> bool
    where
        L: StepStatusLookup + ?Sized,
    {
        match (&step.kind, step.join) {
            (StepKind::Wait { .. }, _) => SignalCoordinator::evaluate(self, step, statuses).is_satisfied(),
            (_, JoinCondition::OnCondition) => self.condition_holds(step, context),
            _ => true,
        }
    }

    /// Evaluate a step's condition expression; a missing expression holds.
    pub fn condition_holds(&self, step: &StepDefinition, context: &Value) -> bool {
        self.conditions
            .get(&step.step_number)
            .map_or(true, |condition| condition.evaluate(context))
    }

    /// Outcome of a decision step. Without an expression the decision is false.
    pub fn decide(&self, decision: &StepDefinition, context: &Value) -> bool {
        self.conditions
            .get(&decision.step_number)
            .is_some_and(|condition| condition.evaluate(context))
    }

    /// Steps on the branch a decision did not take.
    pub fn untaken_branch(&self, decision: &StepDefinition, outcome: bool) -> Vec<u32> {
        match &decision.kind {
            StepKind::Decision { branches } => {
                if outcome {
                    branches.when_false.clone()
                } else {
                    branches.when_true.clone()
                }
            }
            _ => Vec::new(),
        }
    }
}

/// Evaluation context: work order parameters plus `step_<n>` → result data.
pub fn condition_context(parameters: &Value, executions: &[StepExecution]) -> Value {
    let mut context = match parameters {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for execution in executions {
        if let Some(result) = &execution.result_data {
            context.insert(format!("step_{}", execution.step_number), result.clone());
        }
    }
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, StepKind};
    use serde_json::json;

    fn transport(n: u32) -> StepDefinition {
        StepDefinition::new(n, format!("move {n}"), StepKind::Transport, ActionType::Move).at("LZ-A")
    }

    fn statuses(entries: &[(u32, ExecutionStatus)]) -> HashMap<u32, ExecutionStatus> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_linear_candidates() {
        let graph = StepGraph::new("G", "linear", GraphSource::Scenario, (1..=3).map(transport).collect())
            .expect("graph");
        let next: Vec<u32> = graph
            .next_candidates(&BTreeSet::from([1]), &Value::Null)
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(next, vec![2]);
    }

    #[test]
    fn test_immediate_predecessor_satisfies_when_started() {
        let steps = vec![transport(1).join(JoinCondition::Immediate).parallel(), transport(2)];
        let graph = StepGraph::new("G", "immediate", GraphSource::Scenario, steps).expect("graph");
        let step_two = graph.step(2).expect("step 2");
        assert!(graph.predecessors_satisfied(step_two, &statuses(&[(1, ExecutionStatus::InProgress)])));
        assert!(!graph.predecessors_satisfied(step_two, &statuses(&[(1, ExecutionStatus::Pending)])));
    }

    #[test]
    fn test_any_versus_all_joins() {
        let steps = vec![
            transport(1),
            transport(2).depends_on([1]),
            transport(3).depends_on([1]),
            transport(4).depends_on([2, 3]).join(JoinCondition::OnAnyComplete),
            transport(5).depends_on([2, 3]).join(JoinCondition::OnAllComplete),
        ];
        let graph = StepGraph::new("G", "fan", GraphSource::Scenario, steps).expect("graph");
        let view = statuses(&[
            (1, ExecutionStatus::Completed),
            (2, ExecutionStatus::Skipped),
            (3, ExecutionStatus::InProgress),
        ]);
        assert!(graph.predecessors_satisfied(graph.step(4).expect("4"), &view));
        assert!(!graph.predecessors_satisfied(graph.step(5).expect("5"), &view));
    }

    #[test]
    fn test_wait_gated_on_signal_step() {
        let steps = vec![
            transport(1).parallel_id("WELD").join(JoinCondition::Immediate).parallel(),
            transport(2),
            StepDefinition::new(3, "wait weld", StepKind::Wait { wait_for_step_number: 1 }, ActionType::WaitForSignal)
                .parallel_id("WELD")
                .join(JoinCondition::OnCondition),
        ];
        let graph = StepGraph::new("G", "wait", GraphSource::Scenario, steps).expect("graph");
        let blocked = graph.next_candidates(&BTreeSet::from([2]), &Value::Null);
        assert!(blocked.iter().all(|s| s.step_number != 3));
        let open = graph.next_candidates(&BTreeSet::from([1, 2]), &Value::Null);
        assert!(open.iter().any(|s| s.step_number == 3));
    }

    #[test]
    fn test_candidates_with_live_statuses() {
        let steps = vec![
            transport(1),
            transport(2).depends_on([1]).parallel(),
            transport(3).depends_on([1]).parallel(),
            transport(4).depends_on([2, 3]),
        ];
        let graph = StepGraph::new("G", "fan", GraphSource::Scenario, steps).expect("graph");
        assert_eq!(graph.successors(1), vec![2, 3]);
        assert_eq!(graph.predecessors(4), vec![2, 3]);

        let view = statuses(&[
            (1, ExecutionStatus::Completed),
            (2, ExecutionStatus::InProgress),
            (3, ExecutionStatus::Pending),
            (4, ExecutionStatus::Pending),
        ]);
        let next: Vec<u32> = graph
            .next_candidates_with(&view, &Value::Null)
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(next, vec![3]);
    }

    #[test]
    fn test_condition_context_and_gate() {
        let steps = vec![transport(1).join(JoinCondition::OnCondition).condition("step_1.ok == true && lot == 'A'")];
        let graph = StepGraph::new("G", "gate", GraphSource::Scenario, steps).expect("graph");
        let step = graph.step(1).expect("step 1");
        let mut execution = StepExecution::new(Uuid::new_v4(), 1, Utc::now());
        execution.result_data = Some(json!({ "ok": true }));
        let context = condition_context(&json!({ "lot": "A" }), &[execution]);
        assert!(graph.condition_holds(step, &context));
        assert!(!graph.condition_holds(step, &json!({})));
    }

    #[test]
    fn test_decision_uses_condition_parsed_at_build() {
        let decision = StepDefinition::new(
            2,
            "passed?",
            StepKind::Decision {
                branches: crate::models::DecisionBranches {
                    when_true: vec![3],
                    when_false: vec![4],
                },
            },
            ActionType::CheckCondition,
        )
        .condition("step_1.passed == true");
        let steps = vec![transport(1), decision, transport(3).depends_on([2]), transport(4).depends_on([2])];
        let graph = StepGraph::new("G", "decide", GraphSource::Scenario, steps).expect("graph");

        // Editing the stored definition after the build does not change the outcome.
        let mut edited = graph.step(2).expect("step 2").clone();
        edited.condition_expression = Some("not valid ==".to_string());
        assert!(graph.decide(&edited, &json!({ "step_1": { "passed": true } })));
        assert!(!graph.decide(&edited, &json!({ "step_1": { "passed": false } })));
        assert!(!graph.decide(graph.step(1).expect("step 1"), &Value::Null));
    }

    #[test]
    fn test_recipe_from_json_in_minutes() {
        let json = r#"{
            "code": "RCP-1",
            "name": "weld recipe",
            "source": "recipe",
            "steps": [
                { "step_number": 1, "name": "weld", "kind": "process", "action": "process",
                  "target_system": "ems", "target_location": "WS-1", "required_station": null,
                  "timeout_minutes": 30, "estimated_duration_seconds": 600, "allow_parallel": false,
                  "is_skippable": false, "is_mandatory": true, "max_retry_count": 3, "join": "on_complete",
                  "parallel_id": null, "condition_expression": null, "description": null }
            ]
        }"#;
        let graph = StepGraph::from_json(json).expect("recipe");
        let step = graph.step(1).expect("step 1");
        assert_eq!(step.timeout_seconds, 1800);
        assert_eq!(step.timeout_minutes, None);
        assert_eq!(step.timeout(), Some(chrono::Duration::minutes(30)));

        let as_scenario = json.replace(r#""source": "recipe""#, r#""source": "scenario""#);
        let err = StepGraph::from_json(&as_scenario).expect_err("minutes in a scenario");
        assert!(matches!(
            err,
            crate::error::MesError::GraphValidation(ref errors)
                if errors.contains(&GraphValidationError::MinutesInScenario(1))
        ));
    }

    #[test]
    fn test_graph_from_json() {
        let json = r#"{
            "code": "SCN-1",
            "name": "two moves",
            "source": "scenario",
            "steps": [
                { "step_number": 1, "name": "pick", "kind": "transport", "action": "move",
                  "target_system": "ams", "target_location": "LZ-A", "required_station": null,
                  "timeout_seconds": 60, "estimated_duration_seconds": 30, "allow_parallel": false,
                  "is_skippable": false, "is_mandatory": true, "max_retry_count": 3, "join": "on_complete",
                  "parallel_id": null, "condition_expression": null, "description": null },
                { "step_number": 2, "name": "drop", "kind": "transport", "action": "move",
                  "target_system": "ams", "target_location": "UZ-A", "required_station": null,
                  "timeout_seconds": 60, "estimated_duration_seconds": 30, "allow_parallel": false,
                  "is_skippable": false, "is_mandatory": true, "max_retry_count": 3, "join": "on_complete",
                  "parallel_id": null, "condition_expression": null, "description": null }
            ]
        }"#;
        let graph = StepGraph::from_json(json).expect("graph");
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.version, "1.0");
        assert_eq!(graph.step(2).and_then(|s| s.target_location.as_deref()), Some("UZ-A"));
    }
}
