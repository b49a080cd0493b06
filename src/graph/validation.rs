//! Structural validation of step graphs. Every violation is collected so
//! authors can fix a graph in one pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use thiserror::Error;

use super::condition::Condition;
use crate::models::{ActionType, GraphSource, StepDefinition, StepKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("graph has no steps")]
    Empty,

    #[error("step number {0} appears more than once")]
    DuplicateStepNumber(u32),

    #[error("step numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguousStepNumbers { expected: u32, found: u32 },

    #[error("step {0} has an empty name")]
    EmptyName(u32),

    #[error("step {step} depends on unknown step {depends_on}")]
    UnknownDependency { step: u32, depends_on: u32 },

    #[error("step {0} depends on itself")]
    SelfDependency(u32),

    #[error("dependency cycle through steps {0:?}")]
    Cycle(Vec<u32>),

    #[error("wait step {step} references unknown step {wait_for}")]
    UnknownWaitTarget { step: u32, wait_for: u32 },

    #[error("wait step {0} references itself")]
    WaitOnSelf(u32),

    #[error("wait step {step} expects parallel id '{expected}' but step {wait_for} has {actual:?}")]
    ParallelIdMismatch {
        step: u32,
        wait_for: u32,
        expected: String,
        actual: Option<String>,
    },

    #[error("step {step}: {kind} step uses action {action:?}")]
    ActionMismatch {
        step: u32,
        kind: &'static str,
        action: ActionType,
    },

    #[error("decision step {0} has no condition expression")]
    MissingCondition(u32),

    #[error("step {step} has an invalid condition: {message}")]
    InvalidCondition { step: u32, message: String },

    #[error("step {step}: {kind} step requires a target location or station")]
    MissingLocation { step: u32, kind: &'static str },

    #[error("decision step {step} branches to unknown step {target}")]
    UnknownBranchStep { step: u32, target: u32 },

    #[error("scenario step {0} gives its timeout in minutes; scenarios use seconds")]
    MinutesInScenario(u32),
}

/// All violations found in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct GraphValidationErrors(pub Vec<GraphValidationError>);

impl GraphValidationErrors {
    pub fn errors(&self) -> &[GraphValidationError] {
        &self.0
    }

    pub fn contains(&self, error: &GraphValidationError) -> bool {
        self.0.contains(error)
    }
}

impl fmt::Display for GraphValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

/// Parsed condition expressions, keyed by step number.
pub type ParsedConditions = HashMap<u32, Condition>;

/// Validate `steps` as a graph of `source`, returning every condition
/// expression already parsed.
pub fn validate_steps(source: GraphSource, steps: &[StepDefinition]) -> Result<ParsedConditions, GraphValidationErrors> {
    let mut errors = Vec::new();
    let mut conditions = ParsedConditions::new();

    if steps.is_empty() {
        return Err(GraphValidationErrors(vec![GraphValidationError::Empty]));
    }

    let mut by_number: BTreeMap<u32, &StepDefinition> = BTreeMap::new();
    for step in steps {
        if by_number.insert(step.step_number, step).is_some() {
            errors.push(GraphValidationError::DuplicateStepNumber(step.step_number));
        }
    }

    for (expected, found) in (1u32..).zip(by_number.keys().copied()) {
        if expected != found {
            errors.push(GraphValidationError::NonContiguousStepNumbers { expected, found });
            break;
        }
    }

    for step in by_number.values() {
        check_step(step, &by_number, &mut errors);
        if source == GraphSource::Scenario && step.timeout_minutes.is_some() {
            errors.push(GraphValidationError::MinutesInScenario(step.step_number));
        }
        if let Some(expression) = &step.condition_expression {
            match Condition::parse(expression) {
                Ok(parsed) => {
                    conditions.insert(step.step_number, parsed);
                }
                Err(err) => errors.push(GraphValidationError::InvalidCondition {
                    step: step.step_number,
                    message: err.message,
                }),
            }
        }
    }

    if let Some(cycle) = find_cycle(&by_number) {
        errors.push(GraphValidationError::Cycle(cycle));
    }

    if errors.is_empty() {
        Ok(conditions)
    } else {
        Err(GraphValidationErrors(errors))
    }
}

fn check_step(
    step: &StepDefinition,
    by_number: &BTreeMap<u32, &StepDefinition>,
    errors: &mut Vec<GraphValidationError>,
) {
    let number = step.step_number;

    if step.name.trim().is_empty() {
        errors.push(GraphValidationError::EmptyName(number));
    }

    for &dependency in &step.depends_on {
        if dependency == number {
            errors.push(GraphValidationError::SelfDependency(number));
        } else if !by_number.contains_key(&dependency) {
            errors.push(GraphValidationError::UnknownDependency {
                step: number,
                depends_on: dependency,
            });
        }
    }

    match &step.kind {
        StepKind::Transport | StepKind::Process | StepKind::Inspection => {
            if step.resource_code().is_none() {
                errors.push(GraphValidationError::MissingLocation {
                    step: number,
                    kind: step.kind.name(),
                });
            }
        }
        StepKind::Wait { wait_for_step_number } => {
            let wait_for = *wait_for_step_number;
            if wait_for == number {
                errors.push(GraphValidationError::WaitOnSelf(number));
            } else if let Some(target) = by_number.get(&wait_for) {
                if let Some(expected) = &step.parallel_id {
                    if target.parallel_id.as_ref() != Some(expected) {
                        errors.push(GraphValidationError::ParallelIdMismatch {
                            step: number,
                            wait_for,
                            expected: expected.clone(),
                            actual: target.parallel_id.clone(),
                        });
                    }
                }
            } else {
                errors.push(GraphValidationError::UnknownWaitTarget {
                    step: number,
                    wait_for,
                });
            }
        }
        StepKind::Decision { branches } => {
            if step.condition_expression.is_none() {
                errors.push(GraphValidationError::MissingCondition(number));
            }
            for &target in branches.when_true.iter().chain(&branches.when_false) {
                if !by_number.contains_key(&target) {
                    errors.push(GraphValidationError::UnknownBranchStep { step: number, target });
                }
            }
        }
        StepKind::Parallel | StepKind::Notify => {}
    }

    let is_wait_kind = matches!(step.kind, StepKind::Wait { .. });
    if is_wait_kind != (step.action == ActionType::WaitForSignal) {
        errors.push(GraphValidationError::ActionMismatch {
            step: number,
            kind: step.kind.name(),
            action: step.action,
        });
    }
}

/// Kahn's algorithm over predecessor and wait edges; returns the steps left
/// unresolved when a cycle exists.
fn find_cycle(by_number: &BTreeMap<u32, &StepDefinition>) -> Option<Vec<u32>> {
    let mut in_degree: BTreeMap<u32, usize> = by_number.keys().map(|&n| (n, 0)).collect();
    let mut successors: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for step in by_number.values() {
        let mut upstream: BTreeSet<u32> = step.predecessors().into_iter().collect();
        if let StepKind::Wait { wait_for_step_number } = step.kind {
            upstream.insert(wait_for_step_number);
        }
        for from in upstream {
            if from == step.step_number || !by_number.contains_key(&from) {
                continue;
            }
            successors.entry(from).or_default().push(step.step_number);
            *in_degree.entry(step.step_number).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<u32> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in successors.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited == by_number.len() {
        None
    } else {
        Some(
            in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(n, _)| n)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionBranches;

    fn transport(n: u32) -> StepDefinition {
        StepDefinition::new(n, format!("move {n}"), StepKind::Transport, ActionType::Move).at("LZ-A")
    }

    #[test]
    fn test_valid_linear_graph() {
        let steps: Vec<_> = (1..=3).map(transport).collect();
        assert!(validate_steps(GraphSource::Scenario, &steps).is_ok());
    }

    #[test]
    fn test_collects_every_violation() {
        let steps = vec![
            transport(1),
            StepDefinition::new(2, "", StepKind::Transport, ActionType::Move),
            StepDefinition::new(
                4,
                "decide",
                StepKind::Decision { branches: DecisionBranches::default() },
                ActionType::CheckCondition,
            ),
        ];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("invalid graph");
        assert!(errors.contains(&GraphValidationError::NonContiguousStepNumbers { expected: 3, found: 4 }));
        assert!(errors.contains(&GraphValidationError::EmptyName(2)));
        assert!(errors.contains(&GraphValidationError::MissingLocation { step: 2, kind: "transport" }));
        assert!(errors.contains(&GraphValidationError::MissingCondition(4)));
        assert!(errors.errors().len() >= 4);
    }

    #[test]
    fn test_wait_target_must_exist() {
        let steps = vec![
            transport(1),
            StepDefinition::new(2, "wait", StepKind::Wait { wait_for_step_number: 9 }, ActionType::WaitForSignal),
        ];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("invalid graph");
        assert!(errors.contains(&GraphValidationError::UnknownWaitTarget { step: 2, wait_for: 9 }));
    }

    #[test]
    fn test_wait_on_itself_rejected() {
        let steps = vec![
            transport(1),
            StepDefinition::new(2, "wait", StepKind::Wait { wait_for_step_number: 2 }, ActionType::WaitForSignal),
        ];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("invalid graph");
        assert!(errors.contains(&GraphValidationError::WaitOnSelf(2)));
        assert!(errors.to_string().contains("wait step 2 references itself"));
    }

    #[test]
    fn test_parallel_id_must_match() {
        let steps = vec![
            transport(1).parallel_id("WELD"),
            StepDefinition::new(2, "wait", StepKind::Wait { wait_for_step_number: 1 }, ActionType::WaitForSignal)
                .parallel_id("BOLT"),
        ];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("invalid graph");
        assert!(matches!(
            errors.errors()[0],
            GraphValidationError::ParallelIdMismatch { step: 2, wait_for: 1, .. }
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![transport(1).depends_on([3]), transport(2), transport(3)];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("cyclic graph");
        assert!(errors.contains(&GraphValidationError::Cycle(vec![1, 2, 3])));
    }

    #[test]
    fn test_wait_edge_participates_in_cycle() {
        let steps = vec![
            transport(1),
            StepDefinition::new(2, "wait", StepKind::Wait { wait_for_step_number: 3 }, ActionType::WaitForSignal),
            transport(3),
        ];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("cyclic graph");
        assert!(matches!(errors.errors()[0], GraphValidationError::Cycle(_)));
    }

    #[test]
    fn test_conditions_parsed_once() {
        let steps = vec![transport(1), transport(2).condition("lot == 'A'")];
        let conditions = validate_steps(GraphSource::Scenario, &steps).expect("valid graph");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[&2].source(), "lot == 'A'");
    }

    #[test]
    fn test_minutes_only_in_recipes() {
        let steps = vec![transport(1).timeout_minutes(30)];
        assert!(validate_steps(GraphSource::Recipe, &steps).is_ok());
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("minutes in scenario");
        assert!(errors.contains(&GraphValidationError::MinutesInScenario(1)));
    }

    #[test]
    fn test_invalid_condition_rejected() {
        let steps = vec![transport(1).condition("quality ==")];
        let errors = validate_steps(GraphSource::Scenario, &steps).expect_err("bad condition");
        assert!(matches!(errors.errors()[0], GraphValidationError::InvalidCondition { step: 1, .. }));
    }
}
