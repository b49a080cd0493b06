use super::errors::{business_rule_violation, GuardError, GuardResult};
use super::states::ExecutionStatus;
use crate::graph::StepGraph;
use crate::models::{StepDefinition, StepExecution, WorkOrder};

/// Trait for implementing state transition guards
pub trait StateGuard<T, C: ?Sized> {
    /// Check if a transition is allowed
    fn check(&self, entity: &T, context: &C) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard to check a failed step still has retry budget
pub struct StepCanBeRetriedGuard;

impl StateGuard<StepExecution, StepDefinition> for StepCanBeRetriedGuard {
    fn check(&self, execution: &StepExecution, definition: &StepDefinition) -> GuardResult<()> {
        if execution.retry_count >= definition.max_retry_count {
            return Err(GuardError::RetryLimitReached {
                retry_count: execution.retry_count,
                max_retry_count: definition.max_retry_count,
            });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Step must have retry attempts remaining"
    }
}

/// Guard to check a step may be skipped instead of completed
pub struct StepCanBeSkippedGuard;

impl StateGuard<StepExecution, StepDefinition> for StepCanBeSkippedGuard {
    fn check(&self, execution: &StepExecution, definition: &StepDefinition) -> GuardResult<()> {
        if !definition.may_be_skipped() {
            return Err(GuardError::NotSkippable {
                step_number: execution.step_number,
            });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Step must be skippable or non-mandatory"
    }
}

/// Steps and executions of the work order under transition.
pub struct WorkOrderGuardContext<'a> {
    pub graph: &'a StepGraph,
    pub executions: &'a [StepExecution],
}

/// Guard to check all mandatory steps succeeded and nothing is in flight
pub struct AllMandatoryStepsCompleteGuard;

impl<'a> StateGuard<WorkOrder, WorkOrderGuardContext<'a>> for AllMandatoryStepsCompleteGuard {
    fn check(&self, order: &WorkOrder, context: &WorkOrderGuardContext<'a>) -> GuardResult<()> {
        if let Some(running) = context.executions.iter().find(|e| e.status == ExecutionStatus::InProgress) {
            return Err(business_rule_violation(format!(
                "Work order {} still has step {} in progress",
                order.id, running.step_number
            )));
        }

        let incomplete: Vec<u32> = context
            .executions
            .iter()
            .filter(|execution| {
                context
                    .graph
                    .step(execution.step_number)
                    .is_some_and(StepDefinition::counts_as_mandatory)
                    && !execution.status.satisfies_dependencies()
            })
            .map(|execution| execution.step_number)
            .collect();

        if !incomplete.is_empty() {
            return Err(business_rule_violation(format!(
                "Work order {} has incomplete mandatory steps {incomplete:?}",
                order.id
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "All mandatory steps must be completed or skipped"
    }
}
