use chrono::{DateTime, Duration, Utc};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    guards::{StateGuard, StepCanBeRetriedGuard, StepCanBeSkippedGuard},
    states::ExecutionStatus,
};
use crate::models::{StepDefinition, StepExecution};

/// State machine for a single step execution.
///
/// Pure: it mutates the borrowed execution record and leaves persistence,
/// resource allocation and dispatch to the caller.
pub struct StepStateMachine<'a> {
    execution: &'a mut StepExecution,
    definition: &'a StepDefinition,
}

impl<'a> StepStateMachine<'a> {
    /// Create a new step state machine instance
    pub fn new(execution: &'a mut StepExecution, definition: &'a StepDefinition) -> Self {
        Self {
            execution,
            definition,
        }
    }

    /// Get the current state of the step
    pub fn current_state(&self) -> ExecutionStatus {
        self.execution.status
    }

    /// Attempt to transition the step state
    pub fn transition(&mut self, event: StepEvent, now: DateTime<Utc>) -> StateMachineResult<ExecutionStatus> {
        let current_state = self.current_state();
        let target_state = Self::determine_target_state(current_state, &event)?;

        self.check_guards(current_state, target_state, &event)?;
        self.apply(target_state, event, now);

        Ok(target_state)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: ExecutionStatus,
        event: &StepEvent,
    ) -> StateMachineResult<ExecutionStatus> {
        let target = match (current_state, event) {
            // Start transitions
            (ExecutionStatus::Pending, StepEvent::Start { .. }) => ExecutionStatus::InProgress,

            // Complete transitions
            (ExecutionStatus::InProgress, StepEvent::Complete(_)) => ExecutionStatus::Completed,

            // Failure transitions; Pending covers dispatch-time failures
            (ExecutionStatus::InProgress, StepEvent::Fail { .. }) => ExecutionStatus::Failed,
            (ExecutionStatus::Pending, StepEvent::Fail { .. }) => ExecutionStatus::Failed,

            // Retry transitions (from failed back to pending)
            (ExecutionStatus::Failed, StepEvent::Retry) => ExecutionStatus::Pending,

            // Skip transitions
            (ExecutionStatus::Pending, StepEvent::Skip(_)) => ExecutionStatus::Skipped,
            (ExecutionStatus::Failed, StepEvent::Skip(_)) => ExecutionStatus::Skipped,

            // Cancel transitions; in-flight steps drain instead
            (ExecutionStatus::Pending, StepEvent::Cancel) => ExecutionStatus::Cancelled,
            (ExecutionStatus::Failed, StepEvent::Cancel) => ExecutionStatus::Cancelled,

            // Invalid transitions
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Check guard conditions for the transition
    fn check_guards(
        &self,
        current_state: ExecutionStatus,
        target_state: ExecutionStatus,
        event: &StepEvent,
    ) -> StateMachineResult<()> {
        match (current_state, target_state, event) {
            (ExecutionStatus::Failed, ExecutionStatus::Pending, StepEvent::Retry) => {
                StepCanBeRetriedGuard
                    .check(&*self.execution, self.definition)
                    .map_err(|_| StateMachineError::RetryLimitExceeded {
                        execution_id: self.execution.id,
                        retry_count: self.execution.retry_count,
                        max_retry_count: self.definition.max_retry_count,
                    })?;
            }

            (_, ExecutionStatus::Skipped, StepEvent::Skip(reason)) if reason.requires_skippable_step() => {
                StepCanBeSkippedGuard.check(&*self.execution, self.definition)?;
            }

            // No special guards for other transitions
            _ => {}
        }

        Ok(())
    }

    fn apply(&mut self, target_state: ExecutionStatus, event: StepEvent, now: DateTime<Utc>) {
        let execution = &mut *self.execution;
        match event {
            StepEvent::Start { resource } => {
                execution.started_at = Some(now);
                execution.ended_at = None;
                execution.assigned_resource = resource;
                execution.next_eligible_at = None;
            }
            StepEvent::Complete(results) => {
                execution.ended_at = Some(now);
                execution.result_data = results;
            }
            StepEvent::Fail { reason, kind } => {
                execution.ended_at = Some(now);
                execution.error_message = Some(reason);
                execution.failure_kind = Some(kind);
            }
            StepEvent::Retry => {
                execution.retry_count += 1;
                execution.started_at = None;
                execution.ended_at = None;
                execution.assigned_resource = None;
                execution.error_message = None;
                execution.error_detail = None;
                execution.failure_kind = None;
            }
            StepEvent::Skip(_) | StepEvent::Cancel => {
                execution.ended_at = Some(now);
            }
        }
        execution.status = target_state;
        execution.updated_at = now;
    }

    /// Check if the step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.current_state().is_terminal()
    }

    /// Has an in-flight attempt exceeded the step's timeout?
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.definition
            .timeout()
            .is_some_and(|limit| timed_out(&*self.execution, limit, now))
    }
}

/// An InProgress execution started more than `limit` before `now`.
pub fn timed_out(execution: &StepExecution, limit: Duration, now: DateTime<Utc>) -> bool {
    match (execution.status, execution.started_at) {
        (ExecutionStatus::InProgress, Some(started_at)) => now - started_at > limit,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, FailureKind, StepKind};
    use crate::state_machine::events::SkipReason;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn definition() -> StepDefinition {
        StepDefinition::new(6, "weld", StepKind::Process, ActionType::Process)
            .at("WS-A")
            .timeout_seconds(10)
            .max_retries(1)
    }

    #[test]
    fn test_full_happy_path() {
        let definition = definition();
        let mut execution = StepExecution::new(Uuid::new_v4(), 6, Utc::now());
        let now = Utc::now();
        let mut machine = StepStateMachine::new(&mut execution, &definition);

        assert_eq!(
            machine.transition(StepEvent::start(Some("WS-A".into())), now),
            Ok(ExecutionStatus::InProgress)
        );
        assert_eq!(
            machine.transition(StepEvent::complete_with_results(json!({ "torque": 40 })), now),
            Ok(ExecutionStatus::Completed)
        );
        assert!(machine.is_terminal());
        assert_eq!(execution.assigned_resource.as_deref(), Some("WS-A"));
        assert_eq!(execution.result_data, Some(json!({ "torque": 40 })));
    }

    #[test]
    fn test_retry_is_bounded() {
        let definition = definition();
        let mut execution = StepExecution::new(Uuid::new_v4(), 6, Utc::now());
        let now = Utc::now();
        let mut machine = StepStateMachine::new(&mut execution, &definition);

        machine.transition(StepEvent::start(None), now).expect("start");
        machine.transition(StepEvent::executor_failure("arc fault"), now).expect("fail");
        assert_eq!(machine.transition(StepEvent::Retry, now), Ok(ExecutionStatus::Pending));
        machine.transition(StepEvent::start(None), now).expect("restart");
        machine.transition(StepEvent::timeout("too slow"), now).expect("fail again");

        assert!(matches!(
            machine.transition(StepEvent::Retry, now),
            Err(StateMachineError::RetryLimitExceeded { retry_count: 1, max_retry_count: 1, .. })
        ));
        assert_eq!(execution.failure_kind, Some(FailureKind::Timeout));
        assert_eq!(execution.retry_count, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(StepStateMachine::determine_target_state(
            ExecutionStatus::InProgress,
            &StepEvent::Cancel
        )
        .is_err());
        assert!(StepStateMachine::determine_target_state(
            ExecutionStatus::Completed,
            &StepEvent::start(None)
        )
        .is_err());
        assert!(StepStateMachine::determine_target_state(
            ExecutionStatus::Pending,
            &StepEvent::Complete(None)
        )
        .is_err());
    }

    #[test]
    fn test_skip_requires_skippable_for_operator() {
        let definition = definition();
        let mut execution = StepExecution::new(Uuid::new_v4(), 6, Utc::now());
        let mut machine = StepStateMachine::new(&mut execution, &definition);
        assert!(matches!(
            machine.transition(StepEvent::Skip(SkipReason::Operator), Utc::now()),
            Err(StateMachineError::GuardFailed { .. })
        ));
        assert_eq!(
            machine.transition(StepEvent::Skip(SkipReason::BranchNotTaken), Utc::now()),
            Ok(ExecutionStatus::Skipped)
        );
    }

    #[test]
    fn test_timeout_detection() {
        let definition = definition();
        let start = Utc::now();
        let mut execution = StepExecution::new(Uuid::new_v4(), 6, start);
        let mut machine = StepStateMachine::new(&mut execution, &definition);
        machine.transition(StepEvent::start(None), start).expect("start");
        assert!(!machine.is_timed_out(start + Duration::seconds(10)));
        assert!(machine.is_timed_out(start + Duration::seconds(11)));
    }
}
