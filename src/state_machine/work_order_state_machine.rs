use chrono::{DateTime, Utc};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::WorkOrderEvent,
    guards::{AllMandatoryStepsCompleteGuard, StateGuard, WorkOrderGuardContext},
    states::WorkOrderStatus,
};
use crate::models::WorkOrder;

/// State machine for the work order lifecycle
pub struct WorkOrderStateMachine<'a> {
    order: &'a mut WorkOrder,
    steps: Option<WorkOrderGuardContext<'a>>,
}

impl<'a> WorkOrderStateMachine<'a> {
    pub fn new(order: &'a mut WorkOrder) -> Self {
        Self { order, steps: None }
    }

    /// Attach step state; required to complete the order.
    pub fn with_steps(mut self, steps: WorkOrderGuardContext<'a>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn current_state(&self) -> WorkOrderStatus {
        self.order.status
    }

    pub fn transition(&mut self, event: WorkOrderEvent, now: DateTime<Utc>) -> StateMachineResult<WorkOrderStatus> {
        let current_state = self.current_state();
        let target_state = Self::determine_target_state(current_state, &event, self.order.actual_start.is_some())?;

        self.check_guards(target_state)?;
        self.apply(target_state, event, now);

        Ok(target_state)
    }

    /// `started` says whether the order ever ran, which decides where Resume lands.
    pub fn determine_target_state(
        current_state: WorkOrderStatus,
        event: &WorkOrderEvent,
        started: bool,
    ) -> StateMachineResult<WorkOrderStatus> {
        use WorkOrderStatus::{Cancelled, Completed, Created, Failed, InProgress, OnHold, Scheduled};

        let target = match (current_state, event) {
            (Created, WorkOrderEvent::Schedule) => Scheduled,

            (Created | Scheduled, WorkOrderEvent::Start) => InProgress,

            (InProgress, WorkOrderEvent::Complete) => Completed,

            (Created | Scheduled | InProgress | OnHold, WorkOrderEvent::Fail(_)) => Failed,

            (Created | Scheduled | InProgress | OnHold, WorkOrderEvent::Cancel) => Cancelled,

            (Scheduled | InProgress, WorkOrderEvent::Hold) => OnHold,

            (OnHold, WorkOrderEvent::Resume) => {
                if started {
                    InProgress
                } else {
                    Scheduled
                }
            }

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    fn check_guards(&self, target_state: WorkOrderStatus) -> StateMachineResult<()> {
        if target_state == WorkOrderStatus::Completed {
            let steps = self.steps.as_ref().ok_or_else(|| StateMachineError::GuardFailed {
                reason: "step state is required to complete a work order".to_string(),
            })?;
            AllMandatoryStepsCompleteGuard.check(&*self.order, steps)?;
        }
        Ok(())
    }

    fn apply(&mut self, target_state: WorkOrderStatus, event: WorkOrderEvent, now: DateTime<Utc>) {
        let order = &mut *self.order;
        match target_state {
            WorkOrderStatus::InProgress => {
                if order.actual_start.is_none() {
                    order.actual_start = Some(now);
                }
            }
            WorkOrderStatus::Completed => {
                order.actual_end = Some(now);
                order.progress_percentage = 100.0;
            }
            WorkOrderStatus::Cancelled | WorkOrderStatus::Failed => {
                if order.actual_end.is_none() {
                    order.actual_end = Some(now);
                }
            }
            WorkOrderStatus::Created | WorkOrderStatus::Scheduled | WorkOrderStatus::OnHold => {}
        }

        if let WorkOrderEvent::Fail(reason) = event {
            order.failure_reason = Some(reason);
        }
        if target_state.is_terminal() {
            order.pending_outcome = None;
        }
        order.status = target_state;
        order.updated_at = now;
    }
}
