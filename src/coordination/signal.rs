//! Join gate for wait steps.
//!
//! A wait step is satisfied only when the step it references, scoped to the
//! same parallel id, has Completed. Each wait step is evaluated on its own
//! against current execution state; there is no shared join counter, so
//! several waits may reference one producer step.

use std::sync::Arc;

use crate::graph::{StepGraph, StepStatusLookup};
use crate::models::{StepDefinition, StepKind, WorkOrderId};
use crate::persistence::{PersistenceResult, WorkOrderStore};
use crate::state_machine::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalState {
    /// Not a wait step; nothing to gate
    NotApplicable,
    /// The producer step completed
    Satisfied { producer: u32 },
    /// The producer has not completed yet but still may
    Waiting {
        producer: u32,
        status: Option<ExecutionStatus>,
    },
    /// The producer can never complete (skipped, cancelled or mismatched)
    Unreachable {
        producer: u32,
        status: Option<ExecutionStatus>,
    },
}

impl SignalState {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. } | Self::NotApplicable)
    }
}

#[derive(Clone)]
pub struct SignalCoordinator {
    store: Arc<dyn WorkOrderStore>,
}

impl SignalCoordinator {
    pub fn new(store: Arc<dyn WorkOrderStore>) -> Self {
        Self { store }
    }

    /// Gate state of `wait_step` given already-loaded step statuses.
    pub fn evaluate<L>(graph: &StepGraph, wait_step: &StepDefinition, statuses: &L) -> SignalState
    where
        L: StepStatusLookup + ?Sized,
    {
        let StepKind::Wait { wait_for_step_number } = wait_step.kind else {
            return SignalState::NotApplicable;
        };
        let producer = wait_for_step_number;
        let status = statuses.status_of(producer);

        let scoped = match graph.step(producer) {
            Some(producer_step) => match &wait_step.parallel_id {
                Some(expected) => producer_step.parallel_id.as_ref() == Some(expected),
                None => true,
            },
            None => false,
        };
        if !scoped {
            return SignalState::Unreachable { producer, status };
        }

        match status {
            Some(ExecutionStatus::Completed) => SignalState::Satisfied { producer },
            Some(ExecutionStatus::Skipped | ExecutionStatus::Cancelled) => {
                SignalState::Unreachable { producer, status }
            }
            _ => SignalState::Waiting { producer, status },
        }
    }

    /// Load the order's executions and evaluate `wait_step`.
    pub async fn is_satisfied(
        &self,
        work_order_id: WorkOrderId,
        graph: &StepGraph,
        wait_step: &StepDefinition,
    ) -> PersistenceResult<bool> {
        let executions = self.store.executions_for(work_order_id).await?;
        Ok(Self::evaluate(graph, wait_step, executions.as_slice()).is_satisfied())
    }
}
