//! Step executor whose outcomes are scripted per step number.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use mes_core::orchestration::{DispatchError, DispatchRequest, StepExecutor, StepOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed(Option<Value>),
    Fail(String),
    Reject(DispatchError),
    /// Never reports back
    Hang,
    /// Succeeds once released with [`ScriptedExecutor::release`]
    Gated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub step_number: u32,
    pub attempt: u32,
    pub execution_id: Uuid,
    pub resource: Option<String>,
}

/// Unscripted steps succeed immediately.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<u32, VecDeque<Scripted>>>,
    gates: Mutex<HashMap<u32, Arc<Notify>>>,
    dispatched: Mutex<Vec<Dispatched>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for successive attempts of `step_number`.
    pub fn script(&self, step_number: u32, outcomes: impl IntoIterator<Item = Scripted>) {
        self.scripts.lock().entry(step_number).or_default().extend(outcomes);
    }

    pub fn release(&self, step_number: u32) {
        self.gate(step_number).notify_one();
    }

    fn gate(&self, step_number: u32) -> Arc<Notify> {
        Arc::clone(self.gates.lock().entry(step_number).or_default())
    }

    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().clone()
    }

    pub fn dispatched_steps(&self) -> Vec<u32> {
        self.dispatched.lock().iter().map(|d| d.step_number).collect()
    }

    pub fn attempts(&self, step_number: u32) -> usize {
        self.dispatched
            .lock()
            .iter()
            .filter(|d| d.step_number == step_number)
            .count()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> Result<StepOutcome, DispatchError> {
        let step_number = request.step.step_number;
        self.dispatched.lock().push(Dispatched {
            step_number,
            attempt: request.attempt,
            execution_id: request.execution_id,
            resource: request.resource.code.clone(),
        });

        let next = self
            .scripts
            .lock()
            .get_mut(&step_number)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Scripted::Succeed(None));

        match next {
            Scripted::Succeed(data) => Ok(StepOutcome::Success(data)),
            Scripted::Fail(reason) => Ok(StepOutcome::Failure(reason)),
            Scripted::Reject(err) => Err(err),
            Scripted::Hang => std::future::pending().await,
            Scripted::Gated => {
                let gate = self.gate(step_number);
                gate.notified().await;
                Ok(StepOutcome::success())
            }
        }
    }
}
