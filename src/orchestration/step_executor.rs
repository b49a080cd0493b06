//! # Step Executor
//!
//! Contract between the scheduler and the systems that physically carry out
//! a step (AMR fleet, station equipment, the MES itself).
//!
//! The scheduler never waits on an executor inline: each dispatch runs on its
//! own task and reports back through the orchestrator's completion channel.
//! Step parameters stay opaque to the scheduler; [`ActionPayload::resolve`]
//! turns them into a typed payload per action for the executor adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::models::{
    ActionType, ExecutionId, LocationId, PalletId, StepDefinition, StepKind, StockId, TargetSystem, WorkOrderId,
};

/// Outcome reported by an executor once the physical work is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success(Option<Value>),
    Failure(String),
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with(result: Value) -> Self {
        Self::Success(Some(result))
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// The executor could not accept or carry out the dispatch at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("No executor registered for target system {0:?}")]
    NoRoute(TargetSystem),

    #[error("Target system {system:?} unavailable: {reason}")]
    Unavailable { system: TargetSystem, reason: String },

    #[error("Step {step_number} has invalid parameters: {reason}")]
    InvalidParameters { step_number: u32, reason: String },

    #[error("Dispatch rejected: {0}")]
    Rejected(String),
}

/// Resources bound to the step at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedResource {
    /// Location or station code the step works at, if any
    pub code: Option<String>,
    pub location_id: Option<LocationId>,
    pub pallet_id: PalletId,
    pub stock_unit_id: StockId,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProcessParameters {
    program: Option<String>,
    equipment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InspectParameters {
    #[serde(default)]
    criteria: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NotifyParameters {
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChargeParameters {
    min_battery_level: Option<u8>,
}

/// Typed, per-action view of a step's parameter bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum ActionPayload {
    Transport {
        to: String,
        charge: bool,
        min_battery_level: Option<u8>,
    },
    Transfer {
        to: String,
    },
    Handling {
        at: Option<String>,
        action: ActionType,
    },
    Process {
        station: String,
        program: Option<String>,
        equipment_id: Option<String>,
    },
    Inspect {
        station: String,
        criteria: Value,
    },
    Notify {
        message: String,
    },
    Signal {
        wait_for_step_number: Option<u32>,
    },
    Condition {
        expression: Option<String>,
    },
}

impl ActionPayload {
    pub fn resolve(step: &StepDefinition) -> Result<Self, DispatchError> {
        let required_code = || {
            step.resource_code().ok_or_else(|| DispatchError::InvalidParameters {
                step_number: step.step_number,
                reason: format!("{:?} needs a target location", step.action),
            })
        };

        let payload = match step.action {
            ActionType::Move => Self::Transport {
                to: required_code()?,
                charge: false,
                min_battery_level: None,
            },
            ActionType::ChargeMove => {
                let params: ChargeParameters = parameters(step)?;
                Self::Transport {
                    to: required_code()?,
                    charge: true,
                    min_battery_level: params.min_battery_level,
                }
            }
            ActionType::Transfer => Self::Transfer { to: required_code()? },
            ActionType::Load | ActionType::Unload | ActionType::StationLoad | ActionType::StationUnload => {
                Self::Handling {
                    at: step.resource_code(),
                    action: step.action,
                }
            }
            ActionType::Process => {
                let params: ProcessParameters = parameters(step)?;
                Self::Process {
                    station: required_code()?,
                    program: params.program,
                    equipment_id: params.equipment_id,
                }
            }
            ActionType::Inspect => {
                let params: InspectParameters = parameters(step)?;
                Self::Inspect {
                    station: required_code()?,
                    criteria: params.criteria,
                }
            }
            ActionType::Notify => {
                let params: NotifyParameters = parameters(step)?;
                Self::Notify {
                    message: params.message.unwrap_or_else(|| step.name.clone()),
                }
            }
            ActionType::WaitForSignal => Self::Signal {
                wait_for_step_number: match step.kind {
                    StepKind::Wait { wait_for_step_number } => Some(wait_for_step_number),
                    _ => None,
                },
            },
            ActionType::CheckCondition => Self::Condition {
                expression: step.condition_expression.clone(),
            },
        };
        Ok(payload)
    }
}

fn parameters<T: DeserializeOwned + Default>(step: &StepDefinition) -> Result<T, DispatchError> {
    if step.parameters.is_null() {
        return Ok(T::default());
    }
    step.parameters_as().map_err(|err| DispatchError::InvalidParameters {
        step_number: step.step_number,
        reason: err.to_string(),
    })
}

/// Everything an executor needs to carry out one attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub execution_id: ExecutionId,
    pub work_order_id: WorkOrderId,
    /// Echoed back with the outcome; stale attempts are ignored.
    pub attempt: u32,
    pub step: StepDefinition,
    pub resource: AssignedResource,
    pub payload: ActionPayload,
}

/// Carries out dispatched steps.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step to completion and report how it went.
    ///
    /// `Err` means the executor never took the job; `Ok(Failure)` means it
    /// tried and the work failed. Both consume one retry.
    async fn dispatch(&self, request: DispatchRequest) -> Result<StepOutcome, DispatchError>;
}

/// Routes each dispatch to the executor registered for the step's target system.
#[derive(Default, Clone)]
pub struct TargetSystemRouter {
    routes: HashMap<TargetSystem, Arc<dyn StepExecutor>>,
    fallback: Option<Arc<dyn StepExecutor>>,
}

impl TargetSystemRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, system: TargetSystem, executor: Arc<dyn StepExecutor>) -> Self {
        self.routes.insert(system, executor);
        self
    }

    pub fn fallback(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }
}

#[async_trait]
impl StepExecutor for TargetSystemRouter {
    async fn dispatch(&self, request: DispatchRequest) -> Result<StepOutcome, DispatchError> {
        let system = request.step.target_system;
        let executor = self
            .routes
            .get(&system)
            .or(self.fallback.as_ref())
            .ok_or(DispatchError::NoRoute(system))?;
        executor.dispatch(request).await
    }
}

/// Executor that reports success after a fixed delay.
///
/// Used for dry runs and demonstrations where no physical system is attached.
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> Result<StepOutcome, DispatchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        debug!(
            execution_id = %request.execution_id,
            step_number = request.step.step_number,
            "Simulated step finished"
        );
        Ok(StepOutcome::success_with(json!({
            "simulated": true,
            "system": request.step.target_system,
            "resource": request.resource.code,
        })))
    }
}
