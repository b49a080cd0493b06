//! # Step Definition
//!
//! One node of a step graph. Recipes and scenarios share this shape; the
//! graph's [`GraphSource`] decides which timeout unit a step may be
//! authored in.

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::defaults;

/// Where a step graph was authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphSource {
    /// Product recipe; steps may give `timeout_minutes`
    Recipe,
    /// Work scenario; steps give `timeout_seconds` only
    Scenario,
}

/// External system a step is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSystem {
    /// Autonomous mobile robot fleet
    Ams,
    /// Equipment (robots, stations)
    Ems,
    /// Handled inside the MES itself
    Mes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Move,
    Load,
    Unload,
    StationLoad,
    StationUnload,
    ChargeMove,
    Process,
    Inspect,
    Transfer,
    Notify,
    WaitForSignal,
    CheckCondition,
}

impl ActionType {
    /// Actions that put the order's stock unit InProcess while they run.
    pub fn holds_stock(&self) -> bool {
        matches!(self, Self::Process | Self::Inspect)
    }

    /// Slot change applied to the pallet when the action completes.
    pub fn occupancy_delta(&self) -> i64 {
        match self {
            Self::Load | Self::StationUnload => 1,
            Self::Unload | Self::StationLoad => -1,
            _ => 0,
        }
    }
}

/// How a step's predecessors gate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinCondition {
    /// Every predecessor completed or skipped
    #[default]
    OnComplete,
    /// At least one predecessor completed or skipped
    OnAnyComplete,
    /// Every predecessor completed or skipped
    OnAllComplete,
    /// Every predecessor succeeded and the step's gate holds
    OnCondition,
    /// Successors may start as soon as this step has started
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationType {
    WeldingStation,
    BoltingStation,
    InspectionStation,
    LoadingZone,
    UnloadingZone,
    WaitingZone,
}

impl StationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeldingStation => "welding_station",
            Self::BoltingStation => "bolting_station",
            Self::InspectionStation => "inspection_station",
            Self::LoadingZone => "loading_zone",
            Self::UnloadingZone => "unloading_zone",
            Self::WaitingZone => "waiting_zone",
        }
    }
}

/// Which branch of a decision a step belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionBranches {
    pub when_true: Vec<u32>,
    pub when_false: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// AMR movement between locations
    Transport,
    /// Equipment work at a station
    Process,
    Inspection,
    /// Join on the completion of another step's parallel branch
    Wait { wait_for_step_number: u32 },
    /// Evaluates the step's condition and skips the branch not taken
    Decision { branches: DecisionBranches },
    Parallel,
    Notify,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Process => "process",
            Self::Inspection => "inspection",
            Self::Wait { .. } => "wait",
            Self::Decision { .. } => "decision",
            Self::Parallel => "parallel",
            Self::Notify => "notify",
        }
    }

    /// Resolved by the scheduler without dispatching to an executor.
    pub fn resolves_in_process(&self) -> bool {
        matches!(self, Self::Wait { .. } | Self::Decision { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_number: u32,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    pub action: ActionType,
    pub target_system: TargetSystem,
    pub target_location: Option<String>,
    pub required_station: Option<StationType>,
    /// Zero means unlimited.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Recipe authoring unit. A recipe graph folds it into `timeout_seconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    pub estimated_duration_seconds: u64,
    pub allow_parallel: bool,
    pub is_skippable: bool,
    pub is_mandatory: bool,
    pub max_retry_count: u32,
    pub join: JoinCondition,
    pub parallel_id: Option<String>,
    pub condition_expression: Option<String>,
    /// Explicit predecessors; empty means the previous step number.
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub parameters: Value,
}

impl StepDefinition {
    pub fn new(step_number: u32, name: impl Into<String>, kind: StepKind, action: ActionType) -> Self {
        let target_system = match (&kind, action) {
            (StepKind::Transport, _) => TargetSystem::Ams,
            (StepKind::Process | StepKind::Inspection, _) => TargetSystem::Ems,
            _ => TargetSystem::Mes,
        };
        Self {
            step_number,
            name: name.into(),
            description: None,
            kind,
            action,
            target_system,
            target_location: None,
            required_station: None,
            timeout_seconds: 0,
            timeout_minutes: None,
            estimated_duration_seconds: 0,
            allow_parallel: false,
            is_skippable: false,
            is_mandatory: true,
            max_retry_count: defaults::MAX_RETRY_COUNT,
            join: JoinCondition::OnComplete,
            parallel_id: None,
            condition_expression: None,
            depends_on: Vec::new(),
            parameters: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.target_location = Some(location.into());
        self
    }

    pub fn station(mut self, station: StationType) -> Self {
        self.required_station = Some(station);
        self
    }

    pub fn system(mut self, system: TargetSystem) -> Self {
        self.target_system = system;
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    /// Move a minutes timeout into `timeout_seconds`.
    pub(crate) fn normalise_timeout(&mut self) {
        if let Some(minutes) = self.timeout_minutes.take() {
            self.timeout_seconds = minutes.saturating_mul(60);
        }
    }

    pub fn estimated_seconds(mut self, seconds: u64) -> Self {
        self.estimated_duration_seconds = seconds;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.allow_parallel = true;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.is_skippable = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_mandatory = false;
        self
    }

    pub fn max_retries(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn join(mut self, join: JoinCondition) -> Self {
        self.join = join;
        self
    }

    pub fn parallel_id(mut self, id: impl Into<String>) -> Self {
        self.parallel_id = Some(id.into());
        self
    }

    pub fn condition(mut self, expression: impl Into<String>) -> Self {
        self.condition_expression = Some(expression.into());
        self
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on = steps.into_iter().collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        let seconds = self
            .timeout_minutes
            .map_or(self.timeout_seconds, |minutes| minutes.saturating_mul(60));
        if seconds == 0 {
            None
        } else {
            Some(Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX)))
        }
    }

    /// Counts toward progress and completion.
    pub fn counts_as_mandatory(&self) -> bool {
        self.is_mandatory && !self.is_skippable
    }

    /// May be abandoned (skipped) instead of failing the order.
    pub fn may_be_skipped(&self) -> bool {
        self.is_skippable || !self.is_mandatory
    }

    /// Predecessor step numbers: explicit dependencies, else the previous step.
    pub fn predecessors(&self) -> Vec<u32> {
        if !self.depends_on.is_empty() {
            self.depends_on.clone()
        } else if self.step_number > 1 {
            vec![self.step_number - 1]
        } else {
            Vec::new()
        }
    }

    /// Location or station code the step operates on.
    pub fn resource_code(&self) -> Option<String> {
        self.target_location
            .clone()
            .or_else(|| self.required_station.map(|station| station.as_str().to_string()))
    }

    /// Deserialize the opaque parameter blob into an executor-specific shape.
    pub fn parameters_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.parameters.clone())
    }
}
