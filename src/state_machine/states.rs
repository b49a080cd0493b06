use serde::{Deserialize, Serialize};
use std::fmt;

/// Work order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    /// Initial state when the order is created
    #[default]
    Created,
    /// Order has a planned start time
    Scheduled,
    /// At least one step has started
    InProgress,
    /// All mandatory steps completed or skipped
    Completed,
    /// Order was cancelled by an operator
    Cancelled,
    /// A mandatory step exhausted its retries
    Failed,
    /// Order is paused; no new steps are dispatched
    OnHold,
}

impl WorkOrderStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Check if this is an active state (steps are being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if the order has not yet begun executing
    pub fn is_waiting_to_start(&self) -> bool {
        matches!(self, Self::Created | Self::Scheduled)
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
            Self::OnHold => write!(f, "on_hold"),
        }
    }
}

impl std::str::FromStr for WorkOrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "on_hold" => Ok(Self::OnHold),
            _ => Err(format!("Invalid work order status: {s}")),
        }
    }
}

/// Step execution states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Initial state when the execution row is created
    #[default]
    Pending,
    /// Dispatched to an executor or resolving in-process
    InProgress,
    /// Step completed successfully
    Completed,
    /// Step failed; may be retried while budget remains
    Failed,
    /// Step was skipped (branch not taken or optional step abandoned)
    Skipped,
    /// Step was cancelled with its work order
    Cancelled,
}

impl ExecutionStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Cancelled)
    }

    /// Check if this is an error state that may allow recovery
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Check if this is an active state (step is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if this step satisfies dependencies for other steps
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}
