//! # Domain Models
//!
//! Plain data types for work orders, step graphs and the physical resources
//! they consume. Persistence is handled by [`crate::persistence`].

pub mod location;
pub mod pallet;
pub mod step_definition;
pub mod step_execution;
pub mod stock_unit;
pub mod work_order;

pub use location::{Location, LocationType};
pub use pallet::{OccupancyChange, Pallet, PalletLocationRecord, PalletStatus, PalletStatusRecord};
pub use step_definition::{
    ActionType, DecisionBranches, GraphSource, JoinCondition, StationType, StepDefinition, StepKind,
    TargetSystem,
};
pub use step_execution::{merge_patch, FailureKind, StepExecution};
pub use stock_unit::{QualityStatus, StockStatus, StockUnit};
pub use work_order::{PendingOutcome, Priority, WorkOrder};

pub type WorkOrderId = uuid::Uuid;
pub type ExecutionId = uuid::Uuid;
pub type GraphId = uuid::Uuid;
pub type ProductId = uuid::Uuid;
pub type StockId = uuid::Uuid;
pub type PalletId = i64;
pub type LocationId = i64;
