//! # System Constants
//!
//! Event names, environment keys and operational defaults shared across the
//! orchestrator.

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MES";
/// Separator between nested configuration keys in environment variables.
pub const ENV_SEPARATOR: &str = "__";

/// Prefix of generated work order numbers (`WO-YYYYMMDD-NNNN`).
pub const ORDER_NUMBER_PREFIX: &str = "WO";

/// Audit event names.
pub mod events {
    // Work order lifecycle
    pub const WORK_ORDER_CREATED: &str = "work_order.created";
    pub const WORK_ORDER_SCHEDULED: &str = "work_order.scheduled";
    pub const WORK_ORDER_START_REQUESTED: &str = "work_order.start_requested";
    pub const WORK_ORDER_STARTED: &str = "work_order.started";
    pub const WORK_ORDER_COMPLETED: &str = "work_order.completed";
    pub const WORK_ORDER_FAILED: &str = "work_order.failed";
    pub const WORK_ORDER_CANCEL_REQUESTED: &str = "work_order.cancel_requested";
    pub const WORK_ORDER_CANCELLED: &str = "work_order.cancelled";
    pub const WORK_ORDER_HELD: &str = "work_order.held";
    pub const WORK_ORDER_RESUMED: &str = "work_order.resumed";

    // Step lifecycle
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_TIMED_OUT: &str = "step.timed_out";
    pub const STEP_RETRY_SCHEDULED: &str = "step.retry_scheduled";
    pub const STEP_RETRY_EXHAUSTED: &str = "step.retry_exhausted";
    pub const STEP_SKIPPED: &str = "step.skipped";
    pub const STEP_CANCELLED: &str = "step.cancelled";
    pub const STEP_RESOURCE_UNAVAILABLE: &str = "step.resource_unavailable";
    pub const STEP_LATE_OUTCOME_IGNORED: &str = "step.late_outcome_ignored";
    pub const STEP_DATA_APPENDED: &str = "step.data_appended";

    // Resources
    pub const STOCK_RESERVED: &str = "stock.reserved";
    pub const STOCK_RELEASED: &str = "stock.released";
    pub const STOCK_STATUS_CHANGED: &str = "stock.status_changed";
    pub const STOCK_QUALITY_CHANGED: &str = "stock.quality_changed";
    pub const PALLET_MOVED: &str = "pallet.moved";
    pub const PALLET_OCCUPANCY_CHANGED: &str = "pallet.occupancy_changed";
    pub const PALLET_STATUS_CHANGED: &str = "pallet.status_changed";
    pub const LOCATION_STATE_CHANGED: &str = "location.state_changed";

    // Scheduling
    pub const VIABLE_STEPS_DISCOVERED: &str = "scheduler.viable_steps_discovered";
}

/// Operational defaults.
pub mod defaults {
    pub const SWEEP_INTERVAL_MS: u64 = 5_000;
    pub const IDLE_WAIT_MS: u64 = 1_000;
    pub const LOCK_TIMEOUT_MS: u64 = 2_000;
    pub const BACKOFF_MAX_MS: u64 = 60_000;
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_000;
    pub const PRIORITY: u8 = 50;
    pub const MAX_RETRY_COUNT: u32 = 3;
    pub const RECIPE_STEP_TIMEOUT_MINUTES: u64 = 30;
    pub const PALLET_MAX_USAGE_COUNT: u32 = 1_000;
}

/// Work order priority bounds.
pub mod priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 100;
}
