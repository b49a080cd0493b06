//! # Work Order
//!
//! A request to carry one stock unit through one step graph.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{GraphId, PalletId, StockId, WorkOrderId};
use crate::constants::{priority, ORDER_NUMBER_PREFIX};
use crate::error::{MesError, MesResult};
use crate::state_machine::WorkOrderStatus;

/// Scheduling priority within `1..=100`; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: u8) -> MesResult<Self> {
        if (priority::MIN..=priority::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(MesError::InvalidInput(format!(
                "priority must be within {}..={}, got {value}",
                priority::MIN,
                priority::MAX
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(crate::constants::defaults::PRIORITY)
    }
}

impl TryFrom<u8> for Priority {
    type Error = MesError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status an order settles into once its in-flight steps drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PendingOutcome {
    Cancelled,
    Failed(String),
}

impl PendingOutcome {
    pub fn target_status(&self) -> WorkOrderStatus {
        match self {
            Self::Cancelled => WorkOrderStatus::Cancelled,
            Self::Failed(_) => WorkOrderStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: WorkOrderId,
    pub order_number: String,
    pub name: String,
    pub graph_id: GraphId,
    pub stock_unit_id: StockId,
    pub pallet_id: PalletId,
    pub status: WorkOrderStatus,
    pub priority: Priority,
    /// Highest step number started so far.
    pub current_step: u32,
    pub progress_percentage: f64,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    /// Released to the floor by `StartWorkOrder`; steps may be dispatched.
    pub start_requested_at: Option<DateTime<Utc>>,
    pub parameters: Value,
    pub remarks: Option<String>,
    pub failure_reason: Option<String>,
    /// Set while the order drains in-flight steps before going terminal.
    pub pending_outcome: Option<PendingOutcome>,
    /// Net pallet occupancy change applied by this order's load/unload steps.
    pub occupancy_ledger: BTreeMap<PalletId, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_number: String,
        name: String,
        graph_id: GraphId,
        stock_unit_id: StockId,
        pallet_id: PalletId,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_number,
            name,
            graph_id,
            stock_unit_id,
            pallet_id,
            status: WorkOrderStatus::Created,
            priority,
            current_step: 0,
            progress_percentage: 0.0,
            scheduled_start: None,
            scheduled_end: None,
            actual_start: None,
            actual_end: None,
            start_requested_at: None,
            parameters: Value::Object(serde_json::Map::new()),
            remarks: None,
            failure_reason: None,
            pending_outcome: None,
            occupancy_ledger: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.actual_end? - self.actual_start?)
    }

    pub fn is_draining(&self) -> bool {
        self.pending_outcome.is_some()
    }

    pub fn cancellation_requested(&self) -> bool {
        matches!(self.pending_outcome, Some(PendingOutcome::Cancelled))
    }

    /// Steps may be dispatched for this order.
    pub fn accepts_dispatch(&self) -> bool {
        if self.is_draining() {
            return false;
        }
        match self.status {
            WorkOrderStatus::InProgress => true,
            WorkOrderStatus::Created | WorkOrderStatus::Scheduled => {
                self.start_requested_at.is_some()
            }
            _ => false,
        }
    }

    /// Progress only moves forward while the order is running.
    pub fn record_progress(&mut self, percentage: f64) {
        let clamped = percentage.clamp(0.0, 100.0);
        if self.status.is_active() || self.status.is_waiting_to_start() {
            self.progress_percentage = self.progress_percentage.max(clamped);
        } else {
            self.progress_percentage = clamped;
        }
    }

    pub fn record_occupancy(&mut self, pallet_id: PalletId, applied_delta: i64) {
        if applied_delta == 0 {
            return;
        }
        let entry = self.occupancy_ledger.entry(pallet_id).or_insert(0);
        *entry += applied_delta;
        if *entry == 0 {
            self.occupancy_ledger.remove(&pallet_id);
        }
    }

    /// Ordering key for `NextExecutableOrder`: priority desc, then planned or creation time asc.
    pub fn scheduling_key(&self) -> (std::cmp::Reverse<Priority>, DateTime<Utc>) {
        (
            std::cmp::Reverse(self.priority),
            self.scheduled_start.unwrap_or(self.created_at),
        )
    }
}

/// `WO-YYYYMMDD-`
pub fn order_number_prefix(date: NaiveDate) -> String {
    format!("{ORDER_NUMBER_PREFIX}-{}-", date.format("%Y%m%d"))
}

/// Next order number for `date` given the numbers already issued that day.
pub fn next_order_number<'a>(date: NaiveDate, existing: impl IntoIterator<Item = &'a str>) -> String {
    let prefix = order_number_prefix(date);
    let last = existing
        .into_iter()
        .filter_map(|number| number.strip_prefix(prefix.as_str()))
        .filter_map(|sequence| sequence.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{prefix}{:04}", last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> WorkOrder {
        WorkOrder::new(
            "WO-20250101-0001".to_string(),
            "test".to_string(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            Priority::new(50).expect("priority"),
            Utc::now(),
        )
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(101).is_err());
        assert_eq!(Priority::new(100).map(Priority::value).ok(), Some(100));
    }

    #[test]
    fn test_priority_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert!(serde_json::from_str::<Priority>("42").is_ok());
    }

    #[test]
    fn test_order_number_sequence() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).expect("date");
        assert_eq!(next_order_number(date, Vec::<&str>::new()), "WO-20250307-0001");
        let existing = ["WO-20250307-0001", "WO-20250307-0009", "WO-20250306-0042"];
        assert_eq!(next_order_number(date, existing), "WO-20250307-0010");
    }

    #[test]
    fn test_progress_is_monotonic_while_running() {
        let mut order = order();
        order.status = WorkOrderStatus::InProgress;
        order.record_progress(40.0);
        order.record_progress(20.0);
        assert_eq!(order.progress_percentage, 40.0);
        order.record_progress(150.0);
        assert_eq!(order.progress_percentage, 100.0);
    }

    #[test]
    fn test_occupancy_ledger_nets_out() {
        let mut order = order();
        order.record_occupancy(7, 1);
        order.record_occupancy(7, 1);
        order.record_occupancy(7, -2);
        assert!(order.occupancy_ledger.is_empty());
    }

    #[test]
    fn test_dispatch_acceptance() {
        let mut order = order();
        assert!(!order.accepts_dispatch());
        order.start_requested_at = Some(Utc::now());
        assert!(order.accepts_dispatch());
        order.pending_outcome = Some(PendingOutcome::Cancelled);
        assert!(!order.accepts_dispatch());
        assert!(order.cancellation_requested());
    }
}
