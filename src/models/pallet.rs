//! # Pallet
//!
//! Carrier with a fixed number of product slots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{LocationId, PalletId};
use crate::constants::defaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PalletStatus {
    Available,
    InUse,
    Empty,
    Collected,
    Inspection,
    Repair,
    Disposed,
}

impl fmt::Display for PalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Empty => "empty",
            Self::Collected => "collected",
            Self::Inspection => "inspection",
            Self::Repair => "repair",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pallet {
    pub id: PalletId,
    pub code: String,
    pub pallet_type: String,
    pub status: PalletStatus,
    pub current_location_id: Option<LocationId>,
    pub max_slots: u32,
    pub current_product_count: u32,
    pub usage_count: u32,
    pub max_usage_count: u32,
    pub last_inspection_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; bumped on every committed write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an occupancy update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyChange {
    pub previous_count: u32,
    pub current_count: u32,
    pub previous_status: PalletStatus,
    pub status: PalletStatus,
}

impl OccupancyChange {
    pub fn applied_delta(&self) -> i64 {
        i64::from(self.current_count) - i64::from(self.previous_count)
    }

    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }
}

impl Pallet {
    pub fn new(id: PalletId, code: impl Into<String>, max_slots: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            code: code.into(),
            pallet_type: "standard".to_string(),
            status: PalletStatus::Available,
            current_location_id: None,
            max_slots,
            current_product_count: 0,
            usage_count: 0,
            max_usage_count: defaults::PALLET_MAX_USAGE_COUNT,
            last_inspection_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_full(&self) -> bool {
        self.current_product_count >= self.max_slots
    }

    pub fn is_empty(&self) -> bool {
        self.current_product_count == 0
    }

    /// Apply `delta`, clamping the count to `[0, max_slots]` and deriving status.
    pub fn apply_occupancy(&mut self, delta: i64) -> OccupancyChange {
        let previous_count = self.current_product_count;
        let previous_status = self.status;

        let next = (i64::from(previous_count) + delta).clamp(0, i64::from(self.max_slots));
        self.current_product_count = u32::try_from(next).unwrap_or(self.max_slots);
        self.status = derive_status(previous_status, self.current_product_count);

        OccupancyChange {
            previous_count,
            current_count: self.current_product_count,
            previous_status,
            status: self.status,
        }
    }

    /// Count one more use; reaching the limit sends the pallet to inspection.
    pub fn record_usage(&mut self) -> bool {
        self.usage_count = self.usage_count.saturating_add(1);
        if self.usage_count >= self.max_usage_count && self.status != PalletStatus::Inspection {
            self.status = PalletStatus::Inspection;
            return true;
        }
        false
    }
}

/// `0` → Empty; non-zero from Empty/Available → InUse; otherwise unchanged.
pub fn derive_status(previous: PalletStatus, count: u32) -> PalletStatus {
    if count == 0 {
        PalletStatus::Empty
    } else if matches!(previous, PalletStatus::Empty | PalletStatus::Available) {
        PalletStatus::InUse
    } else {
        previous
    }
}

/// Stay of a pallet at a location; exactly one record per pallet is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalletLocationRecord {
    pub pallet_id: PalletId,
    pub location_id: LocationId,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub move_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalletStatusRecord {
    pub pallet_id: PalletId,
    pub previous_status: PalletStatus,
    pub new_status: PalletStatus,
    pub location_id: Option<LocationId>,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_clamps_and_derives_status() {
        let mut pallet = Pallet::new(1, "P-001", 4, Utc::now());
        let change = pallet.apply_occupancy(3);
        assert_eq!(change.current_count, 3);
        assert_eq!(change.status, PalletStatus::InUse);

        let change = pallet.apply_occupancy(10);
        assert_eq!(change.current_count, 4);
        assert_eq!(change.applied_delta(), 1);
        assert!(pallet.is_full());

        let change = pallet.apply_occupancy(-9);
        assert_eq!(change.current_count, 0);
        assert_eq!(change.status, PalletStatus::Empty);
    }

    #[test]
    fn test_status_preserved_for_non_occupancy_states() {
        assert_eq!(derive_status(PalletStatus::Inspection, 2), PalletStatus::Inspection);
        assert_eq!(derive_status(PalletStatus::Available, 1), PalletStatus::InUse);
        assert_eq!(derive_status(PalletStatus::Repair, 0), PalletStatus::Empty);
    }

    #[test]
    fn test_usage_limit_triggers_inspection() {
        let mut pallet = Pallet::new(1, "P-001", 4, Utc::now());
        pallet.max_usage_count = 2;
        assert!(!pallet.record_usage());
        assert!(pallet.record_usage());
        assert_eq!(pallet.status, PalletStatus::Inspection);
    }
}
