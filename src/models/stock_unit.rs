use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{LocationId, PalletId, ProductId, StockId, WorkOrderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Available,
    Reserved,
    InProcess,
    Completed,
    OnHold,
    Defective,
    Shipped,
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::InProcess => "in_process",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
            Self::Defective => "defective",
            Self::Shipped => "shipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Good,
    NeedRework,
    Defective,
    PendingInspection,
}

/// One physical unit of a product sitting in a pallet slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUnit {
    pub id: StockId,
    pub stock_number: String,
    pub product_id: ProductId,
    pub pallet_id: PalletId,
    pub position_on_pallet: u32,
    pub current_location_id: Option<LocationId>,
    pub status: StockStatus,
    pub quality: QualityStatus,
    pub lot_number: Option<String>,
    pub inbound_at: DateTime<Utc>,
    pub outbound_at: Option<DateTime<Utc>>,
    pub current_step: Option<u32>,
    /// Work order holding the reservation.
    pub reserved_by: Option<WorkOrderId>,
    pub remarks: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StockUnit {
    pub fn new(
        stock_number: impl Into<String>,
        product_id: ProductId,
        pallet_id: PalletId,
        position_on_pallet: u32,
        inbound_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stock_number: stock_number.into(),
            product_id,
            pallet_id,
            position_on_pallet,
            current_location_id: None,
            status: StockStatus::Available,
            quality: QualityStatus::Good,
            lot_number: None,
            inbound_at,
            outbound_at: None,
            current_step: None,
            reserved_by: None,
            remarks: None,
            version: 0,
            updated_at: inbound_at,
        }
    }

    /// Eligible for FIFO reservation.
    pub fn is_reservable(&self) -> bool {
        self.status == StockStatus::Available && self.quality == QualityStatus::Good
    }
}
