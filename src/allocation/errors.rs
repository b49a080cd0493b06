use thiserror::Error;

use crate::models::{LocationId, PalletId, ProductId, StockId, StockStatus};
use crate::persistence::PersistenceError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocationError {
    #[error("No available stock with good quality for product {product_id}")]
    NoStockAvailable { product_id: ProductId },

    #[error("Location {code} ({location_id}) is at capacity {capacity}")]
    CapacityExceeded {
        location_id: LocationId,
        code: String,
        capacity: u32,
    },

    #[error("Location {code} ({location_id}) is inactive")]
    LocationInactive { location_id: LocationId, code: String },

    #[error("Location {code} ({location_id}) still holds {count} pallet(s)")]
    LocationOccupied {
        location_id: LocationId,
        code: String,
        count: u32,
    },

    #[error("Pallet {pallet_id} is not placed at any location")]
    PalletNotPlaced { pallet_id: PalletId },

    #[error("Pallet {pallet_id} has no free slot")]
    PalletFull { pallet_id: PalletId },

    #[error("Stock {stock_id} is {actual}, expected {expected}")]
    InvalidStockStatus {
        stock_id: StockId,
        expected: StockStatus,
        actual: StockStatus,
    },

    #[error("Position {position} on pallet {pallet_id} is already occupied")]
    PositionOccupied { pallet_id: PalletId, position: u32 },

    #[error("Position {position} exceeds pallet {pallet_id} capacity {max_slots}")]
    PositionOutOfRange {
        pallet_id: PalletId,
        position: u32,
        max_slots: u32,
    },

    #[error("Parent of location {location_id} would create a cycle")]
    LocationCycle { location_id: LocationId },

    #[error("Concurrent access to {resource}; retry the operation")]
    ConcurrencyConflict { resource: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Persistence error: {0}")]
    Persistence(PersistenceError),
}

impl AllocationError {
    /// Conditions that may clear on their own; callers retry instead of failing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::LocationInactive { .. }
                | Self::PalletFull { .. }
                | Self::ConcurrencyConflict { .. }
        )
    }
}

impl From<PersistenceError> for AllocationError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ConcurrentModification { entity, id } => Self::ConcurrencyConflict {
                resource: format!("{entity}:{id}"),
            },
            PersistenceError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Persistence(other),
        }
    }
}

pub type AllocationResult<T> = Result<T, AllocationError>;
