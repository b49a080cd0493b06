//! # Persistence
//!
//! Store traits the orchestrator and allocator depend on, plus the in-memory
//! reference store. A database-backed store implements the same traits.
//!
//! Every multi-entity write goes through a single call (`insert_work_order`,
//! `update_executions`, [`InventoryStore::commit`]) so a store can make it
//! atomic. Inventory entities carry a `version`; `commit` rejects a write
//! whose version does not match the stored one.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryStore;

use crate::graph::StepGraph;
use crate::models::{
    ExecutionId, GraphId, Location, LocationId, Pallet, PalletId, PalletLocationRecord, PalletStatusRecord,
    ProductId, StepExecution, StockId, StockUnit, WorkOrder, WorkOrderId,
};
use crate::state_machine::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrent modification detected for {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn insert_graph(&self, graph: StepGraph) -> PersistenceResult<Arc<StepGraph>>;

    async fn graph(&self, id: GraphId) -> PersistenceResult<Arc<StepGraph>>;

    async fn graphs(&self) -> PersistenceResult<Vec<Arc<StepGraph>>>;
}

#[async_trait]
pub trait WorkOrderStore: Send + Sync {
    /// Insert an order together with its execution rows.
    async fn insert_work_order(&self, order: WorkOrder, executions: Vec<StepExecution>) -> PersistenceResult<()>;

    async fn work_order(&self, id: WorkOrderId) -> PersistenceResult<WorkOrder>;

    async fn update_work_order(&self, order: &WorkOrder) -> PersistenceResult<()>;

    async fn work_orders(&self) -> PersistenceResult<Vec<WorkOrder>>;

    async fn order_numbers_with_prefix(&self, prefix: &str) -> PersistenceResult<Vec<String>>;

    async fn execution(&self, id: ExecutionId) -> PersistenceResult<StepExecution>;

    /// Executions of one order in step-number order.
    async fn executions_for(&self, work_order_id: WorkOrderId) -> PersistenceResult<Vec<StepExecution>>;

    async fn executions_with_status(&self, status: ExecutionStatus) -> PersistenceResult<Vec<StepExecution>>;

    async fn update_execution(&self, execution: &StepExecution) -> PersistenceResult<()> {
        self.update_executions(std::slice::from_ref(execution)).await
    }

    /// Write several executions at once; all or nothing.
    async fn update_executions(&self, executions: &[StepExecution]) -> PersistenceResult<()>;
}

/// Atomic, version-checked inventory write.
///
/// Entities with `version == 0` that the store does not know yet are
/// inserted; everything else must match the stored version and is written
/// back with `version + 1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InventoryBatch {
    pub pallets: Vec<Pallet>,
    pub locations: Vec<Location>,
    pub stock_units: Vec<StockUnit>,
    /// Close the current location record of these pallets before appending.
    pub close_location_records: Vec<(PalletId, chrono::DateTime<chrono::Utc>)>,
    pub location_records: Vec<PalletLocationRecord>,
    pub status_records: Vec<PalletStatusRecord>,
}

impl InventoryBatch {
    pub fn is_empty(&self) -> bool {
        self.pallets.is_empty()
            && self.locations.is_empty()
            && self.stock_units.is_empty()
            && self.close_location_records.is_empty()
            && self.location_records.is_empty()
            && self.status_records.is_empty()
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn pallet(&self, id: PalletId) -> PersistenceResult<Pallet>;

    async fn location(&self, id: LocationId) -> PersistenceResult<Location>;

    async fn location_by_code(&self, code: &str) -> PersistenceResult<Location>;

    async fn locations(&self) -> PersistenceResult<Vec<Location>>;

    async fn stock_unit(&self, id: StockId) -> PersistenceResult<StockUnit>;

    async fn stock_units_for_product(&self, product_id: ProductId) -> PersistenceResult<Vec<StockUnit>>;

    async fn stock_units_on_pallet(&self, pallet_id: PalletId) -> PersistenceResult<Vec<StockUnit>>;

    async fn stock_units_reserved_by(&self, work_order_id: WorkOrderId) -> PersistenceResult<Vec<StockUnit>>;

    async fn pallet_location_history(&self, pallet_id: PalletId) -> PersistenceResult<Vec<PalletLocationRecord>>;

    async fn pallet_status_history(&self, pallet_id: PalletId) -> PersistenceResult<Vec<PalletStatusRecord>>;

    async fn commit(&self, batch: InventoryBatch) -> PersistenceResult<()>;
}
