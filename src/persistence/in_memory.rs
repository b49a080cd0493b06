//! In-memory store backing tests, simulations and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    GraphStore, InventoryBatch, InventoryStore, PersistenceError, PersistenceResult, WorkOrderStore,
};
use crate::graph::StepGraph;
use crate::models::{
    ExecutionId, GraphId, Location, LocationId, Pallet, PalletId, PalletLocationRecord, PalletStatusRecord,
    ProductId, StepExecution, StockId, StockUnit, WorkOrder, WorkOrderId,
};
use crate::state_machine::ExecutionStatus;

#[derive(Default)]
struct OrderTables {
    orders: HashMap<WorkOrderId, WorkOrder>,
    executions: HashMap<ExecutionId, StepExecution>,
    executions_by_order: HashMap<WorkOrderId, Vec<ExecutionId>>,
}

#[derive(Default)]
struct InventoryTables {
    pallets: HashMap<PalletId, Pallet>,
    locations: HashMap<LocationId, Location>,
    stock: HashMap<StockId, StockUnit>,
    location_history: HashMap<PalletId, Vec<PalletLocationRecord>>,
    status_history: HashMap<PalletId, Vec<PalletStatusRecord>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    graphs: RwLock<HashMap<GraphId, Arc<StepGraph>>>,
    orders: RwLock<OrderTables>,
    inventory: RwLock<InventoryTables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("graphs", &self.graphs.read().len())
            .field("orders", &self.orders.read().orders.len())
            .field("pallets", &self.inventory.read().pallets.len())
            .finish()
    }
}

/// Version check for one entity; returns the version to store.
fn next_version(
    entity: &'static str,
    id: impl ToString,
    stored: Option<u64>,
    incoming: u64,
) -> PersistenceResult<u64> {
    match stored {
        Some(current) if current == incoming => Ok(current + 1),
        None if incoming == 0 => Ok(1),
        _ => Err(PersistenceError::ConcurrentModification {
            entity,
            id: id.to_string(),
        }),
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn insert_graph(&self, graph: StepGraph) -> PersistenceResult<Arc<StepGraph>> {
        let mut graphs = self.graphs.write();
        if graphs.contains_key(&graph.id) {
            return Err(PersistenceError::Duplicate {
                entity: "graph",
                id: graph.id.to_string(),
            });
        }
        let graph = Arc::new(graph);
        graphs.insert(graph.id, Arc::clone(&graph));
        Ok(graph)
    }

    async fn graph(&self, id: GraphId) -> PersistenceResult<Arc<StepGraph>> {
        self.graphs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("graph", id))
    }

    async fn graphs(&self) -> PersistenceResult<Vec<Arc<StepGraph>>> {
        Ok(self.graphs.read().values().cloned().collect())
    }
}

#[async_trait]
impl WorkOrderStore for InMemoryStore {
    async fn insert_work_order(&self, order: WorkOrder, executions: Vec<StepExecution>) -> PersistenceResult<()> {
        let mut tables = self.orders.write();
        if tables.orders.contains_key(&order.id) {
            return Err(PersistenceError::Duplicate {
                entity: "work_order",
                id: order.id.to_string(),
            });
        }
        if tables.orders.values().any(|o| o.order_number == order.order_number) {
            return Err(PersistenceError::Duplicate {
                entity: "order_number",
                id: order.order_number,
            });
        }

        let mut ids: Vec<(u32, ExecutionId)> = executions.iter().map(|e| (e.step_number, e.id)).collect();
        ids.sort_unstable();
        tables
            .executions_by_order
            .insert(order.id, ids.into_iter().map(|(_, id)| id).collect());
        for execution in executions {
            tables.executions.insert(execution.id, execution);
        }
        tables.orders.insert(order.id, order);
        Ok(())
    }

    async fn work_order(&self, id: WorkOrderId) -> PersistenceResult<WorkOrder> {
        self.orders
            .read()
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("work_order", id))
    }

    async fn update_work_order(&self, order: &WorkOrder) -> PersistenceResult<()> {
        let mut tables = self.orders.write();
        match tables.orders.get_mut(&order.id) {
            Some(stored) => {
                *stored = order.clone();
                Ok(())
            }
            None => Err(PersistenceError::not_found("work_order", order.id)),
        }
    }

    async fn work_orders(&self) -> PersistenceResult<Vec<WorkOrder>> {
        let mut orders: Vec<WorkOrder> = self.orders.read().orders.values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.order_number.cmp(&b.order_number)));
        Ok(orders)
    }

    async fn order_numbers_with_prefix(&self, prefix: &str) -> PersistenceResult<Vec<String>> {
        Ok(self
            .orders
            .read()
            .orders
            .values()
            .filter(|order| order.order_number.starts_with(prefix))
            .map(|order| order.order_number.clone())
            .collect())
    }

    async fn execution(&self, id: ExecutionId) -> PersistenceResult<StepExecution> {
        self.orders
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("step_execution", id))
    }

    async fn executions_for(&self, work_order_id: WorkOrderId) -> PersistenceResult<Vec<StepExecution>> {
        let tables = self.orders.read();
        let ids = tables
            .executions_by_order
            .get(&work_order_id)
            .ok_or_else(|| PersistenceError::not_found("work_order", work_order_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.executions.get(id).cloned())
            .collect())
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> PersistenceResult<Vec<StepExecution>> {
        Ok(self
            .orders
            .read()
            .executions
            .values()
            .filter(|execution| execution.status == status)
            .cloned()
            .collect())
    }

    async fn update_executions(&self, executions: &[StepExecution]) -> PersistenceResult<()> {
        let mut tables = self.orders.write();
        if let Some(missing) = executions.iter().find(|e| !tables.executions.contains_key(&e.id)) {
            return Err(PersistenceError::not_found("step_execution", missing.id));
        }
        for execution in executions {
            tables.executions.insert(execution.id, execution.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn pallet(&self, id: PalletId) -> PersistenceResult<Pallet> {
        self.inventory
            .read()
            .pallets
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("pallet", id))
    }

    async fn location(&self, id: LocationId) -> PersistenceResult<Location> {
        self.inventory
            .read()
            .locations
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("location", id))
    }

    async fn location_by_code(&self, code: &str) -> PersistenceResult<Location> {
        self.inventory
            .read()
            .locations
            .values()
            .find(|location| location.code == code)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("location", code))
    }

    async fn locations(&self) -> PersistenceResult<Vec<Location>> {
        let mut locations: Vec<Location> = self.inventory.read().locations.values().cloned().collect();
        locations.sort_by_key(|location| location.id);
        Ok(locations)
    }

    async fn stock_unit(&self, id: StockId) -> PersistenceResult<StockUnit> {
        self.inventory
            .read()
            .stock
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("stock_unit", id))
    }

    async fn stock_units_for_product(&self, product_id: ProductId) -> PersistenceResult<Vec<StockUnit>> {
        Ok(self
            .inventory
            .read()
            .stock
            .values()
            .filter(|unit| unit.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn stock_units_on_pallet(&self, pallet_id: PalletId) -> PersistenceResult<Vec<StockUnit>> {
        Ok(self
            .inventory
            .read()
            .stock
            .values()
            .filter(|unit| unit.pallet_id == pallet_id)
            .cloned()
            .collect())
    }

    async fn stock_units_reserved_by(&self, work_order_id: WorkOrderId) -> PersistenceResult<Vec<StockUnit>> {
        Ok(self
            .inventory
            .read()
            .stock
            .values()
            .filter(|unit| unit.reserved_by == Some(work_order_id))
            .cloned()
            .collect())
    }

    async fn pallet_location_history(&self, pallet_id: PalletId) -> PersistenceResult<Vec<PalletLocationRecord>> {
        Ok(self
            .inventory
            .read()
            .location_history
            .get(&pallet_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn pallet_status_history(&self, pallet_id: PalletId) -> PersistenceResult<Vec<PalletStatusRecord>> {
        Ok(self
            .inventory
            .read()
            .status_history
            .get(&pallet_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, batch: InventoryBatch) -> PersistenceResult<()> {
        let mut tables = self.inventory.write();

        // Validate everything before touching any table.
        let mut pallet_versions = Vec::with_capacity(batch.pallets.len());
        for pallet in &batch.pallets {
            let stored = tables.pallets.get(&pallet.id).map(|p| p.version);
            pallet_versions.push(next_version("pallet", pallet.id, stored, pallet.version)?);
        }
        let mut location_versions = Vec::with_capacity(batch.locations.len());
        for location in &batch.locations {
            let stored = tables.locations.get(&location.id).map(|l| l.version);
            location_versions.push(next_version("location", location.id, stored, location.version)?);
            if location.version == 0
                && tables
                    .locations
                    .values()
                    .any(|existing| existing.code == location.code && existing.id != location.id)
            {
                return Err(PersistenceError::Duplicate {
                    entity: "location_code",
                    id: location.code.clone(),
                });
            }
        }
        let mut stock_versions = Vec::with_capacity(batch.stock_units.len());
        for unit in &batch.stock_units {
            let stored = tables.stock.get(&unit.id).map(|s| s.version);
            stock_versions.push(next_version("stock_unit", unit.id, stored, unit.version)?);
        }

        for (mut pallet, version) in batch.pallets.into_iter().zip(pallet_versions) {
            pallet.version = version;
            tables.pallets.insert(pallet.id, pallet);
        }
        for (mut location, version) in batch.locations.into_iter().zip(location_versions) {
            location.version = version;
            tables.locations.insert(location.id, location);
        }
        for (mut unit, version) in batch.stock_units.into_iter().zip(stock_versions) {
            unit.version = version;
            tables.stock.insert(unit.id, unit);
        }
        for (pallet_id, exit_time) in batch.close_location_records {
            if let Some(history) = tables.location_history.get_mut(&pallet_id) {
                for record in history.iter_mut().filter(|record| record.is_current) {
                    record.is_current = false;
                    record.exit_time = Some(exit_time);
                }
            }
        }
        for record in batch.location_records {
            tables.location_history.entry(record.pallet_id).or_default().push(record);
        }
        for record in batch.status_records {
            tables.status_history.entry(record.pallet_id).or_default().push(record);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocationType;
    use chrono::Utc;

    #[tokio::test]
    async fn test_commit_inserts_then_version_checks() {
        let store = InMemoryStore::new();
        let location = Location::new(1, "LZ-A", LocationType::LoadingZone, 2, Utc::now());
        store
            .commit(InventoryBatch {
                locations: vec![location.clone()],
                ..InventoryBatch::default()
            })
            .await
            .expect("insert");

        let stored = store.location(1).await.expect("location");
        assert_eq!(stored.version, 1);

        // Stale write with the pre-insert version is rejected.
        let result = store
            .commit(InventoryBatch {
                locations: vec![location],
                ..InventoryBatch::default()
            })
            .await;
        assert!(matches!(result, Err(PersistenceError::ConcurrentModification { .. })));

        let mut fresh = stored.clone();
        fresh.current_count = 1;
        store
            .commit(InventoryBatch {
                locations: vec![fresh],
                ..InventoryBatch::default()
            })
            .await
            .expect("update");
        assert_eq!(store.location(1).await.expect("location").version, 2);
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let pallet = Pallet::new(1, "P-1", 4, now);
        let mut stale = Location::new(9, "X", LocationType::Warehouse, 1, now);
        stale.version = 5;

        let result = store
            .commit(InventoryBatch {
                pallets: vec![pallet],
                locations: vec![stale],
                ..InventoryBatch::default()
            })
            .await;
        assert!(result.is_err());
        assert!(store.pallet(1).await.is_err());
    }

    #[tokio::test]
    async fn test_work_order_round_trip() {
        use crate::models::Priority;
        let store = InMemoryStore::new();
        let order = WorkOrder::new(
            "WO-20250101-0001".into(),
            "order".into(),
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            1,
            Priority::new(10).expect("priority"),
            Utc::now(),
        );
        let executions = vec![
            StepExecution::new(order.id, 2, Utc::now()),
            StepExecution::new(order.id, 1, Utc::now()),
        ];
        store.insert_work_order(order.clone(), executions).await.expect("insert");

        let loaded = store.executions_for(order.id).await.expect("executions");
        assert_eq!(loaded.iter().map(|e| e.step_number).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.insert_work_order(order, Vec::new()).await.is_err());
        assert_eq!(
            store.order_numbers_with_prefix("WO-20250101-").await.expect("numbers"),
            vec!["WO-20250101-0001".to_string()]
        );
    }
}
