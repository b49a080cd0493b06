//! # Resource Allocator
//!
//! Sole writer of pallet occupancy, location counts and stock status.
//!
//! Each operation locks the resources it touches (see [`LockTable`]),
//! re-reads them under the lock, validates, and writes every change through
//! one [`InventoryStore::commit`] call. A failed validation leaves the store
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::errors::{AllocationError, AllocationResult};
use super::locks::{LockTable, ResourceKey};
use crate::clock::Clock;
use crate::constants::events;
use crate::events::{AuditEntry, AuditSink};
use crate::models::{
    Location, LocationId, OccupancyChange, Pallet, PalletId, PalletLocationRecord, PalletStatus,
    PalletStatusRecord, ProductId, QualityStatus, StockId, StockStatus, StockUnit, WorkOrderId,
};
use crate::persistence::{InventoryBatch, InventoryStore};

/// Result of a pallet move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalletMove {
    pub pallet_id: PalletId,
    pub from: Option<LocationId>,
    pub to: LocationId,
    pub to_code: String,
    /// False when the pallet already stood at the target.
    pub moved: bool,
}

pub struct ResourceAllocator {
    store: Arc<dyn InventoryStore>,
    locks: LockTable,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    lock_timeout: Duration,
}

impl ResourceAllocator {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks: LockTable::new(),
            clock,
            audit,
            lock_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Resources currently locked or waited on.
    pub fn held_lock_count(&self) -> usize {
        self.locks.len()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Add a location, rejecting parent chains that loop back to it.
    pub async fn register_location(&self, location: Location) -> AllocationResult<Location> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Location(location.id)], self.lock_timeout)
            .await?;

        if let Some(parent) = location.parent_location_id {
            self.ensure_acyclic(location.id, parent).await?;
        }
        self.store
            .commit(InventoryBatch {
                locations: vec![location.clone()],
                ..InventoryBatch::default()
            })
            .await?;
        Ok(self.store.location(location.id).await?)
    }

    pub async fn reparent_location(
        &self,
        location_id: LocationId,
        parent: Option<LocationId>,
    ) -> AllocationResult<Location> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Location(location_id)], self.lock_timeout)
            .await?;

        let mut location = self.store.location(location_id).await?;
        if let Some(parent) = parent {
            self.ensure_acyclic(location_id, parent).await?;
        }
        location.parent_location_id = parent;
        location.updated_at = self.clock.now();
        self.store
            .commit(InventoryBatch {
                locations: vec![location],
                ..InventoryBatch::default()
            })
            .await?;
        Ok(self.store.location(location_id).await?)
    }

    async fn ensure_acyclic(&self, location_id: LocationId, parent: LocationId) -> AllocationResult<()> {
        let mut cursor = Some(parent);
        let mut hops = 0usize;
        while let Some(current) = cursor {
            if current == location_id {
                return Err(AllocationError::LocationCycle { location_id });
            }
            hops += 1;
            // A pre-existing loop further up would spin forever.
            if hops > 10_000 {
                return Err(AllocationError::LocationCycle { location_id });
            }
            cursor = self.store.location(current).await?.parent_location_id;
        }
        Ok(())
    }

    pub async fn location_by_code(&self, code: &str) -> AllocationResult<Location> {
        Ok(self.store.location_by_code(code).await?)
    }

    pub async fn activate_location(&self, location_id: LocationId) -> AllocationResult<Location> {
        self.set_location_active(location_id, true).await
    }

    /// Only an empty location may be taken out of service.
    pub async fn deactivate_location(&self, location_id: LocationId) -> AllocationResult<Location> {
        self.set_location_active(location_id, false).await
    }

    async fn set_location_active(&self, location_id: LocationId, active: bool) -> AllocationResult<Location> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Location(location_id)], self.lock_timeout)
            .await?;

        let mut location = self.store.location(location_id).await?;
        if !active && location.current_count > 0 {
            return Err(AllocationError::LocationOccupied {
                location_id,
                code: location.code,
                count: location.current_count,
            });
        }
        if location.is_active != active {
            location.is_active = active;
            location.updated_at = self.clock.now();
            self.store
                .commit(InventoryBatch {
                    locations: vec![location.clone()],
                    ..InventoryBatch::default()
                })
                .await?;
            self.audit.record(
                AuditEntry::info(
                    events::LOCATION_STATE_CHANGED,
                    format!("Location {} {}", location.code, if active { "activated" } else { "deactivated" }),
                )
                .with_resource(location.code.clone())
                .at(self.clock.now()),
            );
        }
        Ok(self.store.location(location_id).await?)
    }

    /// Add a pallet; a pallet placed at a location takes one unit of its capacity.
    pub async fn register_pallet(&self, pallet: Pallet) -> AllocationResult<Pallet> {
        let mut keys = vec![ResourceKey::Pallet(pallet.id)];
        if let Some(location_id) = pallet.current_location_id {
            keys.push(ResourceKey::Location(location_id));
        }
        let _lease = self.locks.acquire(keys, self.lock_timeout).await?;

        let now = self.clock.now();
        let mut batch = InventoryBatch {
            pallets: vec![pallet.clone()],
            ..InventoryBatch::default()
        };
        if let Some(location_id) = pallet.current_location_id {
            let mut location = self.store.location(location_id).await?;
            Self::check_target(&location)?;
            location.current_count += 1;
            location.updated_at = now;
            batch.locations.push(location);
            batch.location_records.push(PalletLocationRecord {
                pallet_id: pallet.id,
                location_id,
                entry_time: now,
                exit_time: None,
                is_current: true,
                move_reason: Some("registered".to_string()),
            });
        }
        self.store.commit(batch).await?;
        Ok(self.store.pallet(pallet.id).await?)
    }

    /// Add a stock unit into a free slot of its pallet.
    pub async fn register_stock_unit(&self, mut unit: StockUnit) -> AllocationResult<StockUnit> {
        let _lease = self
            .locks
            .acquire(
                [ResourceKey::Pallet(unit.pallet_id), ResourceKey::Stock(unit.id)],
                self.lock_timeout,
            )
            .await?;

        let pallet = self.store.pallet(unit.pallet_id).await?;
        if unit.position_on_pallet == 0 || unit.position_on_pallet > pallet.max_slots {
            return Err(AllocationError::PositionOutOfRange {
                pallet_id: pallet.id,
                position: unit.position_on_pallet,
                max_slots: pallet.max_slots,
            });
        }
        let occupied = self
            .store
            .stock_units_on_pallet(pallet.id)
            .await?
            .iter()
            .any(|existing| existing.position_on_pallet == unit.position_on_pallet && existing.id != unit.id);
        if occupied {
            return Err(AllocationError::PositionOccupied {
                pallet_id: pallet.id,
                position: unit.position_on_pallet,
            });
        }

        unit.current_location_id = pallet.current_location_id;
        self.store
            .commit(InventoryBatch {
                stock_units: vec![unit.clone()],
                ..InventoryBatch::default()
            })
            .await?;
        Ok(self.store.stock_unit(unit.id).await?)
    }

    // ------------------------------------------------------------------
    // Stock
    // ------------------------------------------------------------------

    /// Reserve the oldest Available, Good unit of `product_id`.
    pub async fn reserve_stock(&self, product_id: ProductId) -> AllocationResult<StockUnit> {
        self.reserve_stock_for(product_id, None).await
    }

    /// Strict FIFO by inbound time, ties broken by id.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn reserve_stock_for(
        &self,
        product_id: ProductId,
        work_order_id: Option<WorkOrderId>,
    ) -> AllocationResult<StockUnit> {
        let _product_lease = self
            .locks
            .acquire([ResourceKey::Product(product_id)], self.lock_timeout)
            .await?;

        let candidate = self
            .store
            .stock_units_for_product(product_id)
            .await?
            .into_iter()
            .filter(StockUnit::is_reservable)
            .min_by(|a, b| a.inbound_at.cmp(&b.inbound_at).then_with(|| a.id.cmp(&b.id)))
            .ok_or(AllocationError::NoStockAvailable { product_id })?;

        let _stock_lease = self
            .locks
            .acquire([ResourceKey::Stock(candidate.id)], self.lock_timeout)
            .await?;
        let mut unit = self.store.stock_unit(candidate.id).await?;
        if !unit.is_reservable() {
            return Err(AllocationError::ConcurrencyConflict {
                resource: ResourceKey::Stock(unit.id).to_string(),
            });
        }

        unit.status = StockStatus::Reserved;
        unit.reserved_by = work_order_id;
        unit.updated_at = self.clock.now();
        self.commit_stock(unit.clone()).await?;

        debug!(stock_id = %unit.id, stock_number = %unit.stock_number, "Reserved stock (FIFO)");
        self.audit.record(
            AuditEntry::info(events::STOCK_RESERVED, format!("Reserved stock {}", unit.stock_number))
                .with_resource(unit.stock_number.clone())
                .with_details(json!({ "product_id": product_id, "work_order_id": work_order_id }))
                .at(self.clock.now()),
        );
        Ok(self.store.stock_unit(unit.id).await?)
    }

    /// Reserved → Available.
    pub async fn release_stock(&self, stock_id: StockId) -> AllocationResult<StockUnit> {
        let unit = self
            .transition_stock(stock_id, &[StockStatus::Reserved], StockStatus::Available, |unit| {
                unit.reserved_by = None;
                unit.current_step = None;
            })
            .await?;
        self.audit.record(
            AuditEntry::info(events::STOCK_RELEASED, format!("Released stock {}", unit.stock_number))
                .with_resource(unit.stock_number.clone())
                .at(self.clock.now()),
        );
        Ok(unit)
    }

    pub async fn reserve_specific(&self, stock_id: StockId, work_order_id: Option<WorkOrderId>) -> AllocationResult<StockUnit> {
        self.re_reserve(stock_id, work_order_id).await
    }

    /// Available → Reserved, optionally on behalf of a work order.
    pub async fn re_reserve(&self, stock_id: StockId, work_order_id: Option<WorkOrderId>) -> AllocationResult<StockUnit> {
        let unit = self
            .transition_stock(stock_id, &[StockStatus::Available], StockStatus::Reserved, |unit| {
                unit.reserved_by = work_order_id;
            })
            .await?;
        self.audit.record(
            AuditEntry::info(events::STOCK_RESERVED, format!("Reserved stock {}", unit.stock_number))
                .with_resource(unit.stock_number.clone())
                .with_details(json!({ "work_order_id": work_order_id }))
                .at(self.clock.now()),
        );
        Ok(unit)
    }

    /// Reserved → InProcess for a process step; already InProcess is kept.
    pub async fn mark_in_process(&self, stock_id: StockId, step_number: u32) -> AllocationResult<StockUnit> {
        self.transition_stock(
            stock_id,
            &[StockStatus::Reserved, StockStatus::InProcess],
            StockStatus::InProcess,
            |unit| unit.current_step = Some(step_number),
        )
        .await
    }

    /// InProcess → Reserved once no process step holds the unit.
    pub async fn finish_processing(&self, stock_id: StockId) -> AllocationResult<StockUnit> {
        self.transition_stock(
            stock_id,
            &[StockStatus::InProcess, StockStatus::Reserved],
            StockStatus::Reserved,
            |_| {},
        )
        .await
    }

    /// Return every unit the order still holds to Available.
    pub async fn release_for_work_order(&self, work_order_id: WorkOrderId) -> AllocationResult<Vec<StockId>> {
        let mut released = Vec::new();
        for unit in self.store.stock_units_reserved_by(work_order_id).await? {
            if unit.status == StockStatus::InProcess {
                self.finish_processing(unit.id).await?;
            }
            if matches!(unit.status, StockStatus::Reserved | StockStatus::InProcess) {
                self.release_stock(unit.id).await?;
                released.push(unit.id);
            }
        }
        Ok(released)
    }

    /// Reserved or InProcess → Completed; the unit leaves circulation.
    pub async fn complete_stock(&self, stock_id: StockId) -> AllocationResult<StockUnit> {
        self.transition_stock(
            stock_id,
            &[StockStatus::Reserved, StockStatus::InProcess],
            StockStatus::Completed,
            |unit| {
                unit.reserved_by = None;
                unit.current_step = None;
            },
        )
        .await
    }

    /// Mark every unit the order still holds as Completed.
    pub async fn complete_for_work_order(&self, work_order_id: WorkOrderId) -> AllocationResult<Vec<StockId>> {
        let mut completed = Vec::new();
        for unit in self.store.stock_units_reserved_by(work_order_id).await? {
            if !matches!(unit.status, StockStatus::Reserved | StockStatus::InProcess) {
                continue;
            }
            let unit = self.complete_stock(unit.id).await?;
            self.audit.record(
                AuditEntry::info(events::STOCK_STATUS_CHANGED, format!("Stock {} completed", unit.stock_number))
                    .for_order(work_order_id)
                    .with_resource(unit.stock_number.clone())
                    .at(self.clock.now()),
            );
            completed.push(unit.id);
        }
        Ok(completed)
    }

    /// Setting Defective also takes the unit out of circulation.
    pub async fn set_quality(&self, stock_id: StockId, quality: QualityStatus) -> AllocationResult<StockUnit> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Stock(stock_id)], self.lock_timeout)
            .await?;

        let mut unit = self.store.stock_unit(stock_id).await?;
        unit.quality = quality;
        if quality == QualityStatus::Defective {
            unit.status = StockStatus::Defective;
            unit.reserved_by = None;
        }
        unit.updated_at = self.clock.now();
        self.commit_stock(unit.clone()).await?;

        self.audit.record(
            AuditEntry::info(events::STOCK_QUALITY_CHANGED, format!("Stock {} quality {quality:?}", unit.stock_number))
                .with_resource(unit.stock_number.clone())
                .at(self.clock.now()),
        );
        Ok(self.store.stock_unit(stock_id).await?)
    }

    async fn transition_stock(
        &self,
        stock_id: StockId,
        expected: &[StockStatus],
        target: StockStatus,
        update: impl FnOnce(&mut StockUnit) + Send,
    ) -> AllocationResult<StockUnit> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Stock(stock_id)], self.lock_timeout)
            .await?;

        let mut unit = self.store.stock_unit(stock_id).await?;
        if !expected.contains(&unit.status) {
            return Err(AllocationError::InvalidStockStatus {
                stock_id,
                expected: expected.first().copied().unwrap_or(target),
                actual: unit.status,
            });
        }
        unit.status = target;
        update(&mut unit);
        unit.updated_at = self.clock.now();
        self.commit_stock(unit).await?;
        Ok(self.store.stock_unit(stock_id).await?)
    }

    async fn commit_stock(&self, unit: StockUnit) -> AllocationResult<()> {
        self.store
            .commit(InventoryBatch {
                stock_units: vec![unit],
                ..InventoryBatch::default()
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pallets
    // ------------------------------------------------------------------

    /// Move a pallet: source count down, target count up, history appended.
    #[instrument(skip(self, reason), fields(pallet_id = pallet_id, target = target_location_id))]
    pub async fn move_pallet(
        &self,
        pallet_id: PalletId,
        target_location_id: LocationId,
        reason: Option<&str>,
    ) -> AllocationResult<PalletMove> {
        let snapshot = self.store.pallet(pallet_id).await?;
        let riders = self.store.stock_units_on_pallet(pallet_id).await?;

        let mut keys = vec![ResourceKey::Pallet(pallet_id), ResourceKey::Location(target_location_id)];
        if let Some(source) = snapshot.current_location_id {
            keys.push(ResourceKey::Location(source));
        }
        keys.extend(riders.iter().map(|unit| ResourceKey::Stock(unit.id)));
        let _lease = self.locks.acquire(keys, self.lock_timeout).await?;

        let mut pallet = self.store.pallet(pallet_id).await?;
        if pallet.current_location_id != snapshot.current_location_id {
            return Err(AllocationError::ConcurrencyConflict {
                resource: ResourceKey::Pallet(pallet_id).to_string(),
            });
        }

        let mut target = self.store.location(target_location_id).await?;
        if pallet.current_location_id == Some(target_location_id) {
            return Ok(PalletMove {
                pallet_id,
                from: Some(target_location_id),
                to: target_location_id,
                to_code: target.code,
                moved: false,
            });
        }
        Self::check_target(&target)?;

        let now = self.clock.now();
        let from = pallet.current_location_id;
        let mut batch = InventoryBatch::default();

        if let Some(source_id) = from {
            let mut source = self.store.location(source_id).await?;
            source.current_count = source.current_count.saturating_sub(1);
            source.updated_at = now;
            batch.locations.push(source);
            batch.close_location_records.push((pallet_id, now));
        }

        target.current_count += 1;
        target.updated_at = now;
        let to_code = target.code.clone();
        batch.locations.push(target);

        pallet.current_location_id = Some(target_location_id);
        pallet.updated_at = now;
        batch.pallets.push(pallet);

        batch.location_records.push(PalletLocationRecord {
            pallet_id,
            location_id: target_location_id,
            entry_time: now,
            exit_time: None,
            is_current: true,
            move_reason: reason.map(str::to_string),
        });

        for rider in riders {
            let mut unit = self.store.stock_unit(rider.id).await?;
            unit.current_location_id = Some(target_location_id);
            unit.updated_at = now;
            batch.stock_units.push(unit);
        }

        self.store.commit(batch).await?;

        info!(pallet_id = pallet_id, from = ?from, to = %to_code, "Pallet moved");
        self.audit.record(
            AuditEntry::info(events::PALLET_MOVED, format!("Pallet {pallet_id} moved to {to_code}"))
                .with_resource(to_code.clone())
                .with_details(json!({ "pallet_id": pallet_id, "from": from, "to": target_location_id, "reason": reason }))
                .at(now),
        );

        Ok(PalletMove {
            pallet_id,
            from,
            to: target_location_id,
            to_code,
            moved: true,
        })
    }

    fn check_target(target: &Location) -> AllocationResult<()> {
        if !target.is_active {
            return Err(AllocationError::LocationInactive {
                location_id: target.id,
                code: target.code.clone(),
            });
        }
        if !target.has_capacity() {
            return Err(AllocationError::CapacityExceeded {
                location_id: target.id,
                code: target.code.clone(),
                capacity: target.max_capacity,
            });
        }
        Ok(())
    }

    /// Apply `delta` to the pallet's product count, clamped to `[0, max_slots]`.
    pub async fn update_occupancy(&self, pallet_id: PalletId, delta: i64) -> AllocationResult<OccupancyChange> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Pallet(pallet_id)], self.lock_timeout)
            .await?;

        let mut pallet = self.store.pallet(pallet_id).await?;
        if delta > 0 && pallet.current_location_id.is_none() {
            return Err(AllocationError::PalletNotPlaced { pallet_id });
        }
        let change = pallet.apply_occupancy(delta);
        if change.applied_delta() == 0 && !change.status_changed() {
            if delta != 0 {
                warn!(pallet_id = pallet_id, delta = delta, count = change.current_count, "Occupancy update clamped to no-op");
            }
            return Ok(change);
        }

        let now = self.clock.now();
        pallet.updated_at = now;
        let mut batch = InventoryBatch::default();
        if change.status_changed() {
            batch.status_records.push(PalletStatusRecord {
                pallet_id,
                previous_status: change.previous_status,
                new_status: change.status,
                location_id: pallet.current_location_id,
                reason: Some(format!("occupancy {} -> {}", change.previous_count, change.current_count)),
                changed_at: now,
            });
        }
        batch.pallets.push(pallet);
        self.store.commit(batch).await?;

        self.audit.record(
            AuditEntry::info(
                events::PALLET_OCCUPANCY_CHANGED,
                format!("Pallet {pallet_id} occupancy {} -> {}", change.previous_count, change.current_count),
            )
            .with_details(json!({ "pallet_id": pallet_id, "requested_delta": delta, "status": change.status }))
            .at(now),
        );
        Ok(change)
    }

    /// Count one use of the pallet; reaching its limit sends it to inspection.
    pub async fn record_usage(&self, pallet_id: PalletId) -> AllocationResult<Pallet> {
        let _lease = self
            .locks
            .acquire([ResourceKey::Pallet(pallet_id)], self.lock_timeout)
            .await?;

        let mut pallet = self.store.pallet(pallet_id).await?;
        let previous_status = pallet.status;
        let needs_inspection = pallet.record_usage();
        let now = self.clock.now();
        pallet.updated_at = now;

        let mut batch = InventoryBatch::default();
        if needs_inspection {
            batch.status_records.push(PalletStatusRecord {
                pallet_id,
                previous_status,
                new_status: PalletStatus::Inspection,
                location_id: pallet.current_location_id,
                reason: Some("usage limit reached".to_string()),
                changed_at: now,
            });
            self.audit.record(
                AuditEntry::warning(events::PALLET_STATUS_CHANGED, format!("Pallet {pallet_id} due for inspection"))
                    .at(now),
            );
        }
        batch.pallets.push(pallet);
        self.store.commit(batch).await?;
        Ok(self.store.pallet(pallet_id).await?)
    }
}
