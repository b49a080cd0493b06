//! Property tests for the allocator's capacity and FIFO invariants.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::strategies::*;
use mes_core::allocation::{AllocationError, ResourceAllocator};
use mes_core::clock::ManualClock;
use mes_core::events::NullAuditSink;
use mes_core::models::{Location, LocationType, Pallet, StockUnit};
use mes_core::persistence::{InMemoryStore, InventoryStore};
use proptest::prelude::*;
use uuid::Uuid;

fn allocator() -> (Arc<InMemoryStore>, ResourceAllocator) {
    let store = Arc::new(InMemoryStore::new());
    let allocator = ResourceAllocator::new(
        store.clone(),
        Arc::new(ManualClock::default()),
        Arc::new(NullAuditSink),
        Duration::from_millis(500),
    );
    (store, allocator)
}

proptest! {
    /// Reservations come out oldest-first, ties broken by id, and never repeat.
    #[test]
    fn reserve_stock_is_strict_fifo(offsets in inbound_offsets_strategy()) {
        let (reserved, expected) = tokio_test::block_on(async {
            let (_, allocator) = allocator();
            let now = Utc::now();
            allocator
                .register_location(Location::new(1, "LZ", LocationType::LoadingZone, 5, now))
                .await
                .expect("location");
            let mut pallet = Pallet::new(1, "PLT-1", offsets.len() as u32, now);
            pallet.current_location_id = Some(1);
            allocator.register_pallet(pallet).await.expect("pallet");

            let product = Uuid::new_v4();
            let mut units = Vec::new();
            for (position, offset) in (1u32..).zip(&offsets) {
                let unit = StockUnit::new(
                    format!("S{position}"),
                    product,
                    1,
                    position,
                    now + chrono::Duration::seconds(*offset),
                );
                units.push(allocator.register_stock_unit(unit).await.expect("stock"));
            }
            units.sort_by(|a, b| a.inbound_at.cmp(&b.inbound_at).then_with(|| a.id.cmp(&b.id)));
            let expected: Vec<Uuid> = units.iter().map(|u| u.id).collect();

            let mut reserved = Vec::new();
            for _ in 0..offsets.len() {
                reserved.push(allocator.reserve_stock(product).await.expect("reserve").id);
            }
            let exhausted = allocator.reserve_stock(product).await;
            assert!(matches!(exhausted, Err(AllocationError::NoStockAvailable { .. })));
            (reserved, expected)
        });
        prop_assert_eq!(reserved, expected);
    }

    /// Pallet occupancy stays within its slots whatever deltas arrive.
    #[test]
    fn pallet_occupancy_stays_in_bounds(deltas in occupancy_deltas_strategy()) {
        let (counts, applied_sum, final_count) = tokio_test::block_on(async {
            let (store, allocator) = allocator();
            let now = Utc::now();
            allocator
                .register_location(Location::new(1, "LZ", LocationType::LoadingZone, 5, now))
                .await
                .expect("location");
            let mut pallet = Pallet::new(1, "PLT-1", 4, now);
            pallet.current_location_id = Some(1);
            allocator.register_pallet(pallet).await.expect("pallet");

            let mut counts = Vec::new();
            let mut applied_sum = 0;
            for delta in &deltas {
                let change = allocator.update_occupancy(1, *delta).await.expect("occupancy");
                counts.push(change.current_count);
                applied_sum += change.applied_delta();
            }
            let final_count = store.pallet(1).await.expect("pallet").current_product_count;
            (counts, applied_sum, final_count)
        });
        prop_assert!(counts.iter().all(|count| *count <= 4));
        prop_assert_eq!(applied_sum, i64::from(final_count));
    }

    /// No location exceeds its capacity and the counts add up to the pallets placed.
    #[test]
    fn location_capacity_holds_under_moves(requests in move_requests_strategy(4, 3)) {
        let (counts, capacities) = tokio_test::block_on(async {
            let (store, allocator) = allocator();
            let now = Utc::now();
            let capacities = [1u32, 2, 4];
            for (id, capacity) in (1i64..).zip(capacities) {
                allocator
                    .register_location(Location::new(id, format!("L{id}"), LocationType::Station, capacity, now))
                    .await
                    .expect("location");
            }
            allocator
                .register_location(Location::new(4, "YARD", LocationType::Warehouse, 10, now))
                .await
                .expect("yard");
            for pallet_id in 1..=4 {
                let mut pallet = Pallet::new(pallet_id, format!("P{pallet_id}"), 2, now);
                pallet.current_location_id = Some(4);
                allocator.register_pallet(pallet).await.expect("pallet");
            }

            for (pallet_index, location_index) in &requests {
                let pallet_id = *pallet_index as i64 + 1;
                let target = *location_index as i64 + 1;
                match allocator.move_pallet(pallet_id, target, None).await {
                    Ok(_) | Err(AllocationError::CapacityExceeded { .. }) => {}
                    Err(other) => panic!("unexpected move error: {other}"),
                }
            }

            let mut counts = Vec::new();
            for id in 1..=4 {
                counts.push(store.location(id).await.expect("location").current_count);
            }
            (counts, capacities)
        });
        for (count, capacity) in counts.iter().zip(capacities) {
            prop_assert!(*count <= capacity);
        }
        prop_assert_eq!(counts.iter().sum::<u32>(), 4);
    }
}
