//! Concurrent callers against the allocator and against a single order.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::plant::Plant;
use common::scripted_executor::Scripted;
use futures::future::join_all;
use mes_core::allocation::ResourceAllocator;
use mes_core::clock::ManualClock;
use mes_core::events::NullAuditSink;
use mes_core::models::{ActionType, Location, LocationType, Pallet, StepDefinition, StepKind};
use mes_core::orchestration::StepOutcome;
use mes_core::persistence::{InMemoryStore, InventoryStore};
use mes_core::{ExecutionStatus, WorkOrderStatus};

const STATION: i64 = 1;
const YARD: i64 = 2;
const PALLETS: i64 = 8;
const SLOTS: u32 = 3;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_holds_under_concurrent_moves_and_occupancy() {
    let store = Arc::new(InMemoryStore::new());
    let allocator = Arc::new(ResourceAllocator::new(
        store.clone(),
        Arc::new(ManualClock::default()),
        Arc::new(NullAuditSink),
        Duration::from_secs(2),
    ));
    let now = Utc::now();
    allocator
        .register_location(Location::new(STATION, "ST-1", LocationType::Station, 1, now))
        .await
        .expect("station");
    allocator
        .register_location(Location::new(YARD, "YARD", LocationType::Warehouse, 10, now))
        .await
        .expect("yard");
    for pallet_id in 1..=PALLETS {
        let mut pallet = Pallet::new(pallet_id, format!("PLT-{pallet_id}"), SLOTS, now);
        pallet.current_location_id = Some(YARD);
        allocator.register_pallet(pallet).await.expect("pallet");
    }

    let tasks = (0..200i64).map(|i| {
        let allocator = Arc::clone(&allocator);
        tokio::spawn(async move {
            let pallet_id = i % PALLETS + 1;
            let result = if i % 3 == 0 {
                let delta = if i % 2 == 0 { 2 } else { -1 };
                allocator.update_occupancy(pallet_id, delta).await.map(|_| ())
            } else {
                let target = if i % 2 == 0 { STATION } else { YARD };
                allocator.move_pallet(pallet_id, target, Some("shuffle")).await.map(|_| ())
            };
            if let Err(err) = result {
                assert!(err.is_retryable(), "unexpected allocator error: {err}");
            }
        })
    });
    for joined in join_all(tasks).await {
        joined.expect("task");
    }

    let station = store.location(STATION).await.expect("station");
    let yard = store.location(YARD).await.expect("yard");
    assert!(station.current_count <= station.max_capacity);
    assert_eq!(station.current_count + yard.current_count, PALLETS as u32);

    let mut at_station = 0;
    for pallet_id in 1..=PALLETS {
        let pallet = store.pallet(pallet_id).await.expect("pallet");
        assert!(pallet.current_product_count <= SLOTS);
        if pallet.current_location_id == Some(STATION) {
            at_station += 1;
        }
    }
    assert_eq!(station.current_count, at_station);
    assert_eq!(allocator.held_lock_count(), 0);
}

fn notify(n: u32) -> StepDefinition {
    StepDefinition::new(n, format!("notify {n}"), StepKind::Notify, ActionType::Notify)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_advances_keep_one_writer_per_order() {
    let plant = Arc::new(Plant::new().await);
    let stock = plant.pallet(1, 1).await;
    let graph = plant
        .graph(vec![
            notify(1),
            notify(2).depends_on([1]),
            notify(3).depends_on([1]).parallel(),
            notify(4).depends_on([1]),
        ])
        .await;
    let order = plant.order(&graph, &stock[0]).await;
    for step in 1..=4 {
        plant.executor.script(step, [Scripted::Hang]);
    }
    plant.orchestrator.start_work_order(order.id).await.expect("start");
    let first = plant.execution(order.id, 1).await;
    assert_eq!(first.status, ExecutionStatus::InProgress);

    // The outcome of step 1 races with a burst of scheduler passes.
    let mut tasks = Vec::new();
    {
        let plant = Arc::clone(&plant);
        tasks.push(tokio::spawn(async move {
            plant
                .orchestrator
                .handle_outcome(first.id, 0, StepOutcome::success())
                .await
                .map(|_| ())
        }));
    }
    for _ in 0..31 {
        let plant = Arc::clone(&plant);
        let order_id = order.id;
        tasks.push(tokio::spawn(async move {
            plant.orchestrator.advance(order_id).await.map(|_| ())
        }));
    }
    for joined in join_all(tasks).await {
        joined.expect("task").expect("operation");
    }
    plant.orchestrator.advance(order.id).await.expect("advance");
    // Dispatch runs on spawned tasks; give them a moment to reach the executor.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let statuses: Vec<ExecutionStatus> = plant.executions(order.id).await.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Completed,
            ExecutionStatus::InProgress,
            ExecutionStatus::InProgress,
            ExecutionStatus::Pending,
        ]
    );
    for step in [1, 2, 3] {
        assert_eq!(plant.executor.attempts(step), 1, "step {step} dispatched once");
    }
    assert_eq!(plant.executor.attempts(4), 0);

    let status = plant.orchestrator.get_status(order.id).await.expect("status");
    assert_eq!(status.status, WorkOrderStatus::InProgress);
    assert_eq!(plant.orchestrator.locked_order_count(), 0);
}
