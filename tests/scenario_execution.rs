//! End-to-end runs of step graphs through the orchestrator against a
//! scripted executor.

mod common;

use common::plant::Plant;
use common::scripted_executor::Scripted;
use mes_core::constants::events;
use mes_core::models::{ActionType, JoinCondition, StepDefinition, StepKind, StockStatus};
use mes_core::scenarios::{BOLTING_STATION, CHARGING_STATION, WAITING_ZONE, WELDING_STATION};
use mes_core::{ExecutionStatus, WorkOrderStatus};
use serde_json::json;

fn notify(n: u32) -> StepDefinition {
    StepDefinition::new(n, format!("notify {n}"), StepKind::Notify, ActionType::Notify)
}

#[tokio::test]
async fn test_parallel_scenario_runs_to_completion() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let graph = plant.scenario().await;
    let order = plant.order(&graph, &stock[0]).await;

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    let report = plant.settle(order.id).await;

    assert_eq!(report.status, WorkOrderStatus::Completed);
    assert_eq!(report.progress_percentage, 100.0);
    assert_eq!(report.steps.len(), 21);
    assert!(report.steps.iter().all(|step| step.status == ExecutionStatus::Completed));
    assert!(report.actual_start.is_some() && report.actual_end.is_some());

    // Wait steps resolve in place with the producer that signalled them.
    assert_eq!(plant.execution(order.id, 11).await.result_data, Some(json!({ "signal_from": 6 })));
    assert_eq!(plant.execution(order.id, 14).await.result_data, Some(json!({ "signal_from": 9 })));
    let dispatched = plant.executor.dispatched_steps();
    assert!(!dispatched.contains(&11) && !dispatched.contains(&14));

    assert_eq!(plant.stock(&stock[0]).await.status, StockStatus::Completed);

    let loading = plant.location("LoadingZoneA").await;
    let pallet = plant.pallet_state(1).await;
    assert_eq!(pallet.current_location_id, Some(loading.id));
    assert_eq!(pallet.current_product_count, 0);
    assert_eq!(loading.current_count, 1);
    for code in [WELDING_STATION, BOLTING_STATION, WAITING_ZONE, CHARGING_STATION, "UnloadingZoneA"] {
        assert_eq!(plant.location(code).await.current_count, 0, "{code} should be empty");
    }

    let finished = plant.orchestrator.work_order(order.id).await.expect("order");
    assert!(finished.occupancy_ledger.is_empty());
    assert_eq!(plant.audit.count(events::WORK_ORDER_COMPLETED), 1);
    assert_eq!(plant.audit.count(events::WORK_ORDER_STARTED), 1);

    // Nothing stays locked once the order is finished.
    assert_eq!(plant.orchestrator.locked_order_count(), 0);
    assert_eq!(plant.orchestrator.allocator().held_lock_count(), 0);
}

#[tokio::test]
async fn test_transport_continues_while_welding_runs() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let graph = plant.scenario().await;
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(6, [Scripted::Gated]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    plant.pump().await;

    assert_eq!(plant.execution(order.id, 6).await.status, ExecutionStatus::InProgress);
    for step in [7, 8, 9, 10] {
        assert_eq!(plant.execution(order.id, step).await.status, ExecutionStatus::Completed, "step {step}");
    }
    assert_eq!(plant.execution(order.id, 11).await.status, ExecutionStatus::Pending);
    assert!(!plant.executor.dispatched_steps().contains(&12));
    // Welding still holds the unit after bolting finished.
    assert_eq!(plant.stock(&stock[0]).await.status, StockStatus::InProcess);

    let status = plant.orchestrator.get_status(order.id).await.expect("status");
    assert_eq!(status.status, WorkOrderStatus::InProgress);
    assert!(status.progress_percentage > 0.0 && status.progress_percentage < 100.0);

    plant.executor.release(6);
    let report = plant.settle(order.id).await;
    assert_eq!(report.status, WorkOrderStatus::Completed);
}

#[tokio::test]
async fn test_non_parallel_siblings_run_one_at_a_time() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let graph = plant
        .graph(vec![notify(1), notify(2).depends_on([1]), notify(3).depends_on([1])])
        .await;
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(2, [Scripted::Gated]);
    plant.executor.script(3, [Scripted::Gated]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    plant.pump().await;
    assert_eq!(plant.executor.dispatched_steps(), vec![1, 2]);
    assert_eq!(plant.execution(order.id, 3).await.status, ExecutionStatus::Pending);

    plant.executor.release(2);
    plant.pump().await;
    assert_eq!(plant.executor.dispatched_steps(), vec![1, 2, 3]);
    assert_eq!(plant.execution(order.id, 2).await.status, ExecutionStatus::Completed);

    plant.executor.release(3);
    let report = plant.settle(order.id).await;
    assert_eq!(report.status, WorkOrderStatus::Completed);
}

fn signalled_graph(producer: StepDefinition) -> Vec<StepDefinition> {
    vec![
        producer.parallel().parallel_id("JOB").join(JoinCondition::Immediate),
        notify(2),
        StepDefinition::new(3, "wait for job", StepKind::Wait { wait_for_step_number: 1 }, ActionType::WaitForSignal)
            .parallel_id("JOB")
            .join(JoinCondition::OnCondition),
    ]
}

#[tokio::test]
async fn test_wait_step_holds_until_producer_completes() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let graph = plant.graph(signalled_graph(notify(1))).await;
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(1, [Scripted::Gated]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    plant.pump().await;
    assert_eq!(plant.execution(order.id, 1).await.status, ExecutionStatus::InProgress);
    assert_eq!(plant.execution(order.id, 2).await.status, ExecutionStatus::Completed);
    assert_eq!(plant.execution(order.id, 3).await.status, ExecutionStatus::Pending);

    plant.executor.release(1);
    let report = plant.settle(order.id).await;
    assert_eq!(report.status, WorkOrderStatus::Completed);
    assert_eq!(plant.execution(order.id, 3).await.result_data, Some(json!({ "signal_from": 1 })));
}

#[tokio::test]
async fn test_wait_step_skipped_when_producer_is_abandoned() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let graph = plant.graph(signalled_graph(notify(1).optional().max_retries(0))).await;
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(1, [Scripted::Fail("welder offline".into())]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    let report = plant.settle(order.id).await;

    assert_eq!(report.status, WorkOrderStatus::Completed);
    assert_eq!(plant.execution(order.id, 1).await.status, ExecutionStatus::Skipped);
    assert_eq!(plant.execution(order.id, 3).await.status, ExecutionStatus::Skipped);
    assert_eq!(plant.audit.count(events::STEP_RETRY_EXHAUSTED), 1);
}

#[tokio::test]
async fn test_inspection_decision_routes_passed_part() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let recipe = mes_core::scenarios::inspection_recipe().expect("recipe");
    let graph = plant.orchestrator.register_graph(recipe).await.expect("register");
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(2, [Scripted::Succeed(Some(json!({ "passed": true, "defects": 0 })))]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    let report = plant.settle(order.id).await;

    assert_eq!(report.status, WorkOrderStatus::Completed);
    assert_eq!(plant.execution(order.id, 3).await.result_data, Some(json!({ "outcome": true })));
    assert_eq!(plant.execution(order.id, 4).await.status, ExecutionStatus::Completed);
    assert_eq!(plant.execution(order.id, 5).await.status, ExecutionStatus::Skipped);
    assert_eq!(plant.execution(order.id, 6).await.status, ExecutionStatus::Completed);
    assert!(!plant.executor.dispatched_steps().contains(&5));

    let pallet = plant.pallet_state(1).await;
    assert_eq!(pallet.current_location_id, Some(plant.location("UnloadingZoneA").await.id));
}

#[tokio::test]
async fn test_inspection_decision_routes_reject_to_repair() {
    let plant = Plant::new().await;
    let stock = plant.pallet(1, 1).await;
    let recipe = mes_core::scenarios::inspection_recipe().expect("recipe");
    let graph = plant.orchestrator.register_graph(recipe).await.expect("register");
    let order = plant.order(&graph, &stock[0]).await;
    plant.executor.script(2, [Scripted::Succeed(Some(json!({ "passed": false })))]);

    plant.orchestrator.start_work_order(order.id).await.expect("start");
    let report = plant.settle(order.id).await;

    assert_eq!(report.status, WorkOrderStatus::Completed);
    assert_eq!(plant.execution(order.id, 4).await.status, ExecutionStatus::Skipped);
    assert_eq!(plant.execution(order.id, 5).await.status, ExecutionStatus::Completed);
    assert_eq!(plant.location("RepairArea").await.current_count, 1);
}
