//! A seeded plant: in-memory store, manual clock, scripted executor and an
//! orchestrator wired to them.

use std::sync::Arc;
use std::time::Duration;

use mes_core::clock::{Clock, ManualClock};
use mes_core::config::MesConfig;
use mes_core::events::{AuditEntry, AuditSink};
use mes_core::graph::StepGraph;
use mes_core::models::{
    GraphSource, Location, Pallet, PalletId, ProductId, StepDefinition, StepExecution, StockUnit, WorkOrder,
    WorkOrderId,
};
use mes_core::orchestration::{OrchestrationContext, Orchestrator, WorkOrderStatusReport};
use mes_core::persistence::{InMemoryStore, InventoryStore, WorkOrderStore};
use mes_core::scenarios::{parallel_weld_bolt_scenario, seed_layout, seed_pallet, Zone};
use parking_lot::Mutex;
use uuid::Uuid;

use super::scripted_executor::ScriptedExecutor;

/// Keeps every audit entry for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    pub fn entries(&self, event: &str) -> Vec<AuditEntry> {
        self.entries.lock().iter().filter(|e| e.event == event).cloned().collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.entries(event).len()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

pub struct Plant {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub executor: Arc<ScriptedExecutor>,
    pub audit: Arc<RecordingAuditSink>,
    pub orchestrator: Arc<Orchestrator>,
    pub product_id: ProductId,
}

pub fn test_config() -> MesConfig {
    let mut config = MesConfig::default();
    config.scheduler.idle_wait_ms = 50;
    config
}

impl Plant {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: MesConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let executor = ScriptedExecutor::new();
        let audit = Arc::new(RecordingAuditSink::default());

        let context = OrchestrationContext::in_memory(store.clone(), executor.clone(), config)
            .with_clock(clock.clone())
            .with_audit_sink(audit.clone());
        let orchestrator = Arc::new(Orchestrator::new(context));
        seed_layout(orchestrator.allocator(), clock.now())
            .await
            .expect("seed layout");

        Self {
            store,
            clock,
            executor,
            audit,
            orchestrator,
            product_id: Uuid::new_v4(),
        }
    }

    /// Register a pallet at the zone A loading zone carrying `units` units.
    pub async fn pallet(&self, pallet_id: PalletId, units: u32) -> Vec<StockUnit> {
        let (_, stock) = seed_pallet(
            self.orchestrator.allocator(),
            pallet_id,
            &Zone::A.loading(),
            self.product_id,
            units,
            self.clock.now(),
        )
        .await
        .expect("seed pallet");
        stock
    }

    pub async fn scenario(&self) -> Arc<StepGraph> {
        let graph = parallel_weld_bolt_scenario(Zone::A).expect("scenario graph");
        self.orchestrator.register_graph(graph).await.expect("register scenario")
    }

    pub async fn graph(&self, steps: Vec<StepDefinition>) -> Arc<StepGraph> {
        let graph = StepGraph::new("TEST", "test graph", GraphSource::Recipe, steps).expect("valid graph");
        self.orchestrator.register_graph(graph).await.expect("register graph")
    }

    pub async fn order(&self, graph: &StepGraph, stock: &StockUnit) -> WorkOrder {
        self.orchestrator
            .create_work_order(graph.id, stock.id, 50)
            .await
            .expect("create work order")
    }

    /// Apply every outcome that arrives within a short window.
    pub async fn pump(&self) {
        while self
            .orchestrator
            .handle_next_outcome(Duration::from_millis(100))
            .await
            .expect("handle outcome")
            .is_some()
        {}
    }

    pub async fn settle(&self, work_order_id: WorkOrderId) -> WorkOrderStatusReport {
        self.orchestrator
            .run_until_settled(work_order_id, Duration::from_secs(10))
            .await
            .expect("settle work order")
    }

    pub async fn executions(&self, work_order_id: WorkOrderId) -> Vec<StepExecution> {
        self.store.executions_for(work_order_id).await.expect("executions")
    }

    pub async fn execution(&self, work_order_id: WorkOrderId, step_number: u32) -> StepExecution {
        self.executions(work_order_id)
            .await
            .into_iter()
            .find(|e| e.step_number == step_number)
            .expect("execution for step")
    }

    pub async fn stock(&self, stock: &StockUnit) -> StockUnit {
        self.store.stock_unit(stock.id).await.expect("stock unit")
    }

    pub async fn location(&self, code: &str) -> Location {
        self.store.location_by_code(code).await.expect("location")
    }

    pub async fn pallet_state(&self, pallet_id: PalletId) -> Pallet {
        self.store.pallet(pallet_id).await.expect("pallet")
    }
}
