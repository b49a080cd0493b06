//! Collaborators threaded through every orchestration component.
//!
//! There is no ambient state: stores, executor, audit sink, clock and config
//! all travel in this struct.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::step_executor::StepExecutor;
use crate::clock::{Clock, SystemClock};
use crate::config::MesConfig;
use crate::events::{AuditEntry, AuditSink, EventPublisher, FanoutAuditSink, TracingAuditSink};
use crate::persistence::{GraphStore, InMemoryStore, InventoryStore, WorkOrderStore};

#[derive(Clone)]
pub struct OrchestrationContext {
    pub work_orders: Arc<dyn WorkOrderStore>,
    pub graphs: Arc<dyn GraphStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub executor: Arc<dyn StepExecutor>,
    pub audit: Arc<dyn AuditSink>,
    /// Broadcast feed of every audit entry
    pub events: EventPublisher,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<MesConfig>,
}

impl OrchestrationContext {
    pub fn new(
        work_orders: Arc<dyn WorkOrderStore>,
        graphs: Arc<dyn GraphStore>,
        inventory: Arc<dyn InventoryStore>,
        executor: Arc<dyn StepExecutor>,
        config: MesConfig,
    ) -> Self {
        let events = EventPublisher::new(config.events.channel_capacity);
        let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(vec![
            Arc::new(TracingAuditSink),
            Arc::new(events.clone()),
        ]));

        Self {
            work_orders,
            graphs,
            inventory,
            executor,
            audit,
            events,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    /// One in-memory store serving all three store roles.
    pub fn in_memory(store: Arc<InMemoryStore>, executor: Arc<dyn StepExecutor>, config: MesConfig) -> Self {
        Self::new(store.clone(), store.clone(), store, executor, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send audit entries to an additional sink as well.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Arc::new(FanoutAuditSink::new(vec![self.audit, sink]));
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record an audit entry stamped with the context clock.
    pub fn record(&self, entry: AuditEntry) {
        self.audit.record(entry.at(self.clock.now()));
    }
}
