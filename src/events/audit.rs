use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One audit record: a state change, allocation or anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub level: AuditLevel,
    pub event: String,
    pub message: String,
    pub work_order_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub step_number: Option<u32>,
    pub resource: Option<String>,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(level: AuditLevel, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            event: event.into(),
            message: message.into(),
            work_order_id: None,
            execution_id: None,
            step_number: None,
            resource: None,
            details: Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn info(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AuditLevel::Info, event, message)
    }

    pub fn warning(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AuditLevel::Warning, event, message)
    }

    pub fn error(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AuditLevel::Error, event, message)
    }

    pub fn for_order(mut self, work_order_id: Uuid) -> Self {
        self.work_order_id = Some(work_order_id);
        self
    }

    pub fn for_step(mut self, work_order_id: Uuid, execution_id: Uuid, step_number: u32) -> Self {
        self.work_order_id = Some(work_order_id);
        self.execution_id = Some(execution_id);
        self.step_number = Some(step_number);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

/// Destination for audit entries. Recording must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits entries as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let AuditEntry {
            level,
            event,
            message,
            work_order_id,
            execution_id,
            step_number,
            resource,
            details,
            ..
        } = entry;

        macro_rules! emit {
            ($macro:ident) => {
                tracing::$macro!(
                    event = %event,
                    work_order_id = ?work_order_id,
                    execution_id = ?execution_id,
                    step_number = step_number,
                    resource = resource.as_deref(),
                    details = %details,
                    "{message}"
                )
            };
        }

        match level {
            AuditLevel::Debug => emit!(debug),
            AuditLevel::Info => emit!(info),
            AuditLevel::Warning => emit!(warn),
            AuditLevel::Error | AuditLevel::Critical => emit!(error),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}

/// Forwards each entry to several sinks.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, entry: AuditEntry) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(entry.clone());
            }
            last.record(entry);
        }
    }
}
