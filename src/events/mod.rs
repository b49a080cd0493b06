pub mod audit;
pub mod publisher;

// Re-export key types for convenience
pub use audit::{AuditEntry, AuditLevel, AuditSink, FanoutAuditSink, NullAuditSink, TracingAuditSink};
pub use publisher::{EventPublisher, PublishError};
