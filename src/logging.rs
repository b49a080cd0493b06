//! # Logging
//!
//! Environment-aware structured logging for tracing work orders through
//! asynchronous step dispatch and resource allocation.

use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// `RUST_LOG` overrides the environment-derived level. `MES_LOG_FORMAT=json`
/// switches console output to JSON lines. Safe to call more than once.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = is_json_format();

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // An embedding host may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = json,
            "STRUCTURED LOGGING: Initialized"
        );
    });
}

/// `MES_ENV`, falling back to `APP_ENV`, then `development`.
fn get_environment() -> String {
    std::env::var("MES_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn is_json_format() -> bool {
    std::env::var("MES_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// One work order lifecycle event.
pub fn log_work_order_operation(
    operation: &str,
    work_order_id: Option<Uuid>,
    order_number: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        work_order_id = ?work_order_id,
        order_number = order_number,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "WORK_ORDER_OPERATION"
    );
}

/// One step lifecycle event (start, outcome, retry, skip).
pub fn log_step_operation(
    operation: &str,
    work_order_id: Option<Uuid>,
    execution_id: Option<Uuid>,
    step_number: Option<u32>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        work_order_id = ?work_order_id,
        execution_id = ?execution_id,
        step_number = step_number,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "STEP_OPERATION"
    );
}

/// Allocator outcome for a single resource.
pub fn log_allocation_operation(
    operation: &str,
    resource: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        resource = %resource,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "ALLOCATION_OPERATION"
    );
}

/// Errors that are handled locally but should still reach the operator log.
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
