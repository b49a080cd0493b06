//! # Step Execution
//!
//! Runtime record of one step definition for one work order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{ExecutionId, WorkOrderId};
use crate::state_machine::ExecutionStatus;

/// Why a step ended up Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor reported a failure
    Executor,
    /// The step exceeded its timeout
    Timeout,
    /// The step could not be dispatched
    Dispatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: ExecutionId,
    pub work_order_id: WorkOrderId,
    pub step_number: u32,
    pub status: ExecutionStatus,
    pub assigned_resource: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub execution_data: Value,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Earliest time a retried attempt may be dispatched.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn new(work_order_id: WorkOrderId, step_number: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_order_id,
            step_number,
            status: ExecutionStatus::Pending,
            assigned_resource: None,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            execution_data: Value::Object(Map::new()),
            result_data: None,
            error_message: None,
            error_detail: None,
            failure_kind: None,
            next_eligible_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempt number an outcome must carry to be applied.
    pub fn attempt(&self) -> u32 {
        self.retry_count
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }

    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.is_some_and(|eligible| eligible > now)
    }

    /// Shallow-to-deep JSON merge patch (RFC 7386) into `execution_data`.
    pub fn merge_execution_data(&mut self, patch: &Value) {
        merge_patch(&mut self.execution_data, patch);
    }
}

/// RFC 7386: objects merge recursively, `null` deletes, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
