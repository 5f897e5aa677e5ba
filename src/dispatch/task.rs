//! Delegate Tasks
//!
//! The persisted record of work handed to a remote agent, plus the
//! transport-level request and response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Persisted, not yet acknowledged by the transport
    Queued,
    Dispatched,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// Statuses in which a response is still accepted.
    pub const PENDING: [TaskStatus; 2] = [TaskStatus::Queued, TaskStatus::Dispatched];

    pub fn is_pending(self) -> bool {
        Self::PENDING.contains(&self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DelegateTask {
    pub id: String,
    /// Correlation key back to the waiting node
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub parameters: Value,
    pub expiry: DateTime<Utc>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl DelegateTask {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && self.expiry <= now
    }
}

/// Work sent to an agent pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    pub node_execution_id: String,
    pub parameters: Value,
    pub expiry: DateTime<Utc>,
}

impl From<&DelegateTask> for TaskRequest {
    fn from(task: &DelegateTask) -> Self {
        Self {
            task_id: task.id.clone(),
            node_execution_id: task.node_execution_id.clone(),
            parameters: task.parameters.clone(),
            expiry: task.expiry,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    Success,
    Failure,
    Error,
}

/// Result reported by an agent, correlated by `task_id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskResultStatus,
    #[serde(default)]
    pub payload: Value,
}

impl TaskResponse {
    pub fn new(task_id: impl Into<String>, status: TaskResultStatus, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            payload,
        }
    }
}
