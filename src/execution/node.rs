//! Node Execution Records
//!
//! One record per run of a plan node. Records reference each other only by
//! id (`parent_id`, `previous_id`, `retry_ids`); trees are rebuilt by query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::{ExecutionMode, Status};
use crate::advising::AdviserResponse;
use crate::ambiance::Ambiance;

/// Entry of a node's append-only execution log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async { callback_ids: Vec<String> },
    Task { task_id: String },
    TaskChain { task_id: String, link: usize },
    Child { child_id: String },
    Children { child_ids: Vec<String> },
    ChildChain { child_id: String, index: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Application,
    Facilitation,
    Dispatch,
    Expired,
    Interrupted,
    Custom,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    pub ambiance: Ambiance,
    pub plan_node_id: String,
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub status: Status,
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,

    /// Set once advising has claimed this terminal transition
    #[serde(default)]
    pub advised: bool,
    #[serde(default)]
    pub adviser_response: Option<AdviserResponse>,
    /// Set once the adviser response has been acted upon
    #[serde(default)]
    pub advise_applied: bool,

    /// Earlier attempts of this node, oldest first
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Superseded by a retry; ignored by roll-up
    #[serde(default)]
    pub old_retry: bool,

    /// Status a DISCONTINUING node finalizes to
    #[serde(default)]
    pub discontinue_target: Option<Status>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub output: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub version: u64,
}

impl NodeExecution {
    /// Creates a QUEUED record. The id must match the runtime id of the
    /// ambiance's last level.
    pub fn new(id: impl Into<String>, plan_node_id: impl Into<String>, ambiance: Ambiance) -> Self {
        Self {
            id: id.into(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            ambiance,
            plan_node_id: plan_node_id.into(),
            parent_id: None,
            previous_id: None,
            status: Status::Queued,
            mode: None,
            executable_responses: Vec::new(),
            advised: false,
            adviser_response: None,
            advise_applied: false,
            retry_ids: Vec::new(),
            old_retry: false,
            discontinue_target: None,
            failure_info: None,
            output: None,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn with_retry_ids(mut self, retry_ids: Vec<String>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    pub fn attempt(&self) -> usize {
        self.retry_ids.len() + 1
    }

    /// Status used when rolling up into the parent; MARK_SUCCESS and IGNORE
    /// advice turn a failure into success.
    pub fn resolved_status(&self) -> Status {
        match self.adviser_response {
            Some(AdviserResponse::MarkSuccess) | Some(AdviserResponse::Ignore)
                if self.status.is_terminal() =>
            {
                Status::Succeeded
            }
            _ => self.status,
        }
    }

    pub fn awaiting_intervention(&self) -> bool {
        self.status.is_terminal()
            && self.advise_applied
            && matches!(
                self.adviser_response,
                Some(AdviserResponse::InterventionWait { .. })
            )
    }

    /// Whether this node still blocks its parent from finalizing.
    pub fn is_open(&self) -> bool {
        if self.old_retry {
            return false;
        }
        if !self.status.is_terminal() || !self.advised || !self.advise_applied {
            return true;
        }
        matches!(
            self.adviser_response,
            Some(AdviserResponse::InterventionWait { .. }) | Some(AdviserResponse::Retry { .. })
        )
    }

    pub fn last_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// Callback ids registered by ASYNC executions, oldest first.
    pub fn callback_ids(&self) -> Vec<String> {
        self.executable_responses
            .iter()
            .filter_map(|r| match r {
                ExecutableResponse::Async { callback_ids } => Some(callback_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}
