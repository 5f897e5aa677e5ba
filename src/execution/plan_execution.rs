//! Plan Execution Records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::Status;

/// Trigger details and retry lineage of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PlanExecutionMetadata {
    pub trigger: String,
    #[serde(default)]
    pub run_sequence: u64,
    /// Plan execution this run retries, if any
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl PlanExecutionMetadata {
    pub fn manual() -> Self {
        Self {
            trigger: "MANUAL".to_string(),
            ..Self::default()
        }
    }
}

/// One run of a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanExecution {
    pub id: String,
    pub plan_id: String,
    pub status: Status,
    pub metadata: PlanExecutionMetadata,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub version: u64,
}

impl PlanExecution {
    /// Creates a RUNNING plan execution.
    pub fn new(id: impl Into<String>, plan_id: impl Into<String>, metadata: PlanExecutionMetadata) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            metadata,
            start_ts: Utc::now(),
            end_ts: None,
            version: 0,
        }
    }

    /// True once the plan no longer accepts new nodes.
    pub fn is_closing(&self) -> bool {
        self.status == Status::Discontinuing || self.status.is_terminal()
    }
}
