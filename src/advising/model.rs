//! Adviser Configurations and Responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::Status;

/// What to do once retries are exhausted or a failure is matched.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairAction {
    Ignore,
    MarkSuccess,
    RollbackStage,
    EndPlan,
    /// Let the failure stand and roll up
    #[default]
    Fail,
}

/// One entry of a plan node's `adviser_configs`.
///
/// An empty `when` matches every terminal status for NEXT_STEP and every
/// failure status for the other kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserConfig {
    NextStep {
        #[serde(default)]
        when: Vec<Status>,
    },
    Retry {
        #[serde(default)]
        when: Vec<Status>,
        /// Attempts including the first run
        max_attempts: u32,
        /// Wait before each retry; the last entry repeats
        #[serde(default)]
        wait_intervals_ms: Vec<u64>,
        #[serde(default)]
        after_retries: RepairAction,
    },
    OnFail {
        #[serde(default)]
        when: Vec<Status>,
        action: RepairAction,
    },
    ManualIntervention {
        #[serde(default)]
        when: Vec<Status>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        on_timeout: RepairAction,
    },
}

/// Discriminant of [`AdviserConfig`], the key of the adviser table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviserKind {
    NextStep,
    Retry,
    OnFail,
    ManualIntervention,
}

impl AdviserConfig {
    pub fn kind(&self) -> AdviserKind {
        match self {
            AdviserConfig::NextStep { .. } => AdviserKind::NextStep,
            AdviserConfig::Retry { .. } => AdviserKind::Retry,
            AdviserConfig::OnFail { .. } => AdviserKind::OnFail,
            AdviserConfig::ManualIntervention { .. } => AdviserKind::ManualIntervention,
        }
    }

    pub fn when(&self) -> &[Status] {
        match self {
            AdviserConfig::NextStep { when }
            | AdviserConfig::Retry { when, .. }
            | AdviserConfig::OnFail { when, .. }
            | AdviserConfig::ManualIntervention { when, .. } => when,
        }
    }

    pub fn matches(&self, status: Status) -> bool {
        let when = self.when();
        if !when.is_empty() {
            return when.contains(&status);
        }
        match self.kind() {
            AdviserKind::NextStep => status.is_terminal(),
            _ => status.is_failure(),
        }
    }
}

/// Decision recorded on a terminal node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    NextStep,
    Retry {
        wait_ms: u64,
    },
    MarkSuccess,
    Ignore,
    RollbackStage,
    EndPlan,
    /// Parked until a RETRY / MARK_* interrupt or the deadline
    InterventionWait {
        deadline: Option<DateTime<Utc>>,
        on_timeout: RepairAction,
    },
}

impl RepairAction {
    /// `None` for FAIL: no response, the failure stands.
    pub fn response(self) -> Option<AdviserResponse> {
        match self {
            RepairAction::Ignore => Some(AdviserResponse::Ignore),
            RepairAction::MarkSuccess => Some(AdviserResponse::MarkSuccess),
            RepairAction::RollbackStage => Some(AdviserResponse::RollbackStage),
            RepairAction::EndPlan => Some(AdviserResponse::EndPlan),
            RepairAction::Fail => None,
        }
    }
}
