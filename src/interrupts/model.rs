//! Interrupt Records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    PauseAll,
    ResumeAll,
    Retry,
    MarkFailed,
    MarkSuccess,
    Expire,
    CustomFailure,
}

impl InterruptType {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptType::Abort => "ABORT",
            InterruptType::PauseAll => "PAUSE_ALL",
            InterruptType::ResumeAll => "RESUME_ALL",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::Expire => "EXPIRE",
            InterruptType::CustomFailure => "CUSTOM_FAILURE",
        }
    }

    /// Only valid without a node target.
    pub fn is_plan_only(self) -> bool {
        matches!(self, InterruptType::PauseAll | InterruptType::ResumeAll)
    }

    /// Only valid with a node target.
    pub fn is_node_only(self) -> bool {
        matches!(
            self,
            InterruptType::Retry
                | InterruptType::MarkFailed
                | InterruptType::MarkSuccess
                | InterruptType::CustomFailure
        )
    }

    /// Plan-level interrupts that may not be pending alongside this one.
    pub fn plan_level_conflicts(self) -> &'static [InterruptType] {
        match self {
            InterruptType::Abort | InterruptType::Expire => {
                &[InterruptType::Abort, InterruptType::Expire]
            }
            InterruptType::PauseAll | InterruptType::ResumeAll => {
                &[InterruptType::PauseAll, InterruptType::ResumeAll]
            }
            _ => &[],
        }
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    pub fn is_pending(self) -> bool {
        matches!(self, InterruptState::Registered | InterruptState::Processing)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    #[default]
    User,
    /// Raised by an END_PLAN adviser response
    Adviser,
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Interrupt {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: InterruptType,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub state: InterruptState,
    #[serde(default)]
    pub issued_by: IssuedBy,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Interrupt {
    pub fn new(
        kind: InterruptType,
        plan_execution_id: impl Into<String>,
        node_execution_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id,
            state: InterruptState::Registered,
            issued_by: IssuedBy::User,
            message: None,
            created_at: Utc::now(),
            processed_at: None,
            version: 0,
        }
    }

    pub fn issued_by(mut self, issuer: IssuedBy) -> Self {
        self.issued_by = issuer;
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn is_plan_level(&self) -> bool {
        self.node_execution_id.is_none()
    }
}
