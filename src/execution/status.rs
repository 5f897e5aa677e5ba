//! Status State Machine
//!
//! Every status write in the kernel is checked against the tables in this
//! module. A target status lists the statuses it may be entered from; any
//! path not listed is rejected (SUCCEEDED never goes back to RUNNING).
//! QUEUED is only ever produced by creating a record.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Status of a node execution or plan execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    ResourceWaiting,
    InputWaiting,
    Suspended,
    Discontinuing,
    /// Plan-level only
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Errored,
    Skipped,
}

impl Status {
    pub const WAITING: [Status; 3] = [
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::ResourceWaiting,
    ];

    pub const TERMINAL: [Status; 6] = [
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Expired,
        Status::Errored,
        Status::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// RUNNING sub-states entered by the ASYNC, TASK and queue modes.
    pub fn is_waiting(self) -> bool {
        Self::WAITING.contains(&self)
    }

    /// Terminal statuses that count as a failure for roll-up.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Errored | Status::Expired)
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Statuses a node may hold while its work is in flight.
    pub fn is_active(self) -> bool {
        self == Status::Running || self.is_waiting()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ResourceWaiting => "RESOURCE_WAITING",
            Status::InputWaiting => "INPUT_WAITING",
            Status::Suspended => "SUSPENDED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Paused => "PAUSED",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Errored => "ERRORED",
            Status::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node runs once facilitated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    TaskChain,
    Child,
    Children,
    ChildChain,
}

impl ExecutionMode {
    /// Modes whose node waits on child node executions.
    pub fn spawns_children(self) -> bool {
        matches!(
            self,
            ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain
        )
    }
}

static NODE_TRANSITIONS: Lazy<HashMap<Status, Vec<Status>>> = Lazy::new(|| {
    use Status::*;

    let mut waits_and_running = vec![Running];
    waits_and_running.extend(Status::WAITING);

    let mut table = HashMap::new();

    let mut running_from = vec![Queued, Suspended, InputWaiting];
    running_from.extend(Status::WAITING);
    table.insert(Running, running_from);

    for wait in Status::WAITING {
        table.insert(wait, vec![Running]);
    }
    table.insert(InputWaiting, vec![Queued, Running]);
    table.insert(Suspended, waits_and_running.clone());
    table.insert(Succeeded, waits_and_running.clone());

    let mut failing_from = waits_and_running.clone();
    failing_from.push(Discontinuing);
    table.insert(Failed, failing_from.clone());
    table.insert(Expired, failing_from);

    let mut errored_from = vec![Queued];
    errored_from.extend(waits_and_running.iter().copied());
    table.insert(Errored, errored_from);

    // A container whose children were all skipped rolls up from RUNNING
    table.insert(Skipped, vec![Queued, Running]);
    table.insert(Aborted, vec![Discontinuing, Suspended, InputWaiting]);

    let mut discontinuing_from = vec![Queued, Suspended, InputWaiting];
    discontinuing_from.extend(waits_and_running.iter().copied());
    table.insert(Discontinuing, discontinuing_from);

    table
});

static PLAN_TRANSITIONS: Lazy<HashMap<Status, Vec<Status>>> = Lazy::new(|| {
    use Status::*;

    let mut table = HashMap::new();
    table.insert(Running, vec![Paused]);
    table.insert(Paused, vec![Running]);
    table.insert(Discontinuing, vec![Running, Paused]);
    for terminal in Status::TERMINAL {
        table.insert(terminal, vec![Running, Paused, Discontinuing]);
    }
    table
});

/// Statuses a node execution may move to `target` from.
pub fn node_allowed_from(target: Status) -> &'static [Status] {
    NODE_TRANSITIONS
        .get(&target)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Statuses a plan execution may move to `target` from.
pub fn plan_allowed_from(target: Status) -> &'static [Status] {
    PLAN_TRANSITIONS
        .get(&target)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn can_transition(from: Status, to: Status) -> bool {
    node_allowed_from(to).contains(&from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        for status in Status::TERMINAL {
            assert!(status.is_terminal());
        }
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Discontinuing.is_terminal());
        assert!(!Status::Paused.is_terminal());
    }

    #[test]
    fn test_terminal_never_leaves() {
        let all = [
            Status::Queued,
            Status::Running,
            Status::AsyncWaiting,
            Status::TaskWaiting,
            Status::ResourceWaiting,
            Status::InputWaiting,
            Status::Suspended,
            Status::Discontinuing,
            Status::Succeeded,
            Status::Failed,
            Status::Aborted,
            Status::Expired,
            Status::Errored,
            Status::Skipped,
        ];
        for from in Status::TERMINAL {
            for to in all {
                assert!(!can_transition(from, to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_queued_only_by_creation() {
        assert!(node_allowed_from(Status::Queued).is_empty());
    }

    #[test]
    fn test_happy_path() {
        assert!(can_transition(Status::Queued, Status::Running));
        assert!(can_transition(Status::Running, Status::TaskWaiting));
        assert!(can_transition(Status::TaskWaiting, Status::Succeeded));
    }

    #[test]
    fn test_discontinuing_paths() {
        assert!(can_transition(Status::Running, Status::Discontinuing));
        assert!(can_transition(Status::Queued, Status::Discontinuing));
        assert!(can_transition(Status::Discontinuing, Status::Aborted));
        assert!(can_transition(Status::Discontinuing, Status::Failed));
        assert!(!can_transition(Status::Discontinuing, Status::Discontinuing));
        assert!(!can_transition(Status::Discontinuing, Status::Succeeded));
        assert!(!can_transition(Status::Running, Status::Aborted));
    }

    #[test]
    fn test_suspended_and_input_waiting_resume_or_abort() {
        assert!(can_transition(Status::Suspended, Status::Running));
        assert!(can_transition(Status::InputWaiting, Status::Running));
        assert!(can_transition(Status::Suspended, Status::Aborted));
        assert!(can_transition(Status::InputWaiting, Status::Aborted));
    }

    #[test]
    fn test_plan_transitions() {
        assert!(plan_allowed_from(Status::Paused).contains(&Status::Running));
        assert!(plan_allowed_from(Status::Running).contains(&Status::Paused));
        assert!(plan_allowed_from(Status::Aborted).contains(&Status::Discontinuing));
        assert!(!plan_allowed_from(Status::Running).contains(&Status::Succeeded));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::TaskWaiting).unwrap();
        assert_eq!(json, "\"TASK_WAITING\"");
        assert_eq!(Status::TaskWaiting.to_string(), "TASK_WAITING");
    }

    #[test]
    fn test_mode_spawns_children() {
        assert!(ExecutionMode::Children.spawns_children());
        assert!(!ExecutionMode::TaskChain.spawns_children());
    }
}
