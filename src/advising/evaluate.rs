//! Adviser Evaluation
//!
//! Pure decision step of advising. Configs are scanned in declaration
//! order and the first one matching the node's status decides, even when
//! its decision is to let the failure stand.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::model::{AdviserConfig, AdviserKind, AdviserResponse};
use crate::execution::Status;

/// Inputs an adviser may look at besides its own config.
#[derive(Debug, Clone)]
pub struct AdviseInput {
    pub status: Status,
    /// 1 for the first run
    pub attempt: usize,
    pub now: DateTime<Utc>,
    pub default_retry_wait: Duration,
    pub default_intervention_timeout: Option<Duration>,
}

type AdviseFn = fn(&AdviserConfig, &AdviseInput) -> Option<AdviserResponse>;

fn next_step(_config: &AdviserConfig, _input: &AdviseInput) -> Option<AdviserResponse> {
    Some(AdviserResponse::NextStep)
}

fn retry(config: &AdviserConfig, input: &AdviseInput) -> Option<AdviserResponse> {
    let AdviserConfig::Retry {
        max_attempts,
        wait_intervals_ms,
        after_retries,
        ..
    } = config
    else {
        return None;
    };

    if input.attempt >= *max_attempts as usize {
        return after_retries.response();
    }
    let wait_ms = wait_intervals_ms
        .get(input.attempt - 1)
        .or_else(|| wait_intervals_ms.last())
        .copied()
        .unwrap_or(input.default_retry_wait.as_millis() as u64);
    Some(AdviserResponse::Retry { wait_ms })
}

fn on_fail(config: &AdviserConfig, _input: &AdviseInput) -> Option<AdviserResponse> {
    match config {
        AdviserConfig::OnFail { action, .. } => action.response(),
        _ => None,
    }
}

fn manual_intervention(config: &AdviserConfig, input: &AdviseInput) -> Option<AdviserResponse> {
    let AdviserConfig::ManualIntervention {
        timeout_ms,
        on_timeout,
        ..
    } = config
    else {
        return None;
    };

    let timeout = timeout_ms
        .map(Duration::from_millis)
        .or(input.default_intervention_timeout);
    let deadline = timeout
        .and_then(|t| chrono::Duration::from_std(t).ok())
        .map(|t| input.now + t);
    Some(AdviserResponse::InterventionWait {
        deadline,
        on_timeout: *on_timeout,
    })
}

static ADVISERS: [(AdviserKind, AdviseFn); 4] = [
    (AdviserKind::NextStep, next_step),
    (AdviserKind::Retry, retry),
    (AdviserKind::OnFail, on_fail),
    (AdviserKind::ManualIntervention, manual_intervention),
];

/// Decides the response for a terminal node.
///
/// # Returns
///
/// * `Some(response)` - Recorded and applied by advising
/// * `None` - The status stands and rolls up into the parent
pub fn evaluate(configs: &[AdviserConfig], input: &AdviseInput) -> Option<AdviserResponse> {
    match configs.iter().find(|config| config.matches(input.status)) {
        Some(config) => ADVISERS
            .iter()
            .find(|(kind, _)| *kind == config.kind())
            .and_then(|(_, advise)| advise(config, input)),
        None if input.status.is_positive() => Some(AdviserResponse::NextStep),
        None => None,
    }
}
