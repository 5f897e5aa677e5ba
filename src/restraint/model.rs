//! Resource Restraint Records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestraintState {
    Blocked,
    Active,
    Finished,
}

/// Execution scope whose completion releases a claim.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    #[default]
    Plan,
    Stage,
    StepGroup,
    Matrix,
    Step,
}

/// Identity of a semaphore: the same unit in different scopes is independent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RestraintKey {
    pub scope_key: String,
    pub resource_unit: String,
}

impl RestraintKey {
    pub fn new(scope_key: impl Into<String>, resource_unit: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
            resource_unit: resource_unit.into(),
        }
    }
}

impl fmt::Display for RestraintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_key, self.resource_unit)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceRestraintInstance {
    pub id: String,
    /// Node execution waiting on this claim
    pub claimant_id: String,
    pub key: RestraintKey,
    /// FIFO rank, unique per key
    pub order: u64,
    pub state: RestraintState,
    pub permits: u32,
    pub capacity: u32,
    pub holding_scope: HoldingScope,
    pub release_entity_id: String,
    pub created_at: DateTime<Utc>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Parameters of a single acquire call.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireRequest {
    pub key: RestraintKey,
    /// Signed so that misconfigured negative capacities can be rejected
    pub capacity: i64,
    pub permits: u32,
    pub holding_scope: HoldingScope,
    pub release_entity_id: String,
    pub claimant_id: String,
}

impl AcquireRequest {
    pub fn new(key: RestraintKey, capacity: i64, claimant_id: impl Into<String>) -> Self {
        let claimant_id = claimant_id.into();
        Self {
            key,
            capacity,
            permits: 1,
            holding_scope: HoldingScope::Step,
            release_entity_id: claimant_id.clone(),
            claimant_id,
        }
    }

    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    pub fn held_by(mut self, scope: HoldingScope, release_entity_id: impl Into<String>) -> Self {
        self.holding_scope = scope;
        self.release_entity_id = release_entity_id.into();
        self
    }
}
