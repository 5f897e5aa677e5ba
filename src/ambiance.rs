//! Ambiance
//!
//! Hierarchical address of a node execution inside the running DAG
//! (pipeline → stage → step group → step). Each descent appends a
//! [`Level`]; moving to a sibling replaces the last level.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::NodeGroup;

/// Iteration details for nodes spawned by a loop or matrix strategy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StrategyMetadata {
    pub iteration: usize,
    pub total_iterations: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub matrix_values: BTreeMap<String, String>,
}

/// One step of the ambiance path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Level {
    /// Plan node id
    pub setup_id: String,

    /// Node execution id
    pub runtime_id: String,

    pub step_type: String,

    pub group: NodeGroup,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_metadata: Option<StrategyMetadata>,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        step_type: impl Into<String>,
        group: NodeGroup,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            step_type: step_type.into(),
            group,
            strategy_metadata: None,
        }
    }

    pub fn with_strategy(mut self, metadata: StrategyMetadata) -> Self {
        self.strategy_metadata = Some(metadata);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    pub levels: Vec<Level>,
}

impl Ambiance {
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            levels: Vec::new(),
        }
    }

    /// Returns a copy descended by one level.
    pub fn child(&self, level: Level) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.push(level);
        ambiance
    }

    /// Returns a copy with the last level replaced, used for siblings and retries.
    pub fn sibling(&self, level: Level) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.pop();
        ambiance.levels.push(level);
        ambiance
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Innermost level belonging to the given group.
    pub fn nearest(&self, group: NodeGroup) -> Option<&Level> {
        self.levels.iter().rev().find(|level| level.group == group)
    }

    /// Innermost level carrying strategy metadata.
    pub fn strategy_metadata(&self) -> Option<&StrategyMetadata> {
        self.levels
            .iter()
            .rev()
            .find_map(|level| level.strategy_metadata.as_ref())
    }

    /// Slash-joined setup ids, used as a stable scope key in logs.
    pub fn path(&self) -> String {
        self.levels
            .iter()
            .map(|level| level.setup_id.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}
