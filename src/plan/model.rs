//! Plan Data Model
//!
//! The immutable DAG a plan execution walks. Container nodes (pipeline,
//! stage, step group, strategy) list their entry children in `children`;
//! siblings inside a container are chained through `next`.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: deploy
//! root: pipeline
//! nodes:
//!   - id: pipeline
//!     step_type: Pipeline
//!     group: PIPELINE
//!     children: [build]
//!
//!   - id: build
//!     step_type: Stage
//!     group: STAGE
//!     children: [compile]
//!     rollback_config:
//!       node_id: cleanup
//!
//!   - id: compile
//!     step_type: RemoteTask
//!     parameters:
//!       duration_ms: 50
//!     next: [publish]
//!     adviser_configs:
//!       - type: RETRY
//!         when: [FAILED]
//!         max_attempts: 2
//!         after_retries: ROLLBACK_STAGE
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::advising::AdviserConfig;
use crate::ambiance::StrategyMetadata;
use crate::execution::Status;
use crate::facilitation::{FacilitatorConfig, FacilitatorType};

/// Structural role of a plan node, recorded on every ambiance level.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeGroup {
    Pipeline,
    Stage,
    StepGroup,
    Strategy,
    #[default]
    Step,
}

/// Condition under which a queued node is skipped instead of run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipCondition {
    Literal(bool),
    /// Skip when the preceding sibling ended in one of these statuses
    PreviousStatusIn(Vec<Status>),
}

/// How a container derives its status from its children.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePropagation {
    /// Any failed child fails the parent
    #[default]
    AnyFailure,
    /// The parent fails only when every child failed
    AllFailure,
    /// Child failures never fail the parent
    Ignore,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RollbackConfig {
    /// Child of the stage started when a rollback is advised
    pub node_id: String,
}

/// Loop or matrix strategy applied to a node's single child.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyConfig {
    Repeat { times: usize },
    Matrix { axes: BTreeMap<String, Vec<String>> },
}

impl StrategyConfig {
    /// Expands the strategy into one metadata entry per iteration.
    pub fn iterations(&self) -> Vec<StrategyMetadata> {
        match self {
            StrategyConfig::Repeat { times } => (0..*times)
                .map(|iteration| StrategyMetadata {
                    iteration,
                    total_iterations: *times,
                    matrix_values: BTreeMap::new(),
                })
                .collect(),
            StrategyConfig::Matrix { axes } => {
                let mut combinations: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
                for (axis, values) in axes {
                    combinations = combinations
                        .into_iter()
                        .flat_map(|combination| {
                            values.iter().map(move |value| {
                                let mut next = combination.clone();
                                next.insert(axis.clone(), value.clone());
                                next
                            })
                        })
                        .collect();
                }
                if axes.is_empty() {
                    combinations.clear();
                }
                let total = combinations.len();
                combinations
                    .into_iter()
                    .enumerate()
                    .map(|(iteration, matrix_values)| StrategyMetadata {
                        iteration,
                        total_iterations: total,
                        matrix_values,
                    })
                    .collect()
            }
        }
    }
}

/// A single node of the plan graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanNode {
    /// Unique identifier within the plan
    pub id: String,

    /// Registry key of the step implementation
    pub step_type: String,

    #[serde(default)]
    pub group: NodeGroup,

    /// Entry children for container nodes
    #[serde(default)]
    pub children: Vec<String>,

    /// Successor siblings started by the NEXT_STEP adviser
    #[serde(default)]
    pub next: Vec<String>,

    /// Resolved step parameters, opaque to the kernel
    #[serde(default)]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<SkipCondition>,

    #[serde(default)]
    pub facilitator_config: FacilitatorConfig,

    #[serde(default)]
    pub adviser_configs: Vec<AdviserConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<RollbackConfig>,

    #[serde(default)]
    pub failure_propagation: FailurePropagation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,

    /// Park in INPUT_WAITING until input is submitted
    #[serde(default)]
    pub wait_for_input: bool,
}

impl PlanNode {
    /// Creates a leaf step node.
    ///
    /// # Example
    ///
    /// ```
    /// use pipeline_kernel::plan::{NodeGroup, PlanNode};
    ///
    /// let stage = PlanNode::new("build", "Stage")
    ///     .with_group(NodeGroup::Stage)
    ///     .with_children(["compile"]);
    /// assert!(stage.is_container());
    /// ```
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            step_type: step_type.into().trim().to_string(),
            group: NodeGroup::Step,
            children: Vec::new(),
            next: Vec::new(),
            parameters: Value::Null,
            skip_condition: None,
            facilitator_config: FacilitatorConfig::default(),
            adviser_configs: Vec::new(),
            rollback_config: None,
            failure_propagation: FailurePropagation::default(),
            strategy: None,
            wait_for_input: false,
        }
    }

    pub fn with_group(mut self, group: NodeGroup) -> Self {
        self.group = group;
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserConfig) -> Self {
        self.adviser_configs.push(adviser);
        self
    }

    pub fn with_facilitators(mut self, types: Vec<FacilitatorType>) -> Self {
        self.facilitator_config.types = types;
        self
    }

    pub fn with_skip_condition(mut self, condition: SkipCondition) -> Self {
        self.skip_condition = Some(condition);
        self
    }

    pub fn with_rollback(mut self, node_id: impl Into<String>) -> Self {
        self.rollback_config = Some(RollbackConfig {
            node_id: node_id.into(),
        });
        self
    }

    pub fn with_failure_propagation(mut self, rule: FailurePropagation) -> Self {
        self.failure_propagation = rule;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn waiting_for_input(mut self) -> Self {
        self.wait_for_input = true;
        self
    }

    pub fn is_container(&self) -> bool {
        !self.children.is_empty()
    }
}

/// An immutable plan graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: String,

    /// Id of the node every plan execution starts from
    #[serde(rename = "root")]
    pub root_id: String,

    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn new(id: impl Into<String>, root_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root_id: root_id.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn root(&self) -> Option<&PlanNode> {
        self.node(&self.root_id)
    }

    /// Container listing `id` among its children, if any.
    pub fn container_of(&self, id: &str) -> Option<&PlanNode> {
        self.nodes
            .iter()
            .find(|n| n.children.iter().any(|child| child == id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
