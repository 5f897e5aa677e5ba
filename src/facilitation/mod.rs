//! Facilitation
//!
//! Decides how a node runs. Configured facilitator types are tried in
//! priority order (TASK, ASYNC, SYNC, CHILD, CHILDREN, CHILD_CHAIN); the
//! first applicable one wins, declaration order breaking ties between
//! equal priorities.
//!
//! Applicability is a table of pure functions over the plan node and its
//! step. Remote task types may additionally require a capability probe,
//! which is the only asynchronous check and always runs under a timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::execution::ExecutionMode;
use crate::plan::PlanNode;
use crate::steps::Step;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Task,
    TaskChain,
    Async,
    Sync,
    Child,
    Children,
    ChildChain,
}

impl FacilitatorType {
    pub fn mode(self) -> ExecutionMode {
        match self {
            FacilitatorType::Task => ExecutionMode::Task,
            FacilitatorType::TaskChain => ExecutionMode::TaskChain,
            FacilitatorType::Async => ExecutionMode::Async,
            FacilitatorType::Sync => ExecutionMode::Sync,
            FacilitatorType::Child => ExecutionMode::Child,
            FacilitatorType::Children => ExecutionMode::Children,
            FacilitatorType::ChildChain => ExecutionMode::ChildChain,
        }
    }

    /// Lower runs first. TASK_CHAIN shares TASK's slot since both hand the
    /// node to an agent; between the two, declaration order decides.
    pub fn priority(self) -> u8 {
        match self {
            FacilitatorType::Task | FacilitatorType::TaskChain => 0,
            FacilitatorType::Async => 1,
            FacilitatorType::Sync => 2,
            FacilitatorType::Child => 3,
            FacilitatorType::Children => 4,
            FacilitatorType::ChildChain => 5,
        }
    }

    fn is_remote(self) -> bool {
        matches!(self, FacilitatorType::Task | FacilitatorType::TaskChain)
    }
}

/// Facilitation settings of a plan node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct FacilitatorConfig {
    /// Candidate types; empty means derive from the node's shape
    pub types: Vec<FacilitatorType>,

    /// Delay between facilitation and execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_wait_ms: Option<u64>,

    /// Capability a remote pool must own for TASK types to apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// Facilitation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    pub initial_wait: Duration,
}

/// Asks the agent side whether a pool currently serves a capability.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn owns_capability(&self, capability: &str) -> Result<bool>;
}

/// Probe answering from a fixed capability set.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilityProbe {
    /// `None` owns every capability
    capabilities: Option<HashSet<String>>,
    latency: Duration,
}

impl StaticCapabilityProbe {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: Some(capabilities.into_iter().map(Into::into).collect()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl CapabilityProbe for StaticCapabilityProbe {
    async fn owns_capability(&self, capability: &str) -> Result<bool> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self
            .capabilities
            .as_ref()
            .map_or(true, |owned| owned.contains(capability)))
    }
}

type Applicability = fn(&PlanNode, &dyn Step) -> bool;

fn leaf_supports(node: &PlanNode, step: &dyn Step, mode: ExecutionMode) -> bool {
    !node.is_container() && step.supports(mode)
}

fn task_applies(node: &PlanNode, step: &dyn Step) -> bool {
    leaf_supports(node, step, ExecutionMode::Task)
}

fn task_chain_applies(node: &PlanNode, step: &dyn Step) -> bool {
    leaf_supports(node, step, ExecutionMode::TaskChain)
}

fn async_applies(node: &PlanNode, step: &dyn Step) -> bool {
    leaf_supports(node, step, ExecutionMode::Async)
}

fn sync_applies(node: &PlanNode, step: &dyn Step) -> bool {
    leaf_supports(node, step, ExecutionMode::Sync)
}

fn child_applies(node: &PlanNode, _step: &dyn Step) -> bool {
    node.children.len() == 1 && node.strategy.is_none()
}

/// A strategy node fans its single child out once per iteration.
fn children_applies(node: &PlanNode, _step: &dyn Step) -> bool {
    node.is_container() && (node.strategy.is_none() || node.children.len() == 1)
}

fn child_chain_applies(node: &PlanNode, _step: &dyn Step) -> bool {
    node.is_container() && node.strategy.is_none()
}

static APPLICABILITY: [(FacilitatorType, Applicability); 7] = [
    (FacilitatorType::Task, task_applies),
    (FacilitatorType::TaskChain, task_chain_applies),
    (FacilitatorType::Async, async_applies),
    (FacilitatorType::Sync, sync_applies),
    (FacilitatorType::Child, child_applies),
    (FacilitatorType::Children, children_applies),
    (FacilitatorType::ChildChain, child_chain_applies),
];

fn applicable(kind: FacilitatorType, node: &PlanNode, step: &dyn Step) -> bool {
    APPLICABILITY
        .iter()
        .find(|(candidate, _)| *candidate == kind)
        .map_or(false, |(_, check)| check(node, step))
}

/// Candidate types for a node, in evaluation order.
pub fn candidates(node: &PlanNode) -> Vec<FacilitatorType> {
    let mut types = if node.facilitator_config.types.is_empty() {
        if !node.is_container() {
            vec![
                FacilitatorType::Task,
                FacilitatorType::TaskChain,
                FacilitatorType::Async,
                FacilitatorType::Sync,
            ]
        } else if node.children.len() == 1 && node.strategy.is_none() {
            vec![FacilitatorType::Child]
        } else {
            vec![FacilitatorType::Children]
        }
    } else {
        node.facilitator_config.types.clone()
    };
    // Stable: equal priorities keep declaration order
    types.sort_by_key(|kind| kind.priority());
    types
}

pub struct Facilitator {
    probe: Arc<dyn CapabilityProbe>,
    timeout: Duration,
}

impl Facilitator {
    pub fn new(probe: Arc<dyn CapabilityProbe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    /// Picks the execution mode for a node.
    ///
    /// # Returns
    ///
    /// * `Ok(response)` - Chosen mode and initial wait
    /// * `Err(FacilitationTimeout)` - A capability probe did not answer in time
    /// * `Err(NoApplicableFacilitator)` - No candidate applies
    pub async fn facilitate(&self, node: &PlanNode, step: &dyn Step) -> Result<FacilitatorResponse> {
        for kind in candidates(node) {
            if !applicable(kind, node, step) {
                continue;
            }
            if kind.is_remote() {
                if let Some(capability) = &node.facilitator_config.capability {
                    if !self.probe_capability(capability).await? {
                        debug!(
                            "No pool owns capability '{}' for '{}', trying next facilitator",
                            capability, node.id
                        );
                        continue;
                    }
                }
            }

            debug!("Facilitated '{}' as {:?}", node.id, kind.mode());
            return Ok(FacilitatorResponse {
                mode: kind.mode(),
                initial_wait: Duration::from_millis(
                    node.facilitator_config.initial_wait_ms.unwrap_or(0),
                ),
            });
        }
        Err(KernelError::NoApplicableFacilitator(node.id.clone()))
    }

    async fn probe_capability(&self, capability: &str) -> Result<bool> {
        match tokio::time::timeout(self.timeout, self.probe.owns_capability(capability)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Capability probe for '{}' exceeded {:?}",
                    capability, self.timeout
                );
                Err(KernelError::FacilitationTimeout(self.timeout.as_millis() as u64))
            }
        }
    }
}
