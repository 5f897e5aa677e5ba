//! Plan Validation
//!
//! Rejects plan graphs the kernel cannot execute safely:
//! - Empty plans and missing root nodes
//! - Duplicate or empty node ids
//! - Dangling references in `children`, `next` and rollback configs
//! - Nodes claimed by more than one container
//! - Cycles through `children` and `next` edges
//! - Strategy nodes without exactly one child

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use thiserror::Error;

use super::model::Plan;
use crate::advising::AdviserConfig;

/// Validation error types for plan graphs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Plan has no nodes")]
    EmptyPlan,

    #[error("Plan root node '{0}' does not exist")]
    MissingRoot(String),

    #[error("Duplicate plan node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("Plan node has empty or whitespace-only ID")]
    EmptyNodeId,

    #[error("Plan node '{0}' has no step type")]
    EmptyStepType(String),

    #[error("Plan node '{node}' references unknown node '{reference}'")]
    InvalidReference { node: String, reference: String },

    #[error("Plan node '{node}' is a child of both '{first}' and '{second}'")]
    MultipleContainers {
        node: String,
        first: String,
        second: String,
    },

    #[error("Plan graph contains a cycle")]
    CyclicGraph,

    #[error("Strategy node '{0}' must have exactly one child")]
    InvalidStrategy(String),

    #[error("Plan node '{0}' has a retry adviser with max_attempts of 0")]
    InvalidRetry(String),
}

/// Validates the plan structure.
///
/// Performs the following checks:
/// 1. Plan is not empty
/// 2. Node ids are unique and non-empty
/// 3. Root exists
/// 4. All references point to existing nodes
/// 5. Every node has at most one container
/// 6. No cycles through `children` or `next`
pub fn validate_plan(plan: &Plan) -> Result<(), ValidationError> {
    info!("Validating plan '{}' with {} nodes", plan.id, plan.len());

    if plan.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &plan.nodes {
        if node.id.trim().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }
        if !seen_ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        if node.step_type.trim().is_empty() {
            return Err(ValidationError::EmptyStepType(node.id.clone()));
        }
    }

    if !seen_ids.contains(plan.root_id.as_str()) {
        return Err(ValidationError::MissingRoot(plan.root_id.clone()));
    }

    let mut container_of: HashMap<&str, &str> = HashMap::new();
    for node in &plan.nodes {
        let rollback = node.rollback_config.iter().map(|r| &r.node_id);
        for reference in node.children.iter().chain(node.next.iter()).chain(rollback) {
            if !seen_ids.contains(reference.as_str()) {
                return Err(ValidationError::InvalidReference {
                    node: node.id.clone(),
                    reference: reference.clone(),
                });
            }
        }

        for child in &node.children {
            if let Some(first) = container_of.insert(child.as_str(), node.id.as_str()) {
                return Err(ValidationError::MultipleContainers {
                    node: child.clone(),
                    first: first.to_string(),
                    second: node.id.clone(),
                });
            }
        }

        if node.strategy.is_some() && node.children.len() != 1 {
            return Err(ValidationError::InvalidStrategy(node.id.clone()));
        }

        for adviser in &node.adviser_configs {
            if let AdviserConfig::Retry { max_attempts: 0, .. } = adviser {
                return Err(ValidationError::InvalidRetry(node.id.clone()));
            }
        }

        if node.next.is_empty() && !node.is_container() {
            debug!("Plan node '{}' is a leaf with no successors", node.id);
        }
    }

    check_acyclic(plan)?;

    info!("Plan '{}' validated: {} nodes", plan.id, plan.len());
    Ok(())
}

/// Kahn's algorithm over the union of `children` and `next` edges.
fn check_acyclic(plan: &Plan) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> =
        plan.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

    for node in &plan.nodes {
        for target in node.children.iter().chain(node.next.iter()) {
            if let Some(degree) = in_degree.get_mut(target.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(current) = queue.pop_front() {
        visited += 1;
        let Some(node) = plan.node(current) else {
            continue;
        };
        for target in node.children.iter().chain(node.next.iter()) {
            if let Some(degree) = in_degree.get_mut(target.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(target.as_str());
                }
            }
        }
    }

    if visited != plan.len() {
        return Err(ValidationError::CyclicGraph);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advising::RepairAction;
    use crate::execution::Status;
    use crate::plan::{NodeGroup, PlanNode, StrategyConfig};

    fn valid_plan() -> Plan {
        Plan::new("p", "pipeline")
            .with_node(
                PlanNode::new("pipeline", "Pipeline")
                    .with_group(NodeGroup::Pipeline)
                    .with_children(["build"]),
            )
            .with_node(
                PlanNode::new("build", "Stage")
                    .with_group(NodeGroup::Stage)
                    .with_children(["compile"])
                    .with_rollback("cleanup"),
            )
            .with_node(PlanNode::new("compile", "Noop").then("test"))
            .with_node(PlanNode::new("test", "Noop"))
            .with_node(PlanNode::new("cleanup", "Noop"))
    }

    #[test]
    fn test_valid_plan() {
        assert!(validate_plan(&valid_plan()).is_ok());
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::new("p", "root");
        assert_eq!(validate_plan(&plan), Err(ValidationError::EmptyPlan));
    }

    #[test]
    fn test_missing_root() {
        let plan = Plan::new("p", "root").with_node(PlanNode::new("a", "Noop"));
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::MissingRoot("root".to_string()))
        );
    }

    #[test]
    fn test_duplicate_ids() {
        let plan = Plan::new("p", "a")
            .with_node(PlanNode::new("a", "Noop"))
            .with_node(PlanNode::new("a", "Noop"));
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::DuplicateNodeId("a".to_string()))
        );
    }

    #[test]
    fn test_empty_step_type() {
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "  "));
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::EmptyStepType("a".to_string()))
        );
    }

    #[test]
    fn test_dangling_reference() {
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "Noop").then("ghost"));
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_dangling_rollback() {
        let plan = Plan::new("p", "a").with_node(
            PlanNode::new("a", "Stage")
                .with_children(["b"])
                .with_rollback("ghost"),
        )
        .with_node(PlanNode::new("b", "Noop"));
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::InvalidReference { reference, .. }) if reference == "ghost"
        ));
    }

    #[test]
    fn test_shared_child() {
        let plan = Plan::new("p", "root")
            .with_node(PlanNode::new("root", "Pipeline").with_children(["s1", "s2"]))
            .with_node(PlanNode::new("s1", "Stage").with_children(["x"]))
            .with_node(PlanNode::new("s2", "Stage").with_children(["x"]))
            .with_node(PlanNode::new("x", "Noop"));
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::MultipleContainers { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let plan = Plan::new("p", "a")
            .with_node(PlanNode::new("a", "Noop").then("b"))
            .with_node(PlanNode::new("b", "Noop").then("a"));
        assert_eq!(validate_plan(&plan), Err(ValidationError::CyclicGraph));
    }

    #[test]
    fn test_strategy_requires_single_child() {
        let plan = Plan::new("p", "loop")
            .with_node(
                PlanNode::new("loop", "Strategy")
                    .with_children(["a", "b"])
                    .with_strategy(StrategyConfig::Repeat { times: 2 }),
            )
            .with_node(PlanNode::new("a", "Noop"))
            .with_node(PlanNode::new("b", "Noop"));
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::InvalidStrategy("loop".to_string()))
        );
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let plan = Plan::new("p", "a").with_node(PlanNode::new("a", "Noop").with_adviser(
            AdviserConfig::Retry {
                when: vec![Status::Failed],
                max_attempts: 0,
                wait_intervals_ms: vec![],
                after_retries: RepairAction::Fail,
            },
        ));
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::InvalidRetry("a".to_string()))
        );
    }
}
