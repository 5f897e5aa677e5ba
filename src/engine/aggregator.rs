//! Status Aggregator
//!
//! Rolls child results up into their parent. There are no counters: every
//! check re-reads the children, and the closing write on the parent is a
//! CAS, so concurrent checks from sibling completions finalize it once.

use log::{debug, info};

use super::context::KernelContext;
use crate::advising;
use crate::ambiance::{Level, StrategyMetadata};
use crate::error::{KernelError, Result};
use crate::execution::{ExecutableResponse, ExecutionMode, KernelEvent, NodeExecution, Status};
use crate::plan::{FailurePropagation, PlanNode};

/// Entry point for every terminal status event.
pub async fn on_terminal(ctx: &KernelContext, node_execution_id: &str, recovering: bool) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    if !node.status.is_terminal() {
        return Ok(());
    }
    ctx.release_restraints(&node.id);
    advising::advise(ctx, node_execution_id, recovering).await
}

/// Derives a parent's status from its closed children.
///
/// Precedence is ERRORED, FAILED, EXPIRED, then ABORTED; a parent whose
/// children were all skipped is SKIPPED, otherwise SUCCEEDED.
pub fn aggregate(children: &[NodeExecution], rule: FailurePropagation) -> Status {
    let statuses: Vec<Status> = children
        .iter()
        .filter(|child| !child.old_retry)
        .map(NodeExecution::resolved_status)
        .collect();

    let worst_failure = [Status::Errored, Status::Failed, Status::Expired]
        .into_iter()
        .find(|status| statuses.contains(status));
    let failures = statuses.iter().filter(|status| status.is_failure()).count();

    let failed = match rule {
        FailurePropagation::AnyFailure => worst_failure,
        FailurePropagation::AllFailure => worst_failure.filter(|_| failures == statuses.len()),
        FailurePropagation::Ignore => None,
    };
    if let Some(status) = failed {
        return status;
    }
    if statuses.contains(&Status::Aborted) {
        return Status::Aborted;
    }
    if statuses.iter().all(|status| *status == Status::Skipped) {
        Status::Skipped
    } else {
        Status::Succeeded
    }
}

/// Called once a node's advise has been applied.
pub fn after_close(ctx: &KernelContext, node_execution_id: &str) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    if node.old_retry || node.is_open() {
        return Ok(());
    }
    match &node.parent_id {
        Some(parent_id) => check_parent(ctx, parent_id),
        None => check_plan(ctx, &node.plan_execution_id),
    }
}

/// Finalizes `parent_id` if all of its children are closed.
pub fn check_parent(ctx: &KernelContext, parent_id: &str) -> Result<()> {
    let parent = ctx.nodes.get(parent_id)?;
    if !matches!(parent.status, Status::Running | Status::Discontinuing) {
        return Ok(());
    }
    let plan_node = ctx.plan_node(&parent)?;

    match spawn_response(&parent) {
        Some(response) if parent.status == Status::Running => {
            ensure_spawned(ctx, &parent, &plan_node, response)?
        }
        Some(_) => {}
        // Children not recorded yet; the spawner checks again
        None if parent.status == Status::Running => return Ok(()),
        None => {}
    }

    let children = ctx.nodes.find_children_by_parent(parent_id)?;
    if children.iter().any(NodeExecution::is_open) {
        return Ok(());
    }

    if parent.status == Status::Running
        && parent.mode == Some(ExecutionMode::ChildChain)
        && aggregate(&children, FailurePropagation::AnyFailure).is_positive()
        && advance_chain(ctx, &parent, &plan_node)?
    {
        return Ok(());
    }

    let target = if parent.status == Status::Discontinuing {
        parent.discontinue_target.unwrap_or(Status::Aborted)
    } else {
        aggregate(&children, plan_node.failure_propagation)
    };
    finalize_parent(ctx, &parent, target)
}

fn finalize_parent(ctx: &KernelContext, parent: &NodeExecution, target: Status) -> Result<()> {
    if parent.status == Status::Running && target == Status::Aborted {
        // ABORTED is only reachable through DISCONTINUING
        ctx.nodes.update_status_with_ops(
            &parent.id,
            Status::Discontinuing,
            Some(&[Status::Running]),
            |n| n.discontinue_target = Some(Status::Aborted),
        )?;
    }
    let finalized = ctx.nodes.update_status_with_ops(
        &parent.id,
        target,
        Some(&[Status::Running, Status::Discontinuing]),
        |_| {},
    )?;
    if finalized.is_some() {
        debug!("Parent {} ({}) finalized as {}", parent.id, parent.plan_node_id, target);
    }
    Ok(())
}

/// Finalizes the plan execution once every top-level node is closed.
///
/// The top-level nodes roll up like the children of a container; a run
/// whose nodes were all skipped counts as SUCCEEDED.
pub fn check_plan(ctx: &KernelContext, plan_execution_id: &str) -> Result<()> {
    let roots: Vec<NodeExecution> = ctx
        .store
        .find_nodes_by_plan_execution(plan_execution_id)?
        .into_iter()
        .filter(|n| n.parent_id.is_none())
        .collect();
    if roots.is_empty() || roots.iter().any(NodeExecution::is_open) {
        return Ok(());
    }

    let target = match aggregate(&roots, FailurePropagation::AnyFailure) {
        Status::Skipped => Status::Succeeded,
        status => status,
    };
    if ctx.plans.update_status(plan_execution_id, target)?.is_some() {
        info!("Plan execution {} finished: {}", plan_execution_id, target);
        ctx.release_restraints(plan_execution_id);
    }
    Ok(())
}

fn spawn_response(parent: &NodeExecution) -> Option<&ExecutableResponse> {
    parent.last_response().filter(|response| {
        matches!(
            response,
            ExecutableResponse::Child { .. }
                | ExecutableResponse::Children { .. }
                | ExecutableResponse::ChildChain { .. }
        )
    })
}

/// Children a spawn response stands for: (child id, plan node id, strategy).
pub fn planned_children(
    plan_node: &PlanNode,
    response: &ExecutableResponse,
) -> Vec<(String, String, Option<StrategyMetadata>)> {
    match response {
        ExecutableResponse::Child { child_id } => plan_node
            .children
            .first()
            .map(|entry| vec![(child_id.clone(), entry.clone(), None)])
            .unwrap_or_default(),
        ExecutableResponse::Children { child_ids } => match (&plan_node.strategy, plan_node.children.first()) {
            (Some(strategy), Some(entry)) => strategy
                .iterations()
                .into_iter()
                .zip(child_ids)
                .map(|(metadata, id)| (id.clone(), entry.clone(), Some(metadata)))
                .collect(),
            _ => plan_node
                .children
                .iter()
                .zip(child_ids)
                .map(|(entry, id)| (id.clone(), entry.clone(), None))
                .collect(),
        },
        ExecutableResponse::ChildChain { child_id, index } => plan_node
            .children
            .get(*index)
            .map(|entry| vec![(child_id.clone(), entry.clone(), None)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Creates any recorded child that is missing from the store.
fn ensure_spawned(
    ctx: &KernelContext,
    parent: &NodeExecution,
    plan_node: &PlanNode,
    response: &ExecutableResponse,
) -> Result<()> {
    for (child_id, plan_node_id, strategy) in planned_children(plan_node, response) {
        spawn_child(ctx, parent, &plan_node_id, &child_id, strategy)?;
    }
    Ok(())
}

/// Creates a QUEUED child under `parent` and queues its start.
///
/// # Returns
///
/// * `Ok(true)` - Child created
/// * `Ok(false)` - A child with this id already exists
pub fn spawn_child(
    ctx: &KernelContext,
    parent: &NodeExecution,
    plan_node_id: &str,
    child_id: &str,
    strategy: Option<StrategyMetadata>,
) -> Result<bool> {
    if ctx.store.get_node(child_id)?.is_some() {
        return Ok(false);
    }
    let plan = ctx.plan(&parent.plan_execution_id)?;
    let plan_node = plan
        .node(plan_node_id)
        .ok_or_else(|| KernelError::not_found("plan node", plan_node_id))?;

    let mut level = Level::new(&plan_node.id, child_id, &plan_node.step_type, plan_node.group);
    if let Some(metadata) = strategy {
        level = level.with_strategy(metadata);
    }
    let child = NodeExecution::new(child_id, &plan_node.id, parent.ambiance.child(level))
        .with_parent(Some(parent.id.clone()));

    if let Err(e) = ctx.nodes.create(child) {
        if ctx.store.get_node(child_id)?.is_some() {
            return Ok(false);
        }
        return Err(e);
    }
    ctx.bus.emit(KernelEvent::StartNode {
        node_execution_id: child_id.to_string(),
    });
    Ok(true)
}

/// Claims and starts the next CHILD_CHAIN link.
///
/// Returns `false` when the chain is complete.
fn advance_chain(ctx: &KernelContext, parent: &NodeExecution, plan_node: &PlanNode) -> Result<bool> {
    let Some(ExecutableResponse::ChildChain { index, .. }) = parent.last_response() else {
        return Ok(false);
    };
    let (index, next) = (*index, *index + 1);
    let Some(entry) = plan_node.children.get(next) else {
        return Ok(false);
    };

    let child_id = uuid::Uuid::new_v4().to_string();
    let claimed = ctx.nodes.update_with(
        &parent.id,
        |n| {
            n.status == Status::Running
                && matches!(
                    n.last_response(),
                    Some(ExecutableResponse::ChildChain { index: current, .. }) if *current == index
                )
        },
        |n| {
            n.executable_responses.push(ExecutableResponse::ChildChain {
                child_id: child_id.clone(),
                index: next,
            })
        },
    )?;

    if let Some(parent) = claimed {
        debug!("Chain {} advancing to link {} ({})", parent.id, next, entry);
        spawn_child(ctx, &parent, entry, &child_id, None)?;
    }
    Ok(true)
}
