//! Advise Application
//!
//! Advising runs in two CAS-guarded phases so that it takes effect once
//! per terminal transition:
//!
//! 1. Claim: `advised` flips from false to true together with the
//!    recorded response. Only the worker that wins the claim continues.
//! 2. Apply: the response is acted on, then `advise_applied` is set and
//!    the parent is re-checked.
//!
//! Applying is idempotent so that recovery can re-run phase 2 for a node
//! whose worker died between the phases.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use super::evaluate::{evaluate, AdviseInput};
use super::model::AdviserResponse;
use crate::ambiance::Level;
use crate::engine::{aggregator, KernelContext};
use crate::error::{KernelError, Result};
use crate::execution::{KernelEvent, NodeExecution, Status};
use crate::interrupts::{handlers, InterruptType, IssuedBy};
use crate::plan::NodeGroup;

/// Runs both advising phases for a terminal node.
///
/// # Arguments
///
/// * `ctx` - Kernel context
/// * `node_execution_id` - Terminal node
/// * `recovering` - Re-apply a response claimed by a worker that never
///   finished applying it
pub async fn advise(ctx: &KernelContext, node_execution_id: &str, recovering: bool) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    if !node.status.is_terminal() {
        return Ok(());
    }
    if node.advise_applied {
        if recovering {
            aggregator::after_close(ctx, node_execution_id)?;
        }
        return Ok(());
    }

    let claimed = if node.advised {
        None
    } else {
        let response = decide(ctx, &node)?;
        ctx.nodes.update_with(
            node_execution_id,
            |n| !n.advised,
            |n| {
                n.advised = true;
                n.adviser_response = response.clone();
            },
        )?
    };

    let node = match claimed {
        Some(node) => node,
        None if recovering && node.advised => node,
        None => {
            debug!("Advise for {} already claimed", node_execution_id);
            return Ok(());
        }
    };
    info!(
        "Advised {} ({}) after {}: {:?}",
        node.id, node.plan_node_id, node.status, node.adviser_response
    );
    apply(ctx, &node).await
}

fn decide(ctx: &KernelContext, node: &NodeExecution) -> Result<Option<AdviserResponse>> {
    // Discontinued by an interrupt: the interrupt decided the outcome
    if node.discontinue_target.is_some() {
        return Ok(None);
    }
    let configs = match ctx.plan_node(node) {
        Ok(plan_node) => plan_node.adviser_configs,
        Err(KernelError::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };
    let input = AdviseInput {
        status: node.status,
        attempt: node.attempt(),
        now: Utc::now(),
        default_retry_wait: Duration::from_millis(ctx.config.default_retry_wait_ms),
        default_intervention_timeout: ctx.config.intervention_timeout_ms.map(Duration::from_millis),
    };
    Ok(evaluate(&configs, &input))
}

/// Phase 2: acts on the recorded response, marks it applied and re-checks
/// the parent.
pub async fn apply(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    match &node.adviser_response {
        None | Some(AdviserResponse::InterventionWait { .. }) => {}
        Some(AdviserResponse::NextStep)
        | Some(AdviserResponse::MarkSuccess)
        | Some(AdviserResponse::Ignore) => start_successors(ctx, node)?,
        Some(AdviserResponse::Retry { wait_ms }) => retry(ctx, node, *wait_ms)?,
        Some(AdviserResponse::RollbackStage) => rollback_stage(ctx, node).await?,
        Some(AdviserResponse::EndPlan) => end_plan(ctx, node)?,
    }

    ctx.nodes
        .update_with(&node.id, |n| !n.advise_applied, |n| n.advise_applied = true)?;
    aggregator::after_close(ctx, &node.id)
}

/// Replaces the response of a node parked for manual intervention and
/// applies it. Returns `false` if the node was not waiting.
pub async fn resolve_intervention(
    ctx: &KernelContext,
    node_execution_id: &str,
    response: Option<AdviserResponse>,
) -> Result<bool> {
    let Some(node) = reopen_intervention(ctx, node_execution_id, response)? else {
        return Ok(false);
    };
    info!(
        "Intervention on {} resolved with {:?}",
        node.id, node.adviser_response
    );
    apply(ctx, &node).await?;
    Ok(true)
}

fn reopen_intervention(
    ctx: &KernelContext,
    node_execution_id: &str,
    response: Option<AdviserResponse>,
) -> Result<Option<NodeExecution>> {
    ctx.nodes.update_with(
        node_execution_id,
        NodeExecution::awaiting_intervention,
        |n| {
            n.adviser_response = response.clone();
            n.advise_applied = false;
        },
    )
}

/// Lets the failure of a parked node stand. Used when its scope is being
/// discontinued.
pub fn close_intervention(ctx: &KernelContext, node_execution_id: &str) -> Result<()> {
    if reopen_intervention(ctx, node_execution_id, None)?.is_none() {
        return Ok(());
    }
    ctx.nodes
        .update_with(node_execution_id, |n| !n.advise_applied, |n| n.advise_applied = true)?;
    aggregator::after_close(ctx, node_execution_id)
}

fn start_successors(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    let plan = ctx.plan(&node.plan_execution_id)?;
    let Some(plan_node) = plan.node(&node.plan_node_id) else {
        return Ok(());
    };
    let existing = ctx.store.find_nodes_by_previous(&node.id)?;

    for next_id in &plan_node.next {
        if existing.iter().any(|n| &n.plan_node_id == next_id) {
            continue;
        }
        let Some(next) = plan.node(next_id) else {
            warn!("Successor '{}' of '{}' not in plan", next_id, plan_node.id);
            continue;
        };

        let id = uuid::Uuid::new_v4().to_string();
        let mut level = Level::new(&next.id, &id, &next.step_type, next.group);
        if let Some(metadata) = node.ambiance.current_level().and_then(|l| l.strategy_metadata.clone()) {
            level = level.with_strategy(metadata);
        }
        let successor = NodeExecution::new(&id, &next.id, node.ambiance.sibling(level))
            .with_parent(node.parent_id.clone())
            .with_previous(Some(node.id.clone()));
        ctx.nodes.create(successor)?;
        ctx.bus.emit(KernelEvent::StartNode {
            node_execution_id: id,
        });
    }
    Ok(())
}

fn retry(ctx: &KernelContext, node: &NodeExecution, wait_ms: u64) -> Result<()> {
    if node.old_retry {
        return Ok(());
    }
    let existing = ctx
        .store
        .find_nodes_by_plan_execution(&node.plan_execution_id)?
        .into_iter()
        .find(|n| n.retry_ids.last() == Some(&node.id));

    let retry_id = match existing {
        Some(retry) => retry.id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            let ambiance = match node.ambiance.current_level() {
                Some(current) => {
                    let mut level = current.clone();
                    level.runtime_id = id.clone();
                    node.ambiance.sibling(level)
                }
                None => node.ambiance.clone(),
            };
            let mut retry_ids = node.retry_ids.clone();
            retry_ids.push(node.id.clone());

            let attempt = NodeExecution::new(&id, &node.plan_node_id, ambiance)
                .with_parent(node.parent_id.clone())
                .with_previous(node.previous_id.clone())
                .with_retry_ids(retry_ids);
            ctx.nodes.create(attempt)?;
            id
        }
    };

    ctx.nodes
        .update_with(&node.id, |n| !n.old_retry, |n| n.old_retry = true)?;
    info!(
        "Retrying {} as {} (attempt {}) in {} ms",
        node.plan_node_id,
        retry_id,
        node.attempt() + 1,
        wait_ms
    );
    ctx.bus.emit_after(
        Duration::from_millis(wait_ms),
        KernelEvent::StartNode {
            node_execution_id: retry_id,
        },
    );
    Ok(())
}

/// Walks the parent chain up to the innermost node of `group`.
fn enclosing(ctx: &KernelContext, node: &NodeExecution, group: NodeGroup) -> Result<Option<NodeExecution>> {
    let mut current = node.parent_id.clone();
    while let Some(id) = current {
        let parent = ctx.nodes.get(&id)?;
        if ctx.plan_node(&parent)?.group == group {
            return Ok(Some(parent));
        }
        current = parent.parent_id.clone();
    }
    Ok(None)
}

async fn rollback_stage(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    let Some(stage) = enclosing(ctx, node, NodeGroup::Stage)? else {
        warn!("No stage encloses {}, failure stands", node.id);
        return Ok(());
    };
    if stage.status.is_terminal() {
        return Ok(());
    }
    let stage_node = ctx.plan_node(&stage)?;
    let children = ctx.nodes.find_children_by_parent(&stage.id)?;

    let rollback = match &stage_node.rollback_config {
        Some(config) => match children.iter().find(|c| c.plan_node_id == config.node_id) {
            Some(existing) => Some(existing.id.clone()),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                aggregator::spawn_child(ctx, &stage, &config.node_id, &id, None)?;
                Some(id)
            }
        },
        None => {
            warn!(
                "Stage '{}' has no rollback node, ending it",
                stage_node.id
            );
            None
        }
    };

    for child in children {
        if child.id == node.id || Some(&child.id) == rollback.as_ref() || !child.is_open() {
            continue;
        }
        handlers::discontinue_subtree(ctx, &child.id, Status::Aborted, Status::Aborted, None).await?;
    }
    Ok(())
}

fn end_plan(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    let registered = ctx.interrupts.register_as(
        &node.plan_execution_id,
        InterruptType::Abort,
        None,
        IssuedBy::Adviser,
        Some(format!("{} ended the plan", node.plan_node_id)),
    );
    match registered {
        Ok(_) => Ok(()),
        Err(KernelError::DuplicateInterrupt { .. }) | Err(KernelError::InvalidInterrupt(_)) => {
            debug!("Plan {} already closing", node.plan_execution_id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
