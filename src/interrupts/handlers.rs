//! Interrupt Processing
//!
//! A plan execution's interrupts are processed one at a time: the store
//! hands out at most one PROCESSING interrupt per plan execution, and each
//! one is closed with a CAS from PROCESSING so its final state is written
//! exactly once.

use chrono::Utc;
use log::{debug, info, warn};

use super::model::{Interrupt, InterruptState, InterruptType, IssuedBy};
use crate::advising::{self, AdviserResponse};
use crate::engine::{aggregator, KernelContext};
use crate::error::{KernelError, Result};
use crate::execution::{FailureInfo, FailureKind, KernelEvent, NodeExecution, Status};
use crate::steps::StepContext;

/// Drains the REGISTERED interrupts of a plan execution.
pub async fn process_pending(ctx: &KernelContext, plan_execution_id: &str) -> Result<()> {
    while let Some(interrupt) = ctx.store.claim_next_interrupt(plan_execution_id)? {
        info!(
            "Processing {} interrupt {} for plan execution {}",
            interrupt.kind, interrupt.id, plan_execution_id
        );
        run(ctx, &interrupt).await?;
    }
    Ok(())
}

/// Finishes the interrupt a stopped process left PROCESSING, then drains
/// the REGISTERED ones.
///
/// The interrupt keeps its PROCESSING state while its handler runs again,
/// so it is still closed exactly once. Only recovery may call this: during
/// normal operation a PROCESSING interrupt belongs to the worker that
/// claimed it.
pub async fn resume_processing(ctx: &KernelContext, plan_execution_id: &str) -> Result<()> {
    let stuck: Vec<Interrupt> = ctx
        .store
        .find_interrupts(plan_execution_id)?
        .into_iter()
        .filter(|i| i.state == InterruptState::Processing)
        .collect();
    for interrupt in stuck {
        info!(
            "Resuming {} interrupt {} for plan execution {}",
            interrupt.kind, interrupt.id, plan_execution_id
        );
        run(ctx, &interrupt).await?;
    }
    process_pending(ctx, plan_execution_id).await
}

async fn run(ctx: &KernelContext, interrupt: &Interrupt) -> Result<()> {
    let state = match handle(ctx, interrupt).await {
        Ok(()) => InterruptState::ProcessedSuccessfully,
        Err(e) => {
            warn!("Interrupt {} failed: {}", interrupt.id, e);
            InterruptState::ProcessedUnsuccessfully
        }
    };
    close(ctx, &interrupt.id, state)
}

fn close(ctx: &KernelContext, interrupt_id: &str, state: InterruptState) -> Result<()> {
    loop {
        let Some(current) = ctx.store.get_interrupt(interrupt_id)? else {
            return Err(KernelError::not_found("interrupt", interrupt_id));
        };
        if current.state != InterruptState::Processing {
            debug!("Interrupt {} already {:?}", interrupt_id, current.state);
            return Ok(());
        }
        let expected_version = current.version;
        let mut updated = current;
        updated.state = state;
        updated.processed_at = Some(Utc::now());
        updated.version = expected_version + 1;
        if ctx.store.replace_interrupt(updated, expected_version)? {
            return Ok(());
        }
    }
}

fn target_status(kind: InterruptType) -> Status {
    match kind {
        InterruptType::Expire => Status::Expired,
        InterruptType::MarkFailed | InterruptType::CustomFailure => Status::Failed,
        _ => Status::Aborted,
    }
}

fn descendant_status(kind: InterruptType) -> Status {
    match kind {
        InterruptType::Expire => Status::Expired,
        _ => Status::Aborted,
    }
}

async fn handle(ctx: &KernelContext, interrupt: &Interrupt) -> Result<()> {
    let pe = &interrupt.plan_execution_id;
    let node_id = interrupt.node_execution_id.as_deref();

    match (interrupt.kind, node_id) {
        (InterruptType::Abort | InterruptType::Expire, None) => {
            let root_target = match interrupt.issued_by {
                IssuedBy::Adviser => Status::Failed,
                _ => target_status(interrupt.kind),
            };
            ctx.plans.update_status(pe, Status::Discontinuing)?;

            let roots: Vec<NodeExecution> = ctx
                .store
                .find_nodes_by_plan_execution(pe)?
                .into_iter()
                .filter(|n| n.parent_id.is_none() && !n.old_retry)
                .collect();
            for root in roots {
                discontinue_subtree(ctx, &root.id, root_target, descendant_status(interrupt.kind), None)
                    .await?;
                aggregator::after_close(ctx, &root.id)?;
            }
            Ok(())
        }
        (InterruptType::PauseAll, None) => match ctx.plans.update_status(pe, Status::Paused)? {
            Some(_) => Ok(()),
            None => Err(KernelError::InvalidInterrupt(format!(
                "plan execution '{}' is not running",
                pe
            ))),
        },
        (InterruptType::ResumeAll, None) => {
            if ctx.plans.update_status(pe, Status::Running)?.is_none() {
                return Err(KernelError::InvalidInterrupt(format!(
                    "plan execution '{}' is not paused",
                    pe
                )));
            }
            for node in ctx.store.find_nodes_by_plan_execution(pe)? {
                if node.status == Status::Queued {
                    ctx.bus.emit(KernelEvent::StartNode {
                        node_execution_id: node.id,
                    });
                }
            }
            Ok(())
        }
        (InterruptType::Abort | InterruptType::Expire, Some(id)) => {
            let kind = interrupt.kind;
            discontinue_subtree(ctx, id, target_status(kind), descendant_status(kind), None).await
        }
        (InterruptType::Retry, Some(id)) => {
            expect_resolved(id, advising::resolve_intervention(ctx, id, Some(AdviserResponse::Retry { wait_ms: 0 })).await?)
        }
        (InterruptType::MarkSuccess, Some(id)) => {
            if advising::resolve_intervention(ctx, id, Some(AdviserResponse::MarkSuccess)).await? {
                return Ok(());
            }
            mark_success(ctx, id).await
        }
        (InterruptType::MarkFailed | InterruptType::CustomFailure, Some(id)) => {
            if advising::resolve_intervention(ctx, id, None).await? {
                return Ok(());
            }
            let kind = match interrupt.kind {
                InterruptType::CustomFailure => FailureKind::Custom,
                _ => FailureKind::Interrupted,
            };
            let message = interrupt
                .message
                .clone()
                .unwrap_or_else(|| format!("{} by interrupt", interrupt.kind));
            discontinue_subtree(
                ctx,
                id,
                Status::Failed,
                Status::Aborted,
                Some(FailureInfo::new(kind, message)),
            )
            .await
        }
        (kind, _) => Err(KernelError::InvalidInterrupt(format!(
            "{} has an invalid target",
            kind
        ))),
    }
}

fn expect_resolved(node_execution_id: &str, resolved: bool) -> Result<()> {
    if resolved {
        Ok(())
    } else {
        Err(KernelError::InvalidInterrupt(format!(
            "node execution '{}' is not awaiting intervention",
            node_execution_id
        )))
    }
}

async fn mark_success(ctx: &KernelContext, node_execution_id: &str) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    abort_step(ctx, &node).await;

    let mut allowed = vec![Status::Running];
    allowed.extend(Status::WAITING);
    let updated = ctx.nodes.update_status_with_ops(
        node_execution_id,
        Status::Succeeded,
        Some(allowed.as_slice()),
        |n| n.failure_info = None,
    )?;
    match updated {
        Some(_) => Ok(()),
        None => Err(KernelError::InvalidInterrupt(format!(
            "node execution '{}' cannot be marked successful",
            node_execution_id
        ))),
    }
}

/// Lets the step cancel in-flight work and gives up the node's queued
/// resource claims. Failures are logged only.
async fn abort_step(ctx: &KernelContext, node: &NodeExecution) {
    if node.mode.is_none() {
        return;
    }
    ctx.release_claims(node);
    let plan_node = match ctx.plan_node(node) {
        Ok(plan_node) => plan_node,
        Err(e) => {
            warn!("Cannot abort step of {}: {}", node.id, e);
            return;
        }
    };
    if let Some(step) = ctx.steps.get(&plan_node.step_type) {
        if let Err(e) = step.handle_abort(&StepContext::new(node, &plan_node)).await {
            warn!("Step abort for {} failed: {}", node.id, e);
        }
    }
}

/// Discontinues a node and everything below it.
///
/// Non-terminal nodes are first marked DISCONTINUING top-down, recording
/// the status each one finalizes to. Leaves are then finalized bottom-up;
/// parents finalize through the aggregator as their children close.
/// Running the walk twice leaves the same final statuses.
///
/// # Arguments
///
/// * `root_id` - First node of the subtree
/// * `root_target` - Final status of `root_id`
/// * `descendant_target` - Final status of every node below it
/// * `failure` - Recorded on the root when set
pub async fn discontinue_subtree(
    ctx: &KernelContext,
    root_id: &str,
    root_target: Status,
    descendant_target: Status,
    failure: Option<FailureInfo>,
) -> Result<()> {
    let mut visited: Vec<String> = Vec::new();
    let mut pending = vec![root_id.to_string()];

    while let Some(id) = pending.pop() {
        let node = ctx.nodes.get(&id)?;
        let target = if id == root_id { root_target } else { descendant_target };

        if !node.status.is_terminal() && node.status != Status::Discontinuing {
            ctx.nodes.update_status_with_ops(&id, Status::Discontinuing, None, |n| {
                n.discontinue_target = Some(target);
                if id == root_id && failure.is_some() {
                    n.failure_info = failure.clone();
                }
            })?;
        }
        for child in ctx.nodes.find_children_by_parent(&id)? {
            pending.push(child.id);
        }
        visited.push(id);
    }

    for id in visited.iter().rev() {
        let node = ctx.nodes.get(id)?;
        if node.awaiting_intervention() {
            advising::close_intervention(ctx, id)?;
            continue;
        }
        if node.status != Status::Discontinuing {
            continue;
        }
        let spawner = node.mode.map_or(false, |mode| mode.spawns_children());
        if spawner {
            aggregator::check_parent(ctx, id)?;
        } else {
            finalize_leaf(ctx, &node).await?;
        }
    }
    Ok(())
}

/// Moves a DISCONTINUING leaf to its recorded target.
pub async fn finalize_leaf(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    abort_step(ctx, node).await;
    let target = node.discontinue_target.unwrap_or(Status::Aborted);
    if ctx
        .nodes
        .update_status_with_ops(&node.id, target, Some(&[Status::Discontinuing]), |_| {})?
        .is_some()
    {
        debug!("Discontinued {} ({}) as {}", node.id, node.plan_node_id, target);
    }
    Ok(())
}
