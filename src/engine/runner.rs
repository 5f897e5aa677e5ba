//! Event Runner
//!
//! Handles one kernel event per call. Each handler re-reads the records it
//! needs, performs a single CAS transition plus the actions that follow
//! from it, and returns the worker to the pool. Handlers never assume the
//! state that produced the event still holds; a CAS that no longer applies
//! is a no-op.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use super::aggregator;
use super::context::KernelContext;
use crate::advising::{self, AdviserResponse};
use crate::dispatch::TaskResponse;
use crate::error::{KernelError, Result};
use crate::execution::{
    ExecutableResponse, ExecutionMode, FailureInfo, FailureKind, KernelEvent, NodeExecution,
    Status,
};
use crate::interrupts::handlers;
use crate::plan::{PlanNode, SkipCondition};
use crate::steps::{AsyncStart, ChainLink, Step, StepContext, StepOutcome, TaskSpec};

/// Routes a kernel event to its handler.
pub async fn handle_event(ctx: &KernelContext, event: KernelEvent) -> Result<()> {
    match event {
        KernelEvent::StartNode { node_execution_id } => start_node(ctx, &node_execution_id).await,
        KernelEvent::ExecuteNode { node_execution_id } => {
            let node = ctx.nodes.get(&node_execution_id)?;
            execute_node(ctx, &node).await
        }
        KernelEvent::StatusUpdate(event) if event.new_status.is_terminal() => {
            aggregator::on_terminal(ctx, &event.node_execution_id, false).await
        }
        KernelEvent::StatusUpdate(_) => Ok(()),
        KernelEvent::InterruptRegistered { plan_execution_id } => {
            handlers::process_pending(ctx, &plan_execution_id).await
        }
        KernelEvent::ResumeInterrupts { plan_execution_id } => {
            handlers::resume_processing(ctx, &plan_execution_id).await
        }
        KernelEvent::TaskResponse(response) => on_task_response(ctx, &response).await,
        KernelEvent::AsyncResponse {
            node_execution_id,
            callback_id,
            payload,
        } => on_async_response(ctx, &node_execution_id, &callback_id, payload).await,
        KernelEvent::InputSubmitted { node_execution_id } => {
            let node = ctx.nodes.get(&node_execution_id)?;
            if node.status != Status::Running || node.mode.is_some() {
                return Ok(());
            }
            let plan_node = ctx.plan_node(&node)?;
            facilitate(ctx, &node, &plan_node).await
        }
        KernelEvent::Reconcile { node_execution_id } => reconcile(ctx, &node_execution_id).await,
    }
}

/// Moves a QUEUED node into execution, or parks, skips or discontinues it.
async fn start_node(ctx: &KernelContext, node_execution_id: &str) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    if node.status != Status::Queued {
        return Ok(());
    }

    let plan = ctx.plans.get(&node.plan_execution_id)?;
    if plan.status == Status::Paused {
        debug!("Plan execution {} paused, {} stays queued", plan.id, node.id);
        return Ok(());
    }
    if plan.is_closing() {
        return discontinue_queued(ctx, &node, Status::Aborted);
    }
    if let Some(parent_id) = &node.parent_id {
        let parent = ctx.nodes.get(parent_id)?;
        if parent.status == Status::Discontinuing || parent.status.is_terminal() {
            let target = match parent.discontinue_target {
                Some(Status::Expired) => Status::Expired,
                _ => Status::Aborted,
            };
            return discontinue_queued(ctx, &node, target);
        }
    }

    let plan_node = match ctx.plan_node(&node) {
        Ok(plan_node) => plan_node,
        Err(e @ KernelError::NotFound { .. }) => {
            return error_node(ctx, &node.id, FailureKind::Facilitation, e.to_string());
        }
        Err(e) => return Err(e),
    };

    if should_skip(ctx, &node, &plan_node)? {
        if ctx
            .nodes
            .update_status_with_ops(&node.id, Status::Skipped, Some(&[Status::Queued]), |_| {})?
            .is_some()
        {
            info!("Skipped {} ({})", plan_node.id, node.id);
        }
        return Ok(());
    }

    if plan_node.wait_for_input {
        if ctx
            .nodes
            .update_status_with_ops(&node.id, Status::InputWaiting, Some(&[Status::Queued]), |_| {})?
            .is_some()
        {
            info!("{} ({}) waiting for input", plan_node.id, node.id);
        }
        return Ok(());
    }

    let Some(node) = ctx
        .nodes
        .update_status_with_ops(&node.id, Status::Running, Some(&[Status::Queued]), |_| {})?
    else {
        return Ok(());
    };
    facilitate(ctx, &node, &plan_node).await
}

fn discontinue_queued(ctx: &KernelContext, node: &NodeExecution, target: Status) -> Result<()> {
    ctx.nodes.update_status_with_ops(
        &node.id,
        Status::Discontinuing,
        Some(&[Status::Queued]),
        |n| n.discontinue_target = Some(target),
    )?;
    ctx.nodes
        .update_status_with_ops(&node.id, target, Some(&[Status::Discontinuing]), |_| {})?;
    Ok(())
}

fn should_skip(ctx: &KernelContext, node: &NodeExecution, plan_node: &PlanNode) -> Result<bool> {
    match &plan_node.skip_condition {
        None => Ok(false),
        Some(SkipCondition::Literal(skip)) => Ok(*skip),
        Some(SkipCondition::PreviousStatusIn(statuses)) => match &node.previous_id {
            Some(previous_id) => {
                let previous = ctx.nodes.get(previous_id)?;
                Ok(statuses.contains(&previous.resolved_status()))
            }
            None => Ok(false),
        },
    }
}

fn error_node(
    ctx: &KernelContext,
    node_execution_id: &str,
    kind: FailureKind,
    message: String,
) -> Result<()> {
    warn!("Node execution {} errored: {}", node_execution_id, message);
    ctx.nodes
        .update_status_with_ops(node_execution_id, Status::Errored, None, |n| {
            n.failure_info = Some(FailureInfo::new(kind, message.clone()));
        })?;
    Ok(())
}

/// Decides the execution mode of a RUNNING node and starts it.
async fn facilitate(ctx: &KernelContext, node: &NodeExecution, plan_node: &PlanNode) -> Result<()> {
    let step = match ctx.step(&plan_node.step_type) {
        Ok(step) => step,
        Err(e) => return error_node(ctx, &node.id, FailureKind::Facilitation, e.to_string()),
    };
    let response = match ctx.facilitator.facilitate(plan_node, step.as_ref()).await {
        Ok(response) => response,
        Err(e) => return error_node(ctx, &node.id, FailureKind::Facilitation, e.to_string()),
    };

    let claimed = ctx.nodes.update_with(
        &node.id,
        |n| n.status == Status::Running && n.mode.is_none(),
        |n| n.mode = Some(response.mode),
    )?;
    let Some(node) = claimed else {
        return Ok(());
    };

    if response.initial_wait.is_zero() {
        run_mode(ctx, &node, plan_node, step.as_ref()).await
    } else {
        debug!(
            "{} ({}) starts {:?} after {:?}",
            plan_node.id, node.id, response.mode, response.initial_wait
        );
        ctx.bus.emit_after(
            response.initial_wait,
            KernelEvent::ExecuteNode {
                node_execution_id: node.id,
            },
        );
        Ok(())
    }
}

/// Runs a facilitated node that has not produced any response yet.
async fn execute_node(ctx: &KernelContext, node: &NodeExecution) -> Result<()> {
    if node.status != Status::Running || node.mode.is_none() || !node.executable_responses.is_empty() {
        return Ok(());
    }
    let plan_node = ctx.plan_node(node)?;
    let step = match ctx.step(&plan_node.step_type) {
        Ok(step) => step,
        Err(e) => return error_node(ctx, &node.id, FailureKind::Facilitation, e.to_string()),
    };
    run_mode(ctx, node, &plan_node, step.as_ref()).await
}

async fn run_mode(
    ctx: &KernelContext,
    node: &NodeExecution,
    plan_node: &PlanNode,
    step: &dyn Step,
) -> Result<()> {
    let Some(mode) = node.mode else {
        return Ok(());
    };
    let step_ctx = StepContext::new(node, plan_node);

    match mode {
        ExecutionMode::Sync => {
            let outcome = step
                .execute_sync(&step_ctx)
                .await
                .unwrap_or_else(|e| StepOutcome::Error(e.to_string()));
            finish_with(ctx, &node.id, outcome, &[Status::Running], |n| {
                n.executable_responses.push(ExecutableResponse::Sync)
            })
        }
        ExecutionMode::Async => match step.execute_async(&step_ctx).await {
            Ok(AsyncStart::Completed(outcome)) => finish(ctx, &node.id, outcome, &[Status::Running]),
            Ok(AsyncStart::Waiting { callback_id }) => {
                ctx.nodes.update_status_with_ops(
                    &node.id,
                    step.waiting_status(),
                    Some(&[Status::Running]),
                    |n| {
                        n.executable_responses.push(ExecutableResponse::Async {
                            callback_ids: vec![callback_id.clone()],
                        })
                    },
                )?;
                Ok(())
            }
            Err(e) => finish(ctx, &node.id, StepOutcome::Error(e.to_string()), &[Status::Running]),
        },
        ExecutionMode::Task => match step.obtain_task(&step_ctx) {
            Ok(spec) => dispatch_task(ctx, node, spec, None).await,
            Err(e) => error_node(ctx, &node.id, FailureKind::Dispatch, e.to_string()),
        },
        ExecutionMode::TaskChain => match step.start_chain(&step_ctx) {
            Ok(spec) => dispatch_task(ctx, node, spec, Some(0)).await,
            Err(e) => error_node(ctx, &node.id, FailureKind::Dispatch, e.to_string()),
        },
        ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain => {
            spawn_children(ctx, node, plan_node, mode)
        }
    }
}

/// Moves a node to the outcome's terminal status.
fn finish(ctx: &KernelContext, node_execution_id: &str, outcome: StepOutcome, allowed: &[Status]) -> Result<()> {
    finish_with(ctx, node_execution_id, outcome, allowed, |_| {})
}

fn finish_with<F>(
    ctx: &KernelContext,
    node_execution_id: &str,
    outcome: StepOutcome,
    allowed: &[Status],
    ops: F,
) -> Result<()>
where
    F: Fn(&mut NodeExecution),
{
    let target = outcome.status();
    let updated = ctx
        .nodes
        .update_status_with_ops(node_execution_id, target, Some(allowed), |n| {
            ops(n);
            match &outcome {
                StepOutcome::Success(output) => n.output = Some(output.clone()),
                StepOutcome::Failure(message) | StepOutcome::Error(message) => {
                    n.failure_info = Some(FailureInfo::new(FailureKind::Application, message.clone()))
                }
            }
        })?;
    if updated.is_none() {
        debug!(
            "Outcome {} for {} no longer applies, dropping",
            target, node_execution_id
        );
    }
    Ok(())
}

/// Hands a task to the dispatcher and parks the node in TASK_WAITING.
///
/// `link` is set for TASK_CHAIN nodes.
async fn dispatch_task(
    ctx: &KernelContext,
    node: &NodeExecution,
    spec: TaskSpec,
    link: Option<usize>,
) -> Result<()> {
    let expiry_ms = spec.expiry_ms.unwrap_or(ctx.config.default_task_expiry_ms);
    let expiry = Utc::now() + chrono::Duration::milliseconds(expiry_ms as i64);

    let dispatched = ctx
        .dispatcher
        .dispatch(&node.id, &node.plan_execution_id, spec.parameters, expiry, |task| {
            let response = match link {
                Some(link) => ExecutableResponse::TaskChain {
                    task_id: task.id.clone(),
                    link,
                },
                None => ExecutableResponse::Task {
                    task_id: task.id.clone(),
                },
            };
            let parked = ctx.nodes.update_status_with_ops(
                &node.id,
                Status::TaskWaiting,
                Some(&[Status::Running]),
                |n| n.executable_responses.push(response.clone()),
            )?;
            Ok(parked.is_some())
        })
        .await;

    match dispatched {
        Ok(Some(task_id)) => {
            debug!("Node {} waiting on task {}", node.id, task_id);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => error_node(ctx, &node.id, FailureKind::Dispatch, e.to_string()),
    }
}

/// Spawn response recorded on a parent before its children are created.
pub fn spawn_response(mode: ExecutionMode, plan_node: &PlanNode) -> Option<ExecutableResponse> {
    let new_id = || uuid::Uuid::new_v4().to_string();
    match mode {
        ExecutionMode::Child => Some(ExecutableResponse::Child { child_id: new_id() }),
        ExecutionMode::Children => {
            let count = match &plan_node.strategy {
                Some(strategy) => strategy.iterations().len(),
                None => plan_node.children.len(),
            };
            Some(ExecutableResponse::Children {
                child_ids: (0..count).map(|_| new_id()).collect(),
            })
        }
        ExecutionMode::ChildChain => Some(ExecutableResponse::ChildChain {
            child_id: new_id(),
            index: 0,
        }),
        _ => None,
    }
}

fn spawn_children(
    ctx: &KernelContext,
    node: &NodeExecution,
    plan_node: &PlanNode,
    mode: ExecutionMode,
) -> Result<()> {
    let Some(response) = spawn_response(mode, plan_node) else {
        return Ok(());
    };
    let recorded = ctx.nodes.update_with(
        &node.id,
        |n| n.status == Status::Running && n.executable_responses.is_empty(),
        |n| n.executable_responses.push(response.clone()),
    )?;
    let Some(parent) = recorded else {
        return Ok(());
    };

    let children = aggregator::planned_children(plan_node, &response);
    debug!(
        "{} ({}) spawning {} children as {:?}",
        plan_node.id,
        parent.id,
        children.len(),
        mode
    );
    for (child_id, plan_node_id, strategy) in children {
        aggregator::spawn_child(ctx, &parent, &plan_node_id, &child_id, strategy)?;
    }
    // Nothing to wait for when the strategy expanded to zero iterations
    aggregator::check_parent(ctx, &parent.id)
}

async fn on_async_response(
    ctx: &KernelContext,
    node_execution_id: &str,
    callback_id: &str,
    payload: Value,
) -> Result<()> {
    let Some(node) = ctx.store.get_node(node_execution_id)? else {
        warn!("Callback {} for unknown node {}, dropping", callback_id, node_execution_id);
        return Ok(());
    };
    let accepting = node.mode == Some(ExecutionMode::Async)
        && matches!(
            node.status,
            Status::Running | Status::AsyncWaiting | Status::ResourceWaiting
        );
    // A callback may overtake the write that parks the node
    let known = node.status == Status::Running || node.callback_ids().iter().any(|id| id == callback_id);
    if !accepting || !known {
        warn!(
            "Callback {} for node {} in {} not accepted, dropping",
            callback_id, node.id, node.status
        );
        return Ok(());
    }

    let plan_node = ctx.plan_node(&node)?;
    let step = ctx.step(&plan_node.step_type)?;
    let outcome = step
        .handle_async_response(&StepContext::new(&node, &plan_node), callback_id, payload)
        .await
        .unwrap_or_else(|e| StepOutcome::Error(e.to_string()));
    finish(
        ctx,
        &node.id,
        outcome,
        &[Status::Running, Status::AsyncWaiting, Status::ResourceWaiting],
    )
}

async fn on_task_response(ctx: &KernelContext, response: &TaskResponse) -> Result<()> {
    let Some(task) = ctx.dispatcher.correlate(response)? else {
        return Ok(());
    };
    let Some(node) = ctx.store.get_node(&task.node_execution_id)? else {
        warn!("Task {} belongs to unknown node {}", task.id, task.node_execution_id);
        return Ok(());
    };

    // None: plain TASK; Some(link): TASK_CHAIN
    let link = match node.last_response() {
        Some(ExecutableResponse::Task { task_id }) if *task_id == task.id => None,
        Some(ExecutableResponse::TaskChain { task_id, link }) if *task_id == task.id => Some(*link),
        _ => {
            warn!("Task {} is not the current task of node {}, dropping", task.id, node.id);
            return Ok(());
        }
    };
    if node.status != Status::TaskWaiting {
        warn!(
            "Response for task {} after node {} moved to {}, dropping",
            task.id, node.id, node.status
        );
        return Ok(());
    }

    let plan_node = ctx.plan_node(&node)?;
    let step = ctx.step(&plan_node.step_type)?;
    let step_ctx = StepContext::new(&node, &plan_node);

    let Some(link) = link else {
        let outcome = step.handle_task_response(&step_ctx, response);
        return finish(ctx, &node.id, outcome, &[Status::TaskWaiting]);
    };

    match step.next_chain_link(&step_ctx, link, response) {
        Ok(ChainLink::Done(outcome)) => finish(ctx, &node.id, outcome, &[Status::TaskWaiting]),
        Ok(ChainLink::Next(spec)) => {
            let resumed = ctx.nodes.update_status_with_ops(
                &node.id,
                Status::Running,
                Some(&[Status::TaskWaiting]),
                |_| {},
            )?;
            match resumed {
                Some(node) => dispatch_task(ctx, &node, spec, Some(link + 1)).await,
                None => Ok(()),
            }
        }
        Err(e) => finish(
            ctx,
            &node.id,
            StepOutcome::Error(e.to_string()),
            &[Status::TaskWaiting],
        ),
    }
}

/// Expires overdue tasks and intervention deadlines.
///
/// A node whose current task expired is FAILED; a node whose intervention
/// deadline passed gets its `on_timeout` action applied.
pub async fn sweep(ctx: &KernelContext, now: DateTime<Utc>) -> Result<()> {
    for task in ctx.dispatcher.sweep_expired(now)? {
        let Some(node) = ctx.store.get_node(&task.node_execution_id)? else {
            continue;
        };
        let current = matches!(
            node.last_response(),
            Some(ExecutableResponse::Task { task_id } | ExecutableResponse::TaskChain { task_id, .. })
                if *task_id == task.id
        );
        if !current {
            continue;
        }
        let failed = ctx.nodes.update_status_with_ops(
            &node.id,
            Status::Failed,
            Some(&[Status::TaskWaiting]),
            |n| n.failure_info = Some(FailureInfo::new(FailureKind::Expired, "delegate task expired")),
        )?;
        if failed.is_some() {
            info!("Node {} ({}) failed: task {} expired", node.id, node.plan_node_id, task.id);
        }
    }

    for node in ctx.store.find_nodes_by_status(&Status::TERMINAL)? {
        if !node.awaiting_intervention() {
            continue;
        }
        if let Some(AdviserResponse::InterventionWait {
            deadline: Some(deadline),
            on_timeout,
        }) = &node.adviser_response
        {
            if *deadline <= now {
                info!("Intervention on {} timed out, applying {:?}", node.id, on_timeout);
                advising::resolve_intervention(ctx, &node.id, on_timeout.response()).await?;
            }
        }
    }
    Ok(())
}

/// Re-drives a node left mid-flight by a stopped process.
async fn reconcile(ctx: &KernelContext, node_execution_id: &str) -> Result<()> {
    let node = ctx.nodes.get(node_execution_id)?;
    if node.status.is_terminal() {
        return aggregator::on_terminal(ctx, node_execution_id, true).await;
    }
    let spawner = node.mode.map_or(false, |mode| mode.spawns_children());

    match node.status {
        Status::Discontinuing if spawner => aggregator::check_parent(ctx, &node.id),
        Status::Discontinuing => handlers::finalize_leaf(ctx, &node).await,
        Status::Running if node.mode.is_none() => {
            let plan_node = ctx.plan_node(&node)?;
            facilitate(ctx, &node, &plan_node).await
        }
        Status::Running if node.executable_responses.is_empty() => execute_node(ctx, &node).await,
        Status::Running if spawner => aggregator::check_parent(ctx, &node.id),
        status => {
            debug!("Nothing to reconcile for {} in {}", node.id, status);
            Ok(())
        }
    }
}
