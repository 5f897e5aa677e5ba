//! Crash Recovery
//!
//! Rebuilds the kernel queue from the store after a restart. The store is
//! the only source of truth, so recovery only has to find records that
//! were left between two steps and emit the event that continues them:
//!
//! - interrupts stuck in PROCESSING are finished in place, then the
//!   REGISTERED ones are drained
//! - QUEUED nodes are started again
//! - terminal nodes whose advise never got applied are reconciled
//! - RUNNING and DISCONTINUING nodes are reconciled
//! - plans whose top-level nodes all closed are finalized
//!
//! Every handler is idempotent, so emitting an event for a record that
//! was in fact complete is harmless.

use log::info;

use super::aggregator;
use super::context::KernelContext;
use crate::error::Result;
use crate::execution::{KernelEvent, NodeExecution, Status};

/// What a recovery pass re-queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub plan_executions: usize,
    pub pending_interrupts: usize,
    pub restarted_nodes: usize,
    pub reconciled_nodes: usize,
}

/// Re-queues the unfinished work of every open plan execution.
pub fn recover(ctx: &KernelContext) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for execution in ctx.store.list_plan_executions()? {
        if execution.status.is_terminal() {
            continue;
        }
        report.plan_executions += 1;
        report.pending_interrupts += resume_interrupts(ctx, &execution.id)?;

        let nodes = ctx.store.find_nodes_by_plan_execution(&execution.id)?;
        for node in &nodes {
            match recovery_event(node) {
                Some(event @ KernelEvent::StartNode { .. }) => {
                    report.restarted_nodes += 1;
                    ctx.bus.emit(event);
                }
                Some(event) => {
                    report.reconciled_nodes += 1;
                    ctx.bus.emit(event);
                }
                None => {}
            }
        }

        // Top-level nodes closed but the plan write never happened
        aggregator::check_plan(ctx, &execution.id)?;
    }

    info!(
        "Recovered {} plan executions: {} interrupts, {} restarted, {} reconciled",
        report.plan_executions,
        report.pending_interrupts,
        report.restarted_nodes,
        report.reconciled_nodes
    );
    Ok(report)
}

fn recovery_event(node: &NodeExecution) -> Option<KernelEvent> {
    let node_execution_id = node.id.clone();
    match node.status {
        Status::Queued => Some(KernelEvent::StartNode { node_execution_id }),
        status if status.is_terminal() && !node.advise_applied && !node.old_retry => {
            Some(KernelEvent::Reconcile { node_execution_id })
        }
        Status::Running | Status::Discontinuing => Some(KernelEvent::Reconcile { node_execution_id }),
        _ => None,
    }
}

fn resume_interrupts(ctx: &KernelContext, plan_execution_id: &str) -> Result<usize> {
    let pending = ctx
        .store
        .find_interrupts(plan_execution_id)?
        .iter()
        .filter(|i| i.state.is_pending())
        .count();

    if pending > 0 {
        ctx.bus.emit(KernelEvent::ResumeInterrupts {
            plan_execution_id: plan_execution_id.to_string(),
        });
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advising::AdviserResponse;
    use crate::ambiance::Ambiance;
    use crate::execution::ExecutionMode;

    fn node(status: Status) -> NodeExecution {
        let mut node = NodeExecution::new("n1", "a", Ambiance::new("pe", "plan"));
        node.status = status;
        node
    }

    #[test]
    fn test_queued_node_restarted() {
        assert!(matches!(
            recovery_event(&node(Status::Queued)),
            Some(KernelEvent::StartNode { .. })
        ));
    }

    #[test]
    fn test_unapplied_terminal_node_reconciled() {
        let mut failed = node(Status::Failed);
        failed.advised = true;
        assert!(matches!(
            recovery_event(&failed),
            Some(KernelEvent::Reconcile { .. })
        ));

        failed.advise_applied = true;
        failed.adviser_response = Some(AdviserResponse::NextStep);
        assert!(recovery_event(&failed).is_none());
    }

    #[test]
    fn test_waiting_nodes_left_to_their_responses() {
        let mut waiting = node(Status::TaskWaiting);
        waiting.mode = Some(ExecutionMode::Task);
        assert!(recovery_event(&waiting).is_none());
        assert!(recovery_event(&node(Status::InputWaiting)).is_none());
    }

    #[test]
    fn test_running_and_discontinuing_reconciled() {
        assert!(recovery_event(&node(Status::Running)).is_some());
        assert!(recovery_event(&node(Status::Discontinuing)).is_some());
    }
}
