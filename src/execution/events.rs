//! Kernel Events
//!
//! Two channels leave the status pipeline:
//! - the kernel queue ([`KernelEvent`]), drained by the orchestrator's
//!   worker pool and feeding back into the single CAS entry point
//! - the observer stream ([`ExecutionEvent`]), a broadcast for UIs,
//!   timelines and `wait_for_plan`

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::status::Status;
use crate::ambiance::Ambiance;
use crate::dispatch::TaskResponse;

const OBSERVER_CAPACITY: usize = 1024;

/// Published on every successful node status write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub plan_node_id: String,
    pub old_status: Status,
    pub new_status: Status,
    pub ambiance: Ambiance,
    pub timestamp: DateTime<Utc>,
}

/// Published on every successful plan status write.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStatusEvent {
    pub plan_execution_id: String,
    pub old_status: Status,
    pub new_status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Node(StatusEvent),
    Plan(PlanStatusEvent),
}

/// Unit of work for the orchestrator's worker pool.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    StartNode {
        node_execution_id: String,
    },
    /// Run a facilitated node after its initial wait
    ExecuteNode {
        node_execution_id: String,
    },
    StatusUpdate(StatusEvent),
    InterruptRegistered {
        plan_execution_id: String,
    },
    /// Finish an interrupt left PROCESSING by a stopped process (recovery)
    ResumeInterrupts {
        plan_execution_id: String,
    },
    TaskResponse(TaskResponse),
    AsyncResponse {
        node_execution_id: String,
        callback_id: String,
        payload: Value,
    },
    InputSubmitted {
        node_execution_id: String,
    },
    /// Re-run the terminal-status handling for a node (recovery)
    Reconcile {
        node_execution_id: String,
    },
}

/// Cloneable handle onto both event channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    kernel: mpsc::UnboundedSender<KernelEvent>,
    observers: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KernelEvent>) {
        let (kernel, receiver) = mpsc::unbounded_channel();
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        (Self { kernel, observers }, receiver)
    }

    pub fn emit(&self, event: KernelEvent) {
        if let Err(e) = self.kernel.send(event) {
            debug!("Kernel queue closed, dropping {:?}", e.0);
        }
    }

    /// Emits after `delay` without holding a worker.
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
    pub fn emit_after(&self, delay: Duration, event: KernelEvent) {
        if delay.is_zero() {
            self.emit(event);
            return;
        }
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.emit(event);
        });
    }

    pub fn publish_node(&self, event: StatusEvent) {
        // No subscribers is fine
        self.observers.send(ExecutionEvent::Node(event.clone())).ok();
        self.emit(KernelEvent::StatusUpdate(event));
    }

    pub fn publish_plan(&self, event: PlanStatusEvent) {
        self.observers.send(ExecutionEvent::Plan(event)).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.observers.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event() -> StatusEvent {
        StatusEvent {
            node_execution_id: "n1".to_string(),
            plan_execution_id: "pe".to_string(),
            plan_node_id: "a".to_string(),
            old_status: Status::Queued,
            new_status: Status::Running,
            ambiance: Ambiance::new("pe", "plan"),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_node_reaches_both_channels() {
        let (bus, mut kernel_rx) = EventBus::new();
        let mut observer = bus.subscribe();

        bus.publish_node(status_event());

        assert!(matches!(
            kernel_rx.try_recv().unwrap(),
            KernelEvent::StatusUpdate(e) if e.node_execution_id == "n1"
        ));
        assert!(matches!(observer.try_recv().unwrap(), ExecutionEvent::Node(_)));
    }

    #[test]
    fn test_emit_after_closed_queue_is_silent() {
        let (bus, kernel_rx) = EventBus::new();
        drop(kernel_rx);
        bus.emit(KernelEvent::StartNode {
            node_execution_id: "n1".to_string(),
        });
    }

    #[tokio::test]
    async fn test_emit_after_delay() {
        let (bus, mut kernel_rx) = EventBus::new();
        bus.emit_after(
            Duration::from_millis(20),
            KernelEvent::StartNode {
                node_execution_id: "n1".to_string(),
            },
        );
        assert!(kernel_rx.try_recv().is_err());

        let event = tokio::time::timeout(Duration::from_secs(1), kernel_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, KernelEvent::StartNode { .. }));
    }
}
