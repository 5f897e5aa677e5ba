//! Task Transport
//!
//! The seam between the kernel and whatever carries tasks to agents.
//! Responses come back through a [`ResponseSink`] onto the kernel queue,
//! so a transport never touches node state.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use super::task::{TaskRequest, TaskResponse, TaskResultStatus};
use crate::error::{KernelError, Result};
use crate::execution::{EventBus, KernelEvent};

/// Delivers agent responses to the kernel.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    bus: EventBus,
}

impl ResponseSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn respond(&self, response: TaskResponse) {
        debug!("Task {} responded {:?}", response.task_id, response.status);
        self.bus.emit(KernelEvent::TaskResponse(response));
    }
}

#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Hands a request to an agent. Returning `Ok` means the transport
    /// accepted it; the result arrives later through `sink`.
    async fn send(&self, request: TaskRequest, sink: ResponseSink) -> Result<()>;
}

/// In-process transport that plays the agent itself.
///
/// Behaviour is driven by the task parameters:
/// - `duration_ms`: time before responding (default 0)
/// - `result`: `SUCCESS`, `FAILURE` or `ERROR` (default `SUCCESS`)
/// - `respond`: `false` to never answer, leaving the task to expire
/// - `reject`: `true` to refuse the request outright
/// - `send_delay_ms`: time before the send itself returns
#[derive(Debug, Default, Clone)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }

    fn result_status(parameters: &Value) -> TaskResultStatus {
        match parameters.get("result").and_then(Value::as_str) {
            Some("FAILURE") => TaskResultStatus::Failure,
            Some("ERROR") => TaskResultStatus::Error,
            _ => TaskResultStatus::Success,
        }
    }
}

#[async_trait]
impl TaskTransport for LoopbackTransport {
    async fn send(&self, request: TaskRequest, sink: ResponseSink) -> Result<()> {
        let params = &request.parameters;
        let millis = |key: &str| params.get(key).and_then(Value::as_u64).unwrap_or(0);

        if params.get("reject").and_then(Value::as_bool).unwrap_or(false) {
            return Err(KernelError::Transport(format!(
                "agent rejected task {}",
                request.task_id
            )));
        }

        let send_delay = millis("send_delay_ms");
        if send_delay > 0 {
            tokio::time::sleep(Duration::from_millis(send_delay)).await;
        }

        if !params.get("respond").and_then(Value::as_bool).unwrap_or(true) {
            debug!("Loopback task {} will not respond", request.task_id);
            return Ok(());
        }

        let duration = Duration::from_millis(millis("duration_ms"));
        let status = Self::result_status(params);
        let payload = match status {
            TaskResultStatus::Success => json!({ "task_id": request.task_id, "output": params.get("output") }),
            _ => json!({
                "message": params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("task reported failure"),
            }),
        };

        let task_id = request.task_id;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            sink.respond(TaskResponse::new(task_id, status, payload));
        });
        Ok(())
    }
}
