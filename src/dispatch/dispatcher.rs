//! Task Dispatcher
//!
//! Persists delegate tasks before they leave the process, correlates agent
//! responses back to them, and expires the ones nobody answered.
//!
//! Every task status change is a CAS from the pending set, so a response
//! that races the expiry sweep is applied at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use super::task::{DelegateTask, TaskRequest, TaskResponse, TaskStatus};
use super::transport::{ResponseSink, TaskTransport};
use crate::error::{KernelError, Result};
use crate::store::Store;

pub struct TaskDispatcher {
    store: Arc<dyn Store>,
    transport: Arc<dyn TaskTransport>,
    sink: ResponseSink,
    dispatch_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TaskTransport>,
        sink: ResponseSink,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            sink,
            dispatch_timeout,
        }
    }

    /// Persists and sends a task for a waiting node.
    ///
    /// # Arguments
    ///
    /// * `node_execution_id` - Node the response correlates back to
    /// * `plan_execution_id` - Owning plan execution
    /// * `parameters` - Opaque task payload
    /// * `expiry` - Deadline after which the sweep fails the node
    /// * `on_persisted` - Records the task on the node; returning `false`
    ///   cancels the send
    ///
    /// # Returns
    ///
    /// * `Ok(Some(task_id))` - Task accepted by the transport
    /// * `Ok(None)` - Cancelled by `on_persisted`
    /// * `Err(DispatchTimeout | Transport)` - Task marked FAILED
    pub async fn dispatch<F>(
        &self,
        node_execution_id: &str,
        plan_execution_id: &str,
        parameters: Value,
        expiry: DateTime<Utc>,
        on_persisted: F,
    ) -> Result<Option<String>>
    where
        F: FnOnce(&DelegateTask) -> Result<bool>,
    {
        let task = DelegateTask {
            id: uuid::Uuid::new_v4().to_string(),
            node_execution_id: node_execution_id.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
            parameters,
            expiry,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            version: 0,
        };
        self.store.insert_task(task.clone())?;

        match on_persisted(&task) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task {} cancelled before send", task.id);
                self.transition(&task.id, &TaskStatus::PENDING, TaskStatus::Failed)?;
                return Ok(None);
            }
            Err(e) => {
                self.transition(&task.id, &TaskStatus::PENDING, TaskStatus::Failed)?;
                return Err(e);
            }
        }

        let request = TaskRequest::from(&task);
        let sent = tokio::time::timeout(
            self.dispatch_timeout,
            self.transport.send(request, self.sink.clone()),
        )
        .await;

        let error = match sent {
            Ok(Ok(())) => {
                // A fast agent may already have completed it
                self.transition(&task.id, &[TaskStatus::Queued], TaskStatus::Dispatched)?;
                info!("Dispatched task {} for node {}", task.id, node_execution_id);
                return Ok(Some(task.id));
            }
            Ok(Err(e)) => e,
            Err(_) => KernelError::DispatchTimeout(self.dispatch_timeout.as_millis() as u64),
        };

        warn!("Dispatch of task {} failed: {}", task.id, error);
        self.transition(&task.id, &TaskStatus::PENDING, TaskStatus::Failed)?;
        Err(error)
    }

    /// Matches a response to its pending task and completes it.
    ///
    /// Unknown, late and duplicate responses yield `Ok(None)`.
    pub fn correlate(&self, response: &TaskResponse) -> Result<Option<DelegateTask>> {
        if self.store.get_task(&response.task_id)?.is_none() {
            warn!("Response for unknown task {}, dropping", response.task_id);
            return Ok(None);
        }
        let completed =
            self.transition(&response.task_id, &TaskStatus::PENDING, TaskStatus::Completed)?;
        if completed.is_none() {
            warn!("Late response for task {}, dropping", response.task_id);
        }
        Ok(completed)
    }

    /// Moves every overdue pending task to EXPIRED and returns them.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<DelegateTask>> {
        let mut expired = Vec::new();
        for task in self.store.find_tasks_by_status(&TaskStatus::PENDING)? {
            if !task.is_overdue(now) {
                continue;
            }
            if let Some(task) = self.transition(&task.id, &TaskStatus::PENDING, TaskStatus::Expired)? {
                info!("Task {} for node {} expired", task.id, task.node_execution_id);
                expired.push(task);
            }
        }
        Ok(expired)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<DelegateTask>> {
        self.store.get_task(task_id)
    }

    fn transition(
        &self,
        task_id: &str,
        allowed_from: &[TaskStatus],
        target: TaskStatus,
    ) -> Result<Option<DelegateTask>> {
        loop {
            let Some(current) = self.store.get_task(task_id)? else {
                return Err(KernelError::not_found("task", task_id));
            };
            if !allowed_from.contains(&current.status) {
                return Ok(None);
            }
            let expected_version = current.version;
            let mut updated = current;
            updated.status = target;
            updated.version = expected_version + 1;
            if self.store.replace_task(updated.clone(), expected_version)? {
                return Ok(Some(updated));
            }
        }
    }
}
