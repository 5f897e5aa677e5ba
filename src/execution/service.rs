//! Status Update Pipeline
//!
//! [`NodeExecutionService::update_status_with_ops`] is the only way a node's
//! status changes. It re-reads, checks the allowed-from set, applies the
//! caller's extra operations and writes with a version CAS, retrying when
//! another writer bumped the version in between. A status that is no longer
//! acceptable yields `Ok(None)`: racing events converge without surfacing
//! an error.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};

use super::events::{EventBus, PlanStatusEvent, StatusEvent};
use super::node::NodeExecution;
use super::plan_execution::PlanExecution;
use super::status::{node_allowed_from, plan_allowed_from, Status};
use crate::error::{KernelError, Result};
use crate::store::Store;

#[derive(Clone)]
pub struct NodeExecutionService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl NodeExecutionService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn create(&self, node: NodeExecution) -> Result<NodeExecution> {
        debug!(
            "Creating node execution {} for plan node '{}'",
            node.id, node.plan_node_id
        );
        self.store.insert_node(node.clone())?;
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Result<NodeExecution> {
        self.store
            .get_node(id)?
            .ok_or_else(|| KernelError::not_found("node execution", id))
    }

    pub fn find_children_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        self.store.find_nodes_by_parent(parent_id)
    }

    pub fn update_status(&self, id: &str, target: Status) -> Result<Option<NodeExecution>> {
        self.update_status_with_ops(id, target, None, |_| {})
    }

    /// CAS status write.
    ///
    /// # Arguments
    ///
    /// * `id` - Node execution to update
    /// * `target` - New status
    /// * `allowed_from` - Overrides the transition table when given; every
    ///   entry must still be a legal predecessor of `target`
    /// * `ops` - Extra field updates applied in the same write
    ///
    /// # Returns
    ///
    /// * `Ok(Some(node))` - Updated record, event published
    /// * `Ok(None)` - Current status not allowed; nothing written
    pub fn update_status_with_ops<F>(
        &self,
        id: &str,
        target: Status,
        allowed_from: Option<&[Status]>,
        ops: F,
    ) -> Result<Option<NodeExecution>>
    where
        F: Fn(&mut NodeExecution),
    {
        let table = node_allowed_from(target);
        loop {
            let current = self.get(id)?;
            let allowed = match allowed_from {
                Some(subset) => subset.contains(&current.status),
                None => true,
            } && table.contains(&current.status);

            if !allowed {
                debug!(
                    "Cannot update status for node execution {} from {} to {}",
                    id, current.status, target
                );
                return Ok(None);
            }

            let expected_version = current.version;
            let mut updated = current.clone();
            ops(&mut updated);
            updated.status = target;
            updated.version = expected_version + 1;

            let now = Utc::now();
            if target == Status::Running && updated.start_ts.is_none() {
                updated.start_ts = Some(now);
            }
            if target.is_terminal() {
                updated.end_ts = Some(now);
            }

            if self.store.replace_node(updated.clone(), expected_version)? {
                debug!(
                    "Node execution {} ({}) {} -> {}",
                    id, updated.plan_node_id, current.status, target
                );
                self.bus.publish_node(StatusEvent {
                    node_execution_id: updated.id.clone(),
                    plan_execution_id: updated.plan_execution_id.clone(),
                    plan_node_id: updated.plan_node_id.clone(),
                    old_status: current.status,
                    new_status: target,
                    ambiance: updated.ambiance.clone(),
                    timestamp: now,
                });
                return Ok(Some(updated));
            }
        }
    }

    /// CAS write of non-status fields, applied only while `guard` holds.
    pub fn update_with<G, F>(&self, id: &str, guard: G, ops: F) -> Result<Option<NodeExecution>>
    where
        G: Fn(&NodeExecution) -> bool,
        F: Fn(&mut NodeExecution),
    {
        loop {
            let current = self.get(id)?;
            if !guard(&current) {
                return Ok(None);
            }

            let expected_version = current.version;
            let mut updated = current;
            ops(&mut updated);
            updated.version = expected_version + 1;

            if self.store.replace_node(updated.clone(), expected_version)? {
                return Ok(Some(updated));
            }
        }
    }
}

#[derive(Clone)]
pub struct PlanExecutionService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl PlanExecutionService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn create(&self, execution: PlanExecution) -> Result<PlanExecution> {
        self.store.insert_plan_execution(execution.clone())?;
        Ok(execution)
    }

    pub fn get(&self, id: &str) -> Result<PlanExecution> {
        self.store
            .get_plan_execution(id)?
            .ok_or_else(|| KernelError::not_found("plan execution", id))
    }

    /// CAS plan status write against the plan-level table.
    pub fn update_status(&self, id: &str, target: Status) -> Result<Option<PlanExecution>> {
        let allowed = plan_allowed_from(target);
        loop {
            let current = self.get(id)?;
            if !allowed.contains(&current.status) {
                if current.status != target {
                    warn!(
                        "Cannot update plan execution {} from {} to {}",
                        id, current.status, target
                    );
                }
                return Ok(None);
            }

            let expected_version = current.version;
            let mut updated = current.clone();
            updated.status = target;
            updated.version = expected_version + 1;
            if target.is_terminal() {
                updated.end_ts = Some(Utc::now());
            }

            if self.store.replace_plan_execution(updated.clone(), expected_version)? {
                debug!("Plan execution {} {} -> {}", id, current.status, target);
                self.bus.publish_plan(PlanStatusEvent {
                    plan_execution_id: id.to_string(),
                    old_status: current.status,
                    new_status: target,
                    timestamp: Utc::now(),
                });
                return Ok(Some(updated));
            }
        }
    }
}
