//! Kernel Context
//!
//! Everything a worker needs to handle one event, shared behind an `Arc`.
//! The context holds no execution state of its own: every decision is
//! made from what the store returns.

use std::sync::Arc;

use log::warn;
use serde_json::json;

use crate::config::KernelConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{KernelError, Result};
use crate::execution::{
    EventBus, KernelEvent, NodeExecution, NodeExecutionService, PlanExecutionService,
};
use crate::facilitation::Facilitator;
use crate::interrupts::InterruptService;
use crate::plan::{Plan, PlanNode};
use crate::restraint::{ResourceRestraintInstance, RestraintService, RestraintState};
use crate::steps::{Step, StepRegistry};
use crate::store::Store;

pub struct KernelContext {
    pub config: KernelConfig,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub steps: StepRegistry,
    pub nodes: NodeExecutionService,
    pub plans: PlanExecutionService,
    pub interrupts: InterruptService,
    pub restraints: Arc<RestraintService>,
    pub dispatcher: TaskDispatcher,
    pub facilitator: Facilitator,
}

impl KernelContext {
    /// Plan graph behind a plan execution.
    pub fn plan(&self, plan_execution_id: &str) -> Result<Arc<Plan>> {
        let execution = self.plans.get(plan_execution_id)?;
        self.store
            .get_plan(&execution.plan_id)?
            .ok_or_else(|| KernelError::not_found("plan", execution.plan_id))
    }

    pub fn plan_node(&self, node: &NodeExecution) -> Result<PlanNode> {
        let plan = self.plan(&node.plan_execution_id)?;
        plan.node(&node.plan_node_id)
            .cloned()
            .ok_or_else(|| KernelError::not_found("plan node", node.plan_node_id.clone()))
    }

    pub fn step(&self, step_type: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .ok_or_else(|| KernelError::Step(format!("no step registered for type '{}'", step_type)))
    }

    /// Releases claims held by a finished execution scope and wakes the
    /// nodes whose claims were promoted.
    pub fn release_restraints(&self, release_entity_id: &str) {
        match self.restraints.release_by_entity(release_entity_id) {
            Ok(promoted) => self.resume_promoted(promoted),
            Err(e) => warn!("Failed to release restraints held by {}: {}", release_entity_id, e),
        }
    }

    /// Gives up the claims a discontinued node is still waiting on or has
    /// not consumed yet, waking whoever moves up the queue.
    pub fn release_claims(&self, node: &NodeExecution) {
        for instance_id in node.callback_ids() {
            let instance = match self.restraints.get(&instance_id) {
                Ok(Some(instance)) => instance,
                // Not a restraint callback
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load restraint {}: {}", instance_id, e);
                    continue;
                }
            };
            if instance.claimant_id != node.id || instance.state == RestraintState::Finished {
                continue;
            }
            match self.restraints.release(&instance_id) {
                Ok(promoted) => self.resume_promoted(promoted),
                Err(e) => warn!("Failed to release restraint {}: {}", instance_id, e),
            }
        }
    }

    pub fn resume_promoted(&self, promoted: Vec<ResourceRestraintInstance>) {
        for instance in promoted {
            self.bus.emit(KernelEvent::AsyncResponse {
                node_execution_id: instance.claimant_id,
                callback_id: instance.id,
                payload: json!({}),
            });
        }
    }
}
