//! Resource Constraint Step
//!
//! Queues the node on a named resource unit and keeps it in
//! RESOURCE_WAITING until its claim is promoted. The claim is held until
//! the configured holding scope finishes, not just this node. A claim
//! whose node is discontinued first is given up by the kernel.
//!
//! # Parameters
//!
//! ```yaml
//! parameters:
//!   resource_unit: prod-deploy
//!   capacity: 1
//!   permits: 1              # optional, default 1
//!   holding_scope: PLAN     # PLAN | STAGE | STEP_GROUP | MATRIX | STEP
//!   scope_key: ACROSS_ALL   # optional, default ACROSS_ALL
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AsyncStart, Step, StepContext, StepOutcome};
use crate::ambiance::Ambiance;
use crate::error::{KernelError, Result};
use crate::execution::{ExecutionMode, Status};
use crate::plan::NodeGroup;
use crate::restraint::{AcquireRequest, HoldingScope, RestraintKey, RestraintService, RestraintState};

pub const RESOURCE_CONSTRAINT_STEP: &str = "ResourceConstraint";

fn default_scope_key() -> String {
    "ACROSS_ALL".to_string()
}

fn default_permits() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ConstraintParameters {
    resource_unit: String,
    capacity: i64,
    #[serde(default = "default_permits")]
    permits: u32,
    #[serde(default)]
    holding_scope: HoldingScope,
    #[serde(default = "default_scope_key")]
    scope_key: String,
}

/// Resolves the execution whose completion releases a claim.
pub fn release_entity(ambiance: &Ambiance, scope: HoldingScope, node_execution_id: &str) -> String {
    let nearest = |group| ambiance.nearest(group).map(|level| level.runtime_id.clone());
    let entity = match scope {
        HoldingScope::Plan => Some(ambiance.plan_execution_id.clone()),
        HoldingScope::Stage => nearest(NodeGroup::Stage),
        HoldingScope::StepGroup => nearest(NodeGroup::StepGroup),
        HoldingScope::Matrix => nearest(NodeGroup::Strategy),
        HoldingScope::Step => None,
    };
    entity.unwrap_or_else(|| node_execution_id.to_string())
}

pub struct ResourceConstraintStep {
    restraints: Arc<RestraintService>,
}

impl ResourceConstraintStep {
    pub fn new(restraints: Arc<RestraintService>) -> Self {
        Self { restraints }
    }
}

#[async_trait]
impl Step for ResourceConstraintStep {
    fn step_type(&self) -> &str {
        RESOURCE_CONSTRAINT_STEP
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::Async
    }

    fn waiting_status(&self) -> Status {
        Status::ResourceWaiting
    }

    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncStart> {
        let params: ConstraintParameters = serde_json::from_value(ctx.parameters().clone())
            .map_err(|e| KernelError::InvalidConstraint(e.to_string()))?;

        let entity = release_entity(&ctx.ambiance, params.holding_scope, &ctx.node_execution_id);
        let request = AcquireRequest::new(
            RestraintKey::new(params.scope_key, params.resource_unit),
            params.capacity,
            ctx.node_execution_id.clone(),
        )
        .with_permits(params.permits)
        .held_by(params.holding_scope, entity);

        let instance = self.restraints.acquire(&request)?;
        if instance.state == RestraintState::Active {
            return Ok(AsyncStart::Completed(StepOutcome::Success(json!({
                "instance_id": instance.id,
                "order": instance.order,
            }))));
        }
        info!(
            "Node {} waiting on '{}' behind order {}",
            ctx.node_execution_id,
            instance.key,
            instance.order - 1
        );
        Ok(AsyncStart::Waiting {
            callback_id: instance.id,
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        callback_id: &str,
        _payload: Value,
    ) -> Result<StepOutcome> {
        match self.restraints.get(callback_id)? {
            Some(instance) if instance.state == RestraintState::Active => {
                Ok(StepOutcome::Success(json!({
                    "instance_id": instance.id,
                    "order": instance.order,
                })))
            }
            Some(instance) => Ok(StepOutcome::Error(format!(
                "restraint {} is {:?}, not active",
                instance.id, instance.state
            ))),
            None => Err(KernelError::not_found("restraint instance", callback_id)),
        }
    }
}
