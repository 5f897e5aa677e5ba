//! Built-in Steps
//!
//! Generic step types that need no business logic:
//! - `ContainerStep`: pipelines, stages, step groups and strategies
//! - `NoopStep` / `FailStep`: inline steps with a fixed outcome
//! - `RemoteTaskStep` / `RemoteChainStep`: work executed by agents
//! - `CallbackStep`: waits for an external callback

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AsyncStart, ChainLink, Step, StepContext, StepOutcome, TaskSpec};
use crate::dispatch::{TaskResponse, TaskResultStatus};
use crate::error::{KernelError, Result};
use crate::execution::ExecutionMode;

/// Step type of nodes that only hold children.
pub struct ContainerStep {
    step_type: String,
}

impl ContainerStep {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
        }
    }
}

#[async_trait]
impl Step for ContainerStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn supports(&self, _mode: ExecutionMode) -> bool {
        false
    }
}

/// Succeeds inline, echoing its parameters.
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    fn step_type(&self) -> &str {
        "Noop"
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::Sync
    }

    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let iteration = ctx.ambiance.strategy_metadata().map(|m| m.iteration);
        Ok(StepOutcome::Success(json!({
            "node": ctx.plan_node.id,
            "parameters": ctx.parameters(),
            "iteration": iteration,
        })))
    }
}

/// Fails inline with `parameters.message`.
pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    fn step_type(&self) -> &str {
        "Fail"
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::Sync
    }

    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let message = ctx
            .parameters()
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Ok(StepOutcome::Failure(message.to_string()))
    }
}

/// Hands its parameters to an agent as a single task.
pub struct RemoteTaskStep;

#[async_trait]
impl Step for RemoteTaskStep {
    fn step_type(&self) -> &str {
        "RemoteTask"
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::Task
    }

    fn obtain_task(&self, ctx: &StepContext) -> Result<TaskSpec> {
        Ok(TaskSpec::new(ctx.parameters().clone()))
    }
}

/// Dispatches `parameters.links` one after another.
pub struct RemoteChainStep;

impl RemoteChainStep {
    fn links(ctx: &StepContext) -> Result<&Vec<Value>> {
        ctx.parameters()
            .get("links")
            .and_then(Value::as_array)
            .filter(|links| !links.is_empty())
            .ok_or_else(|| {
                KernelError::Step(format!(
                    "plan node '{}' has no task chain links",
                    ctx.plan_node.id
                ))
            })
    }
}

#[async_trait]
impl Step for RemoteChainStep {
    fn step_type(&self) -> &str {
        "RemoteChain"
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::TaskChain
    }

    fn start_chain(&self, ctx: &StepContext) -> Result<TaskSpec> {
        let links = Self::links(ctx)?;
        Ok(TaskSpec::new(links[0].clone()))
    }

    fn next_chain_link(
        &self,
        ctx: &StepContext,
        link: usize,
        response: &TaskResponse,
    ) -> Result<ChainLink> {
        if response.status != TaskResultStatus::Success {
            return Ok(ChainLink::Done(StepOutcome::from_task_response(response)));
        }
        let links = Self::links(ctx)?;
        match links.get(link + 1) {
            Some(next) => Ok(ChainLink::Next(TaskSpec::new(next.clone()))),
            None => Ok(ChainLink::Done(StepOutcome::Success(response.payload.clone()))),
        }
    }
}

/// Waits for a callback keyed by its node execution id. A payload with
/// `"status": "FAILED"` fails the node.
pub struct CallbackStep;

#[async_trait]
impl Step for CallbackStep {
    fn step_type(&self) -> &str {
        "ExternalCallback"
    }

    fn supports(&self, mode: ExecutionMode) -> bool {
        mode == ExecutionMode::Async
    }

    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncStart> {
        Ok(AsyncStart::Waiting {
            callback_id: ctx.node_execution_id.clone(),
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        _callback_id: &str,
        payload: Value,
    ) -> Result<StepOutcome> {
        if payload.get("status").and_then(Value::as_str) == Some("FAILED") {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("callback reported failure");
            return Ok(StepOutcome::Failure(message.to_string()));
        }
        Ok(StepOutcome::Success(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level, StrategyMetadata};
    use crate::plan::{NodeGroup, PlanNode};

    fn ctx(node: PlanNode) -> StepContext {
        StepContext {
            node_execution_id: "n1".into(),
            plan_execution_id: "pe".into(),
            ambiance: Ambiance::new("pe", "plan"),
            plan_node: node,
            responses: vec![],
        }
    }

    #[test]
    fn test_container_supports_nothing() {
        let step = ContainerStep::new("Stage");
        assert_eq!(step.step_type(), "Stage");
        assert!(!step.supports(ExecutionMode::Sync));
        assert!(!step.supports(ExecutionMode::Children));
    }

    #[tokio::test]
    async fn test_noop_reports_iteration() {
        let mut context = ctx(PlanNode::new("a", "Noop"));
        context.ambiance = context.ambiance.child(
            Level::new("a", "n1", "Noop", NodeGroup::Step).with_strategy(StrategyMetadata {
                iteration: 2,
                total_iterations: 3,
                ..StrategyMetadata::default()
            }),
        );

        match NoopStep.execute_sync(&context).await.unwrap() {
            StepOutcome::Success(output) => assert_eq!(output["iteration"], 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_step_message() {
        let node = PlanNode::new("a", "Fail").with_parameters(json!({"message": "bad input"}));
        assert_eq!(
            FailStep.execute_sync(&ctx(node)).await.unwrap(),
            StepOutcome::Failure("bad input".to_string())
        );
    }

    #[test]
    fn test_chain_links_advance_then_finish() {
        let node = PlanNode::new("a", "RemoteChain")
            .with_parameters(json!({"links": [{"n": 1}, {"n": 2}]}));
        let context = ctx(node);

        assert_eq!(RemoteChainStep.start_chain(&context).unwrap().parameters, json!({"n": 1}));

        let ok = TaskResponse::new("t", TaskResultStatus::Success, json!({"done": true}));
        assert!(matches!(
            RemoteChainStep.next_chain_link(&context, 0, &ok).unwrap(),
            ChainLink::Next(spec) if spec.parameters == json!({"n": 2})
        ));
        assert!(matches!(
            RemoteChainStep.next_chain_link(&context, 1, &ok).unwrap(),
            ChainLink::Done(StepOutcome::Success(_))
        ));

        let failed = TaskResponse::new("t", TaskResultStatus::Failure, json!({}));
        assert!(matches!(
            RemoteChainStep.next_chain_link(&context, 0, &failed).unwrap(),
            ChainLink::Done(StepOutcome::Failure(_))
        ));
    }

    #[test]
    fn test_chain_without_links_is_error() {
        let context = ctx(PlanNode::new("a", "RemoteChain"));
        assert!(RemoteChainStep.start_chain(&context).is_err());
    }

    #[tokio::test]
    async fn test_callback_step() {
        let context = ctx(PlanNode::new("a", "ExternalCallback"));
        assert_eq!(
            CallbackStep.execute_async(&context).await.unwrap(),
            AsyncStart::Waiting {
                callback_id: "n1".to_string()
            }
        );

        let outcome = CallbackStep
            .handle_async_response(&context, "n1", json!({"status": "FAILED"}))
            .await
            .unwrap();
        assert_eq!(outcome.status(), crate::execution::Status::Failed);
    }
}
