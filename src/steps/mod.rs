//! Step Units
//!
//! The kernel treats a step as an opaque unit that reports a result. Each
//! step type implements [`Step`] for the modes it supports and is looked up
//! through an explicit [`StepRegistry`] built at startup.
//!
//! # Structure
//!
//! - [`builtin`]: Container, inline, remote and callback steps
//! - [`restraint`]: Resource-constraint queue step

pub mod builtin;
pub mod restraint;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::dispatch::{TaskResponse, TaskResultStatus};
use crate::error::{KernelError, Result};
use crate::execution::{ExecutableResponse, ExecutionMode, NodeExecution, Status};
use crate::plan::PlanNode;

pub use builtin::{CallbackStep, ContainerStep, FailStep, NoopStep, RemoteChainStep, RemoteTaskStep};
pub use restraint::ResourceConstraintStep;

/// Result reported by a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    Failure(String),
    Error(String),
}

impl StepOutcome {
    pub fn status(&self) -> Status {
        match self {
            StepOutcome::Success(_) => Status::Succeeded,
            StepOutcome::Failure(_) => Status::Failed,
            StepOutcome::Error(_) => Status::Errored,
        }
    }

    /// Maps an agent's task response onto an outcome.
    pub fn from_task_response(response: &TaskResponse) -> Self {
        let message = || {
            response
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("task reported failure")
                .to_string()
        };
        match response.status {
            TaskResultStatus::Success => StepOutcome::Success(response.payload.clone()),
            TaskResultStatus::Failure => StepOutcome::Failure(message()),
            TaskResultStatus::Error => StepOutcome::Error(message()),
        }
    }
}

/// Result of starting an ASYNC execution.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncStart {
    /// Finished without waiting
    Completed(StepOutcome),
    /// Completion arrives later, keyed by `callback_id`
    Waiting { callback_id: String },
}

/// Work handed to task dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub parameters: Value,
    /// Falls back to the kernel default when unset
    pub expiry_ms: Option<u64>,
}

impl TaskSpec {
    /// Reads an optional `expiry_ms` from the parameters.
    pub fn new(parameters: Value) -> Self {
        let expiry_ms = parameters.get("expiry_ms").and_then(Value::as_u64);
        Self {
            parameters,
            expiry_ms,
        }
    }
}

/// Next step of a TASK_CHAIN.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainLink {
    Next(TaskSpec),
    Done(StepOutcome),
}

/// What a step sees of the node it runs for.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub ambiance: Ambiance,
    pub plan_node: PlanNode,
    pub responses: Vec<ExecutableResponse>,
}

impl StepContext {
    pub fn new(node: &NodeExecution, plan_node: &PlanNode) -> Self {
        Self {
            node_execution_id: node.id.clone(),
            plan_execution_id: node.plan_execution_id.clone(),
            ambiance: node.ambiance.clone(),
            plan_node: plan_node.clone(),
            responses: node.executable_responses.clone(),
        }
    }

    pub fn parameters(&self) -> &Value {
        &self.plan_node.parameters
    }
}

fn unsupported(step_type: &str, mode: ExecutionMode) -> KernelError {
    KernelError::Step(format!("step '{}' does not support {:?} mode", step_type, mode))
}

/// A step implementation. Only the methods for supported modes are called.
#[async_trait]
pub trait Step: Send + Sync {
    fn step_type(&self) -> &str;

    fn supports(&self, mode: ExecutionMode) -> bool;

    async fn execute_sync(&self, _ctx: &StepContext) -> Result<StepOutcome> {
        Err(unsupported(self.step_type(), ExecutionMode::Sync))
    }

    async fn execute_async(&self, _ctx: &StepContext) -> Result<AsyncStart> {
        Err(unsupported(self.step_type(), ExecutionMode::Async))
    }

    /// Status held while an ASYNC execution waits.
    fn waiting_status(&self) -> Status {
        Status::AsyncWaiting
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        _callback_id: &str,
        payload: Value,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Success(payload))
    }

    fn obtain_task(&self, _ctx: &StepContext) -> Result<TaskSpec> {
        Err(unsupported(self.step_type(), ExecutionMode::Task))
    }

    fn handle_task_response(&self, _ctx: &StepContext, response: &TaskResponse) -> StepOutcome {
        StepOutcome::from_task_response(response)
    }

    fn start_chain(&self, _ctx: &StepContext) -> Result<TaskSpec> {
        Err(unsupported(self.step_type(), ExecutionMode::TaskChain))
    }

    /// Decides what follows chain link `link` given its response.
    fn next_chain_link(
        &self,
        _ctx: &StepContext,
        _link: usize,
        response: &TaskResponse,
    ) -> Result<ChainLink> {
        Ok(ChainLink::Done(StepOutcome::from_task_response(response)))
    }

    /// Called when the node is discontinued while in flight.
    async fn handle_abort(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// Explicit step-type → implementation map, built once and shared.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.step_type().to_string(), step);
    }

    pub fn with(mut self, step: Arc<dyn Step>) -> Self {
        self.register(step);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.steps.keys().map(String::as_str).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_status() {
        assert_eq!(StepOutcome::Success(json!({})).status(), Status::Succeeded);
        assert_eq!(StepOutcome::Failure("x".into()).status(), Status::Failed);
        assert_eq!(StepOutcome::Error("x".into()).status(), Status::Errored);
    }

    #[test]
    fn test_outcome_from_task_response() {
        let response = TaskResponse::new("t1", TaskResultStatus::Failure, json!({"message": "exit 1"}));
        assert_eq!(
            StepOutcome::from_task_response(&response),
            StepOutcome::Failure("exit 1".to_string())
        );

        let response = TaskResponse::new("t1", TaskResultStatus::Success, json!({"out": 1}));
        assert_eq!(
            StepOutcome::from_task_response(&response),
            StepOutcome::Success(json!({"out": 1}))
        );
    }

    #[test]
    fn test_task_spec_reads_expiry() {
        let spec = TaskSpec::new(json!({"expiry_ms": 250}));
        assert_eq!(spec.expiry_ms, Some(250));
        assert_eq!(TaskSpec::new(json!({})).expiry_ms, None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StepRegistry::new()
            .with(Arc::new(NoopStep))
            .with(Arc::new(FailStep));

        assert!(registry.contains("Noop"));
        assert!(registry.get("Fail").is_some());
        assert!(registry.get("Deploy").is_none());
        assert_eq!(registry.step_types(), vec!["Fail", "Noop"]);
    }

    #[tokio::test]
    async fn test_default_methods_reject_unsupported_modes() {
        let ctx = StepContext {
            node_execution_id: "n1".into(),
            plan_execution_id: "pe".into(),
            ambiance: Ambiance::new("pe", "plan"),
            plan_node: PlanNode::new("a", "Noop"),
            responses: vec![],
        };
        let err = NoopStep.execute_async(&ctx).await.unwrap_err();
        assert!(matches!(err, KernelError::Step(_)));
        assert!(NoopStep.obtain_task(&ctx).is_err());
    }
}
