//! Orchestration Engine
//!
//! Drives plan executions from a single kernel queue. Events are handled
//! by a bounded pool of stateless workers; a background sweep expires
//! overdue tasks and intervention deadlines.
//!
//! # Structure
//!
//! - [`context`]: Shared services handed to every worker
//! - [`runner`]: Per-event handlers and the expiry sweep
//! - [`aggregator`]: Child-to-parent status roll-up
//! - [`recovery`]: Re-queues unfinished work after a restart

pub mod aggregator;
pub mod context;
pub mod recovery;
pub mod runner;

#[cfg(test)]
mod scenarios;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::ambiance::{Ambiance, Level};
use crate::config::KernelConfig;
use crate::dispatch::{LoopbackTransport, ResponseSink, TaskDispatcher, TaskResponse, TaskTransport};
use crate::error::{KernelError, Result};
use crate::execution::{
    EventBus, ExecutionEvent, KernelEvent, NodeExecution, NodeExecutionService, PlanExecution,
    PlanExecutionMetadata, PlanExecutionService, Status,
};
use crate::facilitation::{CapabilityProbe, Facilitator, StaticCapabilityProbe};
use crate::interrupts::{Interrupt, InterruptService, InterruptType};
use crate::plan::{validate_plan, Plan};
use crate::restraint::RestraintService;
use crate::steps::{
    CallbackStep, ContainerStep, FailStep, NoopStep, RemoteChainStep, RemoteTaskStep,
    ResourceConstraintStep, Step, StepRegistry,
};
use crate::store::{InMemoryStore, Store};

pub use context::KernelContext;
pub use recovery::RecoveryReport;

/// Step types registered as plain containers.
const CONTAINER_STEP_TYPES: [&str; 5] = ["Pipeline", "Stage", "StepGroup", "Section", "Strategy"];

/// Builds the step registry every orchestrator starts with.
fn default_steps(restraints: Arc<RestraintService>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step_type in CONTAINER_STEP_TYPES {
        registry.register(Arc::new(ContainerStep::new(step_type)));
    }
    registry
        .with(Arc::new(NoopStep))
        .with(Arc::new(FailStep))
        .with(Arc::new(RemoteTaskStep))
        .with(Arc::new(RemoteChainStep))
        .with(Arc::new(CallbackStep))
        .with(Arc::new(ResourceConstraintStep::new(restraints)))
}

/// Assembles an [`Orchestrator`].
///
/// # Example
///
/// ```rust,no_run
/// use pipeline_kernel::config::KernelConfig;
/// use pipeline_kernel::engine::KernelBuilder;
/// use pipeline_kernel::execution::PlanExecutionMetadata;
/// use pipeline_kernel::plan::load_plan;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = KernelBuilder::new(KernelConfig::default()).start()?;
///     let plan = load_plan("demos/pipeline.yaml")?;
///     let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual())?;
///     let execution = orchestrator.wait_for_plan(&id, Duration::from_secs(30)).await?;
///     println!("{}", execution.status);
///     Ok(())
/// }
/// ```
pub struct KernelBuilder {
    config: KernelConfig,
    store: Option<Arc<dyn Store>>,
    transport: Option<Arc<dyn TaskTransport>>,
    probe: Option<Arc<dyn CapabilityProbe>>,
    steps: Vec<Arc<dyn Step>>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            probe: None,
            steps: Vec::new(),
        }
    }

    /// Defaults to a fresh [`InMemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to the in-process [`LoopbackTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn TaskTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to a probe that owns every capability.
    pub fn with_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Registers an additional step, replacing a built-in of the same type.
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    fn build(self) -> Result<(Arc<KernelContext>, mpsc::UnboundedReceiver<KernelEvent>)> {
        self.config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn Store>);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport::new()) as Arc<dyn TaskTransport>);
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(StaticCapabilityProbe::any()) as Arc<dyn CapabilityProbe>);

        let (bus, events) = EventBus::new();
        let restraints = Arc::new(RestraintService::new(store.clone()));
        let mut steps = default_steps(restraints.clone());
        for step in self.steps {
            steps.register(step);
        }
        debug!("Registered step types: {:?}", steps.step_types());

        let ctx = KernelContext {
            nodes: NodeExecutionService::new(store.clone(), bus.clone()),
            plans: PlanExecutionService::new(store.clone(), bus.clone()),
            interrupts: InterruptService::new(store.clone(), bus.clone()),
            dispatcher: TaskDispatcher::new(
                store.clone(),
                transport,
                ResponseSink::new(bus.clone()),
                self.config.dispatch_timeout(),
            ),
            facilitator: Facilitator::new(probe, self.config.facilitation_timeout()),
            restraints,
            steps,
            store,
            bus,
            config: self.config,
        };
        Ok((Arc::new(ctx), events))
    }

    /// Builds the kernel and spawns its event loop and sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Orchestrator> {
        let (ctx, events) = self.build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            "Starting orchestrator with {} workers (sweep every {} ms)",
            ctx.config.workers, ctx.config.sweep_interval_ms
        );
        let handles = vec![
            tokio::spawn(run_event_loop(ctx.clone(), events, shutdown_rx.clone())),
            tokio::spawn(run_sweep_loop(ctx.clone(), shutdown_rx)),
        ];

        Ok(Orchestrator {
            ctx,
            shutdown,
            handles,
        })
    }
}

/// Pulls kernel events and hands each to a worker.
async fn run_event_loop(
    ctx: Arc<KernelContext>,
    mut events: mpsc::UnboundedReceiver<KernelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = Arc::new(Semaphore::new(ctx.config.workers));
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                info!("Event loop exiting: shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let description = format!("{:?}", event);
            if let Err(e) = runner::handle_event(&ctx, event).await {
                error!("Failed to handle {}: {}", description, e);
            }
            drop(permit);
        });
    }
    debug!("Event loop stopped");
}

async fn run_sweep_loop(ctx: Arc<KernelContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.sweep_interval());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = runner::sweep(&ctx, Utc::now()).await {
                    warn!("Sweep failed: {}", e);
                }
            }
        }
    }
    debug!("Sweep loop stopped");
}

/// Handle onto a running kernel.
pub struct Orchestrator {
    ctx: Arc<KernelContext>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Starts a new execution of `plan`.
    ///
    /// # Arguments
    ///
    /// * `plan` - Plan graph, validated before anything is persisted
    /// * `metadata` - Trigger and retry lineage of the run
    ///
    /// # Returns
    ///
    /// * `Ok(plan_execution_id)` - Root node queued
    /// * `Err(InvalidPlan)` - The graph failed validation
    pub fn start_plan(&self, plan: Plan, metadata: PlanExecutionMetadata) -> Result<String> {
        validate_plan(&plan)?;
        let root = plan
            .root()
            .cloned()
            .ok_or_else(|| KernelError::not_found("plan node", plan.root_id.clone()))?;

        let plan_execution_id = uuid::Uuid::new_v4().to_string();
        let root_id = uuid::Uuid::new_v4().to_string();
        let plan_id = plan.id.clone();

        self.ctx.store.save_plan(plan)?;
        self.ctx
            .plans
            .create(PlanExecution::new(&plan_execution_id, &plan_id, metadata))?;

        let level = Level::new(&root.id, &root_id, &root.step_type, root.group);
        let ambiance = Ambiance::new(&plan_execution_id, &plan_id).child(level);
        self.ctx
            .nodes
            .create(NodeExecution::new(&root_id, &root.id, ambiance))?;

        info!(
            "Started plan execution {} of plan '{}'",
            plan_execution_id, plan_id
        );
        self.ctx.bus.emit(KernelEvent::StartNode {
            node_execution_id: root_id,
        });
        Ok(plan_execution_id)
    }

    /// Registers an interrupt and returns its id.
    pub fn register_interrupt(
        &self,
        plan_execution_id: &str,
        kind: InterruptType,
        node_execution_id: Option<&str>,
    ) -> Result<String> {
        self.ctx
            .interrupts
            .register(plan_execution_id, kind, node_execution_id)
            .map(|interrupt| interrupt.id)
    }

    /// Resumes an INPUT_WAITING node with `input` as its output.
    pub fn submit_input(&self, node_execution_id: &str, input: Value) -> Result<()> {
        let resumed = self.ctx.nodes.update_status_with_ops(
            node_execution_id,
            Status::Running,
            Some(&[Status::InputWaiting]),
            |n| n.output = Some(input.clone()),
        )?;
        if resumed.is_none() {
            return Err(KernelError::Step(format!(
                "node execution '{}' is not waiting for input",
                node_execution_id
            )));
        }
        self.ctx.bus.emit(KernelEvent::InputSubmitted {
            node_execution_id: node_execution_id.to_string(),
        });
        Ok(())
    }

    /// Feeds an external callback to an ASYNC node.
    pub fn submit_async_response(&self, node_execution_id: &str, callback_id: &str, payload: Value) {
        self.ctx.bus.emit(KernelEvent::AsyncResponse {
            node_execution_id: node_execution_id.to_string(),
            callback_id: callback_id.to_string(),
            payload,
        });
    }

    /// Feeds an agent response received outside the configured transport.
    pub fn submit_task_response(&self, response: TaskResponse) {
        self.ctx.bus.emit(KernelEvent::TaskResponse(response));
    }

    /// Waits until the plan execution reaches a terminal status.
    pub async fn wait_for_plan(&self, plan_execution_id: &str, timeout: Duration) -> Result<PlanExecution> {
        // Subscribe before the first read so no transition is missed
        let mut events = self.ctx.bus.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let execution = self.ctx.plans.get(plan_execution_id)?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(KernelError::WaitTimeout(plan_execution_id.to_string())),
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(KernelError::ChannelClosed),
                Ok(_) => {}
            }
        }
    }

    /// Status-event stream for observers.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.ctx.bus.subscribe()
    }

    /// Node executions of a run, oldest first.
    pub fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let mut nodes = self.ctx.store.find_nodes_by_plan_execution(plan_execution_id)?;
        nodes.sort_by_key(|n| n.created_at);
        Ok(nodes)
    }

    pub fn plan_execution(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        self.ctx.plans.get(plan_execution_id)
    }

    pub fn interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.ctx.interrupts.list(plan_execution_id)
    }

    /// Re-queues unfinished work found in the store.
    pub fn recover(&self) -> Result<RecoveryReport> {
        recovery::recover(&self.ctx)
    }

    /// Stops the event loop and sweep. In-flight handlers run to completion.
    pub async fn shutdown(self) {
        self.shutdown.send(true).ok();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Orchestrator task ended abnormally: {}", e);
            }
        }
        info!("Orchestrator stopped");
    }
}
