//! PipelineKernel - Execution Orchestration Kernel
//!
//! Walks a plan DAG (pipeline, stages, step groups, steps) to completion.
//! Every node execution moves through a persisted status state machine
//! updated only by compare-and-set, so concurrent workers, late agent
//! responses and user interrupts never corrupt a run.
//!
//! # Architecture
//!
//! - [`plan`]: Immutable plan graph, YAML loading and validation
//! - [`execution`]: Node and plan execution records, statuses, events
//! - [`engine`]: Worker pool, event handlers, roll-up and recovery
//! - [`facilitation`]: Picks the execution mode of each node
//! - [`advising`]: Decides what follows a terminal node
//! - [`dispatch`]: Delegate tasks handed to remote agents
//! - [`interrupts`]: Abort, pause, resume, retry and manual repair
//! - [`restraint`]: FIFO capacity queues for shared resources
//! - [`steps`]: Step behaviours keyed by step type
//! - [`store`]: Persistence seam and the in-memory store
//! - [`monitoring`]: Timelines built from status events
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use pipeline_kernel::config::KernelConfig;
//! use pipeline_kernel::engine::KernelBuilder;
//! use pipeline_kernel::execution::PlanExecutionMetadata;
//! use pipeline_kernel::load_plan;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plan = load_plan("demos/pipeline.yaml")?;
//!
//!     let orchestrator = KernelBuilder::new(KernelConfig::default()).start()?;
//!     let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual())?;
//!
//!     let execution = orchestrator.wait_for_plan(&id, Duration::from_secs(60)).await?;
//!     println!("Plan finished as {}", execution.status);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod advising;
pub mod ambiance;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod execution;
pub mod facilitation;
pub mod interrupts;
pub mod monitoring;
pub mod plan;
pub mod restraint;
pub mod steps;
pub mod store;

// Re-export commonly used types
pub use config::KernelConfig;
pub use engine::{KernelBuilder, Orchestrator};
pub use error::{KernelError, Result};
pub use execution::{NodeExecution, PlanExecution, Status};
pub use interrupts::InterruptType;
pub use plan::{load_plan, Plan, PlanNode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PipelineKernel";
