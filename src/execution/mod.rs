//! Execution Records Module
//!
//! Persisted run state and the single status-update pipeline.
//!
//! # Structure
//!
//! - [`status`]: Status and mode enums plus the transition tables
//! - [`node`]: Node execution records
//! - [`plan_execution`]: Plan execution records
//! - [`service`]: CAS status updates for nodes and plans
//! - [`events`]: Kernel queue and observer stream

pub mod events;
pub mod node;
pub mod plan_execution;
pub mod service;
pub mod status;

pub use events::{EventBus, ExecutionEvent, KernelEvent, PlanStatusEvent, StatusEvent};
pub use node::{ExecutableResponse, FailureInfo, FailureKind, NodeExecution};
pub use plan_execution::{PlanExecution, PlanExecutionMetadata};
pub use service::{NodeExecutionService, PlanExecutionService};
pub use status::{can_transition, node_allowed_from, plan_allowed_from, ExecutionMode, Status};
