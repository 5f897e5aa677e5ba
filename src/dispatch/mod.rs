//! Task Dispatch Module
//!
//! Delegates TASK and TASK_CHAIN work to remote agents.
//!
//! # Structure
//!
//! - [`task`]: Delegate task records and wire shapes
//! - [`transport`]: Transport trait, response sink and loopback agent
//! - [`dispatcher`]: Persist, send, correlate and expire

pub mod dispatcher;
pub mod task;
pub mod transport;

pub use dispatcher::TaskDispatcher;
pub use task::{DelegateTask, TaskRequest, TaskResponse, TaskResultStatus, TaskStatus};
pub use transport::{LoopbackTransport, ResponseSink, TaskTransport};
