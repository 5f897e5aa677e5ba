//! Monitoring Module
//!
//! Observes a run through the kernel's status events.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
