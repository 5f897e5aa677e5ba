//! Resource Restraint Module
//!
//! Named, capacity-bounded resource units shared across plan executions.
//!
//! # Structure
//!
//! - [`model`]: Instances, keys and holding scopes
//! - [`service`]: FIFO acquire and release against the store

pub mod model;
pub mod service;

pub use model::{AcquireRequest, HoldingScope, ResourceRestraintInstance, RestraintKey, RestraintState};
pub use service::RestraintService;
