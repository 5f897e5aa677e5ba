//! Advising
//!
//! Decides what follows a terminal node: next sibling, retry, repair or
//! ending the plan.
//!
//! # Structure
//!
//! - [`model`]: Adviser configs and responses
//! - [`evaluate`]: Pure adviser table
//! - [`apply`]: Two-phase claim and application

pub mod apply;
pub mod evaluate;
pub mod model;

pub use apply::{advise, apply, close_intervention, resolve_intervention};
pub use evaluate::{evaluate, AdviseInput};
pub use model::{AdviserConfig, AdviserKind, AdviserResponse, RepairAction};
