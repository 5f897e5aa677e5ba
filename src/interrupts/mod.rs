//! Interrupt Engine
//!
//! External control signals: abort, pause, resume, retry, mark and expire.
//!
//! # Structure
//!
//! - [`model`]: Interrupt records and types
//! - [`service`]: Validation and registration
//! - [`handlers`]: Single-flight processing and subtree discontinuation

pub mod handlers;
pub mod model;
pub mod service;

pub use model::{Interrupt, InterruptState, InterruptType, IssuedBy};
pub use service::InterruptService;
