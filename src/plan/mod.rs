//! Plan Definition Module
//!
//! The immutable DAG consumed by the kernel. Plans are produced upstream;
//! this module only loads and validates them.
//!
//! # Structure
//!
//! - [`model`]: Plan graph data structures
//! - [`parser`]: YAML loading
//! - [`validator`]: Structural checks (references, cycles, root)

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{
    FailurePropagation, NodeGroup, Plan, PlanNode, RollbackConfig, SkipCondition, StrategyConfig,
};
pub use parser::{load_plan, parse_plan};
pub use validator::{validate_plan, ValidationError};
