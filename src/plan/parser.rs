//! Plan Parser
//!
//! Loads already-built plan graphs from YAML (or JSON, which YAML accepts)
//! and validates them before they reach the kernel.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Plan;
use super::validator::validate_plan;
use crate::error::{KernelError, Result};

/// Loads a plan from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the plan file
///
/// # Returns
///
/// * `Ok(Plan)` - Successfully loaded and validated plan
/// * `Err` - Read, parse or validation error
///
/// # Example
///
/// ```rust,no_run
/// use pipeline_kernel::plan::load_plan;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let plan = load_plan("demos/pipeline.yaml")?;
///     println!("Loaded {} nodes", plan.len());
///     Ok(())
/// }
/// ```
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan> {
    let path = path.as_ref();
    info!("Loading plan from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        KernelError::Config(format!(
            "failed to read plan file '{}': {}",
            path.display(),
            e
        ))
    })?;

    debug!("Plan content loaded ({} bytes)", content.len());
    parse_plan(&content)
}

/// Parses and validates a plan from YAML text.
pub fn parse_plan(content: &str) -> Result<Plan> {
    let plan: Plan = serde_yaml::from_str(content)?;
    info!("Parsed plan '{}' with {} nodes", plan.id, plan.len());

    validate_plan(&plan)?;
    Ok(plan)
}
