//! Persistence Contract
//!
//! Repository traits the kernel runs against. Every mutation of an existing
//! record is a compare-and-swap on its `version`: `replace_*` returns
//! `Ok(false)` when the stored version no longer matches, which callers
//! treat as a lost race rather than an error.
//!
//! # Structure
//!
//! - [`memory`]: `RwLock`-backed in-process implementation
//! - [`snapshot`]: JSON snapshots of the in-memory store

pub mod memory;
pub mod snapshot;

use std::sync::Arc;

use crate::dispatch::{DelegateTask, TaskStatus};
use crate::error::Result;
use crate::execution::{NodeExecution, PlanExecution, Status};
use crate::interrupts::{Interrupt, InterruptType};
use crate::plan::Plan;
use crate::restraint::{ResourceRestraintInstance, RestraintKey};

pub use memory::InMemoryStore;
pub use snapshot::{load_snapshot, save_snapshot, StoreSnapshot};

pub trait PlanRepository: Send + Sync {
    fn save_plan(&self, plan: Plan) -> Result<()>;

    fn get_plan(&self, plan_id: &str) -> Result<Option<Arc<Plan>>>;
}

pub trait PlanExecutionRepository: Send + Sync {
    fn insert_plan_execution(&self, execution: PlanExecution) -> Result<()>;

    fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>>;

    /// Writes `execution` if the stored version equals `expected_version`.
    fn replace_plan_execution(&self, execution: PlanExecution, expected_version: u64) -> Result<bool>;

    fn list_plan_executions(&self) -> Result<Vec<PlanExecution>>;
}

pub trait NodeExecutionRepository: Send + Sync {
    fn insert_node(&self, node: NodeExecution) -> Result<()>;

    fn get_node(&self, id: &str) -> Result<Option<NodeExecution>>;

    /// Writes `node` if the stored version equals `expected_version`.
    fn replace_node(&self, node: NodeExecution, expected_version: u64) -> Result<bool>;

    /// Children in creation order.
    fn find_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    fn find_nodes_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    fn find_nodes_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>>;

    fn find_nodes_by_previous(&self, previous_id: &str) -> Result<Vec<NodeExecution>>;
}

pub trait InterruptRepository: Send + Sync {
    /// Inserts `interrupt` unless a pending plan-level interrupt of one of
    /// the `conflicts` kinds exists for the same plan execution.
    fn insert_interrupt_unless_pending(
        &self,
        interrupt: Interrupt,
        conflicts: &[InterruptType],
    ) -> Result<bool>;

    fn get_interrupt(&self, id: &str) -> Result<Option<Interrupt>>;

    fn replace_interrupt(&self, interrupt: Interrupt, expected_version: u64) -> Result<bool>;

    /// Interrupts of a plan execution in registration order.
    fn find_interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>>;

    /// Moves the oldest REGISTERED interrupt to PROCESSING, unless another
    /// interrupt of the same plan execution is already PROCESSING.
    fn claim_next_interrupt(&self, plan_execution_id: &str) -> Result<Option<Interrupt>>;
}

pub trait TaskRepository: Send + Sync {
    fn insert_task(&self, task: DelegateTask) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<Option<DelegateTask>>;

    fn replace_task(&self, task: DelegateTask, expected_version: u64) -> Result<bool>;

    fn find_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<DelegateTask>>;
}

pub trait RestraintRepository: Send + Sync {
    /// All instances of a key, ordered by `order`, with the key's version.
    fn load_restraint_key(&self, key: &RestraintKey) -> Result<(Vec<ResourceRestraintInstance>, u64)>;

    /// Upserts `changes` and bumps the key version if it still equals
    /// `expected_version`. Rejects duplicate `order` values within the key.
    fn commit_restraint_key(
        &self,
        key: &RestraintKey,
        expected_version: u64,
        changes: Vec<ResourceRestraintInstance>,
    ) -> Result<bool>;

    fn get_restraint_instance(&self, id: &str) -> Result<Option<ResourceRestraintInstance>>;

    fn find_restraint_instances_by_release_entity(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceRestraintInstance>>;
}

/// Everything the kernel persists.
pub trait Store:
    PlanRepository
    + PlanExecutionRepository
    + NodeExecutionRepository
    + InterruptRepository
    + TaskRepository
    + RestraintRepository
{
}

impl<T> Store for T where
    T: PlanRepository
        + PlanExecutionRepository
        + NodeExecutionRepository
        + InterruptRepository
        + TaskRepository
        + RestraintRepository
{
}
