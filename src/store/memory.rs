//! In-Memory Store
//!
//! One `RwLock` per collection. Each CAS method holds the collection's write
//! lock for the compare and the write, so it is atomic with respect to
//! every other call on the same collection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    InterruptRepository, NodeExecutionRepository, PlanExecutionRepository, PlanRepository,
    RestraintRepository, TaskRepository,
};
use crate::dispatch::{DelegateTask, TaskStatus};
use crate::error::{KernelError, Result};
use crate::execution::{NodeExecution, PlanExecution, Status};
use crate::interrupts::{Interrupt, InterruptState, InterruptType};
use crate::plan::Plan;
use crate::restraint::{ResourceRestraintInstance, RestraintKey};

/// Instances of one restraint key plus its commit version.
#[derive(Debug, Clone, Default)]
pub(crate) struct RestraintBucket {
    pub(crate) version: u64,
    pub(crate) instances: Vec<ResourceRestraintInstance>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    pub(crate) plans: RwLock<HashMap<String, Arc<Plan>>>,
    pub(crate) plan_executions: RwLock<HashMap<String, PlanExecution>>,
    pub(crate) nodes: RwLock<HashMap<String, NodeExecution>>,
    pub(crate) interrupts: RwLock<Vec<Interrupt>>,
    pub(crate) tasks: RwLock<HashMap<String, DelegateTask>>,
    pub(crate) restraints: RwLock<HashMap<RestraintKey, RestraintBucket>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|e| KernelError::Store(e.to_string()))
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|e| KernelError::Store(e.to_string()))
}

fn duplicate(kind: &str, id: &str) -> KernelError {
    KernelError::Store(format!("duplicate {} id '{}'", kind, id))
}

impl PlanRepository for InMemoryStore {
    fn save_plan(&self, plan: Plan) -> Result<()> {
        write(&self.plans)?.insert(plan.id.clone(), Arc::new(plan));
        Ok(())
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<Arc<Plan>>> {
        Ok(read(&self.plans)?.get(plan_id).cloned())
    }
}

impl PlanExecutionRepository for InMemoryStore {
    fn insert_plan_execution(&self, execution: PlanExecution) -> Result<()> {
        let mut guard = write(&self.plan_executions)?;
        if guard.contains_key(&execution.id) {
            return Err(duplicate("plan execution", &execution.id));
        }
        guard.insert(execution.id.clone(), execution);
        Ok(())
    }

    fn get_plan_execution(&self, id: &str) -> Result<Option<PlanExecution>> {
        Ok(read(&self.plan_executions)?.get(id).cloned())
    }

    fn replace_plan_execution(&self, execution: PlanExecution, expected_version: u64) -> Result<bool> {
        let mut guard = write(&self.plan_executions)?;
        match guard.get_mut(&execution.id) {
            Some(current) if current.version == expected_version => {
                *current = execution;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_plan_executions(&self) -> Result<Vec<PlanExecution>> {
        let mut executions: Vec<_> = read(&self.plan_executions)?.values().cloned().collect();
        executions.sort_by(|a, b| a.start_ts.cmp(&b.start_ts).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }
}

fn in_creation_order(mut nodes: Vec<NodeExecution>) -> Vec<NodeExecution> {
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    nodes
}

impl NodeExecutionRepository for InMemoryStore {
    fn insert_node(&self, node: NodeExecution) -> Result<()> {
        let mut guard = write(&self.nodes)?;
        if guard.contains_key(&node.id) {
            return Err(duplicate("node execution", &node.id));
        }
        guard.insert(node.id.clone(), node);
        Ok(())
    }

    fn get_node(&self, id: &str) -> Result<Option<NodeExecution>> {
        Ok(read(&self.nodes)?.get(id).cloned())
    }

    fn replace_node(&self, node: NodeExecution, expected_version: u64) -> Result<bool> {
        let mut guard = write(&self.nodes)?;
        match guard.get_mut(&node.id) {
            Some(current) if current.version == expected_version => {
                *current = node;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_nodes_by_parent(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        let nodes = read(&self.nodes)?
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        Ok(in_creation_order(nodes))
    }

    fn find_nodes_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let nodes = read(&self.nodes)?
            .values()
            .filter(|n| n.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        Ok(in_creation_order(nodes))
    }

    fn find_nodes_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>> {
        let nodes = read(&self.nodes)?
            .values()
            .filter(|n| statuses.contains(&n.status))
            .cloned()
            .collect();
        Ok(in_creation_order(nodes))
    }

    fn find_nodes_by_previous(&self, previous_id: &str) -> Result<Vec<NodeExecution>> {
        let nodes = read(&self.nodes)?
            .values()
            .filter(|n| n.previous_id.as_deref() == Some(previous_id))
            .cloned()
            .collect();
        Ok(in_creation_order(nodes))
    }
}

impl InterruptRepository for InMemoryStore {
    fn insert_interrupt_unless_pending(
        &self,
        interrupt: Interrupt,
        conflicts: &[InterruptType],
    ) -> Result<bool> {
        let mut guard = write(&self.interrupts)?;
        if guard.iter().any(|i| i.id == interrupt.id) {
            return Err(duplicate("interrupt", &interrupt.id));
        }
        let conflicting = guard.iter().any(|i| {
            i.plan_execution_id == interrupt.plan_execution_id
                && i.is_plan_level()
                && i.state.is_pending()
                && conflicts.contains(&i.kind)
        });
        if conflicting {
            return Ok(false);
        }
        guard.push(interrupt);
        Ok(true)
    }

    fn get_interrupt(&self, id: &str) -> Result<Option<Interrupt>> {
        Ok(read(&self.interrupts)?.iter().find(|i| i.id == id).cloned())
    }

    fn replace_interrupt(&self, interrupt: Interrupt, expected_version: u64) -> Result<bool> {
        let mut guard = write(&self.interrupts)?;
        match guard.iter_mut().find(|i| i.id == interrupt.id) {
            Some(current) if current.version == expected_version => {
                *current = interrupt;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_interrupts(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        Ok(read(&self.interrupts)?
            .iter()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect())
    }

    fn claim_next_interrupt(&self, plan_execution_id: &str) -> Result<Option<Interrupt>> {
        let mut guard = write(&self.interrupts)?;
        let in_flight = guard.iter().any(|i| {
            i.plan_execution_id == plan_execution_id && i.state == InterruptState::Processing
        });
        if in_flight {
            return Ok(None);
        }
        let next = guard.iter_mut().find(|i| {
            i.plan_execution_id == plan_execution_id && i.state == InterruptState::Registered
        });
        Ok(next.map(|interrupt| {
            interrupt.state = InterruptState::Processing;
            interrupt.version += 1;
            interrupt.clone()
        }))
    }
}

impl TaskRepository for InMemoryStore {
    fn insert_task(&self, task: DelegateTask) -> Result<()> {
        let mut guard = write(&self.tasks)?;
        if guard.contains_key(&task.id) {
            return Err(duplicate("delegate task", &task.id));
        }
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<DelegateTask>> {
        Ok(read(&self.tasks)?.get(id).cloned())
    }

    fn replace_task(&self, task: DelegateTask, expected_version: u64) -> Result<bool> {
        let mut guard = write(&self.tasks)?;
        match guard.get_mut(&task.id) {
            Some(current) if current.version == expected_version => {
                *current = task;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<DelegateTask>> {
        let mut tasks: Vec<_> = read(&self.tasks)?
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

impl RestraintRepository for InMemoryStore {
    fn load_restraint_key(&self, key: &RestraintKey) -> Result<(Vec<ResourceRestraintInstance>, u64)> {
        let guard = read(&self.restraints)?;
        Ok(guard
            .get(key)
            .map(|bucket| (bucket.instances.clone(), bucket.version))
            .unwrap_or_default())
    }

    fn commit_restraint_key(
        &self,
        key: &RestraintKey,
        expected_version: u64,
        changes: Vec<ResourceRestraintInstance>,
    ) -> Result<bool> {
        let mut guard = write(&self.restraints)?;
        let bucket = guard.entry(key.clone()).or_default();
        if bucket.version != expected_version {
            return Ok(false);
        }

        let mut instances = bucket.instances.clone();
        for change in changes {
            let order_taken = instances
                .iter()
                .any(|i| i.order == change.order && i.id != change.id);
            if order_taken {
                return Ok(false);
            }
            match instances.iter_mut().find(|i| i.id == change.id) {
                Some(existing) => *existing = change,
                None => instances.push(change),
            }
        }
        instances.sort_by_key(|i| i.order);

        bucket.instances = instances;
        bucket.version += 1;
        Ok(true)
    }

    fn get_restraint_instance(&self, id: &str) -> Result<Option<ResourceRestraintInstance>> {
        Ok(read(&self.restraints)?
            .values()
            .flat_map(|bucket| bucket.instances.iter())
            .find(|i| i.id == id)
            .cloned())
    }

    fn find_restraint_instances_by_release_entity(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceRestraintInstance>> {
        let mut instances: Vec<_> = read(&self.restraints)?
            .values()
            .flat_map(|bucket| bucket.instances.iter())
            .filter(|i| i.release_entity_id == release_entity_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }
}
