//! Store Snapshots
//!
//! Serializes the complete in-memory store to JSON so a kernel can be
//! stopped and resumed from disk. A restored store is handed to
//! `Orchestrator::recover` to re-drive unfinished work.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

use super::memory::{read, InMemoryStore, RestraintBucket};
use crate::dispatch::DelegateTask;
use crate::error::Result;
use crate::execution::{NodeExecution, PlanExecution};
use crate::interrupts::Interrupt;
use crate::plan::Plan;
use crate::restraint::{ResourceRestraintInstance, RestraintKey};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestraintSnapshot {
    pub key: RestraintKey,
    pub version: u64,
    pub instances: Vec<ResourceRestraintInstance>,
}

/// Point-in-time copy of every collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StoreSnapshot {
    pub plans: Vec<Plan>,
    pub plan_executions: Vec<PlanExecution>,
    pub node_executions: Vec<NodeExecution>,
    pub interrupts: Vec<Interrupt>,
    pub tasks: Vec<DelegateTask>,
    pub restraints: Vec<RestraintSnapshot>,
}

impl InMemoryStore {
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let mut plans: Vec<Plan> = read(&self.plans)?
            .values()
            .map(|plan| Plan::clone(plan))
            .collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));

        let mut plan_executions: Vec<_> = read(&self.plan_executions)?.values().cloned().collect();
        plan_executions.sort_by(|a, b| a.id.cmp(&b.id));

        let mut node_executions: Vec<_> = read(&self.nodes)?.values().cloned().collect();
        node_executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut tasks: Vec<_> = read(&self.tasks)?.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut restraints: Vec<_> = read(&self.restraints)?
            .iter()
            .map(|(key, bucket)| RestraintSnapshot {
                key: key.clone(),
                version: bucket.version,
                instances: bucket.instances.clone(),
            })
            .collect();
        restraints.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(StoreSnapshot {
            plans,
            plan_executions,
            node_executions,
            interrupts: read(&self.interrupts)?.clone(),
            tasks,
            restraints,
        })
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let plans: HashMap<_, _> = snapshot
            .plans
            .into_iter()
            .map(|plan| (plan.id.clone(), Arc::new(plan)))
            .collect();
        let plan_executions: HashMap<_, _> = snapshot
            .plan_executions
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let nodes: HashMap<_, _> = snapshot
            .node_executions
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let tasks: HashMap<_, _> = snapshot.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let restraints: HashMap<_, _> = snapshot
            .restraints
            .into_iter()
            .map(|r| {
                (
                    r.key,
                    RestraintBucket {
                        version: r.version,
                        instances: r.instances,
                    },
                )
            })
            .collect();

        Self {
            plans: RwLock::new(plans),
            plan_executions: RwLock::new(plan_executions),
            nodes: RwLock::new(nodes),
            interrupts: RwLock::new(snapshot.interrupts),
            tasks: RwLock::new(tasks),
            restraints: RwLock::new(restraints),
        }
    }
}

/// Writes a pretty-printed JSON snapshot of `store` to `path`.
pub fn save_snapshot(store: &InMemoryStore, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(&store.snapshot()?)?;
    fs::write(path, json)?;

    info!("Saved kernel state to {}", path.display());
    Ok(())
}

/// Restores a store from a snapshot written by [`save_snapshot`].
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<InMemoryStore> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let snapshot: StoreSnapshot = serde_json::from_str(&content)?;

    info!(
        "Loaded kernel state from {} ({} plan executions, {} node executions)",
        path.display(),
        snapshot.plan_executions.len(),
        snapshot.node_executions.len()
    );
    Ok(InMemoryStore::from_snapshot(snapshot))
}
