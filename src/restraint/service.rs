//! Resource Restraint Service
//!
//! A FIFO semaphore persisted in the store. Nothing is cached in memory:
//! every acquire and release reloads the key's instances, computes the
//! new state and commits it against the key version, retrying on conflict.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use super::model::{AcquireRequest, ResourceRestraintInstance, RestraintKey, RestraintState};
use crate::error::{KernelError, Result};
use crate::store::Store;

pub struct RestraintService {
    store: Arc<dyn Store>,
}

fn active_permits(instances: &[ResourceRestraintInstance]) -> u64 {
    instances
        .iter()
        .filter(|i| i.state == RestraintState::Active)
        .map(|i| u64::from(i.permits))
        .sum()
}

/// Promotes BLOCKED instances in ascending order while they fit. Stops at
/// the first that does not fit so later, smaller claims cannot overtake it.
fn promote_waiting(instances: &mut [ResourceRestraintInstance]) -> Vec<ResourceRestraintInstance> {
    let mut active = active_permits(instances);
    let mut promoted = Vec::new();

    let mut blocked: Vec<usize> = instances
        .iter()
        .enumerate()
        .filter(|(_, i)| i.state == RestraintState::Blocked)
        .map(|(index, _)| index)
        .collect();
    blocked.sort_by_key(|index| instances[*index].order);

    for index in blocked {
        let instance = &mut instances[index];
        let permits = u64::from(instance.permits);
        if active + permits > u64::from(instance.capacity) {
            break;
        }
        active += permits;
        instance.state = RestraintState::Active;
        instance.acquired_at = Some(Utc::now());
        promoted.push(instance.clone());
    }
    promoted
}

impl RestraintService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Queues a claim and activates it if capacity allows.
    ///
    /// The claim is ACTIVE only when no earlier claim is still BLOCKED and
    /// the active permits plus this claim fit within `capacity`.
    ///
    /// # Returns
    ///
    /// * `Ok(instance)` - The persisted claim, ACTIVE or BLOCKED
    /// * `Err(InvalidConstraint)` - Capacity or permits can never be satisfied
    pub fn acquire(&self, request: &AcquireRequest) -> Result<ResourceRestraintInstance> {
        if request.capacity <= 0 {
            return Err(KernelError::InvalidConstraint(format!(
                "capacity for '{}' must be positive, got {}",
                request.key, request.capacity
            )));
        }
        let capacity = u32::try_from(request.capacity).map_err(|_| {
            KernelError::InvalidConstraint(format!("capacity for '{}' is too large", request.key))
        })?;
        if request.permits == 0 || request.permits > capacity {
            return Err(KernelError::InvalidConstraint(format!(
                "permits for '{}' must be between 1 and {}, got {}",
                request.key, capacity, request.permits
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        loop {
            let (instances, version) = self.store.load_restraint_key(&request.key)?;

            let order = instances.iter().map(|i| i.order).max().unwrap_or(0) + 1;
            let queue_empty = !instances.iter().any(|i| i.state == RestraintState::Blocked);
            let fits = active_permits(&instances) + u64::from(request.permits) <= u64::from(capacity);
            let active = queue_empty && fits;

            let instance = ResourceRestraintInstance {
                id: id.clone(),
                claimant_id: request.claimant_id.clone(),
                key: request.key.clone(),
                order,
                state: if active {
                    RestraintState::Active
                } else {
                    RestraintState::Blocked
                },
                permits: request.permits,
                capacity,
                holding_scope: request.holding_scope,
                release_entity_id: request.release_entity_id.clone(),
                created_at: Utc::now(),
                acquired_at: active.then(Utc::now),
            };

            if self
                .store
                .commit_restraint_key(&request.key, version, vec![instance.clone()])?
            {
                info!(
                    "Restraint {} on '{}' for {}: order {} {:?}",
                    instance.id, request.key, request.claimant_id, order, instance.state
                );
                return Ok(instance);
            }
            debug!("Restraint key '{}' changed during acquire, retrying", request.key);
        }
    }

    /// Finishes a claim and returns the claims promoted in its place.
    ///
    /// Releasing an already FINISHED claim is a no-op.
    pub fn release(&self, instance_id: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let Some(instance) = self.store.get_restraint_instance(instance_id)? else {
            return Err(KernelError::not_found("restraint instance", instance_id));
        };
        self.release_in_key(&instance.key, &[instance_id.to_string()])
    }

    /// Finishes every unfinished claim held by an execution scope.
    pub fn release_by_entity(&self, release_entity_id: &str) -> Result<Vec<ResourceRestraintInstance>> {
        let held: Vec<_> = self
            .store
            .find_restraint_instances_by_release_entity(release_entity_id)?
            .into_iter()
            .filter(|i| i.state != RestraintState::Finished)
            .collect();

        let mut keys: Vec<RestraintKey> = held.iter().map(|i| i.key.clone()).collect();
        keys.sort();
        keys.dedup();

        let mut promoted = Vec::new();
        for key in keys {
            let ids: Vec<String> = held
                .iter()
                .filter(|i| i.key == key)
                .map(|i| i.id.clone())
                .collect();
            promoted.extend(self.release_in_key(&key, &ids)?);
        }
        Ok(promoted)
    }

    fn release_in_key(
        &self,
        key: &RestraintKey,
        instance_ids: &[String],
    ) -> Result<Vec<ResourceRestraintInstance>> {
        loop {
            let (mut instances, version) = self.store.load_restraint_key(key)?;

            let mut changed = Vec::new();
            for instance in instances.iter_mut() {
                if instance_ids.contains(&instance.id) && instance.state != RestraintState::Finished {
                    instance.state = RestraintState::Finished;
                    changed.push(instance.id.clone());
                }
            }
            if changed.is_empty() {
                return Ok(Vec::new());
            }

            let promoted = promote_waiting(&mut instances);
            let updates: Vec<_> = instances
                .into_iter()
                .filter(|i| changed.contains(&i.id) || promoted.iter().any(|p| p.id == i.id))
                .collect();

            if self.store.commit_restraint_key(key, version, updates)? {
                for instance in &promoted {
                    info!(
                        "Restraint {} on '{}' promoted for {} (order {})",
                        instance.id, key, instance.claimant_id, instance.order
                    );
                }
                return Ok(promoted);
            }
            debug!("Restraint key '{}' changed during release, retrying", key);
        }
    }

    /// Current instances of a key, ordered by FIFO rank.
    pub fn instances(&self, key: &RestraintKey) -> Result<Vec<ResourceRestraintInstance>> {
        Ok(self.store.load_restraint_key(key)?.0)
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<ResourceRestraintInstance>> {
        self.store.get_restraint_instance(instance_id)
    }
}
