//! Interrupt Registration
//!
//! Validates a control signal against the current plan and node state and
//! persists it REGISTERED. Invalid and duplicate registrations are rejected
//! here with a typed error; nothing is queued for them.

use std::sync::Arc;

use log::info;

use super::model::{Interrupt, InterruptType, IssuedBy};
use crate::error::{KernelError, Result};
use crate::execution::{EventBus, KernelEvent, NodeExecution, PlanExecution, Status};
use crate::store::Store;

pub struct InterruptService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

fn invalid(message: impl Into<String>) -> KernelError {
    KernelError::InvalidInterrupt(message.into())
}

fn is_leaf(node: &NodeExecution) -> bool {
    !node.mode.map_or(false, |mode| mode.spawns_children())
}

/// Checks the interrupt against the state it targets.
fn validate(kind: InterruptType, plan: &PlanExecution, node: Option<&NodeExecution>) -> Result<()> {
    if plan.status.is_terminal() {
        return Err(invalid(format!(
            "plan execution '{}' already finished ({})",
            plan.id, plan.status
        )));
    }

    let Some(node) = node else {
        return match kind {
            InterruptType::Abort | InterruptType::Expire if plan.is_closing() => Err(invalid(
                format!("plan execution '{}' is already discontinuing", plan.id),
            )),
            InterruptType::Abort | InterruptType::Expire => Ok(()),
            InterruptType::PauseAll if plan.status != Status::Running => Err(invalid(format!(
                "cannot pause plan execution in {}",
                plan.status
            ))),
            InterruptType::ResumeAll if plan.status != Status::Paused => Err(invalid(format!(
                "cannot resume plan execution in {}",
                plan.status
            ))),
            InterruptType::PauseAll | InterruptType::ResumeAll => Ok(()),
            other => Err(invalid(format!("{} requires a node execution", other))),
        };
    };

    let active = !node.status.is_terminal() && node.status != Status::Discontinuing;
    let accepted = match kind {
        InterruptType::Abort | InterruptType::Expire => active,
        InterruptType::Retry => node.awaiting_intervention(),
        InterruptType::MarkSuccess => (active && is_leaf(node)) || node.awaiting_intervention(),
        InterruptType::MarkFailed | InterruptType::CustomFailure => {
            active || node.awaiting_intervention()
        }
        InterruptType::PauseAll | InterruptType::ResumeAll => {
            return Err(invalid(format!("{} applies to the whole plan", kind)));
        }
    };
    if !accepted {
        return Err(invalid(format!(
            "{} not applicable to node execution '{}' in {}",
            kind, node.id, node.status
        )));
    }
    Ok(())
}

impl InterruptService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Registers a user interrupt.
    ///
    /// # Arguments
    ///
    /// * `plan_execution_id` - Plan execution to act on
    /// * `kind` - Interrupt type
    /// * `node_execution_id` - Target node; `None` targets the plan
    ///
    /// # Returns
    ///
    /// * `Ok(interrupt)` - Persisted REGISTERED and queued for processing
    /// * `Err(InvalidInterrupt)` - Target state does not admit it
    /// * `Err(DuplicateInterrupt)` - A conflicting plan-level interrupt is pending
    pub fn register(
        &self,
        plan_execution_id: &str,
        kind: InterruptType,
        node_execution_id: Option<&str>,
    ) -> Result<Interrupt> {
        self.register_as(plan_execution_id, kind, node_execution_id, IssuedBy::User, None)
    }

    pub fn register_as(
        &self,
        plan_execution_id: &str,
        kind: InterruptType,
        node_execution_id: Option<&str>,
        issued_by: IssuedBy,
        message: Option<String>,
    ) -> Result<Interrupt> {
        let plan = self
            .store
            .get_plan_execution(plan_execution_id)?
            .ok_or_else(|| KernelError::not_found("plan execution", plan_execution_id))?;

        let node = match node_execution_id {
            Some(id) => {
                let node = self
                    .store
                    .get_node(id)?
                    .ok_or_else(|| KernelError::not_found("node execution", id))?;
                if node.plan_execution_id != plan_execution_id {
                    return Err(invalid(format!(
                        "node execution '{}' does not belong to plan execution '{}'",
                        id, plan_execution_id
                    )));
                }
                Some(node)
            }
            None => None,
        };
        validate(kind, &plan, node.as_ref())?;

        let interrupt = Interrupt::new(kind, plan_execution_id, node_execution_id.map(String::from))
            .issued_by(issued_by)
            .with_message(message);
        let conflicts = if interrupt.is_plan_level() {
            kind.plan_level_conflicts()
        } else {
            &[]
        };

        if !self.store.insert_interrupt_unless_pending(interrupt.clone(), conflicts)? {
            return Err(KernelError::DuplicateInterrupt {
                kind,
                plan_execution_id: plan_execution_id.to_string(),
            });
        }
        info!(
            "Registered {} interrupt {} for plan execution {}",
            kind, interrupt.id, plan_execution_id
        );
        self.bus.emit(KernelEvent::InterruptRegistered {
            plan_execution_id: plan_execution_id.to_string(),
        });
        Ok(interrupt)
    }

    pub fn list(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        self.store.find_interrupts(plan_execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advising::{AdviserResponse, RepairAction};
    use crate::ambiance::Ambiance;
    use crate::execution::{ExecutionMode, PlanExecutionMetadata};
    use crate::store::{
        InMemoryStore, InterruptRepository, NodeExecutionRepository, PlanExecutionRepository,
    };

    fn setup() -> (InterruptService, Arc<InMemoryStore>, tokio::sync::mpsc::UnboundedReceiver<KernelEvent>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_plan_execution(PlanExecution::new("pe", "plan", PlanExecutionMetadata::manual()))
            .unwrap();
        let mut node = NodeExecution::new("n1", "a", Ambiance::new("pe", "plan"));
        node.status = Status::Running;
        node.mode = Some(ExecutionMode::Task);
        store.insert_node(node).unwrap();

        let (bus, rx) = EventBus::new();
        (InterruptService::new(store.clone(), bus), store, rx)
    }

    fn set_node(store: &InMemoryStore, update: impl Fn(&mut NodeExecution)) {
        let mut node = store.get_node("n1").unwrap().unwrap();
        let version = node.version;
        update(&mut node);
        node.version += 1;
        assert!(store.replace_node(node, version).unwrap());
    }

    #[test]
    fn test_register_emits_event() {
        let (service, store, mut rx) = setup();
        let interrupt = service.register("pe", InterruptType::Abort, None).unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::InterruptRegistered { plan_execution_id } if plan_execution_id == "pe"
        ));
        assert_eq!(store.find_interrupts("pe").unwrap(), vec![interrupt]);
    }

    #[test]
    fn test_duplicate_plan_level_abort_rejected() {
        let (service, _store, _rx) = setup();
        service.register("pe", InterruptType::Abort, None).unwrap();

        let err = service.register("pe", InterruptType::Expire, None).unwrap_err();
        assert!(matches!(
            err,
            KernelError::DuplicateInterrupt {
                kind: InterruptType::Expire,
                ..
            }
        ));
    }

    #[test]
    fn test_pause_requires_running_plan() {
        let (service, store, _rx) = setup();
        let mut plan = store.get_plan_execution("pe").unwrap().unwrap();
        plan.status = Status::Paused;
        plan.version += 1;
        assert!(store.replace_plan_execution(plan, 0).unwrap());

        assert!(matches!(
            service.register("pe", InterruptType::PauseAll, None),
            Err(KernelError::InvalidInterrupt(_))
        ));
        assert!(service.register("pe", InterruptType::ResumeAll, None).is_ok());
    }

    #[test]
    fn test_target_shape_validated() {
        let (service, _store, _rx) = setup();
        assert!(matches!(
            service.register("pe", InterruptType::Retry, None),
            Err(KernelError::InvalidInterrupt(_))
        ));
        assert!(matches!(
            service.register("pe", InterruptType::PauseAll, Some("n1")),
            Err(KernelError::InvalidInterrupt(_))
        ));
        assert!(matches!(
            service.register("pe", InterruptType::Abort, Some("ghost")),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn test_terminal_node_rejects_abort() {
        let (service, store, _rx) = setup();
        set_node(&store, |n| n.status = Status::Succeeded);

        assert!(matches!(
            service.register("pe", InterruptType::Abort, Some("n1")),
            Err(KernelError::InvalidInterrupt(_))
        ));
        assert!(matches!(
            service.register("pe", InterruptType::Retry, Some("n1")),
            Err(KernelError::InvalidInterrupt(_))
        ));
    }

    #[test]
    fn test_retry_accepted_while_awaiting_intervention() {
        let (service, store, _rx) = setup();
        set_node(&store, |n| {
            n.status = Status::Failed;
            n.advised = true;
            n.advise_applied = true;
            n.adviser_response = Some(AdviserResponse::InterventionWait {
                deadline: None,
                on_timeout: RepairAction::Fail,
            });
        });
        assert!(service.register("pe", InterruptType::Retry, Some("n1")).is_ok());
        assert!(service.register("pe", InterruptType::MarkSuccess, Some("n1")).is_ok());
    }

    #[test]
    fn test_mark_success_needs_leaf() {
        let (service, store, _rx) = setup();
        set_node(&store, |n| n.mode = Some(ExecutionMode::Children));
        assert!(matches!(
            service.register("pe", InterruptType::MarkSuccess, Some("n1")),
            Err(KernelError::InvalidInterrupt(_))
        ));
        assert!(service.register("pe", InterruptType::MarkFailed, Some("n1")).is_ok());
    }
}
