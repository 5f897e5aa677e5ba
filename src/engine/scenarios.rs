//! End-to-end runs of the kernel against the in-memory store and the
//! loopback agent pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::advising::{self, AdviserConfig, RepairAction};
use crate::dispatch::TaskResultStatus;
use crate::execution::{ExecutableResponse, ExecutionMode, FailureKind};
use crate::facilitation::FacilitatorType;
use crate::interrupts::{handlers, InterruptState, IssuedBy};
use crate::plan::{NodeGroup, PlanNode, StrategyConfig};
use crate::restraint::{AcquireRequest, RestraintKey, RestraintState};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> KernelConfig {
    KernelConfig {
        workers: 4,
        sweep_interval_ms: 20,
        ..KernelConfig::default()
    }
}

fn orchestrator() -> Orchestrator {
    KernelBuilder::new(config()).start().unwrap()
}

async fn wait_for_nodes<F>(orchestrator: &Orchestrator, plan_execution_id: &str, check: F) -> Vec<NodeExecution>
where
    F: Fn(&[NodeExecution]) -> bool,
{
    for _ in 0..500 {
        let nodes = orchestrator.node_executions(plan_execution_id).unwrap();
        if check(&nodes) {
            return nodes;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nodes of {} never reached the expected state", plan_execution_id);
}

fn of<'a>(nodes: &'a [NodeExecution], plan_node_id: &str) -> Vec<&'a NodeExecution> {
    nodes.iter().filter(|n| n.plan_node_id == plan_node_id).collect()
}

fn final_statuses(nodes: &[NodeExecution]) -> BTreeMap<String, Status> {
    nodes
        .iter()
        .map(|n| (n.plan_node_id.clone(), n.status))
        .collect()
}

fn pipeline(plan_id: &str, children: &[&str]) -> Plan {
    Plan::new(plan_id, "pipeline").with_node(
        PlanNode::new("pipeline", "Pipeline")
            .with_group(NodeGroup::Pipeline)
            .with_children(children.iter().copied()),
    )
}

fn silent_task(id: &str) -> PlanNode {
    PlanNode::new(id, "RemoteTask").with_parameters(json!({"respond": false, "expiry_ms": 60_000}))
}

fn shared_lock(permits: u32) -> PlanNode {
    PlanNode::new("lock", "ResourceConstraint").with_parameters(json!({
        "resource_unit": "shared-db",
        "capacity": 2,
        "permits": permits,
        "holding_scope": "PLAN"
    }))
}

async fn wait_for_status(orchestrator: &Orchestrator, plan_execution_id: &str, plan_node_id: &str, status: Status) -> NodeExecution {
    let nodes = wait_for_nodes(orchestrator, plan_execution_id, |nodes| {
        of(nodes, plan_node_id).first().map_or(false, |n| n.status == status)
    })
    .await;
    of(&nodes, plan_node_id)[0].clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_cas_and_single_advise() {
    let (ctx, mut events) = KernelBuilder::new(config()).build().unwrap();
    let plan = Plan::new("chain", "a")
        .with_node(PlanNode::new("a", "Noop").then("b"))
        .with_node(PlanNode::new("b", "Noop"));
    ctx.store.save_plan(plan).unwrap();
    ctx.plans
        .create(PlanExecution::new("pe", "chain", PlanExecutionMetadata::manual()))
        .unwrap();
    let ambiance = Ambiance::new("pe", "chain").child(Level::new("a", "a1", "Noop", NodeGroup::Step));
    ctx.nodes.create(NodeExecution::new("a1", "a", ambiance)).unwrap();

    let stale = ctx.nodes.get("a1").unwrap();
    ctx.nodes.update_status("a1", Status::Running).unwrap().unwrap();
    ctx.nodes.update_status("a1", Status::Succeeded).unwrap().unwrap();

    let mut resurrected = stale.clone();
    resurrected.status = Status::Running;
    resurrected.version = stale.version + 1;
    assert!(!ctx.store.replace_node(resurrected, stale.version).unwrap());
    assert_eq!(ctx.nodes.get("a1").unwrap().status, Status::Succeeded);

    let (first, second) = tokio::join!(
        advising::advise(&ctx, "a1", false),
        advising::advise(&ctx, "a1", false)
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(ctx.store.find_nodes_by_previous("a1").unwrap().len(), 1);
    let mut starts = 0;
    while let Ok(event) = events.try_recv() {
        if let KernelEvent::StartNode { .. } = event {
            starts += 1;
        }
    }
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn test_capacity_one_promotes_in_order() {
    let (ctx, _events) = KernelBuilder::new(config()).build().unwrap();
    let key = RestraintKey::new("ACROSS_ALL", "prod-env");

    let instances: Vec<_> = ["n1", "n2", "n3"]
        .into_iter()
        .map(|claimant| {
            ctx.restraints
                .acquire(&AcquireRequest::new(key.clone(), 1, claimant))
                .unwrap()
        })
        .collect();
    let orders: Vec<u64> = instances.iter().map(|i| i.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert_eq!(instances[0].state, RestraintState::Active);
    assert_eq!(instances[1].state, RestraintState::Blocked);

    let promoted = ctx.restraints.release(&instances[0].id).unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, instances[1].id);
    assert_eq!(
        ctx.restraints.get(&instances[2].id).unwrap().unwrap().state,
        RestraintState::Blocked
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_constraint_serializes_parallel_lanes() {
    let orchestrator = orchestrator();
    let plan = Plan::new("lanes", "lanes")
        .with_node(
            PlanNode::new("lanes", "Strategy")
                .with_group(NodeGroup::Strategy)
                .with_children(["lane"])
                .with_strategy(StrategyConfig::Repeat { times: 3 }),
        )
        .with_node(
            PlanNode::new("lane", "Stage")
                .with_group(NodeGroup::Stage)
                .with_children(["lock"]),
        )
        .with_node(
            PlanNode::new("lock", "ResourceConstraint")
                .with_parameters(json!({
                    "resource_unit": "prod-env",
                    "capacity": 1,
                    "holding_scope": "STAGE"
                }))
                .then("work"),
        )
        .with_node(PlanNode::new("work", "RemoteTask").with_parameters(json!({"duration_ms": 40})));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    let execution = orchestrator.wait_for_plan(&id, WAIT).await.unwrap();
    assert_eq!(execution.status, Status::Succeeded);

    let nodes = orchestrator.node_executions(&id).unwrap();
    let mut work: Vec<_> = of(&nodes, "work");
    assert_eq!(work.len(), 3);
    work.sort_by_key(|n| n.start_ts);
    for pair in work.windows(2) {
        // The next lane only starts once the previous lane released the unit
        assert!(pair[1].start_ts.unwrap() >= pair[0].end_ts.unwrap());
    }

    let key = RestraintKey::new("ACROSS_ALL", "prod-env");
    let instances = orchestrator.ctx.restraints.instances(&key).unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.state == RestraintState::Finished));
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_is_idempotent() {
    let orchestrator = orchestrator();
    let plan = pipeline("abort", &["build", "deploy"])
        .with_node(silent_task("build"))
        .with_node(silent_task("deploy"));

    let once = orchestrator.start_plan(plan.clone(), PlanExecutionMetadata::manual()).unwrap();
    let twice = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    for id in [&once, &twice] {
        wait_for_nodes(&orchestrator, id, |nodes| {
            nodes.iter().filter(|n| n.status == Status::TaskWaiting).count() == 2
        })
        .await;
    }

    orchestrator.register_interrupt(&once, InterruptType::Abort, None).unwrap();
    orchestrator.register_interrupt(&twice, InterruptType::Abort, None).unwrap();
    let second = orchestrator.register_interrupt(&twice, InterruptType::Abort, None);
    assert!(matches!(
        second,
        Err(KernelError::DuplicateInterrupt { .. }) | Err(KernelError::InvalidInterrupt(_))
    ));

    assert_eq!(orchestrator.wait_for_plan(&once, WAIT).await.unwrap().status, Status::Aborted);
    assert_eq!(orchestrator.wait_for_plan(&twice, WAIT).await.unwrap().status, Status::Aborted);

    // Walking the tree again changes nothing
    let root = orchestrator.node_executions(&twice).unwrap()[0].id.clone();
    handlers::discontinue_subtree(&orchestrator.ctx, &root, Status::Aborted, Status::Aborted, None)
        .await
        .unwrap();

    let once_nodes = orchestrator.node_executions(&once).unwrap();
    let twice_nodes = orchestrator.node_executions(&twice).unwrap();
    assert_eq!(final_statuses(&once_nodes), final_statuses(&twice_nodes));
    assert!(twice_nodes.iter().all(|n| n.status == Status::Aborted));
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_task_retries_once_then_rolls_back() {
    let orchestrator = orchestrator();
    let plan = pipeline("expiry", &["stage"])
        .with_node(
            PlanNode::new("stage", "Stage")
                .with_group(NodeGroup::Stage)
                .with_children(["deploy"])
                .with_rollback("rollback"),
        )
        .with_node(
            PlanNode::new("deploy", "RemoteTask")
                .with_parameters(json!({"respond": false, "expiry_ms": 60}))
                .with_adviser(AdviserConfig::Retry {
                    when: vec![Status::Failed],
                    max_attempts: 2,
                    wait_intervals_ms: vec![],
                    after_retries: RepairAction::RollbackStage,
                }),
        )
        .with_node(PlanNode::new("rollback", "Noop"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    let execution = orchestrator.wait_for_plan(&id, WAIT).await.unwrap();
    assert_eq!(execution.status, Status::Failed);

    let nodes = orchestrator.node_executions(&id).unwrap();
    let attempts = of(&nodes, "deploy");
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|n| n.status == Status::Failed));
    assert_eq!(attempts[1].retry_ids, vec![attempts[0].id.clone()]);
    assert!(attempts[0].old_retry);
    assert_eq!(
        attempts[0].failure_info.as_ref().unwrap().message,
        "delegate task expired"
    );

    let rollback = of(&nodes, "rollback");
    assert_eq!(rollback.len(), 1);
    assert_eq!(rollback[0].status, Status::Succeeded);
    assert_eq!(of(&nodes, "stage")[0].status, Status::Failed);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_parent_waits_for_both() {
    let orchestrator = orchestrator();
    let mut observer = orchestrator.subscribe();
    let plan = Plan::new("fanout", "parent")
        .with_node(
            PlanNode::new("parent", "Stage")
                .with_group(NodeGroup::Stage)
                .with_children(["slow", "broken"]),
        )
        .with_node(PlanNode::new("slow", "RemoteTask").with_parameters(json!({"duration_ms": 100})))
        .with_node(PlanNode::new("broken", "Fail").with_parameters(json!({"message": "boom"})));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Failed);

    let mut terminal_order = Vec::new();
    while let Ok(event) = observer.try_recv() {
        if let ExecutionEvent::Node(event) = event {
            if event.plan_execution_id == id && event.new_status.is_terminal() {
                terminal_order.push((event.plan_node_id, event.new_status));
            }
        }
    }
    assert_eq!(terminal_order.len(), 3);
    assert_eq!(terminal_order[2], ("parent".to_string(), Status::Failed));
    assert!(terminal_order.contains(&("slow".to_string(), Status::Succeeded)));
    assert!(terminal_order.contains(&("broken".to_string(), Status::Failed)));
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_response_after_abort_dropped() {
    let orchestrator = orchestrator();
    let plan = pipeline("late", &["build"]).with_node(silent_task("build"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    let nodes = wait_for_nodes(&orchestrator, &id, |nodes| {
        of(nodes, "build").first().map_or(false, |n| n.status == Status::TaskWaiting)
    })
    .await;
    let build = of(&nodes, "build")[0].clone();
    let Some(ExecutableResponse::Task { task_id }) = build.last_response().cloned() else {
        panic!("build has no task");
    };

    orchestrator
        .register_interrupt(&id, InterruptType::Abort, Some(&build.id))
        .unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Aborted);

    orchestrator.submit_task_response(TaskResponse::new(&task_id, TaskResultStatus::Success, json!({})));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let build = orchestrator
        .node_executions(&id)
        .unwrap()
        .into_iter()
        .find(|n| n.id == build.id)
        .unwrap();
    assert_eq!(build.status, Status::Aborted);
    assert!(build.output.is_none());
    assert_eq!(orchestrator.plan_execution(&id).unwrap().status, Status::Aborted);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_holds_queued_nodes_until_resume() {
    let orchestrator = orchestrator();
    let plan = Plan::new("paused", "first")
        .with_node(
            PlanNode::new("first", "RemoteTask")
                .with_parameters(json!({"duration_ms": 100}))
                .then("second"),
        )
        .with_node(PlanNode::new("second", "Noop"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    wait_for_nodes(&orchestrator, &id, |nodes| {
        of(nodes, "first").first().map_or(false, |n| n.status == Status::TaskWaiting)
    })
    .await;
    orchestrator.register_interrupt(&id, InterruptType::PauseAll, None).unwrap();

    let nodes = wait_for_nodes(&orchestrator, &id, |nodes| !of(nodes, "second").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(of(&nodes, "first")[0].status, Status::Succeeded);
    assert_eq!(
        of(&orchestrator.node_executions(&id).unwrap(), "second")[0].status,
        Status::Queued
    );
    assert_eq!(orchestrator.plan_execution(&id).unwrap().status, Status::Paused);

    orchestrator.register_interrupt(&id, InterruptType::ResumeAll, None).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manual_intervention_resolved_by_mark_success() {
    let orchestrator = orchestrator();
    let plan = pipeline("manual", &["check"])
        .with_node(
            PlanNode::new("check", "Fail").with_adviser(AdviserConfig::ManualIntervention {
                when: vec![],
                timeout_ms: None,
                on_timeout: RepairAction::Fail,
            }),
        );

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    let nodes = wait_for_nodes(&orchestrator, &id, |nodes| {
        of(nodes, "check").first().map_or(false, |n| n.awaiting_intervention())
    })
    .await;
    assert_eq!(orchestrator.plan_execution(&id).unwrap().status, Status::Running);

    let check = of(&nodes, "check")[0].id.clone();
    orchestrator
        .register_interrupt(&id, InterruptType::MarkSuccess, Some(&check))
        .unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Succeeded);

    // The interrupt is closed after its effects, which may trail the plan
    let mut interrupts = orchestrator.interrupts(&id).unwrap();
    for _ in 0..100 {
        if !interrupts[0].state.is_pending() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupts = orchestrator.interrupts(&id).unwrap();
    }
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].state, InterruptState::ProcessedSuccessfully);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_input_wait_resumes_on_submit() {
    let orchestrator = orchestrator();
    let plan = Plan::new("input", "approve").with_node(PlanNode::new("approve", "Noop").waiting_for_input());

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    let nodes = wait_for_nodes(&orchestrator, &id, |nodes| {
        nodes.first().map_or(false, |n| n.status == Status::InputWaiting)
    })
    .await;
    assert!(orchestrator.submit_input("missing", json!({})).is_err());

    orchestrator.submit_input(&nodes[0].id, json!({"approved": true})).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_invalid_plan_rejected_before_persisting() {
    let orchestrator = orchestrator();
    let plan = Plan::new("broken", "missing").with_node(PlanNode::new("a", "Noop"));

    assert!(matches!(
        orchestrator.start_plan(plan, PlanExecutionMetadata::manual()),
        Err(KernelError::InvalidPlan(_))
    ));
    assert!(orchestrator.ctx.store.list_plan_executions().unwrap().is_empty());
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recover_restarts_queued_work() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let plan = Plan::new("resume", "a").with_node(PlanNode::new("a", "Noop"));
    store.save_plan(plan).unwrap();
    store
        .insert_plan_execution(PlanExecution::new("pe", "resume", PlanExecutionMetadata::manual()))
        .unwrap();
    let ambiance = Ambiance::new("pe", "resume").child(Level::new("a", "a1", "Noop", NodeGroup::Step));
    store.insert_node(NodeExecution::new("a1", "a", ambiance)).unwrap();

    let orchestrator = KernelBuilder::new(config()).with_store(store).start().unwrap();
    let report = orchestrator.recover().unwrap();
    assert_eq!(report.plan_executions, 1);
    assert_eq!(report.restarted_nodes, 1);

    assert_eq!(orchestrator.wait_for_plan("pe", WAIT).await.unwrap().status, Status::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborted_waiter_promotes_next_claim() {
    let orchestrator = orchestrator();

    let holder = pipeline("holder", &["lock"])
        .with_node(shared_lock(1).then("work"))
        .with_node(silent_task("work"));
    let holder = orchestrator.start_plan(holder, PlanExecutionMetadata::manual()).unwrap();
    wait_for_status(&orchestrator, &holder, "work", Status::TaskWaiting).await;

    let greedy = pipeline("greedy", &["lock"]).with_node(shared_lock(2));
    let greedy = orchestrator.start_plan(greedy, PlanExecutionMetadata::manual()).unwrap();
    let greedy_lock = wait_for_status(&orchestrator, &greedy, "lock", Status::ResourceWaiting).await;

    // Fits next to the holder, but queues behind the greedy claim
    let small = pipeline("small", &["lock"]).with_node(shared_lock(1));
    let small = orchestrator.start_plan(small, PlanExecutionMetadata::manual()).unwrap();
    wait_for_status(&orchestrator, &small, "lock", Status::ResourceWaiting).await;

    orchestrator
        .register_interrupt(&greedy, InterruptType::Abort, Some(&greedy_lock.id))
        .unwrap();

    assert_eq!(orchestrator.wait_for_plan(&small, WAIT).await.unwrap().status, Status::Succeeded);
    assert_eq!(orchestrator.wait_for_plan(&greedy, WAIT).await.unwrap().status, Status::Aborted);
    let greedy_nodes = orchestrator.node_executions(&greedy).unwrap();
    assert_eq!(of(&greedy_nodes, "lock")[0].status, Status::Aborted);

    let key = RestraintKey::new("ACROSS_ALL", "shared-db");
    let instances = orchestrator.ctx.restraints.instances(&key).unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.state != RestraintState::Blocked));

    orchestrator.register_interrupt(&holder, InterruptType::Abort, None).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&holder, WAIT).await.unwrap().status, Status::Aborted);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_chain_dispatches_links_in_order() {
    let orchestrator = orchestrator();
    let plan = pipeline("chained", &["migrate"]).with_node(
        PlanNode::new("migrate", "RemoteChain").with_parameters(json!({
            "links": [
                {"duration_ms": 20, "output": "schema"},
                {"duration_ms": 20, "output": "data"}
            ]
        })),
    );

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Succeeded);

    let nodes = orchestrator.node_executions(&id).unwrap();
    let migrate = of(&nodes, "migrate")[0];
    assert_eq!(migrate.status, Status::Succeeded);
    let links: Vec<usize> = migrate
        .executable_responses
        .iter()
        .filter_map(|r| match r {
            ExecutableResponse::TaskChain { link, .. } => Some(*link),
            _ => None,
        })
        .collect();
    assert_eq!(links, vec![0, 1]);
    assert_eq!(migrate.output.as_ref().unwrap()["output"], json!("data"));
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_chain_runs_children_one_by_one() {
    let orchestrator = orchestrator();
    let plan = pipeline("sequential", &["stage"])
        .with_node(
            PlanNode::new("stage", "Stage")
                .with_group(NodeGroup::Stage)
                .with_children(["first", "second", "third"])
                .with_facilitators(vec![FacilitatorType::ChildChain]),
        )
        .with_node(PlanNode::new("first", "RemoteTask").with_parameters(json!({"duration_ms": 30})))
        .with_node(PlanNode::new("second", "RemoteTask").with_parameters(json!({"duration_ms": 30})))
        .with_node(PlanNode::new("third", "Noop"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Succeeded);

    let nodes = orchestrator.node_executions(&id).unwrap();
    let order: Vec<&NodeExecution> = ["first", "second", "third"]
        .iter()
        .map(|plan_node_id| of(&nodes, plan_node_id)[0])
        .collect();
    for pair in order.windows(2) {
        assert!(pair[1].start_ts.unwrap() >= pair[0].end_ts.unwrap());
    }

    let stage = of(&nodes, "stage")[0];
    assert_eq!(stage.mode, Some(ExecutionMode::ChildChain));
    let indexes: Vec<usize> = stage
        .executable_responses
        .iter()
        .filter_map(|r| match r {
            ExecutableResponse::ChildChain { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_plan_fails_plan_and_aborts_siblings() {
    let orchestrator = orchestrator();
    let plan = Plan::new("ended", "parallel")
        .with_node(
            PlanNode::new("parallel", "Stage")
                .with_group(NodeGroup::Stage)
                .with_children(["gate", "build"]),
        )
        .with_node(
            PlanNode::new("gate", "Fail")
                .with_parameters(json!({"message": "policy violated"}))
                .with_adviser(AdviserConfig::OnFail {
                    when: vec![],
                    action: RepairAction::EndPlan,
                }),
        )
        .with_node(silent_task("build"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Failed);

    let nodes = orchestrator.node_executions(&id).unwrap();
    assert_eq!(of(&nodes, "gate")[0].status, Status::Failed);
    assert_eq!(of(&nodes, "build")[0].status, Status::Aborted);

    let interrupts = orchestrator.interrupts(&id).unwrap();
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0].kind, InterruptType::Abort);
    assert_eq!(interrupts[0].issued_by, IssuedBy::Adviser);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expire_interrupt_expires_open_nodes() {
    let orchestrator = orchestrator();
    let plan = pipeline("expiring", &["build", "deploy"])
        .with_node(silent_task("build"))
        .with_node(silent_task("deploy"));

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    wait_for_nodes(&orchestrator, &id, |nodes| {
        nodes.iter().filter(|n| n.status == Status::TaskWaiting).count() == 2
    })
    .await;

    orchestrator.register_interrupt(&id, InterruptType::Expire, None).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Expired);

    let nodes = orchestrator.node_executions(&id).unwrap();
    assert!(nodes.iter().all(|n| n.status == Status::Expired));
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_capability_check_errors_node_and_plan() {
    let orchestrator = KernelBuilder::new(KernelConfig {
        facilitation_timeout_ms: 20,
        ..config()
    })
    .with_probe(Arc::new(
        StaticCapabilityProbe::any().with_latency(Duration::from_millis(500)),
    ))
    .start()
    .unwrap();

    let mut deploy = PlanNode::new("deploy", "RemoteTask");
    deploy.facilitator_config.capability = Some("gpu".to_string());
    let plan = pipeline("gpu", &["deploy"]).with_node(deploy);

    let id = orchestrator.start_plan(plan, PlanExecutionMetadata::manual()).unwrap();
    assert_eq!(orchestrator.wait_for_plan(&id, WAIT).await.unwrap().status, Status::Errored);

    let nodes = orchestrator.node_executions(&id).unwrap();
    let deploy = of(&nodes, "deploy")[0];
    assert_eq!(deploy.status, Status::Errored);
    assert!(deploy.mode.is_none());
    assert_eq!(deploy.failure_info.as_ref().unwrap().kind, FailureKind::Facilitation);
    assert_eq!(of(&nodes, "pipeline")[0].status, Status::Errored);
    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recover_finishes_processing_interrupt_in_place() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let plan = Plan::new("stuck", "build").with_node(silent_task("build"));
    store.save_plan(plan).unwrap();
    store
        .insert_plan_execution(PlanExecution::new("pe", "stuck", PlanExecutionMetadata::manual()))
        .unwrap();
    let ambiance = Ambiance::new("pe", "stuck").child(Level::new("build", "b1", "RemoteTask", NodeGroup::Step));
    let mut build = NodeExecution::new("b1", "build", ambiance);
    build.status = Status::TaskWaiting;
    build.mode = Some(ExecutionMode::Task);
    store.insert_node(build).unwrap();

    // Claimed by a process that stopped before closing it
    let mut pause = Interrupt::new(InterruptType::PauseAll, "pe", None);
    pause.state = InterruptState::Processing;
    let pause_id = pause.id.clone();
    assert!(store.insert_interrupt_unless_pending(pause, &[]).unwrap());

    let orchestrator = KernelBuilder::new(config()).with_store(store).start().unwrap();
    let report = orchestrator.recover().unwrap();
    assert_eq!(report.pending_interrupts, 1);

    let mut interrupt = orchestrator.ctx.store.get_interrupt(&pause_id).unwrap().unwrap();
    for _ in 0..200 {
        if !interrupt.state.is_pending() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupt = orchestrator.ctx.store.get_interrupt(&pause_id).unwrap().unwrap();
    }
    assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
    // Closed straight from PROCESSING, never handed out a second time
    assert_eq!(interrupt.version, 1);
    assert_eq!(orchestrator.plan_execution("pe").unwrap().status, Status::Paused);
    orchestrator.shutdown().await;
}
