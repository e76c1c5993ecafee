//! Orchestration integration tests.
//!
//! A generic two-phase pipeline runs on the local bus against an in-memory
//! store:
//! - `process` fans out phase A (`stepA`, or the gated `download`) and then
//!   phase B (`stepB`), and completes
//! - children can be held until the test releases them, or fail
//!
//! These cover fan-out ordering, fan-in, admission, failure recording and
//! redelivery.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use abd_core::{
    bus::{task_message, LocalBus, MessageBus},
    coordination::{AdmissionGate, CompletionAggregator, ConcurrencyLimit, EntryStatus},
    dispatch::{DispatchError, ExternalError, RouteTable, Router, TopicHandler, Validate},
    orchestration::{Orchestrator, Phase, PhaseProgress, Resume},
    task::{NewTask, SqliteTaskStore, StoreError, Task, TaskFilter, TaskPatch, TaskStatus, TaskStore},
};

const PROC: &str = "proc";
const PHASE_A: Phase = Phase::new("phase_a", &["stepA", "download"]);
const PHASE_B: Phase = Phase::new("phase_b", &["stepB"]);

/// Observations and controls shared with the handlers.
struct Work {
    release: Semaphore,
    started: Mutex<Vec<String>>,
    parent_statuses: Mutex<Vec<TaskStatus>>,
    fan_outs: Mutex<Vec<&'static str>>,
    process_calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for Work {
    fn default() -> Self {
        Self {
            release: Semaphore::new(0),
            started: Mutex::default(),
            parent_statuses: Mutex::default(),
            fan_outs: Mutex::default(),
            process_calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl Work {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn fan_outs(&self) -> Vec<&'static str> {
        self.fan_outs.lock().unwrap().clone()
    }
}

fn step_a() -> String {
    "stepA".to_string()
}

#[derive(Deserialize)]
struct Pipeline {
    children: usize,
    #[serde(default = "step_a")]
    child_topic: String,
    #[serde(default)]
    hold: bool,
    #[serde(default)]
    fail: Option<String>,
}

impl Validate for Pipeline {
    fn validate(&self) -> Result<(), String> {
        if self.children == 0 {
            return Err("children must be at least 1".to_string());
        }
        Ok(())
    }
}

struct ProcessHandler {
    orchestrator: Arc<Orchestrator>,
    work: Arc<Work>,
}

#[async_trait]
impl TopicHandler for ProcessHandler {
    type Payload = Pipeline;

    async fn handle(&self, task: Task, p: Pipeline) -> Result<(), DispatchError> {
        self.work.process_calls.fetch_add(1, Ordering::SeqCst);

        match self.orchestrator.resume(&task, &PHASE_A).await? {
            Resume::NotStarted => {
                let children = (0..p.children)
                    .map(|i| {
                        let fail = if i == 0 { p.fail.clone() } else { None };
                        NewTask::pending(
                            p.child_topic.as_str(),
                            json!({ "index": i, "hold": p.hold, "fail": fail }),
                        )
                    })
                    .collect();
                self.work.fan_outs.lock().unwrap().push("phase_a");
                self.orchestrator.fan_out(&task, &PHASE_A, children).await?;
                return Ok(());
            }
            Resume::Waiting { .. } => return Ok(()),
            Resume::Done => {}
        }

        match self.orchestrator.resume(&task, &PHASE_B).await? {
            Resume::NotStarted => {
                self.work.fan_outs.lock().unwrap().push("phase_b");
                self.orchestrator
                    .fan_out(&task, &PHASE_B, vec![NewTask::pending("stepB", json!({ "index": 0 }))])
                    .await?;
            }
            Resume::Waiting { .. } => {}
            Resume::Done => {
                self.orchestrator.complete(&task).await?;
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct Step {
    #[serde(default)]
    hold: bool,
    #[serde(default)]
    fail: Option<String>,
}

impl Validate for Step {}

struct StepHandler {
    orchestrator: Arc<Orchestrator>,
    work: Arc<Work>,
    phase: Phase,
}

#[async_trait]
impl TopicHandler for StepHandler {
    type Payload = Step;

    async fn handle(&self, task: Task, step: Step) -> Result<(), DispatchError> {
        self.work.started.lock().unwrap().push(task.id.clone());
        if let Some(parent_id) = &task.parent_task_id {
            let parent = self.orchestrator.store().get(parent_id).await?;
            self.work.parent_statuses.lock().unwrap().push(parent.status);
        }

        let now = self.work.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.work.peak.fetch_max(now, Ordering::SeqCst);
        if step.hold {
            if let Ok(permit) = self.work.release.acquire().await {
                permit.forget();
            }
        }
        self.work.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = step.fail {
            return Err(ExternalError::new(message).into());
        }
        self.orchestrator
            .complete_child(&task, TaskPatch::new(), &self.phase.completed_path())
            .await?;
        Ok(())
    }
}

struct Harness {
    store: Arc<SqliteTaskStore>,
    bus: Arc<LocalBus>,
    aggregator: Arc<CompletionAggregator>,
    gate: Arc<AdmissionGate>,
    work: Arc<Work>,
}

impl Harness {
    fn new(download_limit: usize) -> Self {
        let store = Arc::new(SqliteTaskStore::in_memory().expect("Failed to create store"));
        let bus = Arc::new(LocalBus::new());
        let work = Arc::new(Work::default());
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), bus.clone(), PROC));

        let step = |phase: Phase| StepHandler {
            orchestrator: orchestrator.clone(),
            work: work.clone(),
            phase,
        };
        let routes = RouteTable::new()
            .route(
                "process",
                ProcessHandler {
                    orchestrator: orchestrator.clone(),
                    work: work.clone(),
                },
            )
            .route("stepA", step(PHASE_A))
            .route("download", step(PHASE_A))
            .route("stepB", step(PHASE_B));

        let aggregator = Arc::new(
            CompletionAggregator::new(store.clone(), bus.clone())
                .track("stepA", "phase_a.done", PROC)
                .track("download", "phase_a.done", PROC)
                .track("stepB", "phase_b.done", PROC),
        );
        let gate = Arc::new(AdmissionGate::new(
            "download",
            ConcurrencyLimit::new(download_limit),
        ));

        let router = Router::new(routes, store.clone())
            .with_aggregator(aggregator.clone())
            .with_gate("download", gate.clone());
        bus.subscribe(PROC, Arc::new(router));

        Self {
            store,
            bus,
            aggregator,
            gate,
            work,
        }
    }

    async fn submit(&self, payload: Value) -> Task {
        let task = self
            .store
            .create(NewTask::pending("process", payload))
            .await
            .expect("Failed to create root task");
        self.deliver(&task).await;
        task
    }

    async fn deliver(&self, task: &Task) {
        self.bus
            .emit(PROC, task_message(task).unwrap())
            .await
            .expect("Failed to emit");
    }

    async fn children(&self, parent_id: &str) -> Vec<Task> {
        self.store
            .find_all(&TaskFilter::new().with_parent(parent_id))
            .await
            .unwrap()
    }

    async fn count(&self, parent_id: &str, status: TaskStatus) -> usize {
        self.children(parent_id)
            .await
            .iter()
            .filter(|c| c.status == status)
            .count()
    }

    async fn task(&self, id: &str) -> Task {
        self.store.get(id).await.unwrap()
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.bus.wait_idle())
            .await
            .expect("Bus did not settle");
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {}", what);
}

// Scenario 1: fan-out persists children and parks the parent.
#[tokio::test]
async fn test_fan_out_persists_children_under_child_pending_parent() {
    let h = Harness::new(2);
    let root = h
        .submit(json!({ "children": 3, "hold": true, "phase_a": { "done": false } }))
        .await;
    let hr = &h;
    let id = root.id.as_str();

    eventually("three children started", || async move {
        hr.work.started().len() == 3
    })
    .await;

    let children = h.children(id).await;
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.topic == "stepA"));
    assert!(children
        .iter()
        .all(|c| c.parent_task_id.as_deref() == Some(id)));

    let parent = h.task(id).await;
    assert_eq!(parent.status, TaskStatus::ChildPending);
    assert_eq!(
        PhaseProgress::of(&parent, &PHASE_A),
        PhaseProgress {
            total: 3,
            completed: 0,
            done: false
        }
    );

    // Every child saw its parent already parked.
    let statuses = h.work.parent_statuses.lock().unwrap().clone();
    assert_eq!(statuses, vec![TaskStatus::ChildPending; 3]);

    h.work.release.add_permits(3);
    h.settle().await;
}

// Scenario 2: fan-in fires once, after the last child.
#[tokio::test]
async fn test_parent_advances_once_after_last_child() {
    let h = Harness::new(2);
    let root = h.submit(json!({ "children": 3, "hold": true })).await;
    let hr = &h;
    let id = root.id.as_str();

    eventually("three children started", || async move {
        hr.work.started().len() == 3
    })
    .await;

    h.work.release.add_permits(2);
    eventually("two children completed", || async move {
        hr.count(id, TaskStatus::Completed).await == 2
    })
    .await;

    // Give the aggregator a chance to misfire.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.aggregator.membership().outstanding("stepA", id), 1);
    let parent = h.task(id).await;
    assert_eq!(parent.payload_at("phase_a.done"), Some(&json!(false)));
    assert_eq!(h.work.fan_outs(), vec!["phase_a"]);
    assert_eq!(h.work.process_calls.load(Ordering::SeqCst), 1);

    h.work.release.add_permits(1);
    h.settle().await;

    assert_eq!(h.aggregator.membership().outstanding("stepA", id), 0);
    assert_eq!(h.work.fan_outs(), vec!["phase_a", "phase_b"]);
    // Initial delivery, then one per completed phase.
    assert_eq!(h.work.process_calls.load(Ordering::SeqCst), 3);

    let parent = h.task(id).await;
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(parent.payload_at("phase_a.done"), Some(&json!(true)));
    assert_eq!(parent.payload_at("phase_a.completed"), Some(&json!(3)));
    assert_eq!(parent.payload_at("phase_b.done"), Some(&json!(true)));
}

// Scenario 3: the gate runs two at a time and promotes in arrival order.
#[tokio::test]
async fn test_gate_limits_running_children_and_promotes_fifo() {
    let h = Harness::new(2);
    let root = h
        .submit(json!({ "children": 5, "child_topic": "download", "hold": true }))
        .await;
    let hr = &h;
    let id = root.id.as_str();

    eventually("five children at the gate", || async move {
        hr.gate.state().entries(id).len() == 5 && hr.work.started().len() == 2
    })
    .await;

    assert_eq!(h.count(id, TaskStatus::InProgress).await, 2);
    assert_eq!(h.count(id, TaskStatus::Pending).await, 3);

    let queued: Vec<String> = h
        .gate
        .state()
        .entries(id)
        .into_iter()
        .filter(|(_, status)| *status == EntryStatus::Pending)
        .map(|(task_id, _)| task_id)
        .collect();
    assert_eq!(queued.len(), 3);

    for (i, expected) in queued.iter().enumerate() {
        h.work.release.add_permits(1);
        let want = 3 + i;
        eventually("next child promoted", || async move {
            hr.work.started().len() == want
        })
        .await;
        assert_eq!(&h.work.started()[want - 1], expected);
        assert!(h.count(id, TaskStatus::InProgress).await <= 2);
    }

    h.work.release.add_permits(2);
    h.settle().await;
    assert_eq!(h.work.peak.load(Ordering::SeqCst), 2);
    assert_eq!(h.count(id, TaskStatus::Completed).await, 6);
    assert_eq!(h.task(id).await.status, TaskStatus::Completed);
}

// Scenario 4: a collaborator error lands verbatim on the task.
#[tokio::test]
async fn test_external_error_fails_task_with_message() {
    let h = Harness::new(2);
    let root = h
        .submit(json!({ "children": 1, "fail": "disk full" }))
        .await;
    h.settle().await;

    let child = h.children(&root.id).await.remove(0);
    assert_eq!(child.status, TaskStatus::Failed);
    assert_eq!(child.error.as_ref().unwrap().message, "disk full");

    let parent = h.task(&root.id).await;
    assert_eq!(parent.status, TaskStatus::Failed);
    assert!(parent.error.unwrap().message.contains("disk full"));
    assert_eq!(h.work.fan_outs(), vec!["phase_a"]);
}

// Scenario 5: redelivery after the phase flag is set skips the phase.
#[tokio::test]
async fn test_redelivery_after_phase_done_skips_to_next_phase() {
    let h = Harness::new(2);
    let root = h
        .store
        .create(NewTask::pending(
            "process",
            json!({ "children": 2, "phase_a": { "total": 2, "completed": 2, "done": true } }),
        ))
        .await
        .unwrap();

    h.deliver(&root).await;
    h.deliver(&root).await;
    h.settle().await;

    assert_eq!(h.work.fan_outs(), vec!["phase_b"]);
    let children = h.children(&root.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].topic, "stepB");
    assert_eq!(h.task(&root.id).await.status, TaskStatus::Completed);
}

// Scenario 6: an empty filter never deletes anything.
#[tokio::test]
async fn test_remove_many_rejects_empty_filter() {
    let h = Harness::new(2);
    h.store
        .create(NewTask::pending("process", json!({ "children": 1 })))
        .await
        .unwrap();

    let err = h.store.remove_many(&TaskFilter::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(h.store.find_all(&TaskFilter::new()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_task_is_never_reopened_by_redelivery() {
    let h = Harness::new(2);
    let root = h.submit(json!({ "children": 1 })).await;
    h.settle().await;
    assert_eq!(h.task(&root.id).await.status, TaskStatus::Completed);
    let calls = h.work.process_calls.load(Ordering::SeqCst);

    // The original pending message arrives again.
    h.deliver(&root).await;
    h.settle().await;

    let stored = h.task(&root.id).await;
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(h.work.process_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_invalid_payload_fails_without_fan_out() {
    let h = Harness::new(2);
    let root = h.submit(json!({ "children": 0 })).await;
    h.settle().await;

    let stored = h.task(&root.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored
        .error
        .unwrap()
        .message
        .contains("children must be at least 1"));
    assert!(h.children(&root.id).await.is_empty());
}

#[tokio::test]
async fn test_create_then_find_round_trip() {
    let h = Harness::new(2);
    let payload = json!({ "children": 2, "nested": { "list": [1, 2, 3] } });
    let created = h
        .store
        .create(NewTask::pending("process", payload.clone()))
        .await
        .unwrap();

    let found = h
        .store
        .find_one(&TaskFilter::by_id(&created.id))
        .await
        .unwrap()
        .expect("task should exist");
    assert_eq!(found.topic, "process");
    assert_eq!(found.status, TaskStatus::Pending);
    assert_eq!(found.payload, payload);
}
