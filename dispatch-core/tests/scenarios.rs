//! Integration tests for the concrete scenarios in §8 of the specification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::bus::RecordingBus;
use dispatch_core::kv::MemoryKv;
use dispatch_core::{
    BatchConsumer, BatchStatus, ConsumerState, ContextAssembler, ContextBuildRequest,
    ContextBuildResponse, ContextKv, ContextPayload, DispatchConfig, DispatchScheduler,
    ModelRegistry, Phase, PhaseOrchestrator, ResultPublisher, Task, TaskExecutionTrigger,
    TaskStatus,
};
use tokio::sync::watch;

fn task(id: &str, status: TaskStatus, phase: Option<&str>, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        plan_id: "plan-1".to_string(),
        sequence: 1,
        task_type: "coding".to_string(),
        description: format!("implement {id}"),
        files: vec![],
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        phase_id: phase.map(|p| p.to_string()),
        status,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn phase(id: &str, deps: &[&str]) -> Phase {
    Phase {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

async fn respond_to_all_context_requests(bus: Arc<RecordingBus>, kv: Arc<MemoryKv>, expected: usize) {
    let mut seen = HashSet::new();
    loop {
        let snapshot = bus.published.lock().await.clone();
        for (subject, payload) in &snapshot {
            if !subject.starts_with("context.build.") {
                continue;
            }
            if let Ok(req) = serde_json::from_slice::<ContextBuildRequest>(payload) {
                if seen.insert(req.context_request_id.clone()) {
                    let response = ContextBuildResponse {
                        payload: Some(ContextPayload {
                            documents: Default::default(),
                            entities: vec![],
                            sops: vec![],
                            token_count: 1,
                        }),
                        error: None,
                    };
                    let bytes = serde_json::to_vec(&response).unwrap();
                    let _ = kv.put(&req.context_request_id, bytes).await;
                }
            }
        }
        if seen.len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn triggered_task_ids(bus: &RecordingBus) -> Vec<String> {
    bus.published
        .try_lock()
        .unwrap()
        .iter()
        .filter(|(subject, _)| subject == "workflow.trigger.task-execution-loop")
        .map(|(_, payload)| {
            let trigger: TaskExecutionTrigger = serde_json::from_slice(payload).unwrap();
            trigger.task_id
        })
        .collect()
}

fn make_orchestrator(
    context_timeout: Duration,
) -> (
    PhaseOrchestrator<RecordingBus, MemoryKv>,
    Arc<RecordingBus>,
    Arc<MemoryKv>,
) {
    let bus = Arc::new(RecordingBus::default());
    let kv = Arc::new(MemoryKv::new());
    let mut cfg = DispatchConfig::default();
    cfg.context_timeout = context_timeout;
    let registry = Arc::new(ModelRegistry::new("default-model"));
    let assembler = Arc::new(ContextAssembler::new(bus.clone(), kv.clone(), registry, cfg.clone()));
    let scheduler = Arc::new(DispatchScheduler::new(bus.clone(), cfg));
    (PhaseOrchestrator::new(scheduler, assembler), bus, kv)
}

#[tokio::test]
async fn s1_linear_chain_dispatches_in_dependency_order() {
    let (orchestrator, bus, kv) = make_orchestrator(Duration::from_secs(2));
    let tasks = vec![
        task("T1", TaskStatus::Approved, None, &[]),
        task("T2", TaskStatus::Approved, None, &["T1"]),
        task("T3", TaskStatus::Approved, None, &["T2"]),
    ];

    let responder = tokio::spawn(respond_to_all_context_requests(bus.clone(), kv.clone(), 3));
    let (_tx, rx) = watch::channel(false);
    let stats = orchestrator.run("slug-s1", tasks, vec![], rx).await.unwrap();
    responder.await.unwrap();

    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(triggered_task_ids(&bus), vec!["T1", "T2", "T3"]);
}

#[tokio::test]
async fn s2_diamond_join_waits_for_both_branches() {
    let (orchestrator, bus, kv) = make_orchestrator(Duration::from_secs(2));
    let tasks = vec![
        task("A", TaskStatus::Approved, None, &[]),
        task("B", TaskStatus::Approved, None, &["A"]),
        task("C", TaskStatus::Approved, None, &["A"]),
        task("D", TaskStatus::Approved, None, &["B", "C"]),
    ];

    let responder = tokio::spawn(respond_to_all_context_requests(bus.clone(), kv.clone(), 4));
    let (_tx, rx) = watch::channel(false);
    let stats = orchestrator.run("slug-s2", tasks, vec![], rx).await.unwrap();
    responder.await.unwrap();

    assert_eq!(stats.dispatched, 4);
    let order = triggered_task_ids(&bus);
    let a = order.iter().position(|x| x == "A").unwrap();
    let b = order.iter().position(|x| x == "B").unwrap();
    let c = order.iter().position(|x| x == "C").unwrap();
    let d = order.iter().position(|x| x == "D").unwrap();
    assert!(a < b && a < c);
    assert!(d > b && d > c);
}

#[tokio::test]
async fn s3_phase_triggers_committed_before_dependent_phase_starts() {
    let (orchestrator, bus, kv) = make_orchestrator(Duration::from_secs(2));
    let tasks = vec![
        task("X", TaskStatus::Approved, Some("P1"), &[]),
        task("Y", TaskStatus::Approved, Some("P1"), &[]),
        task("Z", TaskStatus::Approved, Some("P2"), &[]),
    ];
    let phases = vec![phase("P1", &[]), phase("P2", &["P1"])];

    let responder = tokio::spawn(respond_to_all_context_requests(bus.clone(), kv.clone(), 3));
    let (_tx, rx) = watch::channel(false);
    orchestrator.run("slug-s3", tasks, phases, rx).await.unwrap();
    responder.await.unwrap();

    let order = triggered_task_ids(&bus);
    let x = order.iter().position(|i| i == "X").unwrap();
    let y = order.iter().position(|i| i == "Y").unwrap();
    let z = order.iter().position(|i| i == "Z").unwrap();
    assert!(z > x && z > y);
}

#[tokio::test]
async fn s4_unapproved_dependent_is_skipped_not_failed() {
    let (orchestrator, bus, kv) = make_orchestrator(Duration::from_secs(2));
    let tasks = vec![
        task("A", TaskStatus::Approved, None, &[]),
        task("B", TaskStatus::Pending, None, &["A"]),
    ];

    let responder = tokio::spawn(respond_to_all_context_requests(bus.clone(), kv.clone(), 1));
    let (_tx, rx) = watch::channel(false);
    let stats = orchestrator.run("slug-s4", tasks, vec![], rx).await.unwrap();
    responder.await.unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(triggered_task_ids(&bus), vec!["A"]);
}

#[tokio::test]
async fn s5_non_retryable_context_failure_still_dispatches_with_request_id_carried() {
    let bus = Arc::new(RecordingBus::default());
    let kv = Arc::new(MemoryKv::new());
    let mut cfg = DispatchConfig::default();
    cfg.context_timeout = Duration::from_secs(2);
    let registry = Arc::new(ModelRegistry::new("default-model"));
    let assembler = Arc::new(ContextAssembler::new(bus.clone(), kv.clone(), registry, cfg.clone()));
    let scheduler = Arc::new(DispatchScheduler::new(bus.clone(), cfg));
    let orchestrator = PhaseOrchestrator::new(scheduler, assembler);

    let bus_for_responder = bus.clone();
    let kv_for_responder = kv.clone();
    let responder = tokio::spawn(async move {
        loop {
            let snapshot = bus_for_responder.published.lock().await.clone();
            if let Some((subject, payload)) = snapshot
                .iter()
                .find(|(s, _)| s.starts_with("context.build."))
            {
                let _ = subject;
                let req: ContextBuildRequest = serde_json::from_slice(payload).unwrap();
                let response = ContextBuildResponse {
                    payload: None,
                    error: Some("document store unavailable".to_string()),
                };
                let bytes = serde_json::to_vec(&response).unwrap();
                kv_for_responder.put(&req.context_request_id, bytes).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let tasks = vec![task("A", TaskStatus::Approved, None, &[])];
    let (_tx, rx) = watch::channel(false);
    let stats = orchestrator.run("slug-s5", tasks, vec![], rx).await.unwrap();
    responder.await.unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.failed, 0);

    let published = bus.published.lock().await;
    let trigger = published
        .iter()
        .find(|(subject, _)| subject == "workflow.trigger.task-execution-loop")
        .unwrap();
    let trigger: TaskExecutionTrigger = serde_json::from_slice(&trigger.1).unwrap();
    assert!(!trigger.context_request_id.is_empty());
}

#[tokio::test]
async fn s6_cycle_fails_batch_with_circular_in_error() {
    use dispatch_core::error::DispatchError;

    let (orchestrator, _bus, _kv) = make_orchestrator(Duration::from_secs(2));
    let tasks = vec![
        task("A", TaskStatus::Approved, None, &["C"]),
        task("B", TaskStatus::Approved, None, &["A"]),
        task("C", TaskStatus::Approved, None, &["B"]),
    ];

    let (_tx, rx) = watch::channel(false);
    let err = orchestrator.run("slug-s6", tasks, vec![], rx).await.unwrap_err();
    assert!(matches!(err, DispatchError::Graph(_)));
    assert!(err.to_string().to_lowercase().contains("circular"));
}

#[tokio::test]
async fn s7_empty_plan_yields_no_tasks_result_and_acks_via_consumer() {
    use dispatch_core::{BatchResult, BatchTrigger};
    use std::sync::Mutex as StdMutex;

    struct RecordingPublisher {
        results: StdMutex<Vec<BatchResult>>,
    }

    #[async_trait::async_trait]
    impl ResultPublisher for RecordingPublisher {
        async fn publish_result(&self, result: &BatchResult) -> Result<(), String> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let change_dir = dir.path().join(".semspec/changes/slug-s7");
    std::fs::create_dir_all(&change_dir).unwrap();
    std::fs::write(change_dir.join("tasks.json"), "[]").unwrap();

    let (orchestrator, _bus, _kv) = make_orchestrator(Duration::from_millis(50));
    let publisher = Arc::new(RecordingPublisher {
        results: StdMutex::new(vec![]),
    });
    let consumer = BatchConsumer::new(
        DispatchConfig::default(),
        dir.path().to_path_buf(),
        Arc::new(orchestrator),
        publisher.clone(),
    );
    assert!(consumer.start());
    assert_eq!(consumer.state(), ConsumerState::Running);

    let trigger = BatchTrigger {
        request_id: "r-s7".to_string(),
        batch_id: "b-s7".to_string(),
        slug: "slug-s7".to_string(),
        trace_id: "t-s7".to_string(),
    };
    let raw = serde_json::to_vec(&trigger).unwrap();
    let resolution = consumer.handle_message(&raw).await;
    assert_eq!(resolution, dispatch_core::Resolution::Ack);

    let results = publisher.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_count, 0);
    assert_eq!(results[0].status, BatchStatus::NoTasks);
}
