//! End-to-end reconciliation through the orchestrator loop, backed by the
//! in-memory runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use pipegrid_driver::{InMemoryRuntime, RuntimeCall, RuntimeOp, PIPELINE_VERSION_LABEL};
use pipegrid_orchestrator::{GenerationEvent, Orchestrator, OrchestratorError, OrchestratorResult};
use pipegrid_state::{StateStore, WorkloadVersion};

fn config_blob(prefix: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "repository": { "prefix": prefix },
        "executor": {
            "pullImage": false,
            "feedbackBackoff": { "initialMs": 10, "maxMs": 50 }
        }
    }))
    .unwrap()
}

fn version(v: &str, status: &str) -> WorkloadVersion {
    WorkloadVersion {
        key: "w1".to_string(),
        version: v.to_string(),
        content_key: format!("/w1/{v}/logic.yaml"),
        artifact_keys: Vec::new(),
        status: status.to_string(),
    }
}

struct Harness {
    store: StateStore,
    runtime: InMemoryRuntime,
    configs: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Receiver<GenerationEvent>,
    task: JoinHandle<OrchestratorResult<()>>,
}

impl Harness {
    fn start() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        let orchestrator = Orchestrator::new(store.clone(), Arc::new(runtime.clone()));
        let events = orchestrator.generation_events();

        let (configs, configs_rx) = mpsc::channel(4);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orchestrator.run(configs_rx, shutdown_rx));

        Self {
            store,
            runtime,
            configs,
            shutdown,
            events,
            task,
        }
    }

    async fn configure(&self, prefix: &str) {
        self.configs.send(config_blob(prefix)).await.unwrap();
    }

    async fn next_event(&mut self) -> GenerationEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for generation event")
            .expect("generation events closed")
    }

    async fn expect_running(&mut self, generation: u64) {
        assert_eq!(self.next_event().await, GenerationEvent::Starting(generation));
        assert_eq!(self.next_event().await, GenerationEvent::Running(generation));
    }

    async fn finish(self) -> OrchestratorResult<()> {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("orchestrator did not stop")
            .expect("orchestrator panicked")
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn publish_then_archive_reuses_one_execution() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.containers().iter().any(|c| c.state == "running")).await;
    let id = h.runtime.containers()[0].id.clone();

    h.store
        .put_workload_version("acme", "w1", &version("v1", "archived"))
        .unwrap();
    wait_for(|| h.runtime.containers().is_empty()).await;

    assert_eq!(
        h.runtime.mutating_calls(),
        vec![
            RuntimeCall::Create("w1-v1".to_string()),
            RuntimeCall::Start(id.clone()),
            RuntimeCall::Stop(id.clone()),
            RuntimeCall::Remove(id),
        ]
    );

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn new_configuration_retires_previous_generation_first() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.configure("beta").await;
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));
    h.expect_running(2).await;

    // Only generation 2's driver holds an event subscription.
    wait_for(|| h.runtime.subscriber_count() == 1).await;

    // Generation 1's watcher is gone: its prefix is no longer reconciled.
    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    h.store
        .put_workload_version("beta", "w2", &version("v1", "draft"))
        .unwrap();
    wait_for(|| h.runtime.containers().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let containers = h.runtime.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "w2-v1");

    // A closed configuration channel ends the loop cleanly.
    let Harness {
        configs,
        mut events,
        task,
        ..
    } = h;
    drop(configs);
    assert_eq!(events.recv().await.unwrap(), GenerationEvent::Draining(2));
    assert_eq!(events.recv().await.unwrap(), GenerationEvent::Retired(2));
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn new_generation_reconciles_existing_state() {
    let mut h = Harness::start();
    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    h.store
        .put_workload_version("acme", "w1", &version("v2", "paused"))
        .unwrap();

    h.configure("acme").await;
    h.expect_running(1).await;
    wait_for(|| h.runtime.containers().len() == 1).await;

    let containers = h.runtime.containers();
    let container = &containers[0];
    assert_eq!(container.state, "running");
    assert_eq!(
        container.labels.get(PIPELINE_VERSION_LABEL).map(String::as_str),
        Some("v1")
    );

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn deleted_version_is_torn_down() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.containers().len() == 1).await;

    h.store.delete_workload_version("acme", "w1", "v1").unwrap();
    wait_for(|| h.runtime.containers().is_empty()).await;

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn purge_does_not_tear_down() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.containers().len() == 1).await;
    h.runtime.clear_calls();

    h.store.purge("acme.pipeline.w1.version.v1").unwrap();
    // A later write proves the purge notification has been consumed.
    h.store
        .put_workload_version("acme", "w2", &version("v1", "draft"))
        .unwrap();
    wait_for(|| h.runtime.containers().len() == 2).await;

    assert!(!h
        .runtime
        .mutating_calls()
        .iter()
        .any(|call| matches!(call, RuntimeCall::Stop(_) | RuntimeCall::Remove(_))));

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn malformed_configuration_is_fatal() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.configs.send(b"{not json".to_vec()).await.unwrap();
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));

    let result = h.finish().await;
    assert!(matches!(result, Err(OrchestratorError::Config(_))));
}

#[tokio::test]
async fn empty_configuration_shuts_down_cleanly() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.configs.send(Vec::new()).await.unwrap();
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));
    h.finish().await.unwrap();
}

#[tokio::test]
async fn startup_failure_waits_for_next_configuration() {
    let mut h = Harness::start();
    h.runtime.fail(RuntimeOp::Ping, 1);

    h.configure("acme").await;
    assert_eq!(h.next_event().await, GenerationEvent::Starting(1));
    assert!(matches!(
        h.next_event().await,
        GenerationEvent::Failed { generation: 1, .. }
    ));

    // Nothing is reconciled without a generation.
    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.runtime.containers().is_empty());

    h.configure("acme").await;
    h.expect_running(2).await;
    wait_for(|| h.runtime.containers().len() == 1).await;

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn reconcile_errors_are_not_fatal() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "retired"))
        .unwrap();
    h.store
        .put_workload_version("acme", "w2", &version("v1", "draft"))
        .unwrap();
    wait_for(|| h.runtime.containers().len() == 1).await;
    assert!(!h.task.is_finished());

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn shutdown_leaves_executions_running() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.containers().iter().any(|c| c.state == "running")).await;

    h.shutdown.send(true).unwrap();
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));
    let runtime = h.runtime.clone();
    h.finish().await.unwrap();

    assert_eq!(runtime.containers()[0].state, "running");
    assert_eq!(runtime.subscriber_count(), 0);
}

#[tokio::test]
async fn feedback_is_forwarded_to_the_host() {
    let store = StateStore::open_in_memory().unwrap();
    let runtime = InMemoryRuntime::new();
    let (feedback_tx, mut feedback_rx) = mpsc::channel(16);
    let orchestrator =
        Orchestrator::new(store.clone(), Arc::new(runtime.clone())).with_feedback(feedback_tx);
    let mut events = orchestrator.generation_events();

    let (configs, configs_rx) = mpsc::channel(1);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(orchestrator.run(configs_rx, shutdown_rx));

    configs.send(config_blob("acme")).await.unwrap();
    while events.recv().await.unwrap() != GenerationEvent::Running(1) {}
    wait_for(|| runtime.subscriber_count() == 1).await;

    store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();

    let mut actions = Vec::new();
    while actions.len() < 2 {
        let feedback = tokio::time::timeout(Duration::from_secs(2), feedback_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feedback.workload_id, "w1");
        actions.push(feedback.action);
    }
    assert_eq!(actions, vec!["create", "start"]);

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn new_configuration_mid_reconciliation_discards_the_call() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.runtime.hold(RuntimeOp::Start);
    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.held_calls(RuntimeOp::Start) == 1).await;

    // Generation 1 is fully retired before generation 2 starts.
    h.configure("beta").await;
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));
    h.expect_running(2).await;
    wait_for(|| h.runtime.subscriber_count() == 1).await;

    h.runtime.release(RuntimeOp::Start);
    h.store
        .put_workload_version("beta", "w2", &version("v1", "published"))
        .unwrap();
    wait_for(|| {
        h.runtime
            .containers()
            .iter()
            .any(|c| c.name == "w2-v1" && c.state == "running")
    })
    .await;

    // The abandoned start never took effect.
    let containers = h.runtime.containers();
    let abandoned = containers.iter().find(|c| c.name == "w1-v1").unwrap();
    assert_eq!(abandoned.state, "created");
    assert!(
        !h.runtime
            .mutating_calls()
            .contains(&RuntimeCall::Start(abandoned.id.clone()))
    );

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn delete_between_generations_is_applied_by_the_next_one() {
    let mut h = Harness::start();
    h.configure("acme").await;
    h.expect_running(1).await;

    h.store
        .put_workload_version("acme", "w1", &version("v1", "published"))
        .unwrap();
    wait_for(|| h.runtime.containers().iter().any(|c| c.state == "running")).await;

    h.runtime.fail(RuntimeOp::Ping, 1);
    h.configure("acme").await;
    assert_eq!(h.next_event().await, GenerationEvent::Draining(1));
    assert_eq!(h.next_event().await, GenerationEvent::Retired(1));
    assert_eq!(h.next_event().await, GenerationEvent::Starting(2));
    assert!(matches!(
        h.next_event().await,
        GenerationEvent::Failed { generation: 2, .. }
    ));

    h.store.delete_workload_version("acme", "w1", "v1").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.runtime.containers().len(), 1);

    h.configure("acme").await;
    h.expect_running(3).await;
    wait_for(|| h.runtime.containers().is_empty()).await;

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}

#[tokio::test]
async fn shutdown_interrupts_a_hanging_startup() {
    let mut h = Harness::start();
    h.runtime.hold(RuntimeOp::Ping);

    h.configure("acme").await;
    assert_eq!(h.next_event().await, GenerationEvent::Starting(1));
    wait_for(|| h.runtime.held_calls(RuntimeOp::Ping) == 1).await;

    h.shutdown.send(true).unwrap();
    h.finish().await.unwrap();
}
