//! Generations: one live watcher/driver pairing.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pipegrid_driver::{Driver, FeedbackEvent, RuntimeConnector};
use pipegrid_state::{StateStore, WorkloadStatus};
use pipegrid_watcher::{ChangeEvent, Operation, Watcher};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;

/// Lifecycle of a generation, as published by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Starting(u64),
    Running(u64),
    Draining(u64),
    Retired(u64),
    /// Startup failed; the loop waits for the next configuration.
    Failed { generation: u64, error: String },
}

impl GenerationEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Starting(id) | Self::Running(id) | Self::Draining(id) | Self::Retired(id) => *id,
            Self::Failed { generation, .. } => *generation,
        }
    }
}

/// Handle to a running generation: its cancellation scope and task.
pub(crate) struct Generation {
    id: u64,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Generation {
    /// Build the watcher and driver for `config` and start reconciling.
    pub(crate) async fn start(
        id: u64,
        config: &OrchestratorConfig,
        store: StateStore,
        connector: &dyn RuntimeConnector,
        feedback_out: Option<mpsc::Sender<FeedbackEvent>>,
    ) -> OrchestratorResult<Self> {
        let mut watcher = Watcher::new(store, &config.repository)?;
        let runtime = connector.connect(&config.executor).await?;
        let mut driver = Driver::start(runtime, config.executor.clone()).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let channels = Channels {
            updates: watcher.updates(),
            feedback: driver.feedback(),
            feedback_out,
        };

        let watcher = Arc::new(watcher);
        let watch_task = tokio::spawn({
            let watcher = watcher.clone();
            let shutdown = shutdown_rx.clone();
            async move {
                // Failures are logged by the watcher; the generation keeps
                // running until the next configuration replaces it.
                let _ = watcher.watch(shutdown).await;
            }
        });

        let task = tokio::spawn(run(id, watcher, watch_task, driver, channels, shutdown_rx));
        info!(generation = id, prefix = %config.repository.prefix, "generation running");

        Ok(Self { id, shutdown, task })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the generation and wait until its watcher and driver are closed.
    pub(crate) async fn retire(self) {
        debug!(generation = self.id, "draining generation");
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!(generation = self.id, error = %e, "generation task failed");
        }
        info!(generation = self.id, "generation retired");
    }
}

struct Channels {
    updates: Option<mpsc::Receiver<ChangeEvent>>,
    feedback: Option<mpsc::Receiver<FeedbackEvent>>,
    feedback_out: Option<mpsc::Sender<FeedbackEvent>>,
}

async fn run(
    id: u64,
    watcher: Arc<Watcher>,
    watch_task: JoinHandle<()>,
    mut driver: Driver,
    channels: Channels,
    mut shutdown: watch::Receiver<bool>,
) {
    let Channels {
        updates,
        feedback,
        feedback_out,
    } = channels;
    let mut updates_open = updates.is_some();
    let mut feedback_open = feedback.is_some();
    let (mut updates, mut feedback) = (
        updates.unwrap_or_else(|| mpsc::channel(1).1),
        feedback.unwrap_or_else(|| mpsc::channel(1).1),
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            update = updates.recv(), if updates_open => match update {
                Some(event) => {
                    if !dispatch(id, &driver, event, &mut shutdown).await {
                        break;
                    }
                }
                None => {
                    updates_open = false;
                    warn!(generation = id, "change feed ended; waiting for the next configuration");
                }
            },
            event = feedback.recv(), if feedback_open => match event {
                Some(event) => forward(id, event, feedback_out.as_ref()),
                None => feedback_open = false,
            },
        }
    }

    watcher.close();
    driver.close();
    driver.join().await;
    let _ = watch_task.await;
    debug!(generation = id, "watcher and driver closed");
}

/// Reconcile one change. Returns false if the generation was cancelled
/// while the call was in flight; its result is then discarded.
async fn dispatch(
    id: u64,
    driver: &Driver,
    event: ChangeEvent,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    // A deleted version has no desired state left; tear it down.
    let version = match event.operation {
        Operation::Put => event.version,
        Operation::Delete => event.version.with_status(WorkloadStatus::Archived),
    };

    let result = tokio::select! {
        _ = shutdown.changed() => {
            debug!(generation = id, pipeline_id = %event.workload_id, version = %version.version, "reconciliation abandoned");
            return false;
        }
        result = driver.ensure(&event.workload_id, &version) => result,
    };

    match result {
        Ok(()) => debug!(
            generation = id,
            pipeline_id = %event.workload_id,
            version = %version.version,
            status = %version.status,
            revision = event.revision,
            "pipeline version reconciled"
        ),
        Err(e) => error!(
            generation = id,
            pipeline_id = %event.workload_id,
            version = %version.version,
            status = %version.status,
            operation = ?event.operation,
            revision = event.revision,
            error = %e,
            "unable to reconcile pipeline version"
        ),
    }
    true
}

fn forward(id: u64, event: FeedbackEvent, out: Option<&mpsc::Sender<FeedbackEvent>>) {
    info!(
        generation = id,
        pipeline_id = %event.workload_id,
        version = %event.version,
        execution_id = %event.execution_id,
        action = %event.action,
        "runtime feedback"
    );
    if let Some(out) = out {
        if let Err(e) = out.try_send(event) {
            debug!(generation = id, error = %e, "feedback not forwarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pipegrid_driver::{ExecutorConfig, InMemoryRuntime, RuntimeOp};
    use pipegrid_state::WorkloadVersion;
    use pipegrid_watcher::RepositoryConfig;

    use crate::error::OrchestratorError;

    fn config(prefix: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            repository: RepositoryConfig {
                prefix: prefix.to_string(),
            },
            executor: ExecutorConfig {
                pull_image: false,
                ..ExecutorConfig::default()
            },
        }
    }

    fn version(v: &str, status: &str) -> WorkloadVersion {
        WorkloadVersion {
            key: "w1".to_string(),
            version: v.to_string(),
            status: status.to_string(),
            ..Default::default()
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

    #[test]
    fn event_generation_numbers() {
        assert_eq!(GenerationEvent::Running(3).generation(), 3);
        assert_eq!(
            GenerationEvent::Failed {
                generation: 4,
                error: "x".to_string()
            }
            .generation(),
            4
        );
    }

    #[tokio::test]
    async fn reconciles_existing_and_new_versions() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();

        let generation = Generation::start(1, &config("acme"), store.clone(), &runtime, None)
            .await
            .unwrap();
        assert_eq!(generation.id(), 1);
        wait_for(|| runtime.containers().iter().any(|c| c.state == "running")).await;

        store
            .put_workload_version("acme", "w2", &version("v1", "draft"))
            .unwrap();
        wait_for(|| runtime.containers().len() == 2).await;

        generation.retire().await;
    }

    #[tokio::test]
    async fn delete_tears_down_the_execution() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        let generation = Generation::start(1, &config("acme"), store.clone(), &runtime, None)
            .await
            .unwrap();

        store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();
        wait_for(|| runtime.containers().len() == 1).await;

        store.delete_workload_version("acme", "w1", "v1").unwrap();
        wait_for(|| runtime.containers().is_empty()).await;

        generation.retire().await;
    }

    #[tokio::test]
    async fn ensure_errors_do_not_stop_the_generation() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        let generation = Generation::start(1, &config("acme"), store.clone(), &runtime, None)
            .await
            .unwrap();

        store
            .put_workload_version("acme", "w1", &version("v1", "bogus"))
            .unwrap();
        runtime.fail(RuntimeOp::Create, 1);
        store
            .put_workload_version("acme", "w2", &version("v1", "draft"))
            .unwrap();
        store
            .put_workload_version("acme", "w3", &version("v1", "draft"))
            .unwrap();

        wait_for(|| runtime.containers().len() == 1).await;
        generation.retire().await;
    }

    #[tokio::test]
    async fn retire_closes_watcher_and_driver() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        let generation = Generation::start(1, &config("acme"), store.clone(), &runtime, None)
            .await
            .unwrap();
        wait_for(|| runtime.subscriber_count() == 1).await;

        generation.retire().await;
        assert_eq!(runtime.subscriber_count(), 0);

        store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn feedback_is_forwarded() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        let (tx, mut rx) = mpsc::channel(16);
        let generation = Generation::start(1, &config("acme"), store.clone(), &runtime, Some(tx))
            .await
            .unwrap();
        wait_for(|| runtime.subscriber_count() == 1).await;

        store
            .put_workload_version("acme", "w1", &version("v1", "draft"))
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.action, "create");
        assert_eq!(event.workload_id, "w1");

        generation.retire().await;
    }

    #[tokio::test]
    async fn startup_fails_when_runtime_unreachable() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();
        runtime.fail(RuntimeOp::Ping, 1);

        let result = Generation::start(1, &config("acme"), store, &runtime, None).await;
        assert!(matches!(result, Err(OrchestratorError::Driver(_))));
    }

    #[tokio::test]
    async fn startup_fails_on_invalid_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = InMemoryRuntime::new();

        let result = Generation::start(1, &config("a.b"), store, &runtime, None).await;
        assert!(matches!(result, Err(OrchestratorError::Watcher(_))));
    }
}
