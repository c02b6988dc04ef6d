//! Driver: reconciles one workload version at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pipegrid_state::{WorkloadStatus, WorkloadVersion};

use crate::backoff::Backoff;
use crate::config::ExecutorConfig;
use crate::error::DriverResult;
use crate::execution::{Execution, ExecutionState};
use crate::feedback::{run_feedback, FeedbackEvent};
use crate::runtime::{ContainerRuntime, ContainerSpec, ListOptions};
use crate::{PIPELINE_ID_LABEL, PIPELINE_VERSION_LABEL};

const FEEDBACK_BUFFER: usize = 256;

/// Reconciles workload versions against a container runtime and streams
/// runtime feedback.
pub struct Driver {
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutorConfig,
    feedback_rx: Option<mpsc::Receiver<FeedbackEvent>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Driver {
    /// Check the runtime is reachable and start streaming feedback.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        config: ExecutorConfig,
    ) -> DriverResult<Self> {
        runtime.ping().await?;

        let (tx, feedback_rx) = mpsc::channel(FEEDBACK_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_feedback(
            runtime.clone(),
            tx,
            Backoff::from_config(&config.feedback_backoff),
            shutdown_rx,
        ));

        debug!(image = %config.image, "driver started");
        Ok(Self {
            runtime,
            config,
            feedback_rx: Some(feedback_rx),
            shutdown,
            task: Some(task),
        })
    }

    /// Take the feedback receiver. Returns `None` after the first call.
    pub fn feedback(&mut self) -> Option<mpsc::Receiver<FeedbackEvent>> {
        self.feedback_rx.take()
    }

    /// Stop the feedback subscription. Executions are left alone.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("driver closed");
        }
    }

    /// Wait for the feedback task to finish. Call after `close`.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Converge the execution of `version` toward its desired status.
    pub async fn ensure(&self, workload_id: &str, version: &WorkloadVersion) -> DriverResult<()> {
        match version.desired_status()? {
            WorkloadStatus::Published => {
                let execution = self.ensure_present(workload_id, version).await?;
                self.ensure_started(&execution).await
            }
            WorkloadStatus::Draft => {
                self.ensure_present(workload_id, version).await?;
                Ok(())
            }
            WorkloadStatus::Paused => {
                match self.find_execution(workload_id, &version.version).await? {
                    Some(execution) => self.ensure_stopped(&execution).await,
                    None => Ok(()),
                }
            }
            WorkloadStatus::Archived => {
                match self.find_execution(workload_id, &version.version).await? {
                    Some(execution) => self.ensure_absent(&execution).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// The execution labelled with `(workload_id, version)`, if any.
    ///
    /// Uses the first match; duplicates are not checked.
    pub async fn find_execution(
        &self,
        workload_id: &str,
        version: &str,
    ) -> DriverResult<Option<Execution>> {
        let options = ListOptions::all()
            .with_label(PIPELINE_ID_LABEL, workload_id)
            .with_label(PIPELINE_VERSION_LABEL, version);

        let Some(listed) = self.runtime.list(&options).await?.into_iter().next() else {
            return Ok(None);
        };
        let Some(container) = self.runtime.inspect(&listed.id).await? else {
            return Ok(None);
        };

        Ok(Some(Execution {
            id: container.id,
            workload_id: workload_id.to_string(),
            version: version.to_string(),
            state: ExecutionState::from_runtime_status(&container.state),
        }))
    }

    async fn ensure_present(
        &self,
        workload_id: &str,
        version: &WorkloadVersion,
    ) -> DriverResult<Execution> {
        if let Some(execution) = self.find_execution(workload_id, &version.version).await? {
            return Ok(execution);
        }

        if self.config.pull_image {
            self.runtime.pull_image(&self.config.image).await?;
        }

        let spec = self.container_spec(workload_id, version);
        let id = self.runtime.create(&spec).await?;
        info!(pipeline_id = %workload_id, version = %version.version, execution_id = %id, name = %spec.name, "execution created");

        Ok(Execution {
            id,
            workload_id: workload_id.to_string(),
            version: version.version.clone(),
            state: ExecutionState::Present,
        })
    }

    async fn ensure_started(&self, execution: &Execution) -> DriverResult<()> {
        if execution.state == ExecutionState::Started {
            return Ok(());
        }
        self.runtime.start(&execution.id).await?;
        info!(pipeline_id = %execution.workload_id, version = %execution.version, execution_id = %execution.id, "execution started");
        Ok(())
    }

    async fn ensure_stopped(&self, execution: &Execution) -> DriverResult<()> {
        if execution.state == ExecutionState::Stopped {
            return Ok(());
        }
        self.runtime
            .stop(&execution.id, self.config.stop_timeout())
            .await?;
        info!(pipeline_id = %execution.workload_id, version = %execution.version, execution_id = %execution.id, "execution stopped");
        Ok(())
    }

    async fn ensure_absent(&self, execution: &Execution) -> DriverResult<()> {
        self.runtime
            .stop(&execution.id, self.config.stop_timeout())
            .await?;
        self.runtime.remove(&execution.id, true).await?;
        info!(pipeline_id = %execution.workload_id, version = %execution.version, execution_id = %execution.id, "execution removed");
        Ok(())
    }

    fn container_spec(&self, workload_id: &str, version: &WorkloadVersion) -> ContainerSpec {
        let labels = BTreeMap::from([
            (PIPELINE_ID_LABEL.to_string(), workload_id.to_string()),
            (PIPELINE_VERSION_LABEL.to_string(), version.version.clone()),
        ]);
        let env = vec![
            format!("PIPEGRID_PIPELINE_ID={workload_id}"),
            format!("PIPEGRID_PIPELINE_VERSION={}", version.version),
            format!("PIPEGRID_CONTENT_KEY={}", version.content_key),
            format!("PIPEGRID_ARTIFACT_KEYS={}", version.artifact_keys.join(",")),
        ];

        ContainerSpec {
            name: container_name(workload_id, &version.version),
            image: self.config.image.clone(),
            labels,
            env,
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// `<workload_id>-<version>`, restricted to characters container names allow.
pub fn container_name(workload_id: &str, version: &str) -> String {
    let mut name: String = format!("{workload_id}-{version}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert(0, 'p');
    }
    name
}
