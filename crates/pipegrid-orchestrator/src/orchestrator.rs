//! Orchestrator: consumes configuration and rotates generations.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

use pipegrid_driver::{FeedbackEvent, RuntimeConnector};
use pipegrid_state::StateStore;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::generation::{Generation, GenerationEvent};

const GENERATION_EVENT_BUFFER: usize = 64;

/// The reconciliation loop.
///
/// Each configuration blob starts a new generation after retiring the
/// active one. An empty blob, a closed configuration channel, or the
/// shutdown signal retire the active generation and end the loop cleanly;
/// an undecodable blob ends it with an error. A generation still starting
/// when shutdown arrives is abandoned.
pub struct Orchestrator {
    store: StateStore,
    connector: Arc<dyn RuntimeConnector>,
    feedback_out: Option<mpsc::Sender<FeedbackEvent>>,
    events: broadcast::Sender<GenerationEvent>,
}

impl Orchestrator {
    pub fn new(store: StateStore, connector: Arc<dyn RuntimeConnector>) -> Self {
        let (events, _) = broadcast::channel(GENERATION_EVENT_BUFFER);
        Self {
            store,
            connector,
            feedback_out: None,
            events,
        }
    }

    /// Forward runtime feedback to `tx` in addition to logging it. Events
    /// are dropped while `tx` is full.
    pub fn with_feedback(mut self, tx: mpsc::Sender<FeedbackEvent>) -> Self {
        self.feedback_out = Some(tx);
        self
    }

    /// Subscribe to generation lifecycle events.
    pub fn generation_events(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }

    /// Run until shut down or fed an invalid configuration.
    pub async fn run(
        self,
        mut configs: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> OrchestratorResult<()> {
        let mut current: Option<Generation> = None;
        let mut next_id: u64 = 0;

        loop {
            let blob = if *shutdown.borrow() {
                None
            } else {
                tokio::select! {
                    _ = shutdown.changed() => None,
                    blob = configs.recv() => blob,
                }
            };

            if let Some(generation) = current.take() {
                self.retire(generation).await;
            }

            let Some(blob) = blob.filter(|blob| !blob.is_empty()) else {
                info!("orchestrator shutting down");
                return Ok(());
            };

            let config = match OrchestratorConfig::from_slice(&blob) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "unable to decode configuration");
                    return Err(e);
                }
            };

            next_id += 1;
            self.publish(GenerationEvent::Starting(next_id));
            info!(generation = next_id, prefix = %config.repository.prefix, "starting generation");

            let started = tokio::select! {
                _ = shutdown.changed() => {
                    info!(generation = next_id, "shutdown during generation startup");
                    return Ok(());
                }
                started = Generation::start(
                    next_id,
                    &config,
                    self.store.clone(),
                    self.connector.as_ref(),
                    self.feedback_out.clone(),
                ) => started,
            };

            match started {
                Ok(generation) => {
                    self.publish(GenerationEvent::Running(next_id));
                    current = Some(generation);
                }
                Err(e) => {
                    error!(generation = next_id, error = %e, "unable to start generation; waiting for the next configuration");
                    self.publish(GenerationEvent::Failed {
                        generation: next_id,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn retire(&self, generation: Generation) {
        let id = generation.id();
        self.publish(GenerationEvent::Draining(id));
        generation.retire().await;
        self.publish(GenerationEvent::Retired(id));
    }

    fn publish(&self, event: GenerationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
