//! Runtime feedback: lifecycle events for labelled executions.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::runtime::{Container, ContainerRuntime, ListOptions, RuntimeEvent};
use crate::{PIPELINE_ID_LABEL, PIPELINE_VERSION_LABEL};

/// Action reported for executions found running at startup.
pub const RUNNING_ACTION: &str = "running";

/// Something happened to an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    /// Epoch seconds.
    pub timestamp: i64,
    pub execution_id: String,
    pub workload_id: String,
    pub version: String,
    /// Runtime lifecycle action, verbatim.
    pub action: String,
    /// Remaining event attributes, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl FeedbackEvent {
    /// Feedback for a runtime event. `None` unless the container carries
    /// both workload labels.
    pub fn from_runtime_event(event: RuntimeEvent) -> Option<Self> {
        let mut attributes = event.attributes;
        let workload_id = attributes.remove(PIPELINE_ID_LABEL)?;
        let version = attributes.remove(PIPELINE_VERSION_LABEL)?;

        let payload = (!attributes.is_empty())
            .then(|| serde_json::to_value(&attributes).ok())
            .flatten();

        Some(Self {
            timestamp: event.time,
            execution_id: event.actor_id,
            workload_id,
            version,
            action: event.action,
            payload,
        })
    }

    /// Synthesized `running` feedback for a container found at startup.
    pub fn running(container: &Container) -> Option<Self> {
        Some(Self {
            timestamp: container.created.unwrap_or_else(epoch_secs),
            execution_id: container.id.clone(),
            workload_id: container.label(PIPELINE_ID_LABEL)?.to_string(),
            version: container.label(PIPELINE_VERSION_LABEL)?.to_string(),
            action: RUNNING_ACTION.to_string(),
            payload: None,
        })
    }
}

/// Stream feedback until shut down or the receiver is dropped.
///
/// Subscribes to runtime events, then reports every running labelled
/// container once. A failed or ended subscription is replaced after a
/// backoff delay; the delay resets once events flow again.
pub(crate) async fn run_feedback(
    runtime: Arc<dyn ContainerRuntime>,
    tx: mpsc::Sender<FeedbackEvent>,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut enumerated = false;

    while !*shutdown.borrow() {
        let subscribed = tokio::select! {
            _ = shutdown.changed() => break,
            subscribed = runtime.events() => subscribed,
        };

        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, attempt = backoff.failures(), delay_ms = delay.as_millis() as u64, "unable to subscribe to runtime events");
                if !pause(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        debug!("subscribed to runtime events");

        if !enumerated {
            enumerated = true;
            if !report_running(runtime.as_ref(), &tx, &mut shutdown).await {
                break;
            }
        }

        let reason = loop {
            let item = tokio::select! {
                _ = shutdown.changed() => return,
                item = stream.recv() => item,
            };
            match item {
                Some(Ok(event)) => {
                    backoff.reset();
                    let Some(feedback) = FeedbackEvent::from_runtime_event(event) else {
                        continue;
                    };
                    if !deliver(feedback, &tx, &mut shutdown).await {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "event stream closed".to_string(),
            }
        };

        let delay = backoff.next_delay();
        warn!(error = %reason, attempt = backoff.failures(), delay_ms = delay.as_millis() as u64, "runtime event subscription lost, resubscribing");
        if !pause(delay, &mut shutdown).await {
            break;
        }
    }

    debug!("runtime feedback stopped");
}

/// Report running labelled containers. Returns false if the task should stop.
async fn report_running(
    runtime: &dyn ContainerRuntime,
    tx: &mpsc::Sender<FeedbackEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let options = ListOptions::running()
        .with_label_key(PIPELINE_ID_LABEL)
        .with_label_key(PIPELINE_VERSION_LABEL);

    let containers = match runtime.list(&options).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "unable to list running executions");
            return true;
        }
    };

    for feedback in containers.iter().filter_map(FeedbackEvent::running) {
        if !deliver(feedback, tx, shutdown).await {
            return false;
        }
    }
    true
}

async fn deliver(
    feedback: FeedbackEvent,
    tx: &mpsc::Sender<FeedbackEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = tx.send(feedback) => sent.is_ok(),
    }
}

/// Sleep unless shut down first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn attributes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn runtime_event_translation() {
        let event = RuntimeEvent {
            actor_id: "abc".to_string(),
            action: "die".to_string(),
            attributes: attributes(&[
                (PIPELINE_ID_LABEL, "w1"),
                (PIPELINE_VERSION_LABEL, "v1"),
                ("exitCode", "137"),
            ]),
            time: 42,
        };
        let feedback = FeedbackEvent::from_runtime_event(event).unwrap();
        assert_eq!(feedback.execution_id, "abc");
        assert_eq!(feedback.workload_id, "w1");
        assert_eq!(feedback.version, "v1");
        assert_eq!(feedback.action, "die");
        assert_eq!(feedback.timestamp, 42);
        assert_eq!(
            feedback.payload,
            Some(serde_json::json!({ "exitCode": "137" }))
        );
    }

    #[test]
    fn unlabelled_events_are_ignored() {
        let event = RuntimeEvent {
            actor_id: "abc".to_string(),
            action: "start".to_string(),
            attributes: attributes(&[(PIPELINE_ID_LABEL, "w1")]),
            time: 1,
        };
        assert!(FeedbackEvent::from_runtime_event(event).is_none());
    }

    #[test]
    fn running_feedback_from_container() {
        let container = Container {
            id: "abc".to_string(),
            state: "running".to_string(),
            labels: attributes(&[(PIPELINE_ID_LABEL, "w1"), (PIPELINE_VERSION_LABEL, "v2")]),
            created: Some(7),
            ..Default::default()
        };
        let feedback = FeedbackEvent::running(&container).unwrap();
        assert_eq!(feedback.action, RUNNING_ACTION);
        assert_eq!(feedback.version, "v2");
        assert_eq!(feedback.timestamp, 7);
        assert!(feedback.payload.is_none());
    }

    #[test]
    fn serializes_camel_case() {
        let feedback = FeedbackEvent {
            timestamp: 1,
            execution_id: "abc".to_string(),
            workload_id: "w1".to_string(),
            version: "v1".to_string(),
            action: "start".to_string(),
            payload: None,
        };
        let json = serde_json::to_value(&feedback).unwrap();
        assert_eq!(json["executionId"], "abc");
        assert_eq!(json["workloadId"], "w1");
        assert!(json.get("payload").is_none());
    }
}
