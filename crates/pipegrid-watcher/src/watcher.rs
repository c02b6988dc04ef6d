//! Watcher: store subscription to change event channel.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pipegrid_state::pattern::is_valid_token;
use pipegrid_state::{
    workload_id_from_key, workload_pattern, KvEntry, KvOperation, StateStore, WorkloadVersion,
};

use crate::error::{WatcherError, WatcherResult};
use crate::event::{ChangeEvent, Operation, RepositoryConfig};

/// Change events buffered before `watch` waits on the consumer.
const UPDATE_BUFFER: usize = 64;

/// Watches workload versions under one prefix.
///
/// Run [`Watcher::watch`] in its own task and drain the receiver returned
/// by [`Watcher::updates`]; an undrained channel blocks the watch.
pub struct Watcher {
    store: StateStore,
    subject: String,
    updates_tx: mpsc::Sender<ChangeEvent>,
    updates_rx: Option<mpsc::Receiver<ChangeEvent>>,
    closed: watch::Sender<bool>,
}

impl Watcher {
    /// Create a watcher over `store` for the configured prefix.
    pub fn new(store: StateStore, config: &RepositoryConfig) -> WatcherResult<Self> {
        if !is_valid_token(&config.prefix) {
            return Err(WatcherError::InvalidPrefix(config.prefix.clone()));
        }

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (closed, _) = watch::channel(false);

        Ok(Self {
            store,
            subject: workload_pattern(&config.prefix),
            updates_tx,
            updates_rx: Some(updates_rx),
            closed,
        })
    }

    /// The key pattern being watched.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Take the read side of the change event channel. Returns `None` after
    /// the first call.
    pub fn updates(&mut self) -> Option<mpsc::Receiver<ChangeEvent>> {
        self.updates_rx.take()
    }

    /// Release the subscription. `watch` returns and nothing more is
    /// delivered. Calling it again has no effect.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(subject = %self.subject, "watcher closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stream change events until closed, shut down, or the subscription
    /// is lost. Only the last case returns an error.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> WatcherResult<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() || *shutdown.borrow() {
            return Ok(());
        }

        let mut feed = match self.store.watch(&self.subject) {
            Ok(feed) => feed,
            Err(e) => {
                error!(subject = %self.subject, error = %e, "unable to watch for pipeline updates");
                return Err(e.into());
            }
        };
        info!(subject = %self.subject, "watching for pipeline updates");

        loop {
            let notification = tokio::select! {
                _ = closed.changed() => break,
                _ = shutdown.changed() => break,
                notification = feed.next() => notification,
            };

            let entry = match notification {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    error!(subject = %self.subject, error = %e, "pipeline update subscription lost");
                    return Err(e.into());
                }
                None => {
                    error!(subject = %self.subject, "pipeline update subscription closed by store");
                    return Err(WatcherError::SubscriptionClosed);
                }
            };

            let Some(event) = translate(entry) else {
                continue;
            };

            tokio::select! {
                _ = closed.changed() => break,
                _ = shutdown.changed() => break,
                sent = self.updates_tx.send(event) => {
                    if sent.is_err() {
                        debug!(subject = %self.subject, "update receiver dropped");
                        break;
                    }
                }
            }
        }

        info!(subject = %self.subject, "stopped watching for pipeline updates");
        Ok(())
    }
}

/// Turn a store notification into a change event, or drop it.
fn translate(entry: KvEntry) -> Option<ChangeEvent> {
    let operation = match entry.operation {
        KvOperation::Put => Operation::Put,
        KvOperation::Delete => Operation::Delete,
        KvOperation::Purge => {
            debug!(key = %entry.key, revision = entry.revision, "purge ignored");
            return None;
        }
    };

    let version: WorkloadVersion = match serde_json::from_slice(&entry.value) {
        Ok(version) => version,
        Err(e) => {
            error!(key = %entry.key, revision = entry.revision, error = %e, "unable to decode stored pipeline version");
            return None;
        }
    };

    let Some(workload_id) = workload_id_from_key(&entry.key) else {
        warn!(key = %entry.key, "key does not name a workload, skipping");
        return None;
    };

    Some(ChangeEvent {
        operation,
        workload_id: workload_id.to_string(),
        version,
        revision: entry.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinHandle;

    fn config(prefix: &str) -> RepositoryConfig {
        RepositoryConfig {
            prefix: prefix.to_string(),
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

    fn entry(key: &str, value: &[u8], operation: KvOperation) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: value.to_vec(),
            revision: 7,
            operation,
            updated_at: 1000,
        }
    }

    async fn recv(updates: &mut mpsc::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("timed out waiting for change event")
            .expect("update channel closed")
    }

    struct Running {
        watcher: Arc<Watcher>,
        updates: mpsc::Receiver<ChangeEvent>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<WatcherResult<()>>,
    }

    /// Start a watcher and wait until it is subscribed.
    async fn start(store: &StateStore) -> Running {
        let mut watcher = Watcher::new(store.clone(), &config("acme")).unwrap();
        let mut updates = watcher.updates().unwrap();
        let watcher = Arc::new(watcher);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.watch(shutdown_rx).await }
        });

        store
            .put_workload_version("acme", "sentinel", &version("v0", "draft"))
            .unwrap();
        let first = recv(&mut updates).await;
        assert_eq!(first.workload_id, "sentinel");

        Running {
            watcher,
            updates,
            shutdown,
            task,
        }
    }

    // ── translate ──────────────────────────────────────────────────

    #[test]
    fn translate_put() {
        let value = serde_json::to_vec(&version("v1", "published")).unwrap();
        let event = translate(entry("acme.pipeline.w1.version.v1", &value, KvOperation::Put)).unwrap();
        assert_eq!(event.operation, Operation::Put);
        assert_eq!(event.workload_id, "w1");
        assert_eq!(event.version.version, "v1");
        assert_eq!(event.revision, 7);
    }

    #[test]
    fn translate_drops_purge() {
        assert!(translate(entry("acme.pipeline.w1.version.v1", b"", KvOperation::Purge)).is_none());
    }

    #[test]
    fn translate_drops_undecodable_payload() {
        assert!(translate(entry("acme.pipeline.w1.version.v1", b"{not json", KvOperation::Put)).is_none());
    }

    #[test]
    fn translate_drops_short_keys() {
        let value = serde_json::to_vec(&version("v1", "published")).unwrap();
        assert!(translate(entry("a.b", &value, KvOperation::Put)).is_none());
    }

    #[test]
    fn new_rejects_bad_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            Watcher::new(store.clone(), &config("")),
            Err(WatcherError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Watcher::new(store, &config("a.b")),
            Err(WatcherError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn updates_can_only_be_taken_once() {
        let store = StateStore::open_in_memory().unwrap();
        let mut watcher = Watcher::new(store, &config("acme")).unwrap();
        assert!(watcher.updates().is_some());
        assert!(watcher.updates().is_none());
    }

    // ── watch ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn delivers_puts_and_deletes_with_revisions() {
        let store = StateStore::open_in_memory().unwrap();
        let mut running = start(&store).await;

        let rev = store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();
        let put = recv(&mut running.updates).await;
        assert_eq!(put.operation, Operation::Put);
        assert_eq!(put.workload_id, "w1");
        assert_eq!(put.revision, rev);

        store.delete_workload_version("acme", "w1", "v1").unwrap();
        let delete = recv(&mut running.updates).await;
        assert_eq!(delete.operation, Operation::Delete);
        assert_eq!(delete.version.status, "published");
        assert!(delete.revision > put.revision);
    }

    #[tokio::test]
    async fn purge_never_produces_an_event() {
        let store = StateStore::open_in_memory().unwrap();
        let mut running = start(&store).await;

        store.purge("acme.pipeline.sentinel.version.v0").unwrap();
        store
            .put_workload_version("acme", "w2", &version("v1", "draft"))
            .unwrap();

        let next = recv(&mut running.updates).await;
        assert_eq!(next.workload_id, "w2");
        assert_eq!(next.operation, Operation::Put);
    }

    #[tokio::test]
    async fn corrupt_record_does_not_stop_the_watch() {
        let store = StateStore::open_in_memory().unwrap();
        let mut running = start(&store).await;

        store.put("acme.pipeline.w1.version.v1", b"garbage").unwrap();
        store
            .put_workload_version("acme", "w1", &version("v2", "published"))
            .unwrap();

        let next = recv(&mut running.updates).await;
        assert_eq!(next.version.version, "v2");
        assert!(!running.task.is_finished());
    }

    #[tokio::test]
    async fn replays_existing_versions_on_start() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();

        let mut watcher = Watcher::new(store.clone(), &config("acme")).unwrap();
        let mut updates = watcher.updates().unwrap();
        let (_shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move { watcher.watch(shutdown_rx).await });

        let first = recv(&mut updates).await;
        assert_eq!(first.workload_id, "w1");
        assert_eq!(first.version.status, "published");
    }

    #[tokio::test]
    async fn close_ends_watch_and_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let running = start(&store).await;

        running.watcher.close();
        running.watcher.close();
        assert!(running.watcher.is_closed());

        let result = tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_ends_watch() {
        let store = StateStore::open_in_memory().unwrap();
        let running = start(&store).await;

        running.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn watch_after_close_returns_immediately() {
        let store = StateStore::open_in_memory().unwrap();
        let watcher = Watcher::new(store, &config("acme")).unwrap();
        watcher.close();
        let (_shutdown, shutdown_rx) = watch::channel(false);
        assert!(watcher.watch(shutdown_rx).await.is_ok());
    }

    #[tokio::test]
    async fn replays_deletes_made_before_start() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workload_version("acme", "w1", &version("v1", "published"))
            .unwrap();
        store.delete_workload_version("acme", "w1", "v1").unwrap();

        let mut watcher = Watcher::new(store.clone(), &config("acme")).unwrap();
        let mut updates = watcher.updates().unwrap();
        let (_shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move { watcher.watch(shutdown_rx).await });

        let event = recv(&mut updates).await;
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.workload_id, "w1");
        assert_eq!(event.version.version, "v1");
    }

    #[tokio::test]
    async fn slow_consumer_survives_unrelated_write_bursts() {
        let store = StateStore::open_in_memory().unwrap().with_watch_capacity(16);
        let mut running = start(&store).await;

        // Fill the update buffer; the watch blocks on the next send.
        for i in 0..70 {
            store
                .put_workload_version("acme", &format!("w{i}"), &version("v1", "draft"))
                .unwrap();
            tokio::task::yield_now().await;
        }
        // Writes under another prefix overflow the shared notification buffer.
        for i in 0..100 {
            store.put(&format!("other.k{i}"), b"noise").unwrap();
        }
        store
            .put_workload_version("acme", "late", &version("v1", "draft"))
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let event = recv(&mut running.updates).await;
            let done = event.workload_id == "late";
            seen.push(event.workload_id);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 71);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 71);
        assert!(!running.task.is_finished());
    }
}
