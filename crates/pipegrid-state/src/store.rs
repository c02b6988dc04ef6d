//! StateStore: redb-backed versioned key/value store.
//!
//! Values are wrapped in `KvEntry` envelopes and JSON-serialized into redb's
//! `&[u8]` value columns. Every mutation draws the next store-wide revision
//! and is broadcast to watchers once its transaction has committed. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::pattern::{validate_key, KeyPattern};
use crate::tables::*;
use crate::types::*;
use crate::watch::KvWatch;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Notifications buffered per watcher before it has to resynchronize.
const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Thread-safe versioned store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Serializes commit + publish so watchers see revisions in order.
    writes: Arc<Mutex<()>>,
    notify: broadcast::Sender<KvEntry>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the watch buffer size. Only affects watches opened afterwards.
    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        self.notify = broadcast::channel(capacity.max(1)).0;
        self
    }

    fn from_database(db: Database) -> Self {
        let (notify, _) = broadcast::channel(DEFAULT_WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            writes: Arc::new(Mutex::new(())),
            notify,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(BLOBS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Versioned entries ──────────────────────────────────────────

    /// Store a value under `key`. Returns the revision of the write.
    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        validate_key(key)?;
        let _guard = self.lock_writes();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry = KvEntry {
            key: key.to_string(),
            value: value.to_vec(),
            revision: next_revision(&txn)?,
            operation: KvOperation::Put,
            updated_at: epoch_secs(),
        };
        write_entry(&txn, &entry)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(%key, revision = entry.revision, "entry stored");
        let revision = entry.revision;
        self.publish(entry);
        Ok(revision)
    }

    /// Get the live value under `key`. Tombstones read as `None`.
    pub fn get(&self, key: &str) -> StateResult<Option<KvEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: KvEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(entry.is_live().then_some(entry))
            }
            None => Ok(None),
        }
    }

    /// Delete the value under `key`, leaving a tombstone that carries the
    /// last value. Returns the tombstone's revision, or `None` if there was
    /// no live value.
    pub fn delete(&self, key: &str) -> StateResult<Option<u64>> {
        validate_key(key)?;
        let _guard = self.lock_writes();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous = match read_entry(&txn, key)? {
            Some(entry) if entry.is_live() => entry,
            _ => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(None);
            }
        };
        let tombstone = KvEntry {
            key: key.to_string(),
            value: previous.value,
            revision: next_revision(&txn)?,
            operation: KvOperation::Delete,
            updated_at: epoch_secs(),
        };
        write_entry(&txn, &tombstone)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(%key, revision = tombstone.revision, "entry deleted");
        let revision = tombstone.revision;
        self.publish(tombstone);
        Ok(Some(revision))
    }

    /// Drop every trace of `key`, live value or tombstone. Returns true if
    /// anything existed. Watchers receive a purge notification.
    pub fn purge(&self, key: &str) -> StateResult<bool> {
        validate_key(key)?;
        let _guard = self.lock_writes();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            table.remove(key).map_err(map_err!(Write))?.is_some()
        };
        if !existed {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(false);
        }
        let marker = KvEntry {
            key: key.to_string(),
            value: Vec::new(),
            revision: next_revision(&txn)?,
            operation: KvOperation::Purge,
            updated_at: epoch_secs(),
        };
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(%key, revision = marker.revision, "entry purged");
        self.publish(marker);
        Ok(true)
    }

    /// List live entries whose key matches `pattern`.
    pub fn list(&self, pattern: &KeyPattern) -> StateResult<Vec<KvEntry>> {
        scan(&self.db, pattern, false)
    }

    /// Last revision issued by this store (0 if nothing was ever written).
    pub fn revision(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(current)
    }

    /// Watch keys matching `pattern`.
    ///
    /// The watch first yields the current entries, tombstones included as
    /// deletes, then every later put, delete and purge on a matching key.
    pub fn watch(&self, pattern: &str) -> StateResult<KvWatch> {
        let pattern = KeyPattern::parse(pattern)?;
        // Subscribe before the snapshot so no commit falls in between.
        let rx = self.notify.subscribe();
        let initial = scan(&self.db, &pattern, true)?;
        debug!(%pattern, replay = initial.len(), "watch opened");
        Ok(KvWatch::new(pattern, initial, rx, self.db.clone()))
    }

    // ── Blobs ──────────────────────────────────────────────────────

    /// Insert or replace a blob.
    pub fn put_blob(&self, key: &str, data: &[u8]) -> StateResult<()> {
        if key.is_empty() {
            return Err(StateError::InvalidKey("empty blob key".to_string()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            table.insert(key, data).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, bytes = data.len(), "blob stored");
        Ok(())
    }

    /// Fetch a blob.
    pub fn get_blob(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Delete a blob. Returns true if it existed.
    pub fn delete_blob(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, entry: KvEntry) {
        // No receivers is fine: nobody is watching.
        let _ = self.notify.send(entry);
    }
}

/// Entries whose key matches `pattern`, in revision order. Tombstones are
/// included only when `tombstones` is set.
pub(crate) fn scan(
    db: &Database,
    pattern: &KeyPattern,
    tombstones: bool,
) -> StateResult<Vec<KvEntry>> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for item in table.iter().map_err(map_err!(Read))? {
        let (key, value) = item.map_err(map_err!(Read))?;
        if !pattern.matches(key.value()) {
            continue;
        }
        let entry: KvEntry =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if tombstones || entry.is_live() {
            results.push(entry);
        }
    }
    results.sort_by_key(|entry| entry.revision);
    Ok(results)
}

/// Bump and return the store-wide revision inside a write transaction.
fn next_revision(txn: &WriteTransaction) -> StateResult<u64> {
    let mut table = txn.open_table(META).map_err(map_err!(Table))?;
    let current = table
        .get(REVISION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(REVISION_KEY, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn read_entry(txn: &WriteTransaction, key: &str) -> StateResult<Option<KvEntry>> {
    let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
    let guard = table.get(key).map_err(map_err!(Read))?;
    match guard {
        Some(guard) => {
            let entry = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

fn write_entry(txn: &WriteTransaction, entry: &KvEntry) -> StateResult<()> {
    let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
    table
        .insert(entry.key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
