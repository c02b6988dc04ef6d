//! Pattern watches over the store's mutation feed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use redb::Database;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::StateResult;
use crate::pattern::KeyPattern;
use crate::store::scan;
use crate::types::KvEntry;

/// A live subscription to mutations of keys matching a pattern.
///
/// Yields the replayed snapshot first, then live notifications in commit
/// order. A notification at or below a key's last delivered revision is
/// skipped, so the replay/subscribe overlap never produces duplicates.
///
/// The notification buffer is shared by every key in the store. A watch
/// that falls behind it re-reads its matching keys from the store and
/// yields whatever changed since it last delivered them. Purges missed
/// that way are not reported.
pub struct KvWatch {
    pattern: KeyPattern,
    pending: VecDeque<KvEntry>,
    delivered: HashMap<String, u64>,
    rx: broadcast::Receiver<KvEntry>,
    db: Arc<Database>,
}

impl KvWatch {
    pub(crate) fn new(
        pattern: KeyPattern,
        initial: Vec<KvEntry>,
        rx: broadcast::Receiver<KvEntry>,
        db: Arc<Database>,
    ) -> Self {
        let delivered = initial
            .iter()
            .map(|entry| (entry.key.clone(), entry.revision))
            .collect();
        Self {
            pattern,
            pending: initial.into(),
            delivered,
            rx,
            db,
        }
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    /// Next matching entry.
    ///
    /// Returns `None` once the store is gone, and an error only if the
    /// store cannot be read while catching up.
    pub async fn next(&mut self) -> Option<StateResult<KvEntry>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }

            match self.rx.recv().await {
                Ok(entry) => {
                    if self.is_new(&entry) {
                        self.delivered.insert(entry.key.clone(), entry.revision);
                        return Some(Ok(entry));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(pattern = %self.pattern, missed, "watch fell behind; catching up from the store");
                    if let Err(e) = self.catch_up() {
                        return Some(Err(e));
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn is_new(&self, entry: &KvEntry) -> bool {
        self.pattern.matches(&entry.key)
            && self
                .delivered
                .get(&entry.key)
                .is_none_or(|&last| entry.revision > last)
    }

    /// Queue every matching entry newer than what was delivered for its key.
    fn catch_up(&mut self) -> StateResult<()> {
        for entry in scan(&self.db, &self.pattern, true)? {
            if self.is_new(&entry) {
                self.delivered.insert(entry.key.clone(), entry.revision);
                self.pending.push_back(entry);
            }
        }
        Ok(())
    }
}
