//! pipegrid-watcher: turns store mutations into typed change events.
//!
//! The `Watcher` subscribes to `<prefix>.pipeline.*.version.*` on the state
//! store and delivers a `ChangeEvent` for every put or delete of a workload
//! version. Purges are compaction and never surface; records that fail to
//! decode are logged and skipped.
//!
//! A lost subscription ends the watch. Recovery is a new generation, started
//! by the orchestrator on the next configuration delivery.

pub mod error;
pub mod event;
pub mod watcher;

pub use error::{WatcherError, WatcherResult};
pub use event::{ChangeEvent, Operation, RepositoryConfig};
pub use watcher::Watcher;
