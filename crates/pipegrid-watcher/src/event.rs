//! Change events and watcher configuration.

use serde::{Deserialize, Serialize};

use pipegrid_state::{WorkloadId, WorkloadVersion};

/// Kind of store mutation behind a `ChangeEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Put,
    Delete,
}

/// A workload version was written or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub workload_id: WorkloadId,
    /// The record as written; for deletes, the last value before the delete.
    pub version: WorkloadVersion,
    /// Store revision of the mutation. Increases per key.
    pub revision: u64,
}

/// Where the watcher finds workload versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// First key token of every workload version key.
    pub prefix: String,
}
