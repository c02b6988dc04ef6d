//! Domain types for the pipegrid state store.
//!
//! `WorkloadVersion` is the record an external authority writes for every
//! version of a pipeline. `KvEntry` is the store's own envelope around any
//! value, carrying its revision and the mutation that produced it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownStatus;

/// Identifier of a workload (pipeline), stable across its versions.
pub type WorkloadId = String;

// ── Workloads ─────────────────────────────────────────────────────

/// One versioned deployable unit of a pipeline.
///
/// `status` is kept as the raw string written by the authority: a value
/// outside [`WorkloadStatus`] must still decode so that reconciliation can
/// reject it explicitly instead of the record silently disappearing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadVersion {
    /// Workload identity.
    #[serde(default)]
    pub key: String,
    /// Version string, unique within `key`.
    pub version: String,
    /// Blob key of the pipeline logic.
    #[serde(default)]
    pub content_key: String,
    /// Blob keys of additional artifacts.
    #[serde(default)]
    pub artifact_keys: Vec<String>,
    /// Desired status: draft, published, paused or archived.
    pub status: String,
}

impl WorkloadVersion {
    /// Parse the desired status.
    pub fn desired_status(&self) -> Result<WorkloadStatus, UnknownStatus> {
        self.status.parse()
    }

    /// Copy of this version with its status replaced.
    pub fn with_status(&self, status: WorkloadStatus) -> Self {
        Self {
            status: status.as_str().to_string(),
            ..self.clone()
        }
    }
}

/// Desired lifecycle status of a workload version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Draft,
    Published,
    Paused,
    Archived,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Draft => "draft",
            WorkloadStatus::Published => "published",
            WorkloadStatus::Paused => "paused",
            WorkloadStatus::Archived => "archived",
        }
    }
}

impl FromStr for WorkloadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(WorkloadStatus::Draft),
            "published" => Ok(WorkloadStatus::Published),
            "paused" => Ok(WorkloadStatus::Paused),
            "archived" => Ok(WorkloadStatus::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Store entries ─────────────────────────────────────────────────

/// The mutation that produced a `KvEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvOperation {
    Put,
    /// Tombstone; the entry keeps the last value written before the delete.
    Delete,
    /// Compaction; only ever seen on a watch, never stored.
    Purge,
}

/// A versioned value as stored and as delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Store-wide sequence number of the mutation.
    pub revision: u64,
    pub operation: KvOperation,
    /// Unix timestamp (seconds) of the mutation.
    pub updated_at: u64,
}

impl KvEntry {
    pub fn is_live(&self) -> bool {
        self.operation == KvOperation::Put
    }
}
