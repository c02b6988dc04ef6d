//! Typed access to workload version records.
//!
//! Records live under `<prefix>.pipeline.<workload_id>.version.<version>`
//! as JSON-serialized `WorkloadVersion`s.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::pattern::{is_valid_token, KeyPattern};
use crate::store::StateStore;
use crate::types::{WorkloadId, WorkloadVersion};

/// Store key of one workload version.
pub fn workload_key(prefix: &str, workload_id: &str, version: &str) -> StateResult<String> {
    for (what, token) in [("prefix", prefix), ("workload id", workload_id), ("version", version)] {
        if !is_valid_token(token) {
            return Err(StateError::InvalidKey(format!("invalid {what}: {token:?}")));
        }
    }
    Ok(format!("{prefix}.pipeline.{workload_id}.version.{version}"))
}

/// Pattern matching every workload version under `prefix`.
pub fn workload_pattern(prefix: &str) -> String {
    format!("{prefix}.pipeline.*.version.*")
}

/// Workload id of a store key: its third-from-last segment.
///
/// Returns `None` for keys with fewer than three segments.
pub fn workload_id_from_key(key: &str) -> Option<&str> {
    key.rsplit('.').nth(2)
}

impl StateStore {
    /// Insert or update a workload version. Returns the write's revision.
    pub fn put_workload_version(
        &self,
        prefix: &str,
        workload_id: &str,
        version: &WorkloadVersion,
    ) -> StateResult<u64> {
        let key = workload_key(prefix, workload_id, &version.version)?;
        let value = serde_json::to_vec(version).map_err(|e| StateError::Serialize(e.to_string()))?;
        let revision = self.put(&key, &value)?;
        debug!(%workload_id, version = %version.version, status = %version.status, revision, "workload version stored");
        Ok(revision)
    }

    /// Get one workload version.
    pub fn get_workload_version(
        &self,
        prefix: &str,
        workload_id: &str,
        version: &str,
    ) -> StateResult<Option<WorkloadVersion>> {
        let key = workload_key(prefix, workload_id, version)?;
        match self.get(&key)? {
            Some(entry) => {
                let decoded = serde_json::from_slice(&entry.value)
                    .map_err(|e| StateError::Deserialize(e.to_string()))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// List all live workload versions under `prefix` as `(workload_id, version)`.
    pub fn list_workload_versions(
        &self,
        prefix: &str,
    ) -> StateResult<Vec<(WorkloadId, WorkloadVersion)>> {
        if !is_valid_token(prefix) {
            return Err(StateError::InvalidKey(format!("invalid prefix: {prefix:?}")));
        }
        self.decode_versions(&KeyPattern::parse(&workload_pattern(prefix))?)
    }

    /// List the live versions of one workload.
    pub fn list_versions_for_workload(
        &self,
        prefix: &str,
        workload_id: &str,
    ) -> StateResult<Vec<WorkloadVersion>> {
        if !is_valid_token(prefix) || !is_valid_token(workload_id) {
            return Err(StateError::InvalidKey(format!(
                "invalid prefix or workload id: {prefix:?}/{workload_id:?}"
            )));
        }
        let pattern = KeyPattern::parse(&format!("{prefix}.pipeline.{workload_id}.version.*"))?;
        Ok(self
            .decode_versions(&pattern)?
            .into_iter()
            .map(|(_, version)| version)
            .collect())
    }

    /// Delete a workload version. Returns true if it existed.
    pub fn delete_workload_version(
        &self,
        prefix: &str,
        workload_id: &str,
        version: &str,
    ) -> StateResult<bool> {
        let key = workload_key(prefix, workload_id, version)?;
        Ok(self.delete(&key)?.is_some())
    }

    fn decode_versions(
        &self,
        pattern: &KeyPattern,
    ) -> StateResult<Vec<(WorkloadId, WorkloadVersion)>> {
        let mut results = Vec::new();
        for entry in self.list(pattern)? {
            let Some(workload_id) = workload_id_from_key(&entry.key) else {
                continue;
            };
            let version: WorkloadVersion = serde_json::from_slice(&entry.value)
                .map_err(|e| StateError::Deserialize(e.to_string()))?;
            results.push((workload_id.to_string(), version));
        }
        Ok(results)
    }
}
