//! Loop configuration, delivered as JSON blobs.

use serde::{Deserialize, Serialize};

use pipegrid_driver::ExecutorConfig;
use pipegrid_watcher::RepositoryConfig;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Everything one generation is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl OrchestratorConfig {
    pub fn from_slice(blob: &[u8]) -> OrchestratorResult<Self> {
        serde_json::from_slice(blob).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    pub fn to_vec(&self) -> OrchestratorResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| OrchestratorError::Config(e.to_string()))
    }
}
