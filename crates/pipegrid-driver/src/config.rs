//! Executor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "jeffail/benthos:latest";

/// Engine endpoint used when neither `url` nor `fromEnv` is set.
pub const DEFAULT_RUNTIME_URL: &str = "unix:///var/run/docker.sock";

/// How the driver reaches its container runtime and what it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Engine endpoint: `unix://<path>`, `tcp://<host:port>` or `http://<host:port>`.
    pub url: Option<String>,
    /// Resolve the endpoint from `DOCKER_HOST`, falling back to the default socket.
    pub from_env: bool,
    /// Image every execution runs.
    pub image: String,
    /// Pull `image` before creating an execution.
    pub pull_image: bool,
    /// Grace period given to a stopping execution.
    pub stop_timeout_secs: u64,
    /// Delay between feedback resubscription attempts.
    pub feedback_backoff: BackoffConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url: None,
            from_env: false,
            image: DEFAULT_IMAGE.to_string(),
            pull_image: true,
            stop_timeout_secs: 10,
            feedback_backoff: BackoffConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
        }
    }
}
