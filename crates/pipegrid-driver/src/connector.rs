//! Opening runtime clients from executor configuration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{ExecutorConfig, DEFAULT_RUNTIME_URL};
use crate::docker::DockerRuntime;
use crate::error::RuntimeResult;
use crate::memory::InMemoryRuntime;
use crate::runtime::ContainerRuntime;

/// Opens a fresh runtime client for each generation.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, config: &ExecutorConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>>;
}

/// Builds Docker Engine clients. Reachability is checked by the driver's
/// startup ping, not here.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerConnector;

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self, config: &ExecutorConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        let url = resolve_url(config, std::env::var("DOCKER_HOST").ok());
        let runtime = DockerRuntime::new(&url)?;
        debug!(%url, "docker engine client ready");
        Ok(Arc::new(runtime))
    }
}

/// Hands out the same in-memory runtime every time.
#[async_trait]
impl RuntimeConnector for InMemoryRuntime {
    async fn connect(&self, _config: &ExecutorConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Engine URL for `config`. `docker_host` is the value of `DOCKER_HOST`,
/// consulted only when `fromEnv` is set.
pub fn resolve_url(config: &ExecutorConfig, docker_host: Option<String>) -> String {
    let configured = if config.from_env {
        docker_host.filter(|host| !host.is_empty())
    } else {
        config.url.clone().filter(|url| !url.is_empty())
    };
    configured.unwrap_or_else(|| DEFAULT_RUNTIME_URL.to_string())
}
