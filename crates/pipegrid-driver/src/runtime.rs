//! The container runtime seam.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RuntimeResult;

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw runtime status, e.g. `running` or `exited`.
    pub state: String,
    pub labels: HashMap<String, String>,
    /// Creation time in epoch seconds, when the runtime reports one.
    pub created: Option<i64>,
}

impl Container {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
}

/// Container listing filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOptions {
    /// Include containers that are not running.
    pub all: bool,
    /// Exact `label=value` matches, all of which must hold.
    pub labels: BTreeMap<String, String>,
    /// Containers carrying these labels, whatever the value.
    pub label_keys: Vec<String>,
}

impl ListOptions {
    /// Every container, running or not.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Running containers only.
    pub fn running() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_label_key(mut self, name: impl Into<String>) -> Self {
        self.label_keys.push(name.into());
        self
    }

    /// Whether a container passes this filter.
    pub fn matches(&self, container: &Container) -> bool {
        if !self.all && container.state != "running" {
            return false;
        }
        self.labels
            .iter()
            .all(|(name, value)| container.label(name) == Some(value.as_str()))
            && self
                .label_keys
                .iter()
                .all(|name| container.labels.contains_key(name))
    }
}

/// One lifecycle event from the runtime's container event stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeEvent {
    /// Container id.
    pub actor_id: String,
    /// Lifecycle action, e.g. `create`, `start`, `die`.
    pub action: String,
    /// Container labels plus runtime-specific attributes such as `name`.
    pub attributes: HashMap<String, String>,
    /// Epoch seconds.
    pub time: i64,
}

/// Receiving side of a runtime event subscription.
///
/// An `Err` item or the end of the channel means the subscription is gone.
pub type EventStream = mpsc::Receiver<RuntimeResult<RuntimeEvent>>;

/// Operations the driver needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is reachable.
    async fn ping(&self) -> RuntimeResult<()>;

    async fn list(&self, options: &ListOptions) -> RuntimeResult<Vec<Container>>;

    /// Inspect one container. `None` if it does not exist.
    async fn inspect(&self, id: &str) -> RuntimeResult<Option<Container>>;

    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Start a container. Starting a running container is not an error.
    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// Stop a container, killing it after `timeout`. Stopping a stopped
    /// container is not an error.
    async fn stop(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()>;

    /// Subscribe to container lifecycle events.
    async fn events(&self) -> RuntimeResult<EventStream>;
}
