//! In-memory container runtime.
//!
//! Tracks container state in a map, records every call, and emits the
//! same lifecycle actions a Docker engine would. Failures can be injected
//! per operation, calls can be held in flight, and live event streams can
//! be broken on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    Container, ContainerRuntime, ContainerSpec, EventStream, ListOptions, RuntimeEvent,
};

const EVENT_BUFFER: usize = 256;

/// Runtime operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Ping,
    List,
    Inspect,
    PullImage,
    Create,
    Start,
    Stop,
    Remove,
    Events,
}

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Ping,
    List { all: bool },
    Inspect(String),
    PullImage(String),
    /// Container name.
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Events,
}

impl RuntimeCall {
    /// Whether the call changes container state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Create(_) | Self::Start(_) | Self::Stop(_) | Self::Remove(_)
        )
    }
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, Container>,
    next_id: u64,
    calls: Vec<RuntimeCall>,
    failures: HashMap<RuntimeOp, u32>,
    gates: HashMap<RuntimeOp, Arc<Semaphore>>,
    held: HashMap<RuntimeOp, usize>,
    subscribers: Vec<mpsc::Sender<RuntimeResult<RuntimeEvent>>>,
}

impl Inner {
    fn record(&mut self, call: RuntimeCall, op: RuntimeOp) -> RuntimeResult<()> {
        self.calls.push(call);
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RuntimeError::Request(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn emit(&mut self, action: &str, container: &Container) {
        let mut attributes = container.labels.clone();
        attributes.insert("name".to_string(), container.name.clone());
        attributes.insert("image".to_string(), container.image.clone());
        let event = RuntimeEvent {
            actor_id: container.id.clone(),
            action: action.to_string(),
            attributes,
            time: epoch_secs(),
        };
        self.broadcast(event);
    }

    fn broadcast(&mut self, event: RuntimeEvent) {
        self.subscribers
            .retain(|tx| tx.try_send(Ok(event.clone())).is_ok() || !tx.is_closed());
    }

    fn container_mut(&mut self, id: &str) -> RuntimeResult<&mut Container> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

/// Deterministic `ContainerRuntime` held entirely in memory.
///
/// Clones share state, so a test can keep a handle while the driver owns
/// another.
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Calls that changed container state, in order.
    pub fn mutating_calls(&self) -> Vec<RuntimeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.is_mutating())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: RuntimeOp, times: u32) {
        *self.lock().failures.entry(op).or_default() += times;
    }

    /// Block calls of `op` before they take effect, until `release`.
    pub fn hold(&self, op: RuntimeOp) {
        self.lock()
            .gates
            .entry(op)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Let held and future calls of `op` through.
    pub fn release(&self, op: RuntimeOp) {
        if let Some(gate) = self.lock().gates.remove(&op) {
            gate.close();
        }
    }

    /// How many calls of `op` have arrived at a hold so far.
    pub fn held_calls(&self, op: RuntimeOp) -> usize {
        self.lock().held.get(&op).copied().unwrap_or(0)
    }

    async fn gate(&self, op: RuntimeOp) {
        let gate = {
            let mut inner = self.lock();
            let gate = inner.gates.get(&op).cloned();
            if gate.is_some() {
                *inner.held.entry(op).or_default() += 1;
            }
            gate
        };
        if let Some(gate) = gate {
            // Closed on release.
            let _ = gate.acquire().await;
        }
    }

    /// Snapshot of all containers.
    pub fn containers(&self) -> Vec<Container> {
        self.lock().containers.values().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        self.lock().containers.get(id).cloned()
    }

    /// Add a container as if something else had created it. No event is
    /// emitted.
    pub fn insert_container(&self, container: Container) {
        self.lock()
            .containers
            .insert(container.id.clone(), container);
    }

    /// Publish a raw event to every live subscription.
    pub fn emit(&self, event: RuntimeEvent) {
        self.lock().broadcast(event);
    }

    /// End every live event subscription with an error.
    pub fn break_event_streams(&self) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for tx in subscribers {
            let _ = tx.try_send(Err(RuntimeError::EventStream(
                "connection reset".to_string(),
            )));
        }
    }

    /// Number of event subscriptions still open.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.gate(RuntimeOp::Ping).await;
        self.lock().record(RuntimeCall::Ping, RuntimeOp::Ping)
    }

    async fn list(&self, options: &ListOptions) -> RuntimeResult<Vec<Container>> {
        self.gate(RuntimeOp::List).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::List { all: options.all }, RuntimeOp::List)?;
        Ok(inner
            .containers
            .values()
            .filter(|c| options.matches(c))
            .cloned()
            .collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Option<Container>> {
        self.gate(RuntimeOp::Inspect).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Inspect(id.to_string()), RuntimeOp::Inspect)?;
        Ok(inner.containers.get(id).cloned())
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        self.gate(RuntimeOp::PullImage).await;
        self.lock()
            .record(RuntimeCall::PullImage(image.to_string()), RuntimeOp::PullImage)
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.gate(RuntimeOp::Create).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Create(spec.name.clone()), RuntimeOp::Create)?;

        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Status {
                status: 409,
                message: format!("container name {:?} is already in use", spec.name),
            });
        }

        inner.next_id += 1;
        let container = Container {
            id: format!("mem{:08x}", inner.next_id),
            name: spec.name.clone(),
            image: spec.image.clone(),
            state: "created".to_string(),
            labels: spec
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created: Some(epoch_secs()),
        };
        inner.emit("create", &container);
        let id = container.id.clone();
        inner.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.gate(RuntimeOp::Start).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Start(id.to_string()), RuntimeOp::Start)?;

        let container = inner.container_mut(id)?;
        if container.state == "running" {
            return Ok(());
        }
        container.state = "running".to_string();
        let container = container.clone();
        inner.emit("start", &container);
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        self.gate(RuntimeOp::Stop).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Stop(id.to_string()), RuntimeOp::Stop)?;

        let container = inner.container_mut(id)?;
        if !matches!(container.state.as_str(), "running" | "restarting" | "paused") {
            return Ok(());
        }
        container.state = "exited".to_string();
        let container = container.clone();
        inner.emit("die", &container);
        inner.emit("stop", &container);
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.gate(RuntimeOp::Remove).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Remove(id.to_string()), RuntimeOp::Remove)?;

        let container = inner.container_mut(id)?;
        if container.state == "running" && !force {
            return Err(RuntimeError::Status {
                status: 409,
                message: format!("container {id} is running"),
            });
        }
        if let Some(container) = inner.containers.remove(id) {
            inner.emit("destroy", &container);
        }
        Ok(())
    }

    async fn events(&self) -> RuntimeResult<EventStream> {
        self.gate(RuntimeOp::Events).await;
        let mut inner = self.lock();
        inner.record(RuntimeCall::Events, RuntimeOp::Events)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        inner.subscribers.push(tx);
        Ok(rx)
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
