//! pipegrid-driver: reconciles workload versions against a container runtime.
//!
//! The `Driver` maps a workload version's desired status onto a target
//! execution state and issues the runtime calls needed to get there:
//!
//! | status      | target  | actions                                  |
//! |-------------|---------|------------------------------------------|
//! | `published` | started | create if absent, then start if needed   |
//! | `draft`     | present | create if absent                         |
//! | `paused`    | stopped | stop if present and not already stopped  |
//! | `archived`  | absent  | stop then remove if present              |
//!
//! Executions are found by label on every call; the runtime is the only
//! source of truth. Independently of `ensure`, the driver streams runtime
//! lifecycle activity for labelled containers as `FeedbackEvent`s.
//!
//! Runtimes plug in through the `ContainerRuntime` trait: `DockerRuntime`
//! talks to a Docker Engine over hyper, `InMemoryRuntime` is a deterministic
//! stand-in for tests.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod docker;
pub mod driver;
pub mod error;
pub mod execution;
pub mod feedback;
pub mod memory;
pub mod runtime;

pub use backoff::Backoff;
pub use config::{BackoffConfig, ExecutorConfig};
pub use connector::{resolve_url, DockerConnector, RuntimeConnector};
pub use docker::DockerRuntime;
pub use driver::Driver;
pub use error::{DriverError, DriverResult, RuntimeError, RuntimeResult};
pub use execution::{Execution, ExecutionState};
pub use feedback::FeedbackEvent;
pub use memory::{InMemoryRuntime, RuntimeCall, RuntimeOp};
pub use runtime::{Container, ContainerRuntime, ContainerSpec, EventStream, ListOptions, RuntimeEvent};

/// Label carrying the workload id of an execution.
pub const PIPELINE_ID_LABEL: &str = "pipegrid.pipeline.id";

/// Label carrying the workload version of an execution.
pub const PIPELINE_VERSION_LABEL: &str = "pipegrid.pipeline.version";
