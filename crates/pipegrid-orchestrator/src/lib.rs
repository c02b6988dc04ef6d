//! pipegrid-orchestrator: the reconciliation loop.
//!
//! The `Orchestrator` consumes configuration blobs. Each one retires the
//! active generation (its watcher and driver) and starts a fresh one from
//! the new configuration. Within a generation, every change event is
//! dispatched to the driver's `ensure`, and runtime feedback is logged and
//! forwarded.
//!
//! Exactly one generation runs at a time: the previous one is fully
//! retired before the next is started.

pub mod config;
pub mod error;
pub mod generation;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use generation::GenerationEvent;
pub use orchestrator::Orchestrator;
