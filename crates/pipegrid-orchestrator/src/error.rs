//! Orchestrator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The configuration blob could not be decoded. Fatal to the loop.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] pipegrid_watcher::WatcherError),

    #[error("driver error: {0}")]
    Driver(#[from] pipegrid_driver::DriverError),

    #[error("runtime error: {0}")]
    Runtime(#[from] pipegrid_driver::RuntimeError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
