//! Driver and runtime error types.

use thiserror::Error;

use pipegrid_state::UnknownStatus;

/// Errors from a container runtime call.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime url: {0}")]
    InvalidUrl(String),

    #[error("runtime connection failed: {0}")]
    Connect(String),

    #[error("runtime request failed: {0}")]
    Request(String),

    #[error("runtime returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("invalid runtime response: {0}")]
    Decode(String),

    #[error("event stream failed: {0}")]
    EventStream(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from reconciling a workload version.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type DriverResult<T> = Result<T, DriverError>;
