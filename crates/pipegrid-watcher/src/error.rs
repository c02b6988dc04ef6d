//! Watcher error types.

use thiserror::Error;

/// Errors that end a watch or prevent it from starting.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("invalid repository prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("store subscription failed: {0}")]
    Subscription(#[from] pipegrid_state::StateError),

    #[error("store subscription closed")]
    SubscriptionClosed,
}

pub type WatcherResult<T> = Result<T, WatcherError>;
