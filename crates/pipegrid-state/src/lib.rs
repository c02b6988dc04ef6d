//! pipegrid-state: versioned key/value store for pipegrid.
//!
//! Backed by [redb](https://docs.rs/redb), the store holds the desired state
//! of pipeline workloads (one record per workload version) and the blobs
//! those records reference (`contentKey`, `artifactKeys`).
//!
//! # Architecture
//!
//! Every mutation draws a revision from one store-wide sequence and is
//! published to live watchers after its transaction commits. Keys are
//! dot-separated tokens; workload versions live under
//! `<prefix>.pipeline.<workload_id>.version.<version>`.
//!
//! ```text
//! StateStore
//!   ├── entries  (key → KvEntry JSON: value, revision, operation)
//!   ├── blobs    (blob key → raw bytes)
//!   ├── meta     (revision sequence)
//!   └── broadcast of KvEntry → KvWatch (pattern filter + replay)
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod error;
pub mod pattern;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;
pub mod workloads;

pub use error::{StateError, StateResult, UnknownStatus};
pub use pattern::KeyPattern;
pub use store::StateStore;
pub use types::*;
pub use watch::KvWatch;
pub use workloads::{workload_id_from_key, workload_key, workload_pattern};
