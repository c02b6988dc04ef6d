//! Executions and the runtime status translation.

use std::fmt;

/// Actual state of an execution, as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Present,
    Started,
    Stopped,
    Absent,
}

impl ExecutionState {
    /// Map a runtime container status onto an execution state.
    ///
    /// Unrecognized statuses read as `Absent`.
    pub fn from_runtime_status(status: &str) -> Self {
        match status {
            "created" => Self::Present,
            "running" | "restarting" => Self::Started,
            "paused" | "exited" | "dead" => Self::Stopped,
            "removing" => Self::Absent,
            _ => Self::Absent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One runtime unit backing a workload version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: String,
    pub workload_id: String,
    pub version: String,
    pub state: ExecutionState,
}
