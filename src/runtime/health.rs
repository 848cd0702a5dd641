//! Task lifecycle states and health snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered but not yet started.
    Registered,
    /// Start requested; the task body has not been observed running yet.
    Starting,
    /// Alive as far as the last sweep could tell.
    Running,
    /// Cancellation delivered, waiting for the task to drain.
    Stopping,
    /// Terminal: completed normally or stopped.
    Stopped,
    /// Terminal: failed and exhausted its restart budget.
    Crashed,
    /// Failed; a restart is pending.
    Restarting,
}

/// Point-in-time view of one task, as reported by `TaskRuntime::health`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHealth {
    pub name: String,
    pub state: TaskState,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl TaskHealth {
    /// Seconds since the task last started, if it ever started.
    pub fn uptime_secs(&self) -> Option<i64> {
        self.started_at.map(|t| (Utc::now() - t).num_seconds())
    }
}
