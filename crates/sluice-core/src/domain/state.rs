//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> InProgress -> Completed
/// - Pending -> InProgress -> Retrying -> InProgress ... (until max_attempts)
/// - Pending -> InProgress -> Failed (max_attempts reached, or a permanent error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its first execution.
    Pending,

    /// Dispatched to an executor.
    InProgress,

    /// Finished successfully.
    Completed,

    /// Failed permanently.
    Failed,

    /// Failed at least once; waiting for its backoff delay.
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
    ];

    /// No further transitions happen from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Can be picked up once its scheduled time has passed.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }
}
