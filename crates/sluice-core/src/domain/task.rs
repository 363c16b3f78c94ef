//! Task record: the persisted unit of deferred work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskStatus;

/// Names the executor a task is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    LinkCheck,
    Correction,
    Alert,
    Report,
    Cleanup,
    Maintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::LinkCheck,
        TaskType::Correction,
        TaskType::Alert,
        TaskType::Report,
        TaskType::Cleanup,
        TaskType::Maintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::LinkCheck => "link_check",
            TaskType::Correction => "correction",
            TaskType::Alert => "alert",
            TaskType::Report => "report",
            TaskType::Cleanup => "cleanup",
            TaskType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority.
///
/// The derived order is the scheduling order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional knobs for `TaskQueue::enqueue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A persisted task.
///
/// All status changes go through the methods below so that `updated_at`
/// always moves with the status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// Executions started so far (including the one in flight).
    pub attempts: u32,
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the task enters a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            priority,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            updated_at: now,
            completed_at: None,
            scheduled_for: None,
            error: None,
            metadata: None,
        }
    }

    /// Waiting status and scheduled time reached.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.scheduled_for.is_none_or(|at| at <= now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Mark as in progress (increments attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.error = None;
        self.scheduled_for = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.scheduled_for = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Retrying;
        self.scheduled_for = Some(at);
        self.error = Some(error);
        self.updated_at = now;
    }

    /// Return an abandoned in-progress task to the pending pool.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.scheduled_for = None;
        self.updated_at = now;
    }
}
