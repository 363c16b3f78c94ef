//! Per-task and per-drain results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{BatchId, TaskId};
use super::state::TaskStatus;
use super::task::{Priority, TaskType};

/// Resource usage observed around a single attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Signed change of process memory across the attempt.
    pub memory_delta_bytes: i64,
}

/// Outcome of one attempt of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `EngineError::category` of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    pub execution_time: Duration,
    /// 1-based attempt number this result belongs to.
    pub attempt: u32,
    /// Status the task was left in after this attempt.
    pub status_after: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl TaskResult {
    pub fn will_retry(&self) -> bool {
        self.status_after == TaskStatus::Retrying
    }
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Unsuccessful attempts in this drain, including those that will retry.
    pub failed_tasks: usize,
    /// Subset of `failed_tasks` that was rescheduled.
    pub retrying_tasks: usize,
    /// In selection order.
    pub results: Vec<TaskResult>,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
}

impl BatchResult {
    pub fn empty(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            retrying_tasks: 0,
            results: Vec::new(),
            total_execution_time: Duration::ZERO,
            average_execution_time: Duration::ZERO,
        }
    }

    /// Build the summary from results kept in selection order.
    pub fn from_results(
        batch_id: BatchId,
        results: Vec<TaskResult>,
        total_execution_time: Duration,
    ) -> Self {
        let total_tasks = results.len();
        let completed_tasks = results.iter().filter(|r| r.success).count();
        let retrying_tasks = results.iter().filter(|r| r.will_retry()).count();
        let busy: Duration = results.iter().map(|r| r.execution_time).sum();
        let average_execution_time = match u32::try_from(total_tasks) {
            Ok(n) if n > 0 => busy / n,
            _ => Duration::ZERO,
        };
        Self {
            batch_id,
            total_tasks,
            completed_tasks,
            failed_tasks: total_tasks - completed_tasks,
            retrying_tasks,
            results,
            total_execution_time,
            average_execution_time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks == 0
    }
}
