//! Queue metrics and their TTL cache.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::{Priority, Task, TaskStatus, TaskType};

/// Snapshot of the queue served by `TaskQueue::queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_type: BTreeMap<TaskType, usize>,
    /// Fraction of successful attempts in the recent window, 0.0..=1.0.
    pub success_rate: f64,
    pub average_execution_time: Duration,
    pub generated_at: DateTime<Utc>,
}

impl QueueMetrics {
    pub fn from_tasks(tasks: &[Task], window: &ExecutionWindow, generated_at: DateTime<Utc>) -> Self {
        let mut by_status: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut by_priority = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for task in tasks {
            *by_status.entry(task.status).or_default() += 1;
            *by_priority.entry(task.priority).or_default() += 1;
            *by_type.entry(task.task_type).or_default() += 1;
        }
        Self {
            total: tasks.len(),
            by_status,
            by_priority,
            by_type,
            success_rate: window.success_rate(),
            average_execution_time: window.average_execution_time(),
            generated_at,
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Ring buffer of the most recent attempt outcomes.
#[derive(Debug)]
pub struct ExecutionWindow {
    capacity: usize,
    entries: VecDeque<(bool, Duration)>,
}

impl ExecutionWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, success: bool, elapsed: Duration) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((success, elapsed));
    }

    /// 1.0 when nothing has run yet.
    pub fn success_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 1.0;
        }
        let ok = self.entries.iter().filter(|(s, _)| *s).count();
        ok as f64 / self.entries.len() as f64
    }

    pub fn average_execution_time(&self) -> Duration {
        let total: Duration = self.entries.iter().map(|(_, d)| *d).sum();
        match u32::try_from(self.entries.len()) {
            Ok(n) if n > 0 => total / n,
            _ => Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last computed metrics plus the instant they were computed.
///
/// Expiry is checked on read; nothing runs in the background.
#[derive(Debug)]
pub struct MetricsCache {
    ttl: Duration,
    slot: Mutex<Option<(Instant, QueueMetrics)>>,
}

impl MetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<QueueMetrics> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            Some((at, metrics)) if at.elapsed() < self.ttl => Some(metrics.clone()),
            _ => None,
        }
    }

    pub fn put(&self, metrics: QueueMetrics) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), metrics));
    }

    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
