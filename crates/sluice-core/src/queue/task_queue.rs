//! TaskQueue: the task state machine on top of a `TaskStore`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::metrics::{ExecutionWindow, MetricsCache, QueueMetrics};
use super::retry::RetryPolicy;
use crate::concurrency::BoundedWorkerPool;
use crate::domain::{
    BatchResult, EngineError, EnqueueOptions, ErrorKind, Priority, ResourceUsage, Task,
    TaskId, TaskResult, TaskStatus, TaskType,
};
use crate::ports::{Clock, IdGenerator, TaskFilter, TaskStore, UlidGenerator};
use crate::resource::ResourceMonitor;
use crate::typed::{ExecutorRegistry, TypedTask};

/// Attempts kept for `QueueMetrics::success_rate`.
const EXECUTION_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Default `drain_batch` limit.
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// `max_attempts` for tasks enqueued without an explicit one.
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    /// Default `purge_completed` age.
    pub max_task_age: Duration,
    pub metrics_cache_ttl: Duration,
    /// How long a drain waits for memory relief before giving up.
    pub relief_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 5,
            default_max_attempts: 3,
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(30),
            max_task_age: Duration::from_secs(24 * 60 * 60),
            metrics_cache_ttl: Duration::from_secs(30),
            relief_timeout: Duration::from_secs(30),
        }
    }
}

/// Persistent priority queue with retry scheduling.
///
/// The queue is the only writer of task rows. Each drain claims tasks by
/// moving them to `InProgress` before dispatch, so an id is never executed
/// twice at once.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    monitor: Option<Arc<ResourceMonitor>>,
    pool: BoundedWorkerPool,
    metrics: MetricsCache,
    window: Mutex<ExecutionWindow>,
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<ExecutorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            pool: BoundedWorkerPool::new(config.max_concurrency),
            metrics: MetricsCache::new(config.metrics_cache_ttl),
            window: Mutex::new(ExecutionWindow::new(EXECUTION_WINDOW)),
            config,
            store,
            registry,
            clock,
            ids,
            monitor: None,
        }
    }

    /// Hold drains back while memory is critical.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Value,
        priority: Priority,
        options: EnqueueOptions,
    ) -> Result<TaskId, EngineError> {
        let now = self.clock.now();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        let mut task = Task::new(
            self.ids.generate_task_id(),
            task_type,
            payload,
            priority,
            max_attempts,
            now,
        );
        task.scheduled_for = options.scheduled_for;
        task.metadata = options.metadata;
        let id = task.id;

        self.store.insert(task).await?;
        self.metrics.invalidate();
        debug!(task_id = %id, %task_type, %priority, "task enqueued");
        Ok(id)
    }

    pub async fn enqueue_typed<T: TypedTask>(
        &self,
        task: &T,
        priority: Priority,
        options: EnqueueOptions,
    ) -> Result<TaskId, EngineError> {
        let payload =
            serde_json::to_value(task).map_err(|e| EngineError::Codec(format!("{}: {e}", T::TYPE)))?;
        self.enqueue(T::TYPE, payload, priority, options).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.store.get(id).await?)
    }

    /// Select up to `limit` eligible tasks and run them.
    ///
    /// Results come back in selection order (priority, then age). Executor
    /// failures and timeouts are recorded per task; only store failures and
    /// memory exhaustion fail the drain itself.
    pub async fn drain_batch(&self, limit: Option<usize>) -> Result<BatchResult, EngineError> {
        if let Some(monitor) = &self.monitor {
            monitor.ensure_safe(self.config.relief_timeout).await?;
        }

        let batch_id = self.ids.generate_batch_id();
        let limit = limit.unwrap_or(self.config.batch_size);
        if limit == 0 {
            return Ok(BatchResult::empty(batch_id));
        }

        let now = self.clock.now();
        let selected = self.store.select(&TaskFilter::eligible(now), limit).await?;
        if selected.is_empty() {
            debug!(%batch_id, "nothing eligible");
            return Ok(BatchResult::empty(batch_id));
        }

        let mut claimed = Vec::with_capacity(selected.len());
        for mut task in selected {
            task.start_attempt(now);
            self.store.update(task.clone()).await?;
            debug!(task_id = %task.id, attempt = task.attempts, "task claimed");
            claimed.push(task);
        }
        self.metrics.invalidate();

        let started = Instant::now();
        let results = self
            .pool
            .map(claimed, |task| self.run_attempt(task))
            .await?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        let batch = BatchResult::from_results(batch_id, results, started.elapsed());

        info!(
            %batch_id,
            total = batch.total_tasks,
            completed = batch.completed_tasks,
            failed = batch.failed_tasks,
            retrying = batch.retrying_tasks,
            elapsed_ms = batch.total_execution_time.as_millis() as u64,
            "drain finished"
        );
        Ok(batch)
    }

    async fn run_attempt(&self, task: Task) -> Result<TaskResult, EngineError> {
        let before = self.monitor.as_ref().map(|m| m.snapshot().used_bytes);
        let started = Instant::now();
        let outcome = match self.registry.get(task.task_type) {
            Some(executor) => {
                match tokio::time::timeout(self.config.task_timeout, executor.execute(&task.payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(self.config.task_timeout)),
                }
            }
            None => Err(EngineError::UnknownTaskType(task.task_type)),
        };
        let elapsed = started.elapsed();
        let resource_usage = before.zip(self.monitor.as_ref()).map(|(before, m)| ResourceUsage {
            memory_delta_bytes: m.snapshot().used_bytes as i64 - before as i64,
        });

        let mut result = self.complete(task, outcome, elapsed).await?;
        result.resource_usage = resource_usage;
        Ok(result)
    }

    /// Apply an attempt's outcome to the stored row.
    ///
    /// The outcome is discarded when the row is no longer `InProgress` with the
    /// same attempt number (recovered as stale, purged, or claimed again).
    async fn complete(
        &self,
        claimed: Task,
        outcome: Result<Value, EngineError>,
        elapsed: Duration,
    ) -> Result<TaskResult, EngineError> {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(outcome.is_ok(), elapsed);

        let mut result = TaskResult {
            task_id: claimed.id,
            task_type: claimed.task_type,
            priority: claimed.priority,
            success: outcome.is_ok(),
            output: None,
            error: None,
            error_category: outcome.as_ref().err().map(|e| e.category().to_string()),
            execution_time: elapsed,
            attempt: claimed.attempts,
            status_after: claimed.status,
            resource_usage: None,
        };

        let current = self.store.get(claimed.id).await?;
        let mut task = match current {
            Some(row) if row.status == TaskStatus::InProgress && row.attempts == claimed.attempts => row,
            other => {
                warn!(
                    task_id = %claimed.id,
                    attempt = claimed.attempts,
                    current_status = ?other.as_ref().map(|t| t.status),
                    current_attempt = ?other.as_ref().map(|t| t.attempts),
                    "discarding stale attempt result"
                );
                if let Some(row) = other {
                    result.status_after = row.status;
                }
                match outcome {
                    Ok(output) => result.output = Some(output),
                    Err(err) => result.error = Some(err.to_string()),
                }
                return Ok(result);
            }
        };

        let now = self.clock.now();
        match outcome {
            Ok(output) => {
                task.mark_completed(now);
                result.output = Some(output);
                debug!(task_id = %task.id, attempt = task.attempts, "task completed");
            }
            Err(err) => {
                let message = err.to_string();
                if err.kind() == ErrorKind::Permanent || task.attempts_exhausted() {
                    warn!(
                        task_id = %task.id,
                        attempt = task.attempts,
                        max_attempts = task.max_attempts,
                        error = %message,
                        "task failed"
                    );
                    task.mark_failed(message.clone(), now);
                } else {
                    let delay = self.config.retry.next_delay(task.attempts);
                    let at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    warn!(
                        task_id = %task.id,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "task failed; retry scheduled"
                    );
                    task.schedule_retry(at, message.clone(), now);
                }
                result.error = Some(message);
            }
        }
        result.status_after = task.status;
        self.store.update(task).await?;
        self.metrics.invalidate();
        Ok(result)
    }

    /// Counts by status, priority and type; cached for `metrics_cache_ttl`.
    pub async fn queue_status(&self) -> Result<QueueMetrics, EngineError> {
        if let Some(cached) = self.metrics.get() {
            return Ok(cached);
        }
        let tasks = self.store.select(&TaskFilter::all(), usize::MAX).await?;
        let metrics = {
            let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            QueueMetrics::from_tasks(&tasks, &window, self.clock.now())
        };
        self.metrics.put(metrics.clone());
        Ok(metrics)
    }

    /// Delete terminal tasks that finished at least `max_age` ago.
    pub async fn purge_completed(&self, max_age: Option<Duration>) -> Result<usize, EngineError> {
        let max_age = max_age.unwrap_or(self.config.max_task_age);
        let cutoff = self.cutoff(max_age);
        let purged = self.store.delete(&TaskFilter::terminal_until(cutoff)).await?;
        if purged > 0 {
            self.metrics.invalidate();
            info!(purged, %cutoff, "purged terminal tasks");
        }
        Ok(purged)
    }

    /// Earliest time a waiting task becomes eligible; `None` when nothing waits.
    pub async fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        let now = self.clock.now();
        let waiting = self.store.select(&TaskFilter::waiting(), usize::MAX).await?;
        Ok(waiting
            .iter()
            .map(|t| t.scheduled_for.map_or(now, |at| at.max(now)))
            .min())
    }

    /// Pending plus retrying, scheduled or not.
    pub async fn waiting_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.count(&TaskFilter::waiting()).await?)
    }

    /// Return `InProgress` tasks untouched for `older_than` to `Pending`.
    ///
    /// They keep their attempt count. A late result from the abandoned attempt
    /// is then discarded by the stale-attempt check.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let cutoff = self.cutoff(older_than);
        let stale = self
            .store
            .select(&TaskFilter::stale_in_progress(cutoff), usize::MAX)
            .await?;
        let recovered = stale.len();
        for mut task in stale {
            warn!(task_id = %task.id, attempt = task.attempts, "recovering stale in-progress task");
            task.requeue(now);
            self.store.update(task).await?;
        }
        if recovered > 0 {
            self.metrics.invalidate();
        }
        Ok(recovered)
    }

    fn cutoff(&self, age: Duration) -> DateTime<Utc> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
