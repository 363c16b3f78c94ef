//! Batch strategies: queue drain, producer/consumer and adaptive sizing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::adaptive::{AdaptiveBatchSizer, AdaptiveConfig};
use super::breaker::{BreakerConfig, CircuitBreaker};
use super::hooks::ProcessingHooks;
use crate::concurrency::{BackpressureQueue, Dequeued};
use crate::domain::{
    EngineError, EnqueueOptions, ErrorKind, FailedItem, Priority, ProcessingStats, TaskId, TaskStatus,
    TaskType,
};
use crate::ports::Clock;
use crate::queue::{RetryPolicy, TaskQueue};
use crate::resource::ResourceMonitor;

/// How long an idle consumer waits before checking the buffer again.
const DEQUEUE_POLL: Duration = Duration::from_millis(100);
/// Buffer fill ratio at which the producer reports backpressure.
const BUFFER_HIGH_WATER: f64 = 0.9;
const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);

/// One unit of work for the drain strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub task_type: TaskType,
    pub payload: Value,
    pub priority: Priority,
    pub options: EnqueueOptions,
}

impl WorkItem {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_type,
            payload,
            priority: Priority::default(),
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Tries per item in the producer/consumer strategy.
    pub retry_attempts: u32,
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    pub consumer_count: usize,
    pub buffer_size: usize,
    /// Completions between `on_progress` calls.
    pub progress_interval: usize,
    /// Producer holds back while memory use is at or above this.
    pub backpressure_threshold_percent: f64,
    pub relief_timeout: Duration,
    /// Base pause after a drain with more failures than successes.
    pub failure_cooldown: Duration,
    /// Longest sleep while waiting for a scheduled retry.
    pub max_idle_wait: Duration,
    pub breaker: BreakerConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(30),
            consumer_count: 5,
            buffer_size: 100,
            progress_interval: 10,
            backpressure_threshold_percent: 75.0,
            relief_timeout: Duration::from_secs(30),
            failure_cooldown: Duration::from_secs(1),
            max_idle_wait: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Runs collections through one of three strategies.
///
/// Only one run is in flight per processor; a concurrent call fails with
/// `AlreadyRunning` before doing any work.
pub struct BatchProcessor {
    queue: Arc<TaskQueue>,
    monitor: Arc<ResourceMonitor>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    hooks: ProcessingHooks,
    running: AtomicBool,
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared by the consumers of one producer/consumer run.
struct Consumers<F> {
    f: F,
    config: BatchConfig,
    hooks: ProcessingHooks,
    monitor: Arc<ResourceMonitor>,
    breaker: CircuitBreaker,
    stats: Mutex<ProcessingStats>,
    completions: AtomicUsize,
    aborted: AtomicBool,
    started: Instant,
}

impl<F> Consumers<F> {
    fn stats(&self) -> MutexGuard<'_, ProcessingStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run<T, R, Fut>(&self, worker: usize, buffer: &BackpressureQueue<(usize, T)>)
    where
        T: Clone + Send,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        loop {
            if self.aborted.load(Ordering::Acquire) {
                debug!(worker, "run aborted; consumer leaving");
                return;
            }
            match buffer.dequeue_timeout(DEQUEUE_POLL).await {
                Dequeued::Item((index, item)) => self.process_item(index, item).await,
                Dequeued::Timeout => continue,
                Dequeued::Closed => return,
            }
        }
    }

    async fn process_item<T, R, Fut>(&self, index: usize, item: T)
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            let err = match self.breaker.try_acquire() {
                Ok(_) => match tokio::time::timeout(self.config.task_timeout, (self.f)(item.clone())).await {
                    Ok(Ok(_)) => {
                        self.breaker.record_success();
                        break Ok(());
                    }
                    Ok(Err(err)) => err,
                    Err(_) => EngineError::Timeout(self.config.task_timeout),
                },
                Err(open) => {
                    self.stats().record_error(&open);
                    self.hooks.error(&open, index, attempt);
                    break Err(open);
                }
            };

            self.breaker.record_failure();
            self.stats().record_error(&err);
            self.hooks.error(&err, index, attempt);
            if err.kind() == ErrorKind::Permanent || attempt >= max_attempts {
                break Err(err);
            }
            let delay = self.config.retry.next_delay(attempt);
            debug!(item = index, attempt, delay_ms = delay.as_millis() as u64, error = %err, "item failed; retrying");
            self.stats().total_retried += 1;
            tokio::time::sleep(delay).await;
        };

        if let Err(err) = &outcome {
            warn!(item = index, attempts = attempt, error = %err, "item failed");
        }
        let done = self.completions.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = {
            let mut stats = self.stats();
            match &outcome {
                Ok(()) => stats.total_processed += 1,
                Err(err) => stats.record_failed_item(index, err, attempt),
            }
            if done % self.config.progress_interval.max(1) != 0 {
                return;
            }
            stats.memory.record(self.monitor.snapshot().used_bytes);
            stats.finish(self.started.elapsed());
            stats.clone()
        };
        self.hooks.progress(&snapshot);
    }
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<TaskQueue>,
        monitor: Arc<ResourceMonitor>,
        clock: Arc<dyn Clock>,
        config: BatchConfig,
    ) -> Self {
        Self {
            queue,
            monitor,
            clock,
            config,
            hooks: ProcessingHooks::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_hooks(mut self, hooks: ProcessingHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueue `items`, then drain the queue until every one of them is done.
    ///
    /// Items are retried by the queue under its own retry policy. Tasks that
    /// other callers put on the shared queue may run in the same drains but
    /// are left out of the stats. Memory relief that does not arrive within
    /// `relief_timeout` ends the run.
    pub async fn process_with_backpressure(&self, items: Vec<WorkItem>) -> Result<ProcessingStats, EngineError> {
        let _guard = RunGuard::acquire(&self.running)?;
        let started = Instant::now();
        let mut stats = ProcessingStats::default();

        let mut index_of: HashMap<TaskId, usize> = HashMap::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let id = self
                .queue
                .enqueue(item.task_type, item.payload, item.priority, item.options)
                .await?;
            index_of.insert(id, index);
        }
        info!(items = index_of.len(), "backpressure drain started");

        let mut unfinished = index_of.len();
        let mut consecutive_bad = 0u32;
        while unfinished > 0 {
            if !self.monitor.is_safe() {
                stats.backpressure_events += 1;
                let waiting = self.queue.waiting_count().await?;
                self.hooks.backpressure(self.monitor.snapshot().percent_used, waiting);
                self.monitor.ensure_safe(self.config.relief_timeout).await?;
            }

            let batch = self.queue.drain_batch(None).await?;
            if batch.is_empty() {
                if self.queue.waiting_count().await? == 0 {
                    break;
                }
                self.idle_until_eligible().await?;
                continue;
            }

            let mut own = 0;
            for result in &batch.results {
                let Some(&item_index) = index_of.get(&result.task_id) else {
                    continue;
                };
                own += 1;
                if result.status_after.is_terminal() {
                    unfinished -= 1;
                }
                if result.success {
                    stats.total_processed += 1;
                    continue;
                }
                if let Some(category) = &result.error_category {
                    *stats.errors_by_type.entry(category.clone()).or_default() += 1;
                }
                match result.status_after {
                    TaskStatus::Retrying => stats.total_retried += 1,
                    TaskStatus::Failed => {
                        stats.total_failed += 1;
                        stats.failed_items.push(FailedItem {
                            item_index,
                            error: result.error.clone().unwrap_or_default(),
                            attempts: result.attempt,
                        });
                    }
                    _ => {}
                }
            }
            if own == 0 {
                continue;
            }
            stats.batches_processed += 1;
            stats.batch_sizes.push(own);
            stats.memory.record(self.monitor.snapshot().used_bytes);
            stats.finish(started.elapsed());
            self.hooks.progress(&stats);

            if batch.failed_tasks > batch.completed_tasks {
                consecutive_bad += 1;
                let cooldown = self.config.failure_cooldown.saturating_mul(consecutive_bad);
                warn!(
                    batch_id = %batch.batch_id,
                    failed = batch.failed_tasks,
                    completed = batch.completed_tasks,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "mostly failing drain; cooling down"
                );
                tokio::time::sleep(cooldown).await;
            } else {
                consecutive_bad = 0;
            }
        }

        stats.finish(started.elapsed());
        info!(
            processed = stats.total_processed,
            failed = stats.total_failed,
            retried = stats.total_retried,
            drains = stats.batches_processed,
            "backpressure drain finished"
        );
        Ok(stats)
    }

    async fn idle_until_eligible(&self) -> Result<(), EngineError> {
        let wait = match self.queue.next_eligible_at().await? {
            Some(at) => (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        };
        let wait = wait.min(self.config.max_idle_wait).max(MIN_IDLE_WAIT);
        debug!(wait_ms = wait.as_millis() as u64, "waiting for scheduled retries");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    /// Feed `items` through a bounded buffer to `consumer_count` consumers.
    ///
    /// Each item gets up to `retry_attempts` tries behind the circuit breaker.
    /// Item failures are recorded in the stats; only memory exhaustion fails
    /// the run. The consumers live inside the returned future, so dropping it
    /// stops them.
    pub async fn process_advanced<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Result<ProcessingStats, EngineError>
    where
        T: Clone + Send,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let _guard = RunGuard::acquire(&self.running)?;
        let total = items.len();
        let consumers = Consumers {
            f,
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            monitor: Arc::clone(&self.monitor),
            breaker: CircuitBreaker::new(self.config.breaker.clone()),
            stats: Mutex::new(ProcessingStats::default()),
            completions: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            started: Instant::now(),
        };
        let buffer = BackpressureQueue::new(self.config.buffer_size);
        let consumer_count = self.config.consumer_count.max(1);
        info!(items = total, consumers = consumer_count, buffer = buffer.capacity(), "producer/consumer run started");

        let producer = async {
            let produced = self.produce(items, &consumers, &buffer).await;
            if produced.is_err() {
                consumers.aborted.store(true, Ordering::Release);
            }
            buffer.close().await;
            produced
        };
        let workers = join_all((0..consumer_count).map(|worker| consumers.run(worker, &buffer)));
        let (produced, _) = tokio::join!(producer, workers);
        produced?;

        let mut stats = consumers.stats().clone();
        stats.circuit_breaker_trips = consumers.breaker.trips();
        stats.memory.record(self.monitor.snapshot().used_bytes);
        stats.finish(consumers.started.elapsed());
        info!(
            processed = stats.total_processed,
            failed = stats.total_failed,
            retried = stats.total_retried,
            trips = stats.circuit_breaker_trips,
            backpressure_events = stats.backpressure_events,
            high_water_mark = buffer.high_water_mark().await,
            "producer/consumer run finished"
        );
        Ok(stats)
    }

    async fn produce<T, F>(
        &self,
        items: Vec<T>,
        consumers: &Consumers<F>,
        buffer: &BackpressureQueue<(usize, T)>,
    ) -> Result<(), EngineError>
    where
        T: Send,
    {
        let threshold = self.config.backpressure_threshold_percent;
        for (index, item) in items.into_iter().enumerate() {
            if self.monitor.is_under_pressure(threshold) {
                let snap = self.monitor.sample();
                consumers.stats().backpressure_events += 1;
                self.hooks.backpressure(snap.percent_used, buffer.len().await);
                let waited = Instant::now();
                if !self.monitor.await_below(threshold, self.config.relief_timeout).await {
                    let percent_used = self.monitor.snapshot().percent_used;
                    error!(item = index, percent_used, "memory relief timed out; aborting run");
                    return Err(EngineError::ResourceExhausted {
                        percent_used,
                        waited: waited.elapsed(),
                    });
                }
            }
            if buffer.fill_ratio().await >= BUFFER_HIGH_WATER {
                consumers.stats().backpressure_events += 1;
                self.hooks
                    .backpressure(self.monitor.snapshot().percent_used, buffer.len().await);
            }
            buffer.enqueue((index, item)).await?;
        }
        Ok(())
    }

    /// Run `items` in fully concurrent batches whose size follows latency.
    pub async fn process_adaptive<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Result<ProcessingStats, EngineError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let _guard = RunGuard::acquire(&self.running)?;
        let started = Instant::now();
        let mut stats = ProcessingStats::default();
        let mut sizer = AdaptiveBatchSizer::new(self.config.adaptive.clone());
        let task_timeout = self.config.task_timeout;
        info!(items = items.len(), initial_size = sizer.current(), "adaptive run started");

        let mut rest = items.into_iter().enumerate().peekable();
        while rest.peek().is_some() {
            if !self.monitor.is_safe() {
                stats.backpressure_events += 1;
                self.hooks.backpressure(self.monitor.snapshot().percent_used, 0);
                self.monitor.ensure_safe(self.config.relief_timeout).await?;
            }

            let batch: Vec<(usize, T)> = rest.by_ref().take(sizer.current()).collect();
            let size = batch.len();
            let outcomes = join_all(batch.into_iter().map(|(index, item)| {
                let fut = f(item);
                async move {
                    let item_started = Instant::now();
                    let outcome = match tokio::time::timeout(task_timeout, fut).await {
                        Ok(result) => result.map(|_| ()),
                        Err(_) => Err(EngineError::Timeout(task_timeout)),
                    };
                    (index, item_started.elapsed(), outcome)
                }
            }))
            .await;

            let mut busy = Duration::ZERO;
            for (index, latency, outcome) in outcomes {
                busy += latency;
                match outcome {
                    Ok(()) => stats.total_processed += 1,
                    Err(err) => {
                        stats.record_error(&err);
                        stats.record_failed_item(index, &err, 1);
                        self.hooks.error(&err, index, 1);
                    }
                }
            }
            let avg = u32::try_from(size).map_or(Duration::ZERO, |n| busy / n.max(1));
            stats.batches_processed += 1;
            stats.batch_sizes.push(size);
            stats.memory.record(self.monitor.snapshot().used_bytes);
            let next = sizer.observe(avg);
            debug!(size, avg_latency_ms = avg.as_millis() as u64, next, "adaptive batch done");
            stats.finish(started.elapsed());
            self.hooks.progress(&stats);
        }

        stats.finish(started.elapsed());
        info!(
            processed = stats.total_processed,
            failed = stats.total_failed,
            batches = stats.batches_processed,
            "adaptive run finished"
        );
        Ok(stats)
    }
}
