//! Chunked, memory-gated processing of a materialized collection.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::hooks::ProcessingHooks;
use crate::concurrency::BoundedWorkerPool;
use crate::domain::{EngineError, ProcessingStats};
use crate::ports::Clock;
use crate::resource::ResourceMonitor;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    /// Extra tries for a failed chunk.
    pub chunk_retry_attempts: u32,
    pub chunk_retry_delay: Duration,
    /// Deadline for one item; an item that runs past it fails its chunk.
    pub item_timeout: Duration,
    /// How long a chunk waits for memory relief before the run aborts.
    pub relief_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_concurrency: 5,
            chunk_retry_attempts: 2,
            chunk_retry_delay: Duration::from_secs(1),
            item_timeout: Duration::from_secs(30),
            relief_timeout: Duration::from_secs(30),
        }
    }
}

/// Receives the results of each chunk in order.
#[async_trait]
pub trait ChunkSink<R: Send + 'static>: Send {
    async fn accept(&mut self, chunk_index: usize, results: Vec<R>) -> Result<(), EngineError>;
}

/// Sink that keeps every result.
#[derive(Debug)]
pub struct CollectSink<R> {
    pub results: Vec<R>,
    pub chunks: usize,
}

impl<R> Default for CollectSink<R> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            chunks: 0,
        }
    }
}

#[async_trait]
impl<R: Send + 'static> ChunkSink<R> for CollectSink<R> {
    async fn accept(&mut self, _chunk_index: usize, mut results: Vec<R>) -> Result<(), EngineError> {
        self.results.append(&mut results);
        self.chunks += 1;
        Ok(())
    }
}

type SharedStats = Arc<Mutex<ProcessingStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, ProcessingStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Chunk results of one run. Each run counts into its own stats.
pub struct ChunkStream<R> {
    inner: BoxStream<'static, Result<Vec<R>, EngineError>>,
    stats: SharedStats,
}

impl<R> ChunkStream<R> {
    /// Statistics of this run so far.
    pub fn stats(&self) -> ProcessingStats {
        lock_stats(&self.stats).clone()
    }
}

impl<R> Stream for ChunkStream<R> {
    type Item = Result<Vec<R>, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub struct StreamingProcessor {
    monitor: Arc<ResourceMonitor>,
    clock: Arc<dyn Clock>,
    options: StreamOptions,
    hooks: ProcessingHooks,
    last_run: Mutex<SharedStats>,
}

struct RunContext<F> {
    monitor: Arc<ResourceMonitor>,
    clock: Arc<dyn Clock>,
    options: StreamOptions,
    hooks: ProcessingHooks,
    stats: SharedStats,
    started: Instant,
    f: F,
}

impl<F> RunContext<F> {
    fn stats(&self) -> MutexGuard<'_, ProcessingStats> {
        lock_stats(&self.stats)
    }

    /// Run one chunk, retrying it whole on failure.
    async fn process_chunk<T, R, Fut>(&self, index: usize, chunk: Vec<T>) -> Result<Vec<R>, EngineError>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        let pool = BoundedWorkerPool::new(self.options.max_concurrency);
        let item_timeout = self.options.item_timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // every try, retries included, waits for memory first
            if !self.monitor.is_safe() {
                self.stats().backpressure_events += 1;
                if let Err(err) = self.monitor.ensure_safe(self.options.relief_timeout).await {
                    error!(chunk = index, attempt, error = %err, "memory relief timed out; aborting stream");
                    return Err(err);
                }
            }

            let chunk_started = Instant::now();
            let outcome: Result<Vec<R>, EngineError> = pool
                .map(chunk.clone(), |item| {
                    let fut = (self.f)(item);
                    async move {
                        tokio::time::timeout(item_timeout, fut)
                            .await
                            .unwrap_or(Err(EngineError::Timeout(item_timeout)))
                    }
                })
                .await?
                .into_iter()
                .collect();

            match outcome {
                Ok(results) => {
                    let snapshot = {
                        let mut stats = self.stats();
                        stats.total_processed += results.len();
                        stats.batches_processed += 1;
                        stats.memory.record(self.monitor.snapshot().used_bytes);
                        stats.finish(self.started.elapsed());
                        stats.clone()
                    };
                    debug!(
                        chunk = index,
                        items = results.len(),
                        attempt,
                        elapsed_ms = chunk_started.elapsed().as_millis() as u64,
                        "chunk processed"
                    );
                    self.hooks.chunk_complete(index, results.len());
                    self.hooks.progress(&snapshot);
                    return Ok(results);
                }
                Err(err) => {
                    self.stats().record_chunk_error(index, &err, self.clock.now());
                    self.hooks.error(&err, index, attempt);
                    if attempt > self.options.chunk_retry_attempts {
                        self.stats().total_failed += chunk.len();
                        error!(chunk = index, attempt, error = %err, "chunk failed; aborting stream");
                        return Err(err);
                    }
                    warn!(chunk = index, attempt, error = %err, "chunk failed; retrying");
                    tokio::time::sleep(self.options.chunk_retry_delay).await;
                }
            }
        }
    }
}

impl StreamingProcessor {
    pub fn new(monitor: Arc<ResourceMonitor>, clock: Arc<dyn Clock>, options: StreamOptions) -> Self {
        Self {
            monitor,
            clock,
            options,
            hooks: ProcessingHooks::default(),
            last_run: Mutex::new(SharedStats::default()),
        }
    }

    pub fn with_hooks(mut self, hooks: ProcessingHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Snapshot of the most recently started run. Use `ChunkStream::stats`
    /// when runs overlap.
    pub fn stats(&self) -> ProcessingStats {
        let last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        lock_stats(&last).clone()
    }

    /// Lazily process `items` chunk by chunk.
    ///
    /// Chunk `i` does not start until the consumer polls for it. The stream
    /// ends after the first `Err`. `options` replaces the processor's
    /// options for this run only.
    pub fn process_stream<T, R, F, Fut>(&self, items: Vec<T>, f: F, options: Option<&StreamOptions>) -> ChunkStream<R>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, EngineError>> + Send + 'static,
    {
        let options = options.unwrap_or(&self.options).clone();
        let stats = SharedStats::default();
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&stats);

        let chunk_size = options.chunk_size.max(1);
        let total_items = items.len();
        let mut chunks: VecDeque<Vec<T>> = VecDeque::new();
        let mut rest = items.into_iter().peekable();
        while rest.peek().is_some() {
            chunks.push_back(rest.by_ref().take(chunk_size).collect());
        }
        info!(items = total_items, chunks = chunks.len(), chunk_size, "stream started");

        let ctx = Arc::new(RunContext {
            monitor: Arc::clone(&self.monitor),
            clock: Arc::clone(&self.clock),
            options,
            hooks: self.hooks.clone(),
            stats: Arc::clone(&stats),
            started: Instant::now(),
            f,
        });

        let inner = stream::unfold((ctx, chunks, 0usize, false), |(ctx, mut chunks, index, done)| async move {
            if done {
                return None;
            }
            let Some(chunk) = chunks.pop_front() else {
                let stats = {
                    let mut stats = ctx.stats();
                    stats.finish(ctx.started.elapsed());
                    stats.clone()
                };
                info!(
                    processed = stats.total_processed,
                    chunks = stats.batches_processed,
                    throughput = stats.throughput,
                    "stream finished"
                );
                return None;
            };
            let result = ctx.process_chunk(index, chunk).await;
            let done = result.is_err();
            Some((result, (ctx, chunks, index + 1, done)))
        })
        .boxed();
        ChunkStream { inner, stats }
    }

    /// Same loop as `process_stream`, handing each chunk to `sink`.
    pub async fn process_stream_with_sink<T, R, F, Fut, S>(
        &self,
        items: Vec<T>,
        f: F,
        sink: &mut S,
        options: Option<&StreamOptions>,
    ) -> Result<ProcessingStats, EngineError>
    where
        T: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, EngineError>> + Send + 'static,
        S: ChunkSink<R>,
    {
        let mut stream = self.process_stream(items, f, options);
        let mut index = 0;
        while let Some(chunk) = stream.next().await {
            sink.accept(index, chunk?).await?;
            index += 1;
        }
        Ok(stream.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::SimulatedMemoryProbe;
    use crate::ports::SystemClock;
    use crate::resource::MonitorConfig;
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processor(used: u64, options: StreamOptions) -> (StreamingProcessor, Arc<SimulatedMemoryProbe>) {
        let probe = Arc::new(SimulatedMemoryProbe::new(used));
        let monitor = Arc::new(ResourceMonitor::new(
            MonitorConfig {
                memory_limit_bytes: 100,
                ..MonitorConfig::default()
            },
            probe.clone(),
            Arc::new(SystemClock),
        ));
        (StreamingProcessor::new(monitor, Arc::new(SystemClock), options), probe)
    }

    fn options() -> StreamOptions {
        StreamOptions {
            chunk_size: 3,
            max_concurrency: 2,
            chunk_retry_attempts: 2,
            chunk_retry_delay: Duration::from_millis(10),
            item_timeout: Duration::from_secs(5),
            relief_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn yields_results_in_order_chunk_by_chunk() {
        let (p, _probe) = processor(10, options());
        let chunks: Vec<Vec<u32>> = p
            .process_stream((1..=7).collect(), |x: u32| async move { Ok(x * 10) }, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![vec![10, 20, 30], vec![40, 50, 60], vec![70]]);

        let stats = p.stats();
        assert_eq!(stats.total_processed, 7);
        assert_eq!(stats.batches_processed, 3);
        assert_eq!(stats.memory.peak, 10);
    }

    #[tokio::test]
    async fn chunks_start_only_when_polled() {
        let (p, _probe) = processor(10, options());
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        let mut stream = p.process_stream(
            (0..9).collect(),
            move |x: u32| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(x)
                }
            },
            None,
        );
        assert_eq!(started.load(Ordering::SeqCst), 0);
        stream.next().await.unwrap().unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_chunk_failure_is_retried() {
        let (p, _probe) = processor(10, options());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut sink = CollectSink::default();
        let stats = p
            .process_stream_with_sink(
                vec![1, 2, 3, 4],
                move |x: u32| {
                    let c = c.clone();
                    async move {
                        // the very first call fails once
                        if c.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(EngineError::executor("flaky"))
                        } else {
                            Ok(x)
                        }
                    }
                },
                &mut sink,
                None,
            )
            .await
            .unwrap();

        assert_eq!(sink.results, vec![1, 2, 3, 4]);
        assert_eq!(sink.chunks, 2);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[0].chunk_index, 0);
        assert_eq!(stats.errors_by_type.get("executor"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_aborts_after_retries() {
        let (p, _probe) = processor(10, options());
        let mut sink = CollectSink::default();
        let err = p
            .process_stream_with_sink(
                vec![1u32, 2, 3, 4],
                |x: u32| async move {
                    if x == 4 { Err(EngineError::executor("bad item")) } else { Ok(x) }
                },
                &mut sink,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Executor(_)));
        assert_eq!(sink.results, vec![1, 2, 3]);
        let stats = p.stats();
        // first try plus two retries
        assert_eq!(stats.errors.len(), 3);
        assert_eq!(stats.total_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_item_times_out_and_fails_its_chunk() {
        let (p, _probe) = processor(
            10,
            StreamOptions {
                chunk_retry_attempts: 0,
                ..options()
            },
        );
        let mut stream = p.process_stream(
            vec![1u32, 2],
            |x: u32| async move {
                if x == 2 {
                    std::future::pending::<()>().await;
                }
                Ok(x)
            },
            None,
        );

        let started = Instant::now();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(EngineError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(stream.next().await.is_none());

        let stats = stream.stats();
        assert_eq!(stats.errors_by_type.get("timeout"), Some(&1));
        assert_eq!(stats.total_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_memory_like_a_first_try() {
        let (p, probe) = processor(10, options());
        let calls = Arc::new(AtomicUsize::new(0));
        let (c, spike) = (calls.clone(), probe.clone());
        let mut stream = p.process_stream(
            vec![1u32],
            move |_: u32| {
                c.fetch_add(1, Ordering::SeqCst);
                // the failed try leaves memory above the critical line
                spike.set_used(95);
                async move { Err::<u32, _>(EngineError::executor("spike")) }
            },
            None,
        );

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(EngineError::ResourceExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.stats().backpressure_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relief_timeout_ends_the_stream() {
        let (p, _probe) = processor(95, options());
        let mut stream = p.process_stream(vec![1u32, 2], |x: u32| async move { Ok(x) }, None);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(EngineError::ResourceExhausted { .. })));
        assert!(stream.next().await.is_none());
        assert_eq!(p.stats().backpressure_events, 1);
    }

    #[tokio::test]
    async fn overlapping_streams_keep_separate_stats() {
        let (p, _probe) = processor(10, options());
        let pairs = StreamOptions {
            chunk_size: 2,
            ..options()
        };
        let mut a = p.process_stream((0..4u32).collect(), |x: u32| async move { Ok(x) }, Some(&pairs));
        let mut b = p.process_stream((0..10u32).collect(), |x: u32| async move { Ok(x) }, Some(&pairs));

        a.next().await.unwrap().unwrap();
        b.next().await.unwrap().unwrap();
        b.next().await.unwrap().unwrap();
        a.next().await.unwrap().unwrap();
        assert!(a.next().await.is_none());

        assert_eq!(a.stats().total_processed, 4);
        assert_eq!(a.stats().batches_processed, 2);
        assert_eq!(b.stats().total_processed, 4);
        // the processor reports the run started last
        assert_eq!(p.stats().total_processed, 4);
        assert_eq!(p.stats().batches_processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_options_replace_the_defaults() {
        let (p, _probe) = processor(10, options());
        let wide = StreamOptions {
            chunk_size: 5,
            max_concurrency: 1,
            ..options()
        };
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, pk) = (current.clone(), peak.clone());
        let mut sink = CollectSink::default();
        let stats = p
            .process_stream_with_sink(
                (0..7u32).collect(),
                move |x: u32| {
                    let (c, pk) = (c.clone(), pk.clone());
                    async move {
                        let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                        pk.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        c.fetch_sub(1, Ordering::SeqCst);
                        Ok(x)
                    }
                },
                &mut sink,
                Some(&wide),
            )
            .await
            .unwrap();

        assert_eq!(stats.batches_processed, 2);
        assert_eq!(sink.results, (0..7).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(p.options().chunk_size, 3);
    }

    #[tokio::test]
    async fn chunk_hook_fires_per_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let (p, _probe) = processor(10, options());
        let p = p.with_hooks(ProcessingHooks::default().on_chunk_complete(move |index, count| {
            s.lock().unwrap().push((index, count));
        }));
        let _: Vec<Vec<u32>> = p
            .process_stream(vec![1, 2, 3, 4, 5], |x: u32| async move { Ok(x) }, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0, 3), (1, 2)]);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let (p, _probe) = processor(10, options());
        let chunks: Vec<Vec<u32>> = p
            .process_stream(Vec::<u32>::new(), |x: u32| async move { Ok(x) }, None)
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
        assert_eq!(p.stats().total_processed, 0);
    }
}
