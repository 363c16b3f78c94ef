//! End-to-end scenarios through a built `Engine`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use sluice_core::impls::SimulatedMemoryProbe;
use sluice_core::ports::FixedClock;
use sluice_core::typed::{FnExecutor, Handler, TypedTask};
use sluice_core::{
    Engine, EngineBuilder, EngineConfig, EngineError, EnqueueOptions, Priority, TaskStatus,
    TaskType, WorkItem,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildReport {
    name: String,
}

impl TypedTask for BuildReport {
    const TYPE: TaskType = TaskType::Report;
}

struct Reporter;

#[async_trait]
impl Handler<BuildReport> for Reporter {
    async fn handle(&self, task: BuildReport) -> Result<Value, EngineError> {
        Ok(json!({ "report": task.name }))
    }
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        memory_limit_bytes: 1_000,
        initial_retry_delay_ms: 1_000,
        jitter_bound_ms: 0,
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig, probe: Arc<SimulatedMemoryProbe>) -> Engine {
    EngineBuilder::new(config)
        .probe(probe)
        .register_typed::<BuildReport, _>(Reporter)
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn mixed_priorities_drain_critical_first() {
    let engine = engine_with(quiet_config(), Arc::new(SimulatedMemoryProbe::new(100)));
    let queue = engine.queue();

    let mut enqueue = Vec::new();
    enqueue.extend((0..5).map(|i| (Priority::Medium, format!("medium-{i}"))));
    enqueue.extend((0..3).map(|i| (Priority::High, format!("high-{i}"))));
    enqueue.push((Priority::Critical, "critical".to_string()));
    for (priority, name) in enqueue {
        queue
            .enqueue_typed(&BuildReport { name }, priority, EnqueueOptions::default())
            .await
            .unwrap();
    }

    let batch = queue.drain_batch(None).await.unwrap();
    assert_eq!(batch.total_tasks, 9);
    assert_eq!(batch.completed_tasks, 9);
    assert_eq!(batch.failed_tasks, 0);
    assert_eq!(batch.results[0].priority, Priority::Critical);
    assert!(batch.results[1..4].iter().all(|r| r.priority == Priority::High));
    assert_eq!(batch.results[1].output.as_ref().unwrap()["report"], "high-0");

    let status = queue.queue_status().await.unwrap();
    assert_eq!(status.count(TaskStatus::Completed), 9);
}

#[tokio::test]
async fn task_succeeds_on_third_attempt_after_backoff() {
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
    let attempts = Arc::new(AtomicU32::new(0));
    let a = attempts.clone();
    let engine = EngineBuilder::new(quiet_config())
        .probe(Arc::new(SimulatedMemoryProbe::new(100)))
        .clock(clock.clone())
        .register(
            TaskType::Correction,
            Arc::new(FnExecutor::new(move |payload: Value| {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::executor("upstream unavailable"))
                    } else {
                        Ok(payload)
                    }
                }
            })),
        )
        .unwrap()
        .build()
        .unwrap();
    let queue = engine.queue();

    let id = queue
        .enqueue(
            TaskType::Correction,
            json!({ "page": 7 }),
            Priority::High,
            EnqueueOptions::default().with_max_attempts(3),
        )
        .await
        .unwrap();

    let first = queue.drain_batch(None).await.unwrap();
    assert_eq!(first.retrying_tasks, 1);
    // backoff not elapsed yet
    assert!(queue.drain_batch(None).await.unwrap().is_empty());

    clock.advance(chrono::Duration::seconds(1));
    let second = queue.drain_batch(None).await.unwrap();
    assert_eq!(second.results[0].attempt, 2);
    assert!(second.results[0].will_retry());

    // second delay is twice the first
    clock.advance(chrono::Duration::seconds(1));
    assert!(queue.drain_batch(None).await.unwrap().is_empty());
    clock.advance(chrono::Duration::seconds(1));
    let third = queue.drain_batch(None).await.unwrap();
    assert_eq!(third.completed_tasks, 1);

    let task = queue.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn backpressure_drain_waits_for_relief_then_finishes() {
    // 950 / 1000 is above the 85% critical line; each reclaim frees 100
    let probe = Arc::new(SimulatedMemoryProbe::new(950).with_reclaim_step(100));
    let engine = engine_with(
        EngineConfig {
            relief_poll_interval_ms: 5,
            relief_timeout_ms: 1_000,
            ..quiet_config()
        },
        probe.clone(),
    );

    let items = (0..12)
        .map(|i| WorkItem::new(TaskType::Report, json!({ "name": format!("r{i}") })))
        .collect();
    let stats = engine.batch().process_with_backpressure(items).await.unwrap();

    assert_eq!(stats.total_processed, 12);
    assert_eq!(stats.total_failed, 0);
    assert!(stats.backpressure_events >= 1);
    assert!(probe.reclaim_calls() >= 1);
    assert_eq!(stats.batch_sizes, vec![10, 2]);
    assert!(engine.monitor().is_safe());
}

#[tokio::test(start_paused = true)]
async fn failing_dependency_trips_the_breaker_once() {
    let engine = engine_with(
        EngineConfig {
            retry_attempts: 1,
            consumer_count: 1,
            circuit_breaker_threshold: 5,
            ..quiet_config()
        },
        Arc::new(SimulatedMemoryProbe::new(100)),
    );
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();

    let stats = engine
        .batch()
        .process_advanced((0..20u32).collect(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(EngineError::executor("connection refused")) }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(stats.circuit_breaker_trips, 1);
    assert_eq!(stats.total_failed, 20);
    assert_eq!(stats.errors_by_type.get("circuit_open"), Some(&15));
}

#[tokio::test(start_paused = true)]
async fn adaptive_run_respects_configured_bounds() {
    let engine = engine_with(
        EngineConfig {
            batch_size: 10,
            min_batch_size: 5,
            max_batch_size: 20,
            target_latency_ms: 100,
            ..quiet_config()
        },
        Arc::new(SimulatedMemoryProbe::new(100)),
    );

    let stats = engine
        .batch()
        .process_adaptive((0..200u64).collect(), |x| async move {
            let ms = if x % 3 == 0 { 300 } else { 10 };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(x)
        })
        .await
        .unwrap();

    assert_eq!(stats.total_processed, 200);
    assert_eq!(stats.batch_sizes.iter().sum::<usize>(), 200);
    let (last, full) = stats.batch_sizes.split_last().unwrap();
    assert!(full.iter().all(|s| (5..=20).contains(s)));
    assert!(*last <= 20);
}

#[tokio::test]
async fn streaming_yields_every_chunk() {
    let engine = engine_with(
        EngineConfig {
            chunk_size: 4,
            ..quiet_config()
        },
        Arc::new(SimulatedMemoryProbe::new(100)),
    );

    let chunks: Vec<Vec<u32>> = engine
        .streaming()
        .process_stream((0..10u32).collect(), |x| async move { Ok(x + 1) }, None)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.concat(), (1..=10).collect::<Vec<_>>());
    assert_eq!(engine.streaming().stats().total_processed, 10);
}
