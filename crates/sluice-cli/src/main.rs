mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{info, warn};

use sluice_core::impls::SimulatedMemoryProbe;
use sluice_core::processing::ChunkSink;
use sluice_core::typed::{Handler, TypedTask};
use sluice_core::{
    Engine, EngineBuilder, EngineConfig, EngineError, Priority, ProcessingHooks, ProcessingStats,
    TaskType, WorkItem,
};

use crate::cli::{CliArgs, Command, Workload};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckLink {
    url: String,
}

impl TypedTask for CheckLink {
    const TYPE: TaskType = TaskType::LinkCheck;
}

/// Fails every `fail_every`-th call, otherwise sleeps for the simulated latency.
struct FlakyWork {
    calls: AtomicU32,
    fail_every: u32,
    latency: Duration,
}

impl FlakyWork {
    fn new(workload: &Workload) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_every: workload.fail_every,
            latency: Duration::from_millis(workload.latency_ms),
        }
    }

    async fn run(&self, label: &str) -> Result<(), EngineError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        sleep(self.latency).await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(EngineError::executor(format!("simulated failure on call {n} ({label})")));
        }
        Ok(())
    }
}

struct LinkChecker {
    work: Arc<FlakyWork>,
}

#[async_trait]
impl Handler<CheckLink> for LinkChecker {
    async fn handle(&self, task: CheckLink) -> Result<Value, EngineError> {
        self.work.run(&task.url).await?;
        Ok(json!({ "url": task.url, "status": 200 }))
    }
}

/// Counts chunks as they arrive instead of keeping them.
#[derive(Default)]
struct LoggingSink {
    items: usize,
}

#[async_trait]
impl ChunkSink<String> for LoggingSink {
    async fn accept(&mut self, chunk_index: usize, results: Vec<String>) -> Result<(), EngineError> {
        self.items += results.len();
        info!(chunk = chunk_index, items = results.len(), total = self.items, "chunk stored");
        Ok(())
    }
}

fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {path}"))?;
            EngineConfig::from_json_str(&raw).with_context(|| format!("failed to parse config: {path}"))
        }
        None => EngineConfig::from_env().context("invalid SLUICE_* environment"),
    }
}

fn hooks() -> ProcessingHooks {
    ProcessingHooks::default()
        .on_progress(|stats| {
            info!(
                processed = stats.total_processed,
                failed = stats.total_failed,
                throughput = stats.throughput,
                "progress"
            );
        })
        .on_error(|err, index, attempt| warn!(item = index, attempt, error = %err, "item error"))
        .on_backpressure(|percent_used, queue_len| {
            warn!(percent_used, queue_len, "backpressure");
        })
}

fn build_engine(config: EngineConfig, workload: &Workload, work: Arc<FlakyWork>) -> Result<Engine> {
    let limit = config.memory_limit_bytes as f64;
    let probe = SimulatedMemoryProbe::new((limit * workload.memory_percent / 100.0) as u64)
        .with_reclaim_step((limit * workload.reclaim_percent / 100.0) as u64);

    let engine = EngineBuilder::new(config)
        .probe(Arc::new(probe))
        .hooks(hooks())
        .register_typed::<CheckLink, _>(LinkChecker { work })?
        .expect_types(&[TaskType::LinkCheck])
        .build()?;
    Ok(engine)
}

fn urls(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("https://example.com/page/{i}")).collect()
}

async fn run(command: Command, engine: &Engine, work: Arc<FlakyWork>, items: usize) -> Result<ProcessingStats> {
    let stats = match command {
        Command::Drain => {
            let items = urls(items)
                .into_iter()
                .enumerate()
                .map(|(i, url)| {
                    // every tenth link is urgent
                    let priority = if i % 10 == 0 { Priority::High } else { Priority::Medium };
                    WorkItem::new(TaskType::LinkCheck, json!({ "url": url })).with_priority(priority)
                })
                .collect();
            let stats = engine.batch().process_with_backpressure(items).await?;
            let status = engine.queue().queue_status().await?;
            info!(
                total = status.total,
                success_rate = status.success_rate,
                "queue status"
            );
            stats
        }
        Command::Stream => {
            let mut sink = LoggingSink::default();
            engine
                .streaming()
                .process_stream_with_sink(
                    urls(items),
                    move |url: String| {
                        let work = Arc::clone(&work);
                        async move { work.run(&url).await.map(|()| url) }
                    },
                    &mut sink,
                    None,
                )
                .await?
        }
        Command::Advanced => {
            engine
                .batch()
                .process_advanced(urls(items), move |url: String| {
                    let work = Arc::clone(&work);
                    async move { work.run(&url).await }
                })
                .await?
        }
        Command::Adaptive => {
            engine
                .batch()
                .process_adaptive(urls(items), |url: String| {
                    let work = Arc::clone(&work);
                    async move { work.run(&url).await }
                })
                .await?
        }
        Command::Config => anyhow::bail!("config does not run a workload"),
    };
    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    if let Command::Config = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let work = Arc::new(FlakyWork::new(&args.workload));
    let engine = build_engine(config, &args.workload, Arc::clone(&work))?;
    engine.start();

    let outcome = run(args.command, &engine, work, args.workload.items).await;
    engine.shutdown().await;

    let stats = outcome.with_context(|| format!("{:?} run failed", args.command))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
