//! EngineBuilder - engine の構築とワイヤリング
//!
//! 設定・store・executor・probe・clock を一度だけ組み立て、
//! 共有インスタンスを `Arc` で持つ `Engine` を返します。
//!
//! # Fail-fast 設計
//! - `expect_types()` で期待される TaskType を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック

use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::domain::{EngineError, TaskType};
use crate::impls::{InMemoryTaskStore, ProcessMemoryProbe};
use crate::ports::{Clock, IdGenerator, MemoryProbe, SystemClock, TaskStore};
use crate::processing::{BatchProcessor, ProcessingHooks, StreamingProcessor};
use crate::queue::TaskQueue;
use crate::resource::ResourceMonitor;
use crate::typed::{ExecutorRegistry, Handler, TaskExecutor, TypedTask};

/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(EngineConfig::from_env()?)
///     .register_typed::<CheckLink, _>(LinkChecker)?
///     .expect_types(&[TaskType::LinkCheck])
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    registry: ExecutorRegistry,
    expected_types: Option<Vec<TaskType>>,
    store: Option<Arc<dyn TaskStore>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    hooks: ProcessingHooks,
}

/// Engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing executors for task types: {0:?}. These types were expected but not registered.")]
    MissingExecutors(Vec<TaskType>),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: ExecutorRegistry::new(),
            expected_types: None,
            store: None,
            probe: None,
            clock: None,
            ids: None,
            hooks: ProcessingHooks::default(),
        }
    }

    /// 型消去済み executor を登録
    pub fn register(mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Result<Self, EngineError> {
        self.registry.register(task_type, executor)?;
        Ok(self)
    }

    /// Handler を登録
    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, EngineError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される TaskType のリストを設定
    pub fn expect_types(mut self, task_types: &[TaskType]) -> Self {
        self.expected_types = Some(task_types.to_vec());
        self
    }

    /// 既定は `InMemoryTaskStore`
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 既定は `ProcessMemoryProbe`
    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 既定は `SystemClock`
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Streaming と batch の両方に渡す hooks
    pub fn hooks(mut self, hooks: ProcessingHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// # 検証
    /// - 設定値（`EngineConfig::validate`）
    /// - `expect_types()` の TaskType が全て登録されているか
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_types {
            let mut missing: Vec<TaskType> = expected
                .iter()
                .copied()
                .filter(|t| !self.registry.contains(*t))
                .collect();
            missing.sort();
            missing.dedup();
            if !missing.is_empty() {
                return Err(BuildError::MissingExecutors(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let probe = self.probe.unwrap_or_else(|| Arc::new(ProcessMemoryProbe));
        let registry = Arc::new(self.registry);

        let monitor = Arc::new(ResourceMonitor::new(
            self.config.monitor_config(),
            probe,
            Arc::clone(&clock),
        ));

        let mut queue = TaskQueue::new(
            self.config.queue_config(),
            store,
            Arc::clone(&registry),
            Arc::clone(&clock),
        )
        .with_monitor(Arc::clone(&monitor));
        if let Some(ids) = self.ids {
            queue = queue.with_id_generator(ids);
        }
        let queue = Arc::new(queue);

        let streaming = Arc::new(
            StreamingProcessor::new(
                Arc::clone(&monitor),
                Arc::clone(&clock),
                self.config.stream_options(),
            )
            .with_hooks(self.hooks.clone()),
        );
        let batch = Arc::new(
            BatchProcessor::new(
                Arc::clone(&queue),
                Arc::clone(&monitor),
                Arc::clone(&clock),
                self.config.batch_config(),
            )
            .with_hooks(self.hooks),
        );

        info!(
            executors = ?registry.registered_types(),
            max_concurrency = self.config.max_concurrency,
            memory_limit_bytes = self.config.memory_limit_bytes,
            "engine built"
        );
        Ok(Engine {
            config: self.config,
            registry,
            monitor,
            queue,
            streaming,
            batch,
        })
    }
}

/// 組み立て済みの共有インスタンス一式
///
/// 呼び出し側は必要なものを `Arc::clone` して持ち回ります。
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ExecutorRegistry>,
    monitor: Arc<ResourceMonitor>,
    queue: Arc<TaskQueue>,
    streaming: Arc<StreamingProcessor>,
    batch: Arc<BatchProcessor>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn streaming(&self) -> &Arc<StreamingProcessor> {
        &self.streaming
    }

    pub fn batch(&self) -> &Arc<BatchProcessor> {
        &self.batch
    }

    /// Background sampling を開始（Tokio runtime 内で呼ぶこと）
    pub fn start(&self) -> bool {
        self.monitor.start_monitoring()
    }

    pub async fn shutdown(&self) {
        self.monitor.stop_monitoring().await;
        info!("engine stopped");
    }
}
