//! sluice-core
//!
//! Resource-aware task execution: a persistent priority queue with retries,
//! a memory watchdog, and streaming / batch processors that hold back while
//! memory is tight.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, result, stats, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator, MemoryProbe）
//! - **impls**: 実装（InMemoryTaskStore, ProcessMemoryProbe など）
//! - **typed**: 型付き executor API（TypedTask, Handler, ExecutorRegistry）
//! - **queue**: TaskQueue（状態遷移・retry・metrics）
//! - **resource**: ResourceMonitor
//! - **concurrency**: BoundedWorkerPool, BackpressureQueue
//! - **processing**: StreamingProcessor, BatchProcessor
//! - **config**: EngineConfig
//! - **app**: EngineBuilder / Engine

pub mod app;
pub mod concurrency;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod processing;
pub mod queue;
pub mod resource;
pub mod typed;

pub use app::{BuildError, Engine, EngineBuilder};
pub use config::EngineConfig;
pub use domain::{
    BatchResult, EngineError, EnqueueOptions, Priority, ProcessingStats, Task, TaskId, TaskResult,
    TaskStatus, TaskType,
};
pub use processing::{BatchProcessor, ProcessingHooks, StreamingProcessor, WorkItem};
pub use queue::TaskQueue;
pub use resource::ResourceMonitor;
