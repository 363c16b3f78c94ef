//! Processors built on the queue and the monitor: streaming, batch strategies
//! and the pieces they share.

pub mod adaptive;
pub mod batch;
pub mod breaker;
pub mod hooks;
pub mod streaming;

pub use self::adaptive::{AdaptiveBatchSizer, AdaptiveConfig};
pub use self::batch::{BatchConfig, BatchProcessor, WorkItem};
pub use self::breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitState};
pub use self::hooks::ProcessingHooks;
pub use self::streaming::{ChunkSink, ChunkStream, CollectSink, StreamOptions, StreamingProcessor};
