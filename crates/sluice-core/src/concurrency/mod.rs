//! Concurrency primitives: a bounded worker pool and a backpressure buffer.

pub mod backpressure;
pub mod pool;

pub use self::backpressure::{BackpressureQueue, Dequeued};
pub use self::pool::BoundedWorkerPool;
