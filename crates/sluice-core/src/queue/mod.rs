//! Queue module: task state machine, retry policy and metrics.

mod metrics;
mod retry;
mod task_queue;

pub use metrics::{ExecutionWindow, MetricsCache, QueueMetrics};
pub use retry::RetryPolicy;
pub use task_queue::{QueueConfig, TaskQueue};
