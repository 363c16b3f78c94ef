//! Observer callbacks for processor runs.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::error;

use crate::domain::{EngineError, ProcessingStats};

type ProgressFn = dyn Fn(&ProcessingStats) + Send + Sync;
type ErrorFn = dyn Fn(&EngineError, usize, u32) + Send + Sync;
type BackpressureFn = dyn Fn(f64, usize) + Send + Sync;
type ChunkFn = dyn Fn(usize, usize) + Send + Sync;

/// Best-effort callbacks. A panicking callback is logged and swallowed.
///
/// ```ignore
/// let hooks = ProcessingHooks::default()
///     .on_progress(|stats| println!("{} done", stats.total_processed))
///     .on_error(|err, index, attempt| eprintln!("item {index} try {attempt}: {err}"));
/// ```
#[derive(Clone, Default)]
pub struct ProcessingHooks {
    progress: Option<Arc<ProgressFn>>,
    error: Option<Arc<ErrorFn>>,
    backpressure: Option<Arc<BackpressureFn>>,
    chunk_complete: Option<Arc<ChunkFn>>,
}

impl fmt::Debug for ProcessingHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingHooks")
            .field("on_progress", &self.progress.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_backpressure", &self.backpressure.is_some())
            .field("on_chunk_complete", &self.chunk_complete.is_some())
            .finish()
    }
}

impl ProcessingHooks {
    /// Called with a stats snapshot every `progress_interval` completions.
    pub fn on_progress(mut self, f: impl Fn(&ProcessingStats) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    /// Called per failed try with `(error, item_index, attempt)`.
    pub fn on_error(mut self, f: impl Fn(&EngineError, usize, u32) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Called with `(percent_used, queue_len)` when a producer has to wait.
    pub fn on_backpressure(mut self, f: impl Fn(f64, usize) + Send + Sync + 'static) -> Self {
        self.backpressure = Some(Arc::new(f));
        self
    }

    /// Called with `(chunk_index, result_count)` after each streamed chunk.
    pub fn on_chunk_complete(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.chunk_complete = Some(Arc::new(f));
        self
    }

    pub(crate) fn progress(&self, stats: &ProcessingStats) {
        if let Some(f) = &self.progress {
            guarded("on_progress", || f(stats));
        }
    }

    pub(crate) fn error(&self, err: &EngineError, item_index: usize, attempt: u32) {
        if let Some(f) = &self.error {
            guarded("on_error", || f(err, item_index, attempt));
        }
    }

    pub(crate) fn backpressure(&self, percent_used: f64, queue_len: usize) {
        if let Some(f) = &self.backpressure {
            guarded("on_backpressure", || f(percent_used, queue_len));
        }
    }

    pub(crate) fn chunk_complete(&self, chunk_index: usize, result_count: usize) {
        if let Some(f) = &self.chunk_complete {
            guarded("on_chunk_complete", || f(chunk_index, result_count));
        }
    }
}

fn guarded(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(hook, "processing hook panicked; ignoring");
    }
}
