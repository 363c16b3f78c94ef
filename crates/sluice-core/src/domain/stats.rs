//! Run statistics shared by the streaming and batch processors.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::EngineError;

/// Memory figures observed during a run, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub peak: u64,
    pub average: u64,
    pub current: u64,
    #[serde(skip)]
    samples: u64,
}

impl MemoryStats {
    pub fn record(&mut self, used_bytes: u64) {
        self.current = used_bytes;
        self.peak = self.peak.max(used_bytes);
        // running mean; u128 keeps the intermediate product from overflowing
        let n = u128::from(self.samples);
        let mean = (u128::from(self.average) * n + u128::from(used_bytes)) / (n + 1);
        self.average = u64::try_from(mean).unwrap_or(u64::MAX);
        self.samples += 1;
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

/// A failed chunk attempt in the streaming processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkError {
    pub chunk_index: usize,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// An item that exhausted its tries in the batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_index: usize,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_processed: usize,
    pub total_failed: usize,
    pub total_retried: usize,
    pub batches_processed: usize,
    pub elapsed: Duration,
    /// Items per second over `elapsed`.
    pub throughput: f64,
    pub memory: MemoryStats,
    pub backpressure_events: usize,
    pub circuit_breaker_trips: usize,
    pub errors_by_type: BTreeMap<String, usize>,
    pub errors: Vec<ChunkError>,
    pub failed_items: Vec<FailedItem>,
    pub batch_sizes: Vec<usize>,
}

impl ProcessingStats {
    pub fn record_error(&mut self, error: &EngineError) {
        *self
            .errors_by_type
            .entry(error.category().to_string())
            .or_default() += 1;
    }

    pub fn record_chunk_error(&mut self, chunk_index: usize, error: &EngineError, at: DateTime<Utc>) {
        self.record_error(error);
        self.errors.push(ChunkError {
            chunk_index,
            message: error.to_string(),
            at,
        });
    }

    pub fn record_failed_item(&mut self, item_index: usize, error: &EngineError, attempts: u32) {
        self.total_failed += 1;
        self.failed_items.push(FailedItem {
            item_index,
            error: error.to_string(),
            attempts,
        });
    }

    /// Refresh `elapsed` and `throughput`.
    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        let secs = elapsed.as_secs_f64();
        self.throughput = if secs > 0.0 {
            self.total_processed as f64 / secs
        } else {
            0.0
        };
    }

    pub fn error_count(&self) -> usize {
        self.errors_by_type.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tracks_peak_average_current() {
        let mut m = MemoryStats::default();
        for v in [100, 300, 200] {
            m.record(v);
        }
        assert_eq!(m.peak, 300);
        assert_eq!(m.average, 200);
        assert_eq!(m.current, 200);
        assert_eq!(m.sample_count(), 3);
    }

    #[test]
    fn errors_are_grouped_by_category() {
        let mut stats = ProcessingStats::default();
        stats.record_error(&EngineError::executor("a"));
        stats.record_error(&EngineError::executor("b"));
        stats.record_error(&EngineError::CircuitOpen);
        assert_eq!(stats.errors_by_type.get("executor"), Some(&2));
        assert_eq!(stats.errors_by_type.get("circuit_open"), Some(&1));
        assert_eq!(stats.error_count(), 3);
    }

    #[test]
    fn throughput_is_zero_without_elapsed_time() {
        let mut stats = ProcessingStats {
            total_processed: 10,
            ..Default::default()
        };
        stats.finish(Duration::ZERO);
        assert_eq!(stats.throughput, 0.0);
        stats.finish(Duration::from_secs(2));
        assert_eq!(stats.throughput, 5.0);
    }
}
