//! Latency-driven batch size controller.

use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Desired average per-item latency.
    pub target_latency: Duration,
    /// Relative change per adjustment, in percent.
    pub step_percent: u32,
    /// Grow when latency is below `grow_factor * target`.
    pub grow_factor: f64,
    /// Shrink when latency is above `shrink_factor * target`.
    pub shrink_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            min_batch_size: 5,
            max_batch_size: 100,
            target_latency: Duration::from_secs(1),
            step_percent: 20,
            grow_factor: 0.5,
            shrink_factor: 1.0,
        }
    }
}

/// Grows the batch while items are fast, shrinks it while they are slow.
///
/// The size always stays within `[min_batch_size, max_batch_size]` and moves by
/// at least one when it moves.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSizer {
    config: AdaptiveConfig,
    current: usize,
}

impl AdaptiveBatchSizer {
    pub fn new(config: AdaptiveConfig) -> Self {
        let min = config.min_batch_size.max(1);
        let max = config.max_batch_size.max(min);
        let current = config.initial_batch_size.clamp(min, max);
        Self {
            config: AdaptiveConfig {
                min_batch_size: min,
                max_batch_size: max,
                ..config
            },
            current,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feed the average per-item latency of the last batch; returns the next size.
    pub fn observe(&mut self, avg_latency: Duration) -> usize {
        let target = self.config.target_latency.as_secs_f64();
        let latency = avg_latency.as_secs_f64();
        let step = ((self.current as f64 * f64::from(self.config.step_percent) / 100.0).round() as usize).max(1);

        let next = if latency > self.config.shrink_factor * target {
            self.current.saturating_sub(step)
        } else if latency < self.config.grow_factor * target {
            self.current.saturating_add(step)
        } else {
            self.current
        };
        let next = next.clamp(self.config.min_batch_size, self.config.max_batch_size);
        if next != self.current {
            debug!(
                from = self.current,
                to = next,
                latency_ms = avg_latency.as_millis() as u64,
                "batch size adjusted"
            );
        }
        self.current = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sizer(initial: usize) -> AdaptiveBatchSizer {
        AdaptiveBatchSizer::new(AdaptiveConfig {
            initial_batch_size: initial,
            ..AdaptiveConfig::default()
        })
    }

    #[test]
    fn fast_batches_grow_by_step() {
        let mut s = sizer(10);
        assert_eq!(s.observe(Duration::from_millis(100)), 12);
    }

    #[test]
    fn slow_batches_shrink_by_step() {
        let mut s = sizer(50);
        assert_eq!(s.observe(Duration::from_millis(1500)), 40);
    }

    #[test]
    fn latency_in_band_keeps_size() {
        let mut s = sizer(20);
        assert_eq!(s.observe(Duration::from_millis(700)), 20);
    }

    #[test]
    fn small_sizes_still_move_by_one() {
        let mut s = AdaptiveBatchSizer::new(AdaptiveConfig {
            initial_batch_size: 2,
            min_batch_size: 1,
            ..AdaptiveConfig::default()
        });
        assert_eq!(s.observe(Duration::ZERO), 3);
        assert_eq!(s.observe(Duration::from_secs(5)), 2);
    }

    #[test]
    fn initial_size_is_clamped() {
        assert_eq!(sizer(1).current(), 5);
        assert_eq!(sizer(1000).current(), 100);
    }

    proptest! {
        #[test]
        fn size_stays_within_bounds(
            min in 1usize..20,
            span in 0usize..200,
            initial in 0usize..400,
            latencies in proptest::collection::vec(0u64..5_000, 0..64),
        ) {
            let max = min + span;
            let mut s = AdaptiveBatchSizer::new(AdaptiveConfig {
                initial_batch_size: initial,
                min_batch_size: min,
                max_batch_size: max,
                ..AdaptiveConfig::default()
            });
            prop_assert!(s.current() >= min && s.current() <= max);
            for ms in latencies {
                let next = s.observe(Duration::from_millis(ms));
                prop_assert!(next >= min && next <= max);
            }
        }
    }
}
