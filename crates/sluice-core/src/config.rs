//! Engine configuration.
//!
//! One flat record with a default for every field. Loaded from JSON or from
//! `SLUICE_<FIELD>` environment variables over the defaults, then split into
//! the per-component configs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::EngineError;
use crate::processing::{AdaptiveConfig, BatchConfig, BreakerConfig, StreamOptions};
use crate::queue::{QueueConfig, RetryPolicy};
use crate::resource::MonitorConfig;

/// Prefix of the environment variables read by `EngineConfig::from_env`.
pub const ENV_PREFIX: &str = "SLUICE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_bound_ms: u64,

    pub memory_limit_bytes: u64,
    pub warning_threshold_percent: f64,
    pub gc_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub backpressure_threshold_percent: f64,

    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_cooldown_ms: u64,
    pub task_timeout_ms: u64,
    pub max_task_age_ms: u64,

    pub chunk_size: usize,
    pub chunk_retry_attempts: u32,
    pub chunk_retry_delay_ms: u64,

    pub buffer_size: usize,
    /// 0 means `max_concurrency`.
    pub consumer_count: usize,
    pub progress_interval: usize,

    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub target_latency_ms: u64,
    pub adaptive_step_percent: u32,
    pub adaptive_grow_factor: f64,
    pub adaptive_shrink_factor: f64,

    pub relief_timeout_ms: u64,
    pub relief_poll_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub history_size: usize,
    pub metrics_cache_ttl_ms: u64,
    pub failure_cooldown_ms: u64,
    pub max_idle_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 5,
            retry_attempts: 3,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_bound_ms: 1_000,
            memory_limit_bytes: 512 * 1024 * 1024,
            warning_threshold_percent: 70.0,
            gc_threshold_percent: 80.0,
            critical_threshold_percent: 85.0,
            backpressure_threshold_percent: 75.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
            task_timeout_ms: 30_000,
            max_task_age_ms: 24 * 60 * 60 * 1_000,
            chunk_size: 100,
            chunk_retry_attempts: 2,
            chunk_retry_delay_ms: 1_000,
            buffer_size: 100,
            consumer_count: 0,
            progress_interval: 10,
            min_batch_size: 5,
            max_batch_size: 100,
            target_latency_ms: 1_000,
            adaptive_step_percent: 20,
            adaptive_grow_factor: 0.5,
            adaptive_shrink_factor: 1.0,
            relief_timeout_ms: 30_000,
            relief_poll_interval_ms: 500,
            monitor_interval_ms: 5_000,
            history_size: 60,
            metrics_cache_ttl_ms: 30_000,
            failure_cooldown_ms: 1_000,
            max_idle_wait_ms: 5_000,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl EngineConfig {
    /// Parse a JSON object; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| EngineError::Config(format!("invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `SLUICE_<FIELD>` environment variables on the defaults.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    ///
    /// Values are read as JSON scalars first (`25`, `0.5`, `true`) and fall
    /// back to plain strings, so a malformed number surfaces as a
    /// `Config` error naming the field.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let Value::Object(defaults) = serde_json::to_value(Self::default())
            .map_err(|e| EngineError::Config(format!("cannot encode defaults: {e}")))?
        else {
            return Err(EngineError::Config("defaults are not an object".into()));
        };

        let mut merged = Map::with_capacity(defaults.len());
        for (field, default) in defaults {
            let var = format!("{ENV_PREFIX}{}", field.to_uppercase());
            let value = match lookup(&var).filter(|v| !v.trim().is_empty()) {
                Some(raw) => {
                    let raw = raw.trim();
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                }
                None => default,
            };
            merged.insert(field, value);
        }

        let config: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|e| EngineError::Config(format!("invalid {ENV_PREFIX}* variable: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_concurrency", self.max_concurrency),
            ("chunk_size", self.chunk_size),
            ("buffer_size", self.buffer_size),
            ("progress_interval", self.progress_interval),
            ("min_batch_size", self.min_batch_size),
            ("history_size", self.history_size),
            ("circuit_breaker_threshold", self.circuit_breaker_threshold),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config(format!("{name} must be greater than 0")));
        }
        if self.retry_attempts == 0 {
            return Err(EngineError::Config("retry_attempts must be greater than 0".into()));
        }
        if self.memory_limit_bytes == 0 {
            return Err(EngineError::Config("memory_limit_bytes must be greater than 0".into()));
        }
        if self.task_timeout_ms == 0 {
            return Err(EngineError::Config("task_timeout_ms must be greater than 0".into()));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(EngineError::Config(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(EngineError::Config(format!(
                "initial_retry_delay_ms {} exceeds max_retry_delay_ms {}",
                self.initial_retry_delay_ms, self.max_retry_delay_ms
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(EngineError::Config(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=100.0).contains(&self.backpressure_threshold_percent) {
            return Err(EngineError::Config(format!(
                "backpressure_threshold_percent {} is outside 0..=100",
                self.backpressure_threshold_percent
            )));
        }
        if !(self.adaptive_grow_factor > 0.0 && self.adaptive_grow_factor <= self.adaptive_shrink_factor) {
            return Err(EngineError::Config(format!(
                "adaptive_grow_factor {} must be positive and not above adaptive_shrink_factor {}",
                self.adaptive_grow_factor, self.adaptive_shrink_factor
            )));
        }
        self.monitor_config().validate()
    }

    pub fn consumer_count(&self) -> usize {
        if self.consumer_count == 0 {
            self.max_concurrency
        } else {
            self.consumer_count
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: ms(self.initial_retry_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: ms(self.max_retry_delay_ms),
            jitter_bound: ms(self.jitter_bound_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrency,
            default_max_attempts: self.retry_attempts,
            retry: self.retry_policy(),
            task_timeout: ms(self.task_timeout_ms),
            max_task_age: ms(self.max_task_age_ms),
            metrics_cache_ttl: ms(self.metrics_cache_ttl_ms),
            relief_timeout: ms(self.relief_timeout_ms),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            memory_limit_bytes: self.memory_limit_bytes,
            warning_threshold_percent: self.warning_threshold_percent,
            gc_threshold_percent: self.gc_threshold_percent,
            critical_threshold_percent: self.critical_threshold_percent,
            relief_poll_interval: ms(self.relief_poll_interval_ms),
            monitor_interval: ms(self.monitor_interval_ms),
            history_size: self.history_size,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            cooldown: ms(self.circuit_breaker_cooldown_ms),
        }
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        AdaptiveConfig {
            initial_batch_size: self.batch_size,
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            target_latency: ms(self.target_latency_ms),
            step_percent: self.adaptive_step_percent,
            grow_factor: self.adaptive_grow_factor,
            shrink_factor: self.adaptive_shrink_factor,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            chunk_size: self.chunk_size,
            max_concurrency: self.max_concurrency,
            chunk_retry_attempts: self.chunk_retry_attempts,
            chunk_retry_delay: ms(self.chunk_retry_delay_ms),
            item_timeout: ms(self.task_timeout_ms),
            relief_timeout: ms(self.relief_timeout_ms),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            retry_attempts: self.retry_attempts,
            retry: self.retry_policy(),
            task_timeout: ms(self.task_timeout_ms),
            consumer_count: self.consumer_count(),
            buffer_size: self.buffer_size,
            progress_interval: self.progress_interval,
            backpressure_threshold_percent: self.backpressure_threshold_percent,
            relief_timeout: ms(self.relief_timeout_ms),
            failure_cooldown: ms(self.failure_cooldown_ms),
            max_idle_wait: ms(self.max_idle_wait_ms),
            breaker: self.breaker_config(),
            adaptive: self.adaptive_config(),
        }
    }
}
