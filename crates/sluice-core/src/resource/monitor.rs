//! ResourceMonitor - メモリ使用量の監視と backpressure 判定
//!
//! - `snapshot()`: 副作用なしの計測
//! - `sample()`: 計測 + warn ログ + reclaim + 履歴への追加
//! - `start_monitoring()`: `monitor_interval` ごとに `sample()` を回す
//!   バックグラウンド task（watch channel で停止）

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::snapshot::{PressureLevel, ResourceSnapshot, Trend};
use crate::domain::EngineError;
use crate::ports::{Clock, MemoryProbe};

/// Average of the newer half must differ from the older half by more than
/// this many percentage points to count as a trend.
const TREND_EPSILON_PERCENT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub memory_limit_bytes: u64,
    pub warning_threshold_percent: f64,
    pub gc_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub relief_poll_interval: Duration,
    pub monitor_interval: Duration,
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * 1024 * 1024,
            warning_threshold_percent: 70.0,
            gc_threshold_percent: 80.0,
            critical_threshold_percent: 85.0,
            relief_poll_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(5),
            history_size: 60,
        }
    }
}

impl MonitorConfig {
    /// `0 < warning <= gc <= critical <= 100`, non-zero limit and history.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.memory_limit_bytes == 0 {
            return Err(EngineError::Config("memory_limit_bytes must be > 0".into()));
        }
        let (w, g, c) = (
            self.warning_threshold_percent,
            self.gc_threshold_percent,
            self.critical_threshold_percent,
        );
        if !(w > 0.0 && w <= g && g <= c && c <= 100.0) {
            return Err(EngineError::Config(format!(
                "thresholds must satisfy 0 < warning <= gc <= critical <= 100 (got {w}/{g}/{c})"
            )));
        }
        if self.history_size == 0 {
            return Err(EngineError::Config("history_size must be > 0".into()));
        }
        if self.relief_poll_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(EngineError::Config("monitor intervals must be > 0".into()));
        }
        Ok(())
    }
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
}

impl MonitorInner {
    fn history(&self) -> MutexGuard<'_, VecDeque<ResourceSnapshot>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> ResourceSnapshot {
        let used_bytes = self.probe.used_bytes();
        let limit_bytes = self.config.memory_limit_bytes;
        let percent_used = ResourceSnapshot::percent_of(used_bytes, limit_bytes);
        ResourceSnapshot {
            used_bytes,
            limit_bytes,
            percent_used,
            level: PressureLevel::classify(
                percent_used,
                self.config.warning_threshold_percent,
                self.config.gc_threshold_percent,
                self.config.critical_threshold_percent,
            ),
            taken_at: self.clock.now(),
        }
    }

    fn sample(&self) -> ResourceSnapshot {
        let snap = self.snapshot();
        match snap.level {
            PressureLevel::Normal => {}
            PressureLevel::Warning => {
                warn!(percent_used = snap.percent_used, used_bytes = snap.used_bytes, "memory usage above warning threshold");
            }
            PressureLevel::Reclaim | PressureLevel::Critical => {
                warn!(
                    percent_used = snap.percent_used,
                    used_bytes = snap.used_bytes,
                    level = ?snap.level,
                    "memory usage above reclaim threshold; requesting reclaim"
                );
                self.probe.reclaim();
            }
        }
        let mut history = self.history();
        if history.len() == self.config.history_size {
            history.pop_front();
        }
        history.push_back(snap.clone());
        snap
    }
}

struct Sampler {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Memory watchdog shared by the queue and the processors.
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    sampler: Mutex<Option<Sampler>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn MemoryProbe>, clock: Arc<dyn Clock>) -> Self {
        let history = VecDeque::with_capacity(config.history_size);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                clock,
                history: Mutex::new(history),
            }),
            sampler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Reading without side effects.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.inner.snapshot()
    }

    /// Reading that logs, reclaims above the gc threshold and lands in history.
    pub fn sample(&self) -> ResourceSnapshot {
        self.inner.sample()
    }

    /// Below the critical threshold.
    pub fn is_safe(&self) -> bool {
        self.snapshot().percent_used < self.inner.config.critical_threshold_percent
    }

    pub fn is_under_pressure(&self, threshold_percent: f64) -> bool {
        self.snapshot().percent_used >= threshold_percent
    }

    pub fn force_reclaim(&self) {
        debug!("forced memory reclaim");
        self.inner.probe.reclaim();
    }

    /// Poll until safe or until `timeout` elapses, reclaiming every round.
    pub async fn await_relief(&self, timeout: Duration) -> bool {
        self.await_below(self.inner.config.critical_threshold_percent, timeout)
            .await
    }

    /// Poll until usage drops below `threshold_percent` or `timeout` elapses.
    pub async fn await_below(&self, threshold_percent: f64, timeout: Duration) -> bool {
        let started = Instant::now();
        let poll = self.inner.config.relief_poll_interval;
        loop {
            self.force_reclaim();
            if !self.is_under_pressure(threshold_percent) {
                return true;
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return false;
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    /// `Ok` when safe now or after relief; `ResourceExhausted` when relief times out.
    pub async fn ensure_safe(&self, timeout: Duration) -> Result<(), EngineError> {
        if self.is_safe() {
            return Ok(());
        }
        let started = Instant::now();
        let snap = self.sample();
        warn!(percent_used = snap.percent_used, "memory critical; waiting for relief");
        if self.await_relief(timeout).await {
            info!(waited_ms = started.elapsed().as_millis() as u64, "memory relieved");
            return Ok(());
        }
        Err(EngineError::ResourceExhausted {
            percent_used: self.snapshot().percent_used,
            waited: started.elapsed(),
        })
    }

    /// Spawn the background sampler. Returns `false` if one is already running.
    pub fn start_monitoring(&self) -> bool {
        let mut slot = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // sender dropped or shutdown requested
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        inner.sample();
                    }
                }
            }
            debug!("memory sampler stopped");
        });
        *slot = Some(Sampler { shutdown_tx, join });
        info!(interval_ms = self.inner.config.monitor_interval.as_millis() as u64, "memory sampler started");
        true
    }

    /// Stop the sampler and wait for it. No-op when not running.
    pub async fn stop_monitoring(&self) {
        let sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Sampler { shutdown_tx, join }) = sampler {
            // ignore send error: the task may already be gone
            let _ = shutdown_tx.send(true);
            let _ = join.await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.sampler.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.inner.history().iter().cloned().collect()
    }

    pub fn peak(&self) -> Option<ResourceSnapshot> {
        self.inner
            .history()
            .iter()
            .max_by_key(|s| s.used_bytes)
            .cloned()
    }

    /// Mean `used_bytes` over the history.
    pub fn average(&self) -> Option<u64> {
        let history = self.inner.history();
        if history.is_empty() {
            return None;
        }
        let sum: u128 = history.iter().map(|s| u128::from(s.used_bytes)).sum();
        u64::try_from(sum / history.len() as u128).ok()
    }

    /// Older half vs newer half of the history.
    pub fn trend(&self) -> Trend {
        let history = self.inner.history();
        if history.len() < 2 {
            return Trend::Stable;
        }
        let mid = history.len() / 2;
        let percents: Vec<f64> = history.iter().map(|s| s.percent_used).collect();
        let (older, newer) = percents.split_at(mid);
        let older = older.iter().sum::<f64>() / older.len() as f64;
        let newer = newer.iter().sum::<f64>() / newer.len() as f64;
        if newer - older > TREND_EPSILON_PERCENT {
            Trend::Increasing
        } else if older - newer > TREND_EPSILON_PERCENT {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.get_mut().ok().and_then(Option::take) {
            let _ = sampler.shutdown_tx.send(true);
            sampler.join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::SimulatedMemoryProbe;
    use crate::ports::SystemClock;

    const MB: u64 = 1024 * 1024;

    fn monitor(used: u64) -> (ResourceMonitor, Arc<SimulatedMemoryProbe>) {
        let probe = Arc::new(SimulatedMemoryProbe::new(used));
        let config = MonitorConfig {
            memory_limit_bytes: 100 * MB,
            history_size: 4,
            relief_poll_interval: Duration::from_millis(100),
            monitor_interval: Duration::from_millis(1000),
            ..MonitorConfig::default()
        };
        let m = ResourceMonitor::new(config, probe.clone(), Arc::new(SystemClock));
        (m, probe)
    }

    #[test]
    fn default_config_is_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = MonitorConfig {
            gc_threshold_percent: 90.0,
            critical_threshold_percent: 85.0,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn safety_follows_critical_threshold() {
        let (m, probe) = monitor(50 * MB);
        assert!(m.is_safe());
        probe.set_used(85 * MB);
        assert!(!m.is_safe());
        assert!(m.is_under_pressure(75.0));
    }

    #[test]
    fn sampling_above_gc_threshold_reclaims() {
        let (m, probe) = monitor(81 * MB);
        let snap = m.sample();
        assert_eq!(snap.level, PressureLevel::Reclaim);
        assert_eq!(probe.reclaim_calls(), 1);

        probe.set_used(10 * MB);
        m.sample();
        assert_eq!(probe.reclaim_calls(), 1);
    }

    #[test]
    fn history_is_bounded_and_summarised() {
        let (m, probe) = monitor(0);
        for used in [10, 20, 30, 40, 50, 60] {
            probe.set_used(used * MB);
            m.sample();
        }
        let history = m.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].used_bytes, 30 * MB);
        assert_eq!(m.peak().unwrap().used_bytes, 60 * MB);
        assert_eq!(m.average(), Some(45 * MB));
        assert_eq!(m.trend(), Trend::Increasing);
    }

    #[test]
    fn flat_history_is_stable() {
        let (m, _probe) = monitor(40 * MB);
        m.sample();
        m.sample();
        m.sample();
        assert_eq!(m.trend(), Trend::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn relief_succeeds_once_reclaim_frees_memory() {
        let probe = Arc::new(SimulatedMemoryProbe::new(90 * MB).with_reclaim_step(3 * MB));
        let config = MonitorConfig {
            memory_limit_bytes: 100 * MB,
            ..MonitorConfig::default()
        };
        let m = ResourceMonitor::new(config, probe.clone(), Arc::new(SystemClock));
        assert!(m.await_relief(Duration::from_secs(10)).await);
        assert!(probe.reclaim_calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn relief_times_out_when_memory_stays_high() {
        let (m, _probe) = monitor(95 * MB);
        let started = Instant::now();
        assert!(!m.await_relief(Duration::from_secs(1)).await);
        assert!(started.elapsed() >= Duration::from_secs(1));

        let err = m.ensure_safe(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn background_sampler_fills_history_until_stopped() {
        let (m, _probe) = monitor(20 * MB);
        assert!(m.start_monitoring());
        assert!(!m.start_monitoring());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        m.stop_monitoring().await;
        assert!(!m.is_monitoring());

        let n = m.history().len();
        assert!(n >= 2, "expected at least two samples, got {n}");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(m.history().len(), n);
    }
}
