//! Consecutive-failure circuit breaker.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: usize,
    /// How long the circuit stays open before a probe is let through.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single call allowed after the cooldown.
    Probe,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    trips: usize,
}

/// Opens after `failure_threshold` consecutive failures. After `cooldown`, one
/// probe is admitted: success closes the circuit, failure re-opens it and
/// counts as another trip.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `CircuitOpen` while open or while the probe is outstanding.
    pub fn try_acquire(&self) -> Result<Admission, EngineError> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => Err(EngineError::CircuitOpen),
            CircuitState::Open => {
                let cooled = st
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    st.state = CircuitState::HalfOpen;
                    info!("circuit half-open; admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(EngineError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::Closed {
            info!("circuit closed");
        }
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.opened_at = None;
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut st = self.lock();
        st.consecutive_failures += 1;
        let trip = match st.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => st.consecutive_failures >= self.config.failure_threshold,
            // late results of calls admitted before the circuit opened
            CircuitState::Open => false,
        };
        if trip {
            st.state = CircuitState::Open;
            st.opened_at = Some(Instant::now());
            st.trips += 1;
            warn!(
                consecutive_failures = st.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                trips = st.trips,
                "circuit opened"
            );
        }
        trip
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn trips(&self) -> usize {
        self.lock().trips
    }

    pub fn consecutive_failures(&self) -> usize {
        self.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker();
        assert!(!b.record_failure());
        assert!(!b.record_failure());
        assert!(b.record_failure());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 1);
        assert!(matches!(b.try_acquire(), Err(EngineError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_count() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert!(!b.record_failure());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(b.try_acquire().unwrap(), Admission::Probe);
        // only one probe at a time
        assert!(matches!(b.try_acquire(), Err(EngineError::CircuitOpen)));
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.try_acquire().unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_counts_a_trip() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(b.try_acquire().unwrap(), Admission::Probe);
        assert!(b.record_failure());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.try_acquire().is_err());
    }
}
