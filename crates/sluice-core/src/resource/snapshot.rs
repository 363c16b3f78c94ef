//! Point-in-time memory readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage band relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Below the warning threshold.
    Normal,
    /// At or above warning; logged.
    Warning,
    /// At or above the reclaim threshold; the probe is asked to release memory.
    Reclaim,
    /// At or above critical; new work is held back.
    Critical,
}

impl PressureLevel {
    pub fn classify(percent_used: f64, warning: f64, reclaim: f64, critical: f64) -> Self {
        if percent_used >= critical {
            PressureLevel::Critical
        } else if percent_used >= reclaim {
            PressureLevel::Reclaim
        } else if percent_used >= warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub percent_used: f64,
    pub level: PressureLevel,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn percent_of(used_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 100.0;
        }
        used_bytes as f64 / limit_bytes as f64 * 100.0
    }
}
