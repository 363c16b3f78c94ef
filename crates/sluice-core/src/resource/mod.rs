//! Memory monitoring.

pub mod monitor;
pub mod snapshot;

pub use self::monitor::{MonitorConfig, ResourceMonitor};
pub use self::snapshot::{PressureLevel, ResourceSnapshot, Trend};
