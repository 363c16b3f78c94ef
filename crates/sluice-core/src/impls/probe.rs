//! MemoryProbe implementations.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::ports::MemoryProbe;

/// Resident set size of the current process.
///
/// Reads `VmRSS` from `/proc/self/status`; reports 0 where that file does not
/// exist or cannot be parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn read_rss() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> u64 {
        Self::read_rss().unwrap_or(0)
    }
}

/// `VmRSS:    12345 kB` -> bytes
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Settable probe for tests and the demo binary.
#[derive(Debug, Default)]
pub struct SimulatedMemoryProbe {
    used: AtomicU64,
    reclaims: AtomicUsize,
    /// Bytes released by each `reclaim` call.
    reclaim_step: AtomicU64,
}

impl SimulatedMemoryProbe {
    pub fn new(used_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            ..Self::default()
        }
    }

    /// Every `reclaim` call lowers usage by `step` bytes.
    pub fn with_reclaim_step(self, step: u64) -> Self {
        self.reclaim_step.store(step, Ordering::Relaxed);
        self
    }

    pub fn set_used(&self, used_bytes: u64) {
        self.used.store(used_bytes, Ordering::Relaxed);
    }

    pub fn reclaim_calls(&self) -> usize {
        self.reclaims.load(Ordering::Relaxed)
    }
}

impl MemoryProbe for SimulatedMemoryProbe {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        let step = self.reclaim_step.load(Ordering::Relaxed);
        if step > 0 {
            let _ = self
                .used
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(step)));
        }
    }
}
