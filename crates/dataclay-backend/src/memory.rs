//! Memory usage probes.
//!
//! The eviction policy only needs one number: the fraction of system memory
//! in use. The trait keeps the data manager testable with a fake gauge.

use parking_lot::Mutex;
use sysinfo::System;

/// Reports current memory pressure as a fraction of system memory.
pub trait MemoryGauge: Send + Sync {
    /// Fraction of system memory in use, in `0.0..=1.0`.
    fn used_fraction(&self) -> f64;
}

/// Gauge backed by the operating system's memory accounting.
pub struct SystemMemoryGauge {
    system: Mutex<System>,
}

impl SystemMemoryGauge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGauge for SystemMemoryGauge {
    fn used_fraction(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_gauge_in_range() {
        let gauge = SystemMemoryGauge::new();
        let used = gauge.used_fraction();
        assert!((0.0..=1.0).contains(&used));
    }
}
