//! Traffic and host statistics accumulator
//!
//! Counters accumulate between reports and are zeroed each time a report is
//! taken, so every [`ReportMsg`] covers exactly one reporting interval.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sysinfo::System;

use crate::protocol::ReportMsg;

/// Shared accumulator fed by the data plane and drained by the report loop
pub struct StatCollector {
    traffic_in: AtomicI64,
    traffic_out: AtomicI64,
    errors: Mutex<Vec<String>>,
    system: Mutex<System>,
}

impl StatCollector {
    /// Create an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            traffic_in: AtomicI64::new(0),
            traffic_out: AtomicI64::new(0),
            errors: Mutex::new(Vec::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// Count bytes received from peers
    pub fn add_traffic_in(&self, bytes: i64) {
        self.traffic_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count bytes sent to peers
    pub fn add_traffic_out(&self, bytes: i64) {
        self.traffic_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an error sample for the next report
    pub fn record_error(&self, error: impl Into<String>) {
        self.errors.lock().push(error.into());
    }

    /// Take a report and zero the accumulators
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot_reset(&self) -> ReportMsg {
        let (cpu, mem) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            let cpu = system.global_cpu_info().cpu_usage() as i32;
            let mem = if system.total_memory() > 0 {
                (system.used_memory() * 100 / system.total_memory()) as i32
            } else {
                0
            };
            (cpu, mem)
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        ReportMsg {
            timestamp,
            cpu,
            mem,
            traffic_in: self.traffic_in.swap(0, Ordering::Relaxed),
            traffic_out: self.traffic_out.swap(0, Ordering::Relaxed),
            errors: std::mem::take(&mut *self.errors.lock()),
        }
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StatCollector::new();
        stats.add_traffic_in(100);
        stats.add_traffic_in(50);
        stats.add_traffic_out(7);
        stats.record_error("dial peer failed");

        let report = stats.snapshot_reset();
        assert_eq!(report.traffic_in, 150);
        assert_eq!(report.traffic_out, 7);
        assert_eq!(report.errors, vec!["dial peer failed".to_string()]);
        assert!(report.timestamp > 0);
    }

    #[test]
    fn test_snapshot_resets_to_zero() {
        let stats = StatCollector::new();
        stats.add_traffic_in(42);
        stats.record_error("x");
        let _ = stats.snapshot_reset();

        let second = stats.snapshot_reset();
        assert_eq!(second.traffic_in, 0);
        assert_eq!(second.traffic_out, 0);
        assert!(second.errors.is_empty());
    }
}
