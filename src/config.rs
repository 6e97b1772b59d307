//! Benchmark configuration and result accounting.
//!
//! The library core takes a plain [`BenchConfig`] so tests and embedders can
//! construct runs directly; only the binary layers a CLI on top of it.

use crate::error::SetupError;

/// Default run duration in milliseconds.
pub const DEFAULT_DURATION_MS: u64 = 10_000;
/// Default initial population.
pub const DEFAULT_INITIAL: u64 = 1024;
/// Default number of enclaves.
pub const DEFAULT_THREADS: usize = 1;
/// Default key range upper bound.
pub const DEFAULT_RANGE: u64 = 0x7FFF_FFFF;
/// Default update percentage.
pub const DEFAULT_UPDATE: u32 = 20;
/// Default index maintenance frequency (percent of helper passes).
pub const DEFAULT_UPDATE_FREQ: u32 = 100;

/// Parameters for one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Run duration in milliseconds. 0 means run until the stop flag is set
    /// (the binary wires signals to it).
    pub duration_ms: u64,
    /// Number of keys inserted before the timed window.
    pub initial: u64,
    /// Number of enclaves. Each enclave runs an application thread and a
    /// helper thread on the two hardware threads of one core.
    pub threads: usize,
    /// Keys are drawn from `[1, range]`.
    pub range: u64,
    /// RNG seed. 0 means time-based.
    pub seed: u64,
    /// Percentage of operations that are updates, 0..=100.
    pub update: u32,
    /// A successful insert is followed by a delete of the same key.
    pub alternate: bool,
    /// Failed updates count as reads when choosing the next operation.
    pub effective: bool,
    /// Number of sockets to spread enclaves over. 0 means all.
    pub sockets: usize,
    /// Probability (percent) that a helper pass runs full index maintenance.
    pub update_freq: u32,
    /// Restrict each enclave to a disjoint `range / threads` sub-range.
    pub partition: bool,
    /// Helper pacing sleep in microseconds. 0 means spin.
    pub helper_sleep_us: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_DURATION_MS,
            initial: DEFAULT_INITIAL,
            threads: DEFAULT_THREADS,
            range: DEFAULT_RANGE,
            seed: 0,
            update: DEFAULT_UPDATE,
            alternate: false,
            effective: true,
            sockets: 0,
            update_freq: DEFAULT_UPDATE_FREQ,
            partition: false,
            helper_sleep_us: 0,
        }
    }
}

impl BenchConfig {
    /// Check value ranges before any resource is allocated.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::InvalidConfig`] on the first violated bound.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.threads == 0 {
            return Err(SetupError::InvalidConfig("threads must be >= 1".into()));
        }
        if self.range == 0 {
            return Err(SetupError::InvalidConfig("range must be >= 1".into()));
        }
        if self.range < self.initial {
            return Err(SetupError::InvalidConfig(format!(
                "range ({}) must be >= initial ({})",
                self.range, self.initial
            )));
        }
        if self.update > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "update ({}) must be within 0..=100",
                self.update
            )));
        }
        if self.update_freq > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "update-frequency ({}) must be within 0..=100",
                self.update_freq
            )));
        }
        if self.partition && self.range / self.threads as u64 == 0 {
            return Err(SetupError::InvalidConfig(
                "partitioned range leaves no keys per enclave".into(),
            ));
        }
        Ok(())
    }

    /// Keys each enclave is expected to hold after population.
    #[must_use]
    pub fn per_enclave_fill(&self) -> u64 {
        self.initial / self.threads as u64
    }

    /// Key sub-range width and offset for enclave `id`.
    #[must_use]
    pub fn key_window(&self, id: usize) -> (u64, u64) {
        if self.partition {
            let width = self.range / self.threads as u64;
            (width, width * id as u64)
        } else {
            (self.range, 0)
        }
    }
}

/// Per-thread operation counters, merged into the final report.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpCounters {
    /// Insert attempts.
    pub add: u64,
    /// Inserts that took effect.
    pub added: u64,
    /// Delete attempts.
    pub remove: u64,
    /// Deletes that took effect.
    pub removed: u64,
    /// Lookup attempts.
    pub contains: u64,
    /// Lookups that found a live key.
    pub found: u64,
    /// Index hops across all operations.
    pub idx_hops: u64,
    /// Data-layer hops across all operations.
    pub dat_hops: u64,
    /// Total completed operations.
    pub total_ops: u64,
}

impl OpCounters {
    /// Fold another thread's counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.add += other.add;
        self.added += other.added;
        self.remove += other.remove;
        self.removed += other.removed;
        self.contains += other.contains;
        self.found += other.found;
        self.idx_hops += other.idx_hops;
        self.dat_hops += other.dat_hops;
        self.total_ops += other.total_ops;
    }
}

/// Aggregated results of a run.
#[derive(Debug, Default, Clone)]
pub struct BenchReport {
    /// Wall-clock duration of the timed window in milliseconds.
    pub duration_ms: u64,
    /// All completed operations (reads plus update attempts).
    pub total_ops: u64,
    /// Reads plus failed updates (the effective read count).
    pub effective_reads: u64,
    /// Updates that took effect.
    pub effective_updates: u64,
    /// Lookup attempts.
    pub reads: u64,
    /// Update attempts.
    pub updates: u64,
    /// Inserts that took effect.
    pub adds: u64,
    /// Deletes that took effect.
    pub removes: u64,
    /// Size predicted from `initial + adds - removes`.
    pub expected_size: u64,
    /// Live keys counted by walking the data layer after the run.
    pub observed_size: u64,
    /// Average index hops per operation, when hop counting is compiled in.
    pub avg_idx_hops: f64,
    /// Average data-layer hops per operation, when hop counting is compiled in.
    pub avg_dat_hops: f64,
    /// (local, foreign) memory accesses from application threads, with the
    /// `addr-stats` feature.
    pub app_accesses: (u64, u64),
    /// (local, foreign) memory accesses from helper threads, with the
    /// `addr-stats` feature.
    pub hlp_accesses: (u64, u64),
}

impl BenchReport {
    /// Throughput in operations per second.
    #[must_use]
    pub fn ops_per_sec(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.total_ops as f64 * 1000.0 / self.duration_ms as f64
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BenchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_threads() {
        let cfg = BenchConfig {
            threads: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_range_below_initial() {
        let cfg = BenchConfig {
            initial: 100,
            range: 50,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_update_above_100() {
        let cfg = BenchConfig {
            update: 101,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partitioned_key_windows_are_disjoint() {
        let cfg = BenchConfig {
            threads: 4,
            range: 400,
            partition: true,
            ..Default::default()
        };
        let windows: Vec<_> = (0..4).map(|i| cfg.key_window(i)).collect();
        assert_eq!(windows[0], (100, 0));
        assert_eq!(windows[1], (100, 100));
        assert_eq!(windows[3], (100, 300));
    }

    #[test]
    fn test_unpartitioned_window_covers_range() {
        let cfg = BenchConfig {
            threads: 4,
            range: 400,
            ..Default::default()
        };
        assert_eq!(cfg.key_window(3), (400, 0));
    }
}
