//! Run orchestration: construct enclaves, populate, run, collect results.
//!
//! The coordinator owns the shared chain sentinel and one enclave per
//! requested thread. A run goes through the fixed sequence:
//!
//! 1. build enclaves over the chosen cores, arenas sized from the workload
//! 2. populate: helpers on, each enclave inserts its share of the initial
//!    keys, helpers off
//! 3. handshake: data-node height hints reset, every enclave discards the
//!    population-skewed index and rebuilds it until the tower reaches about
//!    log2 of its fill, helpers restarted with the configured pacing
//! 4. timed window: application threads cross the start barrier, run until
//!    the duration elapses or the stop flag is raised, then join
//! 5. report: counter aggregation plus the expected-versus-observed size
//!    oracle over the shared chain

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::alloc::CACHE_LINE_SIZE;
use crate::application::{AppParams, PopulateParams};
use crate::config::{BenchConfig, BenchReport, OpCounters};
use crate::enclave::Enclave;
use crate::error::SetupError;
use crate::node::{data_layer_size, head_free, head_new, reset_levels, DataNode};
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::topology::Topology;
use crate::tracing_helpers::debug_log;

/// Sizing headroom: data nodes allocated per millisecond of update churn.
const CHURN_NODES_PER_MS: u64 = 4096;
/// Churn floor applied when the duration is open-ended or very short.
const CHURN_FLOOR_MS: u64 = 1_000;
/// Index-arena multiplier over the expected fill, as bytes per line.
const IDX_MULTIPLIER: u64 = 3;
/// How long the startup handshake waits for an index to reach height.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns one benchmark instance end to end.
pub struct Coordinator {
    cfg: BenchConfig,
    head: *mut DataNode,
    enclaves: Vec<Arc<Enclave>>,
    stop: Arc<AtomicBool>,
    seeder: SmallRng,
    last_key: u64,
    /// Live keys at the start of the next timed window; the base of the
    /// expected-size oracle.
    base_size: u64,
}

// SAFETY: the chain sentinel is owned by the coordinator and outlives every
// enclave; all other shared state is behind Arc/atomics.
unsafe impl Send for Coordinator {}

impl Coordinator {
    /// Validate the configuration and build all enclaves over `topology`.
    ///
    /// `bind_sockets` controls whether arena pages are bound to the
    /// enclave's socket; tests on fabricated layouts pass false.
    ///
    /// # Errors
    ///
    /// Configuration, placement and arena failures.
    pub fn new(
        cfg: BenchConfig,
        topology: &Topology,
        bind_sockets: bool,
    ) -> Result<Self, SetupError> {
        cfg.validate()?;
        let placement = topology.assign(cfg.threads, cfg.sockets)?;

        let seed = if cfg.seed == 0 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x5eed)
        } else {
            cfg.seed
        };
        let mut seeder = SmallRng::seed_from_u64(seed);

        let (data_cap, index_cap) = arena_sizes(&cfg);
        let head = head_new();

        let mut enclaves = Vec::with_capacity(cfg.threads);
        for (id, core) in placement.into_iter().enumerate() {
            let enclave = match Enclave::new(
                id,
                core,
                head,
                data_cap,
                index_cap,
                cfg.update_freq,
                bind_sockets,
            ) {
                Ok(e) => e,
                Err(e) => {
                    drop(enclaves);
                    // SAFETY: no enclave references the chain anymore.
                    unsafe { head_free(head) };
                    return Err(e);
                }
            };
            enclaves.push(enclave);
        }

        Ok(Self {
            cfg,
            head,
            enclaves,
            stop: Arc::new(AtomicBool::new(false)),
            seeder,
            last_key: 0,
            base_size: 0,
        })
    }

    /// The configuration this instance runs.
    #[must_use]
    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    /// Handle for raising the stop flag externally (signals, tests).
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Live keys currently in the shared chain.
    #[must_use]
    pub fn observed_size(&self) -> u64 {
        // SAFETY: head is valid while the coordinator exists.
        unsafe { data_layer_size(self.head, true) }
    }

    /// Verify chain ordering and key uniqueness.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, for test diagnostics.
    pub fn check_chain(&self) -> Result<(), String> {
        // SAFETY: head is valid while the coordinator exists.
        unsafe { crate::node::check_chain(self.head) }
    }

    /// Index heights of all enclaves, for observability and tests.
    #[must_use]
    pub fn index_heights(&self) -> Vec<u32> {
        self.enclaves.iter().map(|e| e.index_height()).collect()
    }

    // ========================================================================
    //  Population
    // ========================================================================

    /// Insert the initial key set and run the index handshake.
    ///
    /// Returns the number of live keys in the chain afterwards.
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn populate(&mut self) -> Result<u64, SetupError> {
        let threads = self.cfg.threads as u64;
        let share = self.cfg.initial / threads;
        let remainder = self.cfg.initial % threads;

        for enclave in &self.enclaves {
            enclave.start_helper(0, self.seeder.random())?;
        }

        for (i, enclave) in self.enclaves.iter().enumerate() {
            let num = share + u64::from((i as u64) < remainder);
            let (range, offset) = self.cfg.key_window(i);
            enclave.begin_population(PopulateParams {
                num,
                range,
                offset,
                seed: self.seeder.random(),
            })?;
        }
        for enclave in &self.enclaves {
            let last = enclave.end_population();
            if last != 0 {
                self.last_key = last;
            }
        }
        for enclave in &self.enclaves {
            enclave.stop_helper();
        }

        // The population-time index is skewed towards whatever arrived
        // first; discard it and rebuild over the settled chain.
        // SAFETY: all workers are joined, the chain is quiescent.
        unsafe { reset_levels(self.head) };
        for enclave in &self.enclaves {
            enclave.request_index_reset();
            enclave.start_helper(0, self.seeder.random())?;
        }

        let target = if share >= 4 { share.ilog2() - 1 } else { 0 };
        if target > 0 {
            let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
            for enclave in &self.enclaves {
                while enclave.index_height() < target && Instant::now() < deadline {
                    std::thread::yield_now();
                }
            }
        }

        for enclave in &self.enclaves {
            enclave.stop_helper();
            enclave.start_helper(self.cfg.helper_sleep_us, self.seeder.random())?;
        }

        debug_log!(
            size = self.cfg.initial,
            heights = ?self.index_heights(),
            "population finished"
        );
        let size = self.observed_size();
        self.base_size = size;
        Ok(size)
    }

    // ========================================================================
    //  Timed window
    // ========================================================================

    /// Run the workload and aggregate the report.
    ///
    /// With a zero duration the run continues until [`Self::stop_handle`]
    /// is raised.
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn run(&mut self) -> Result<BenchReport, SetupError> {
        let barrier = Arc::new(Barrier::new(self.cfg.threads + 1));
        self.stop.store(false, WRITE_ORD);

        for (i, enclave) in self.enclaves.iter().enumerate() {
            let (range, offset) = self.cfg.key_window(i);
            enclave.start_application(AppParams {
                first: self.last_key,
                range,
                offset,
                update: self.cfg.update,
                alternate: self.cfg.alternate,
                effective: self.cfg.effective,
                seed: self.seeder.random(),
                barrier: Arc::clone(&barrier),
                stop: Arc::clone(&self.stop),
            })?;
        }

        barrier.wait();
        let start = Instant::now();

        if self.cfg.duration_ms > 0 {
            let deadline = start + Duration::from_millis(self.cfg.duration_ms);
            loop {
                let now = Instant::now();
                if now >= deadline || self.stop.load(READ_ORD) {
                    break;
                }
                std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
            }
        } else {
            while !self.stop.load(READ_ORD) {
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        self.stop.store(true, WRITE_ORD);
        let elapsed = start.elapsed();

        let mut totals = OpCounters::default();
        for enclave in &self.enclaves {
            totals.merge(&enclave.stop_application());
        }
        for enclave in &self.enclaves {
            enclave.stop_helper();
        }

        let report = self.build_report(&totals, elapsed);
        self.base_size = report.observed_size;
        Ok(report)
    }

    /// Stop and restart every helper with a new pacing value.
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn retune_helpers(&mut self, sleep_us: u64) -> Result<(), SetupError> {
        for enclave in &self.enclaves {
            enclave.stop_helper();
            enclave.start_helper(sleep_us, self.seeder.random())?;
        }
        Ok(())
    }

    fn build_report(&self, totals: &OpCounters, elapsed: Duration) -> BenchReport {
        let reads = totals.contains;
        let updates = totals.add + totals.remove;
        let effective_reads =
            totals.contains + (totals.add - totals.added) + (totals.remove - totals.removed);
        let effective_updates = totals.added + totals.removed;
        let expected_size = self.base_size + totals.added - totals.removed;

        let (mut app_local, mut app_foreign) = (0, 0);
        let (mut hlp_local, mut hlp_foreign) = (0, 0);
        for enclave in &self.enclaves {
            app_local += enclave.app_local.load(READ_ORD);
            app_foreign += enclave.app_foreign.load(READ_ORD);
            hlp_local += enclave.hlp_local.load(READ_ORD);
            hlp_foreign += enclave.hlp_foreign.load(READ_ORD);
        }

        let per_op = |hops: u64| {
            if totals.total_ops == 0 {
                0.0
            } else {
                hops as f64 / totals.total_ops as f64
            }
        };

        BenchReport {
            duration_ms: elapsed.as_millis() as u64,
            total_ops: reads + updates,
            effective_reads,
            effective_updates,
            reads,
            updates,
            adds: totals.added,
            removes: totals.removed,
            expected_size,
            observed_size: self.observed_size(),
            avg_idx_hops: per_op(totals.idx_hops),
            avg_dat_hops: per_op(totals.dat_hops),
            app_accesses: (app_local, app_foreign),
            hlp_accesses: (hlp_local, hlp_foreign),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop.store(true, WRITE_ORD);
        for enclave in &self.enclaves {
            let _ = enclave.stop_application();
            enclave.stop_helper();
        }
        // Arenas unmap when the last enclave reference drops; only then is
        // the chain sentinel safe to free.
        self.enclaves.clear();
        // SAFETY: every thread is joined and every enclave dropped.
        unsafe { head_free(self.head) };
    }
}

/// Arena capacities from the workload estimate: the expected per-enclave
/// fill plus duration-driven churn for the data side, and a slimmer
/// multiple of the fill for the index side.
fn arena_sizes(cfg: &BenchConfig) -> (usize, usize) {
    let per = cfg.initial / cfg.threads as u64 + 1;
    let expected = per + per * u64::from(cfg.update) / 100;

    let churn_nodes = if cfg.update == 0 {
        0
    } else {
        cfg.duration_ms.max(CHURN_FLOOR_MS) * CHURN_NODES_PER_MS
    };
    let data_nodes = expected * 4 + churn_nodes + 8_192;
    let data_cap = (CACHE_LINE_SIZE as u64 * data_nodes) as usize;

    let index_cap = (CACHE_LINE_SIZE as u64 * expected * IDX_MULTIPLIER) as usize
        + data_cap / 2
        + (1 << 20);

    (data_cap, index_cap)
}

// ============================================================================
//  Tests
// ============================================================================
