//! Application-thread execution.
//!
//! Each application thread mixes lookups and updates over the shared data
//! layer according to its workload parameters, entering the chain through
//! its enclave's private index. Successful updates are published to the
//! helper through the op ring; everything else leaves no trace outside the
//! chain itself.
//!
//! Operation mixing follows the classic integer-set benchmark rules:
//!
//! - with probability `update`/100 the next operation is an update,
//!   alternating insert and delete around the last inserted key
//! - under `alternate`, a successful insert is followed by a delete of the
//!   same key (and reads alternate between the first populated key and a
//!   random one when updates are off)
//! - under `effective`, failed updates count as reads when deciding what
//!   comes next, so the realized update rate tracks the requested one

use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::OpCounters;
use crate::enclave::Enclave;
use crate::index::descend;
use crate::list::{data_operation, OpKind, Outcome};
use crate::ordering::READ_ORD;
use crate::topology::pin_to_cpu;
use crate::tracing_helpers::trace_log;

/// Parameters handed to one application thread.
pub struct AppParams {
    /// Last key inserted during population; seeds alternate-mode reads.
    pub first: u64,
    /// Width of this thread's key window.
    pub range: u64,
    /// Offset of this thread's key window.
    pub offset: u64,
    /// Update percentage, 0..=100.
    pub update: u32,
    /// Pair inserts with deletes of the same key.
    pub alternate: bool,
    /// Failed updates count as reads for op selection.
    pub effective: bool,
    /// Thread-private RNG seed.
    pub seed: u64,
    /// Start-line barrier shared with the coordinator.
    pub barrier: Arc<Barrier>,
    /// Global stop flag.
    pub stop: Arc<AtomicBool>,
}

/// Parameters for initial population.
pub struct PopulateParams {
    /// Keys to insert.
    pub num: u64,
    /// Width of the key window.
    pub range: u64,
    /// Offset of the key window.
    pub offset: u64,
    /// Thread-private RNG seed.
    pub seed: u64,
}

#[inline]
fn draw_key(rng: &mut SmallRng, range: u64, offset: u64) -> u64 {
    offset + rng.random_range(1..=range)
}

/// Descend the private index and run one data-layer operation.
fn do_operation(
    enclave: &Enclave,
    key: u64,
    kind: OpKind,
    counters: &mut OpCounters,
) -> Outcome {
    // SAFETY: the sentinel is published by this enclave's helper and the
    // entry point it yields is a reachable chain node; the data arena is
    // this thread's own.
    let (outcome, idx_hops, dat_hops) = unsafe {
        let (entry, idx_hops) = descend(enclave.sentinel(), key);
        let (outcome, dat_hops) = data_operation(enclave.data_arena(), entry, kind, key, key);
        (outcome, idx_hops, dat_hops)
    };
    counters.idx_hops += idx_hops;
    counters.dat_hops += dat_hops;
    counters.total_ops += 1;
    outcome
}

/// Pick the next key and operation. May rotate `last` in the alternating
/// read modes.
fn choose_op(
    params: &AppParams,
    rng: &mut SmallRng,
    last: &mut Option<u64>,
    is_update: bool,
) -> (u64, OpKind) {
    if is_update {
        match *last {
            None => (draw_key(rng, params.range, params.offset), OpKind::Insert),
            Some(k) => {
                if params.alternate {
                    (k, OpKind::Delete)
                } else {
                    (draw_key(rng, params.range, params.offset), OpKind::Delete)
                }
            }
        }
    } else {
        let key = if params.alternate {
            if params.update == 0 {
                // Ping-pong between the anchor key and a random one.
                match *last {
                    None => {
                        let first = if params.first == 0 {
                            draw_key(rng, params.range, params.offset)
                        } else {
                            params.first
                        };
                        *last = Some(first);
                        first
                    }
                    Some(_) => {
                        *last = None;
                        draw_key(rng, params.range, params.offset)
                    }
                }
            } else {
                match *last {
                    None => draw_key(rng, params.range, params.offset),
                    Some(k) => k,
                }
            }
        } else {
            draw_key(rng, params.range, params.offset)
        };
        (key, OpKind::Contains)
    }
}

/// Fold one outcome into the counters and compute the next `last`.
fn update_results(
    kind: OpKind,
    counters: &mut OpCounters,
    outcome: Outcome,
    key: u64,
    last: Option<u64>,
    alternate: bool,
) -> Option<u64> {
    match kind {
        OpKind::Contains => {
            counters.contains += 1;
            if outcome.is_done() {
                counters.found += 1;
            }
            last
        }
        OpKind::Insert => {
            counters.add += 1;
            if outcome.is_done() {
                counters.added += 1;
                Some(key)
            } else {
                last
            }
        }
        OpKind::Delete => {
            counters.remove += 1;
            let mut next = last;
            if alternate {
                next = None;
            }
            if outcome.is_done() {
                counters.removed += 1;
                next = None;
            }
            next
        }
    }
}

/// Decide whether the next operation is an update.
fn next_is_update(params: &AppParams, counters: &OpCounters, rng: &mut SmallRng) -> bool {
    if params.effective {
        100 * (counters.added + counters.removed)
            < u64::from(params.update) * (counters.add + counters.remove + counters.contains)
    } else {
        rng.random_range(0..100u32) < params.update
    }
}

/// The application thread body. Runs until the stop flag is observed.
pub(crate) fn application_loop(enclave: &Arc<Enclave>, params: &AppParams) -> OpCounters {
    pin_to_cpu(enclave.core().app_cpu);
    #[cfg(feature = "addr-stats")]
    crate::topology::addrcheck::set_socket(enclave.core().socket);

    params.barrier.wait();

    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut counters = OpCounters::default();
    let mut last: Option<u64> = None;
    let mut is_update = rng.random_range(0..100u32) < params.update;

    while !params.stop.load(READ_ORD) {
        let (key, kind) = choose_op(params, &mut rng, &mut last, is_update);
        let outcome = do_operation(enclave, key, kind, &mut counters);
        last = update_results(kind, &mut counters, outcome, key, last, params.alternate);

        if outcome.is_done() && kind != OpKind::Contains {
            let node = match (kind, outcome) {
                (OpKind::Insert, Outcome::Done(n)) => n,
                _ => ptr::null_mut(),
            };
            // Bounded backpressure: spin until the helper frees a slot,
            // giving up only on shutdown.
            while !enclave.publish(key, node) {
                if params.stop.load(READ_ORD) {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        is_update = next_is_update(params, &counters, &mut rng);
    }

    trace_log!(
        enclave = enclave.id(),
        ops = counters.total_ops,
        "application thread stopping"
    );

    #[cfg(feature = "addr-stats")]
    {
        let (local, foreign) = crate::topology::addrcheck::take();
        enclave
            .app_local
            .fetch_add(local, std::sync::atomic::Ordering::Relaxed);
        enclave
            .app_foreign
            .fetch_add(foreign, std::sync::atomic::Ordering::Relaxed);
    }

    counters
}

/// Insert `params.num` random keys from this enclave, publishing each so
/// the helper can build the initial index. Returns the last inserted key.
pub(crate) fn initial_populate(enclave: &Arc<Enclave>, params: &PopulateParams) -> u64 {
    pin_to_cpu(enclave.core().app_cpu);
    #[cfg(feature = "addr-stats")]
    crate::topology::addrcheck::set_socket(enclave.core().socket);

    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut counters = OpCounters::default();
    let mut last = 0;

    while enclave.populated() < params.num {
        let key = draw_key(&mut rng, params.range, params.offset);
        if let Outcome::Done(node) = do_operation(enclave, key, OpKind::Insert, &mut counters) {
            enclave.note_populated();
            last = key;
            while !enclave.publish(key, node) {
                std::hint::spin_loop();
            }
        }
    }
    last
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params(update: u32, alternate: bool, effective: bool) -> AppParams {
        AppParams {
            first: 7,
            range: 100,
            offset: 0,
            update,
            alternate,
            effective,
            seed: 42,
            barrier: Arc::new(Barrier::new(1)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_update_ops_alternate_insert_delete() {
        let p = params(100, true, false);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut last = None;

        let (_, kind) = choose_op(&p, &mut rng, &mut last, true);
        assert_eq!(kind, OpKind::Insert);

        last = Some(33);
        let (key, kind) = choose_op(&p, &mut rng, &mut last, true);
        assert_eq!((key, kind), (33, OpKind::Delete));
    }

    #[test]
    fn test_read_only_alternate_ping_pongs_anchor() {
        let p = params(0, true, false);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut last = None;

        let (key, kind) = choose_op(&p, &mut rng, &mut last, false);
        assert_eq!((key, kind), (7, OpKind::Contains));
        assert_eq!(last, Some(7));

        let (_, kind) = choose_op(&p, &mut rng, &mut last, false);
        assert_eq!(kind, OpKind::Contains);
        assert_eq!(last, None);
    }

    #[test]
    fn test_update_results_tracks_last_insert() {
        let mut c = OpCounters::default();
        let done = Outcome::Done(ptr::null_mut());

        let last = update_results(OpKind::Insert, &mut c, done, 5, None, true);
        assert_eq!(last, Some(5));
        assert_eq!((c.add, c.added), (1, 1));

        let last = update_results(OpKind::Delete, &mut c, done, 5, last, true);
        assert_eq!(last, None);
        assert_eq!((c.remove, c.removed), (1, 1));

        let last = update_results(OpKind::Insert, &mut c, Outcome::Miss, 9, None, true);
        assert_eq!(last, None);
        assert_eq!((c.add, c.added), (2, 1));
    }

    #[test]
    fn test_effective_mode_counts_failures_as_reads() {
        let p = params(50, false, true);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut c = OpCounters::default();

        // No effective updates yet and plenty of attempts: must demand one.
        c.add = 10;
        c.contains = 10;
        assert!(next_is_update(&p, &c, &mut rng));

        // Realized rate already above target: next op is a read.
        c.added = 10;
        c.removed = 10;
        assert!(!next_is_update(&p, &c, &mut rng));
    }
}
