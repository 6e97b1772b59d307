//! End-to-end stress scenarios over the full enclave runtime.
//!
//! Each test drives the coordinator the way the benchmark binary does,
//! then checks the size oracle (expected = start + adds - removes against
//! a walk of the shared chain) and the structural chain invariants.
//!
//! Placement is fabricated with `Topology::uniform`, so these run on any
//! machine; pinning and page binding degrade to best-effort.

mod common;

use hosk::{BenchConfig, Coordinator, Topology};

fn coordinator(cfg: BenchConfig) -> Coordinator {
    let topo = Topology::uniform(cfg.threads);
    Coordinator::new(cfg, &topo, false).expect("coordinator setup")
}

/// Mixed workload smoke run: the size oracle must hold exactly and the
/// chain must stay sorted and duplicate-free.
#[test]
fn smoke_mixed_workload_holds_size_oracle() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 1000,
        initial: 1024,
        threads: 2,
        range: 2048,
        seed: 42,
        update: 20,
        ..Default::default()
    });

    let populated = coord.populate().expect("populate");
    assert_eq!(populated, 1024);

    let report = coord.run().expect("run");
    assert!(report.total_ops > 0, "no operations completed");
    assert_eq!(
        report.observed_size, report.expected_size,
        "size oracle violated: observed {} vs expected {}",
        report.observed_size, report.expected_size
    );
    coord.check_chain().expect("chain invariants");
}

/// Pure insert/delete duality: with alternate pairing every enclave leaves
/// at most one key behind.
#[test]
fn alternate_updates_leave_at_most_one_key_per_enclave() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 500,
        initial: 0,
        threads: 4,
        range: 64,
        seed: 7,
        update: 100,
        alternate: true,
        ..Default::default()
    });

    assert_eq!(coord.populate().expect("populate"), 0);
    let report = coord.run().expect("run");

    assert_eq!(report.observed_size, report.expected_size);
    assert!(
        report.observed_size <= 4,
        "alternate mode left {} keys for 4 enclaves",
        report.observed_size
    );
    coord.check_chain().expect("chain invariants");
}

/// Read-only workload: the map must come out exactly as it went in.
#[test]
fn read_only_workload_preserves_population() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 1000,
        initial: 10_000,
        threads: 8,
        range: 10_000,
        seed: 99,
        update: 0,
        ..Default::default()
    });

    assert_eq!(coord.populate().expect("populate"), 10_000);
    let report = coord.run().expect("run");

    assert_eq!(report.observed_size, 10_000);
    assert_eq!(report.expected_size, 10_000);
    assert!(report.reads > 0, "read-only run performed no reads");
    assert_eq!(report.adds, 0);
    assert_eq!(report.removes, 0);
    coord.check_chain().expect("chain invariants");
}

/// Maximal collision pressure: sixteen enclaves hammering sixteen keys.
/// No invariant may break and the oracle must stay exact.
#[test]
fn high_contention_preserves_invariants() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 500,
        initial: 8,
        threads: 16,
        range: 16,
        seed: 3,
        update: 50,
        ..Default::default()
    });

    assert_eq!(coord.populate().expect("populate"), 8);
    let report = coord.run().expect("run");

    assert_eq!(
        report.observed_size, report.expected_size,
        "size oracle violated under contention"
    );
    assert!(report.observed_size <= 16);
    coord.check_chain().expect("chain invariants");
}

/// Disjoint key windows: with partitioning plus alternate pairing no
/// update can fail, because no other enclave ever touches the same keys.
#[test]
fn partitioned_ranges_never_collide_across_enclaves() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 500,
        initial: 0,
        threads: 4,
        range: 400,
        seed: 11,
        update: 100,
        alternate: true,
        partition: true,
        ..Default::default()
    });

    assert_eq!(coord.populate().expect("populate"), 0);
    let report = coord.run().expect("run");

    assert_eq!(
        report.updates, report.effective_updates,
        "an update failed despite disjoint key windows ({} attempts, {} effective)",
        report.updates, report.effective_updates
    );
    assert_eq!(report.observed_size, report.expected_size);
    coord.check_chain().expect("chain invariants");
}

/// Helpers paced out of existence: operations stay correct over the shared
/// chain alone. Re-enabling the helpers must let the indexes recover and a
/// second window run normally.
#[test]
fn helper_off_stays_correct_and_recovers() {
    common::init_tracing();
    let mut coord = coordinator(BenchConfig {
        duration_ms: 300,
        initial: 512,
        threads: 2,
        range: 4096,
        seed: 5,
        update: 20,
        // Effectively asleep for the whole window.
        helper_sleep_us: 3_600_000_000,
        ..Default::default()
    });

    assert_eq!(coord.populate().expect("populate"), 512);
    let heights_before = coord.index_heights();

    let report = coord.run().expect("first run");
    assert_eq!(
        report.observed_size, report.expected_size,
        "correctness must not depend on the helpers"
    );
    coord.check_chain().expect("chain invariants");

    // Wake the helpers and let them catch up on the backlog.
    coord.retune_helpers(0).expect("retune");
    std::thread::sleep(std::time::Duration::from_millis(200));
    let heights_after = coord.index_heights();
    for (before, after) in heights_before.iter().zip(&heights_after) {
        assert!(
            after >= before,
            "index lost height after recovery: {before} -> {after}"
        );
    }

    let report = coord.run().expect("second run");
    assert_eq!(report.observed_size, report.expected_size);
    coord.check_chain().expect("chain invariants");
}

/// Population must survive repeated seeds and thread counts without
/// losing keys (uniqueness across concurrent populating enclaves).
#[test]
fn population_is_exact_across_thread_counts() {
    common::init_tracing();
    for threads in [1usize, 3, 5] {
        let mut coord = coordinator(BenchConfig {
            duration_ms: 1,
            initial: 900,
            threads,
            range: 4096,
            seed: threads as u64,
            update: 0,
            ..Default::default()
        });
        let size = coord.populate().expect("populate");
        assert_eq!(size, 900, "population lost keys with {threads} threads");
        coord.check_chain().expect("chain invariants");
    }
}
