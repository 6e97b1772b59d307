//! Benchmark coordinator binary.
//!
//! Drives a configurable integer-set workload over the hybrid skip list:
//! parses flags, checks the host (NUMA plus SMT are hard requirements
//! here), builds one enclave per requested thread, populates, runs the
//! timed window and prints the aggregate report.
//!
//! Exit codes: 0 on a normal stop, 1 on precondition or setup failures,
//! 2 on arena exhaustion (raised from the allocator itself).

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap::Parser;

use hosk::config::{
    DEFAULT_DURATION_MS, DEFAULT_INITIAL, DEFAULT_RANGE, DEFAULT_THREADS, DEFAULT_UPDATE,
    DEFAULT_UPDATE_FREQ,
};
use hosk::{BenchConfig, BenchReport, Coordinator, Topology};

/// Integer-set stress benchmark over a NUMA-aware hybrid skip list.
#[derive(Parser, Debug)]
#[command(name = "hosk", version)]
struct Cli {
    /// Test duration in milliseconds (0 = run until SIGHUP/SIGTERM)
    #[arg(short = 'd', long, default_value_t = DEFAULT_DURATION_MS)]
    duration: u64,

    /// Number of elements to insert before the test
    #[arg(short = 'i', long = "initial-size", default_value_t = DEFAULT_INITIAL)]
    initial: u64,

    /// Number of enclaves (application/helper thread pairs)
    #[arg(short = 't', long = "thread-num", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Range of integer values inserted in the set
    #[arg(short = 'r', long, default_value_t = DEFAULT_RANGE)]
    range: u64,

    /// RNG seed (0 = time-based)
    #[arg(short = 'S', long, default_value_t = 0)]
    seed: u64,

    /// Percentage of update transactions
    #[arg(short = 'u', long = "update-rate", default_value_t = DEFAULT_UPDATE)]
    update: u32,

    /// Consecutive insert/remove target the same value
    #[arg(short = 'A', long)]
    alternate: bool,

    /// Update transactions must effectively write (0 = trial, 1 = effective)
    #[arg(short = 'f', long, default_value_t = 1)]
    effective: u8,

    /// Number of sockets to use (0 = all)
    #[arg(short = 'z', long, default_value_t = 0)]
    sockets: usize,

    /// Percentage of helper passes that run index maintenance
    #[arg(short = 'F', long = "update-frequency", default_value_t = DEFAULT_UPDATE_FREQ)]
    update_frequency: u32,

    /// Partition the range of values over the enclaves
    #[arg(short = 'p', long)]
    partition: bool,

    /// Helper pacing sleep in microseconds (0 = spin)
    #[arg(long = "helper-sleep", default_value_t = 0)]
    helper_sleep: u64,
}

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn catcher(sig: libc::c_int) {
    // Async-signal-safe: one atomic store.
    if let Some(stop) = STOP.get() {
        stop.store(true, Ordering::SeqCst);
    }
    let _ = sig;
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = catcher;
    // SAFETY: catcher only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGHUP, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }
}

fn print_report(cfg: &BenchConfig, report: &BenchReport) {
    let dur = report.duration_ms.max(1) as f64;
    println!(
        "Set size      : {} (expected: {})",
        report.observed_size, report.expected_size
    );
    println!("Duration      : {} (ms)", report.duration_ms);
    println!(
        "#txs          : {} ({:.2} / s)",
        report.total_ops,
        report.total_ops as f64 * 1000.0 / dur
    );
    if cfg.effective {
        println!(
            "#read txs     : {} ({:.2} / s)",
            report.effective_reads,
            report.effective_reads as f64 * 1000.0 / dur
        );
        println!(
            "  #contains   : {} ({:.2} / s)",
            report.reads,
            report.reads as f64 * 1000.0 / dur
        );
    } else {
        println!(
            "#read txs     : {} ({:.2} / s)",
            report.reads,
            report.reads as f64 * 1000.0 / dur
        );
    }
    let eff_total = report.effective_updates + report.effective_reads;
    println!(
        "#eff. upd rate: {:.2}",
        if eff_total == 0 {
            0.0
        } else {
            100.0 * report.effective_updates as f64 / eff_total as f64
        }
    );
    if cfg.effective {
        println!(
            "#update txs   : {} ({:.2} / s)",
            report.effective_updates,
            report.effective_updates as f64 * 1000.0 / dur
        );
        println!(
            "  #adds       : {} ({:.2} / s)",
            report.adds,
            report.adds as f64 * 1000.0 / dur
        );
        println!(
            "  #rmvs       : {} ({:.2} / s)",
            report.removes,
            report.removes as f64 * 1000.0 / dur
        );
        println!(
            "  #upd trials : {} ({:.2} / s)",
            report.updates,
            report.updates as f64 * 1000.0 / dur
        );
    } else {
        println!(
            "#update txs   : {} ({:.2} / s)",
            report.updates,
            report.updates as f64 * 1000.0 / dur
        );
    }

    #[cfg(feature = "trav-stats")]
    {
        println!("Average index hops: {:.2}", report.avg_idx_hops);
        println!("Average data  hops: {:.2}", report.avg_dat_hops);
    }
    #[cfg(feature = "addr-stats")]
    {
        let ratio = |local: u64, foreign: u64| {
            if local + foreign == 0 {
                0.0
            } else {
                local as f64 * 100.0 / (local + foreign) as f64
            }
        };
        let (al, af) = report.app_accesses;
        let (hl, hf) = report.hlp_accesses;
        println!("Application threads: {:.2}% local ({al} local, {af} foreign)", ratio(al, af));
        println!("Helper threads:      {:.2}% local ({hl} local, {hf} foreign)", ratio(hl, hf));
    }
}

fn main() {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hosk=info")),
        )
        .init();

    let cli = Cli::parse();

    if !hosk::topology::numa_available() {
        eprintln!("Error: NUMA unavailable on this system.");
        exit(1);
    }
    let topology = match Topology::detect() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };

    let cfg = BenchConfig {
        duration_ms: cli.duration,
        initial: cli.initial,
        threads: cli.threads,
        range: cli.range,
        seed: cli.seed,
        update: cli.update,
        alternate: cli.alternate,
        effective: cli.effective != 0,
        sockets: cli.sockets,
        update_freq: cli.update_frequency,
        partition: cli.partition,
        helper_sleep_us: cli.helper_sleep,
    };

    println!("Set type     : hybrid skip list");
    println!("Duration     : {}", cfg.duration_ms);
    println!("Initial size : {}", cfg.initial);
    println!("Nb threads   : {}", cfg.threads);
    println!("Value range  : {}", cfg.range);
    println!("Seed         : {}", cfg.seed);
    println!("Update rate  : {}", cfg.update);
    println!("Alternate    : {}", u8::from(cfg.alternate));
    println!("Effective    : {}", u8::from(cfg.effective));
    println!("Sockets      : {}", cfg.sockets);
    println!("{topology}");

    let mut coordinator = match Coordinator::new(cfg.clone(), &topology, true) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };

    let _ = STOP.set(coordinator.stop_handle());
    install_signal_handlers();

    println!("Adding {} entries to set", cfg.initial);
    let size = match coordinator.populate() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };
    println!("Set size     : {size}");
    let share = cfg.initial / cfg.threads as u64;
    println!(
        "Level max    : {}",
        if share >= 2 { share.ilog2() } else { 0 }
    );

    println!("STARTING...");
    let report = match coordinator.run() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };
    println!("STOPPING...");
    print_report(&cfg, &report);
}
