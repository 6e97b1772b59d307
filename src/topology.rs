//! Hardware layout discovery and thread placement.
//!
//! Enclaves need one core each, with both SMT siblings usable: the
//! application thread takes the first hardware thread, the helper the
//! second, so the pair shares L1/L2 with the enclave's channel and index.
//!
//! Layout is read from sysfs (`/sys/devices/system/cpu/*/topology/`).
//! Machines without a second hardware thread per core cannot host an
//! enclave and are rejected at detection time. Tests that do not care about
//! placement fabricate a [`Topology`] with [`Topology::uniform`] instead;
//! pinning is best-effort there.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::SetupError;
use crate::tracing_helpers::warn_log;

/// One usable core: a (socket, core) position and its two hardware threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorePair {
    /// Socket (NUMA node) id.
    pub socket: usize,
    /// Core id within the socket.
    pub core: usize,
    /// Hardware thread for the application side.
    pub app_cpu: usize,
    /// Hardware thread for the helper side.
    pub hlp_cpu: usize,
}

/// The machine layout enclaves are placed on.
#[derive(Debug, Clone)]
pub struct Topology {
    sockets: Vec<usize>,
    cores: Vec<CorePair>,
    cpus: usize,
}

impl Topology {
    /// Enumerate sockets, cores and SMT siblings from sysfs.
    ///
    /// # Errors
    ///
    /// [`SetupError::Topology`] when sysfs cannot be parsed and
    /// [`SetupError::SmtUnavailable`] when any core exposes fewer than two
    /// hardware threads.
    pub fn detect() -> Result<Self, SetupError> {
        let cpu_root = Path::new("/sys/devices/system/cpu");
        let mut by_core: std::collections::BTreeMap<(usize, usize), Vec<usize>> =
            std::collections::BTreeMap::new();
        let mut cpus = 0;

        let entries = fs::read_dir(cpu_root)
            .map_err(|e| SetupError::Topology(format!("{}: {e}", cpu_root.display())))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name
                .strip_prefix("cpu")
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            let topo = entry.path().join("topology");
            if !topo.exists() {
                // Offline cpu.
                continue;
            }
            let socket = read_id(&topo.join("physical_package_id"))?;
            let core = read_id(&topo.join("core_id"))?;
            by_core.entry((socket, core)).or_default().push(id);
            cpus += 1;
        }

        if by_core.is_empty() {
            return Err(SetupError::Topology("no cpus found in sysfs".into()));
        }

        let mut sockets: Vec<usize> = by_core.keys().map(|&(s, _)| s).collect();
        sockets.dedup();

        let mut cores = Vec::with_capacity(by_core.len());
        for ((socket, core), mut threads) in by_core {
            threads.sort_unstable();
            if threads.len() < 2 {
                return Err(SetupError::SmtUnavailable(format!(
                    "socket {socket} core {core} has a single hardware thread"
                )));
            }
            cores.push(CorePair {
                socket,
                core,
                app_cpu: threads[0],
                hlp_cpu: threads[1],
            });
        }

        Ok(Self {
            sockets,
            cores,
            cpus,
        })
    }

    /// Fabricate a flat layout for `n` enclaves on one socket.
    ///
    /// Used by tests and embedders that run without placement guarantees.
    /// Hardware thread ids wrap around the actually available cpus, so
    /// pinning stays valid even when `n` exceeds them.
    #[must_use]
    pub fn uniform(n: usize) -> Self {
        let avail = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let cores = (0..n)
            .map(|i| CorePair {
                socket: 0,
                core: i,
                app_cpu: i % avail,
                hlp_cpu: i % avail,
            })
            .collect();
        Self {
            sockets: vec![0],
            cores,
            cpus: avail,
        }
    }

    /// Number of sockets.
    #[must_use]
    pub fn sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Number of usable cores across all sockets.
    #[must_use]
    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    /// Number of hardware threads seen.
    #[must_use]
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Place `threads` enclaves round-robin across at most `max_sockets`
    /// sockets (0 means all), filling core positions in order.
    ///
    /// # Errors
    ///
    /// [`SetupError::NotEnoughCores`] when the layout runs out of cores.
    pub fn assign(
        &self,
        threads: usize,
        max_sockets: usize,
    ) -> Result<Vec<CorePair>, SetupError> {
        let use_sockets = if max_sockets == 0 {
            self.sockets.len()
        } else {
            max_sockets.min(self.sockets.len())
        };

        // Cores grouped per socket, in discovery order.
        let per_socket: Vec<Vec<CorePair>> = self.sockets[..use_sockets]
            .iter()
            .map(|&s| {
                self.cores
                    .iter()
                    .copied()
                    .filter(|c| c.socket == s)
                    .collect()
            })
            .collect();

        let mut out = Vec::with_capacity(threads);
        let mut sock = 0;
        let mut core_idx = 0;
        for _ in 0..threads {
            let Some(&pair) = per_socket[sock].get(core_idx) else {
                return Err(SetupError::NotEnoughCores {
                    requested: threads,
                    available: per_socket.iter().map(Vec::len).sum(),
                });
            };
            out.push(pair);
            sock += 1;
            if sock == use_sockets {
                sock = 0;
                core_idx += 1;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sockets:          {}", self.sockets())?;
        writeln!(
            f,
            "Cores/Socket:     {}",
            self.cores() / self.sockets().max(1)
        )?;
        write!(f, "Hardware Threads: {}", self.cpus())
    }
}

fn read_id(path: &Path) -> Result<usize, SetupError> {
    let text = fs::read_to_string(path)
        .map_err(|e| SetupError::Topology(format!("{}: {e}", path.display())))?;
    text.trim()
        .parse::<usize>()
        .map_err(|e| SetupError::Topology(format!("{}: {e}", path.display())))
}

/// Whether the host exposes a NUMA topology at all.
#[must_use]
pub fn numa_available() -> bool {
    Path::new("/sys/devices/system/node/node0").exists()
}

/// Pin the calling thread to one cpu. Best-effort: failures are reported
/// through the log and the thread keeps its previous mask.
pub fn pin_to_cpu(cpu: usize) -> bool {
    // SAFETY: cpu_set_t is a plain bitmask; CPU_ZERO/CPU_SET only touch it.
    let ok = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    };
    if !ok {
        warn_log!(cpu, "sched_setaffinity failed; thread runs unpinned");
    }
    ok
}

// ============================================================================
//  Address locality accounting (addr-stats)
// ============================================================================

/// Local/foreign access counting via get_mempolicy(2).
///
/// Traversal code records the addresses it touches; the worker sets its
/// socket once after pinning and drains the tallies when it exits. Counting
/// is per-thread so the hot path stays free of shared writes.
#[cfg(feature = "addr-stats")]
pub mod addrcheck {
    use std::cell::Cell;

    const MPOL_F_NODE: libc::c_ulong = 1 << 0;
    const MPOL_F_ADDR: libc::c_ulong = 1 << 1;

    thread_local! {
        static SOCKET: Cell<i64> = const { Cell::new(-1) };
        static LOCAL: Cell<u64> = const { Cell::new(0) };
        static FOREIGN: Cell<u64> = const { Cell::new(0) };
    }

    /// Declare the calling thread's home socket.
    pub fn set_socket(socket: usize) {
        SOCKET.with(|s| s.set(socket as i64));
    }

    /// Classify one touched address against the home socket.
    pub fn record(addr: *const u8) {
        let home = SOCKET.with(Cell::get);
        if home < 0 || addr.is_null() {
            return;
        }
        let mut node: libc::c_int = -1;
        // SAFETY: get_mempolicy with MPOL_F_NODE | MPOL_F_ADDR only reads
        // the mapping that contains addr and writes the node id.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut node as *mut libc::c_int,
                std::ptr::null_mut::<libc::c_ulong>(),
                0usize,
                addr,
                MPOL_F_NODE | MPOL_F_ADDR,
            )
        };
        if rc != 0 {
            return;
        }
        if i64::from(node) == home {
            LOCAL.with(|c| c.set(c.get() + 1));
        } else {
            FOREIGN.with(|c| c.set(c.get() + 1));
        }
    }

    /// Drain the calling thread's (local, foreign) tallies.
    pub fn take() -> (u64, u64) {
        let local = LOCAL.with(|c| c.replace(0));
        let foreign = FOREIGN.with(|c| c.replace(0));
        (local, foreign)
    }
}

// ============================================================================
//  Tests
// ============================================================================
