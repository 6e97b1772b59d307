//! Per-enclave bump allocation over socket-local pages.
//!
//! Every enclave owns a [`ZoneAllocator`]: two independent [`Arena`]s, one
//! feeding data-layer nodes and one feeding index nodes and intermediate
//! entries. Each arena is a single anonymous mapping bound to the enclave's
//! socket, so every node an enclave creates lands in its own NUMA zone.
//!
//! Allocation is linear. Requests are aligned to a half cache line when they
//! fit in one and to a full line otherwise, and a one-bit memory of the last
//! alignment bumps the cursor forward so a full-line request never straddles
//! lines after a half-line one. The only free operation is
//! [`Arena::free_last`], which rolls back the most recent allocation; it
//! exists for the losing side of a splice CAS. Everything else lives until
//! the arena is unmapped at enclave teardown.
//!
//! Exhaustion is fatal by design: arenas are sized up front from the
//! workload, and running past the end is a sizing bug, not a recoverable
//! condition.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::error::SetupError;
use crate::ordering::RELAXED;
use crate::tracing_helpers::warn_log;

/// Cache line size the alignment rules assume.
pub const CACHE_LINE_SIZE: usize = 64;

/// Half a cache line; small nodes pack two per line.
const HALF_LINE: usize = CACHE_LINE_SIZE / 2;

/// MPOL_PREFERRED for mbind(2).
const MPOL_PREFERRED: libc::c_int = 1;

/// Bits in the nodemask handed to mbind(2).
const NODEMASK_BITS: usize = 1024;

#[inline]
const fn align_up(value: usize, alignment: usize) -> usize {
    value + (alignment - (value % alignment)) % alignment
}

// ============================================================================
//  Arena
// ============================================================================

/// One linear allocation region.
///
/// An arena has a single writer at any point of the run (the application
/// thread for the data arena, the helper thread for the index arena), so
/// its cursors are relaxed atomics rather than a lock.
pub struct Arena {
    base: *mut u8,
    cap: usize,
    /// Offset of the first free byte.
    cur: AtomicUsize,
    /// Offset of the most recent allocation, `usize::MAX` when none is
    /// eligible for rollback.
    last: AtomicUsize,
    /// Aligned size of the most recent allocation.
    last_size: AtomicUsize,
    /// Whether the most recent allocation was half-line aligned.
    last_half: AtomicBool,
}

// SAFETY: the raw base pointer refers to a mapping owned by this arena for
// its whole lifetime, and all cursor state is atomic. Correct use is
// single-writer by protocol; concurrent misuse cannot cause UB in the
// cursor bookkeeping itself.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `cap` bytes, preferring pages on `socket` when given.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ArenaMap`] if the mapping fails. A failed
    /// socket binding is reported and ignored; the arena still works, just
    /// without locality.
    pub fn new(cap: usize, socket: Option<usize>, enclave: usize) -> Result<Self, SetupError> {
        let cap = align_up(cap.max(CACHE_LINE_SIZE), page_size());
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SetupError::ArenaMap { bytes: cap, enclave });
        }
        let base = base.cast::<u8>();

        if let Some(socket) = socket {
            if !bind_to_socket(base, cap, socket) {
                warn_log!(enclave, socket, "mbind failed; arena pages are unbound");
            }
        }

        Ok(Self {
            base,
            cap,
            cur: AtomicUsize::new(0),
            last: AtomicUsize::new(usize::MAX),
            last_size: AtomicUsize::new(0),
            last_half: AtomicBool::new(false),
        })
    }

    /// Service an allocation request.
    ///
    /// Requests at most half a line wide get half-line alignment, larger
    /// ones a full line. Exhaustion terminates the process: buffer sizes
    /// are a contract, not a hint.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert!(size > 0);
        let alignment = if size <= HALF_LINE {
            HALF_LINE
        } else {
            CACHE_LINE_SIZE
        };

        let mut off = self.cur.load(RELAXED);

        // A full-line request after a half-line allocation starts on the
        // next line boundary instead of spilling across one.
        if self.last_half.load(RELAXED) && alignment == CACHE_LINE_SIZE {
            off = align_up(off, CACHE_LINE_SIZE);
            self.last_half.store(false, RELAXED);
        } else if !self.last_half.load(RELAXED) && alignment == HALF_LINE {
            self.last_half.store(true, RELAXED);
        }

        let aligned = align_up(size, alignment);
        if off + aligned > self.cap {
            self.exhausted(size);
        }

        self.last.store(off, RELAXED);
        self.last_size.store(aligned, RELAXED);
        self.cur.store(off + aligned, RELAXED);

        // SAFETY: off + aligned <= cap was checked above.
        unsafe { self.base.add(off) }
    }

    /// Roll back the most recent allocation.
    ///
    /// Only the immediately preceding allocation can be undone; any other
    /// pointer is ignored. The reclaimed bytes are zeroed so a later
    /// allocation starts clean.
    pub fn free_last(&self, ptr: *mut u8, size: usize) {
        let alignment = if size <= HALF_LINE {
            HALF_LINE
        } else {
            CACHE_LINE_SIZE
        };
        let aligned = align_up(size, alignment);

        let last = self.last.load(RELAXED);
        if last == usize::MAX {
            return;
        }
        // SAFETY: last was produced by alloc and is within the mapping.
        let last_ptr = unsafe { self.base.add(last) };
        if ptr != last_ptr || self.last_size.load(RELAXED) != aligned {
            return;
        }

        // SAFETY: [last, last + aligned) is owned by this arena and the
        // caller is relinquishing the allocation.
        unsafe { ptr::write_bytes(last_ptr, 0, aligned) };
        self.cur.store(last, RELAXED);
        if self.last_half.load(RELAXED) && alignment == HALF_LINE {
            self.last_half.store(false, RELAXED);
        }
        self.last.store(usize::MAX, RELAXED);
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cur.load(RELAXED)
    }

    /// Total mapped capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[cold]
    fn exhausted(&self, request: usize) -> ! {
        eprintln!(
            "hosk: arena exhausted ({} of {} bytes used, request {}); \
             buffer sizing is a contract, aborting",
            self.used(),
            self.cap,
            request
        );
        std::process::exit(2);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/cap describe the mapping created in new().
        unsafe {
            libc::munmap(self.base.cast(), self.cap);
        }
    }
}

// ============================================================================
//  ZoneAllocator
// ============================================================================

/// The two arenas of one enclave.
///
/// Data-layer nodes (including markers) come from the data arena, written
/// only by the enclave's application thread. Index nodes and intermediate
/// entries come from the index arena, written only by the helper thread.
pub struct ZoneAllocator {
    data: Arena,
    index: Arena,
}

impl ZoneAllocator {
    /// Map both arenas for an enclave on `socket`.
    ///
    /// # Errors
    ///
    /// Propagates mapping failures from [`Arena::new`].
    pub fn new(
        data_cap: usize,
        index_cap: usize,
        socket: Option<usize>,
        enclave: usize,
    ) -> Result<Self, SetupError> {
        Ok(Self {
            data: Arena::new(data_cap, socket, enclave)?,
            index: Arena::new(index_cap, socket, enclave)?,
        })
    }

    /// Arena feeding data-layer nodes.
    #[must_use]
    pub fn data(&self) -> &Arena {
        &self.data
    }

    /// Arena feeding index nodes and intermediate entries.
    #[must_use]
    pub fn index(&self) -> &Arena {
        &self.index
    }
}

// ============================================================================
//  OS helpers
// ============================================================================

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Prefer `socket` for the pages of `[addr, addr + len)`.
///
/// Returns false when the kernel rejects the policy (no NUMA support, or a
/// socket id past the nodemask); callers treat that as a locality loss, not
/// an error.
fn bind_to_socket(addr: *mut u8, len: usize, socket: usize) -> bool {
    if socket >= NODEMASK_BITS {
        return false;
    }
    let mut mask = [0 as libc::c_ulong; NODEMASK_BITS / (usize::BITS as usize)];
    mask[socket / usize::BITS as usize] |= 1 << (socket % usize::BITS as usize);
    // SAFETY: mask outlives the call and maxnode matches its width.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            MPOL_PREFERRED,
            mask.as_ptr(),
            NODEMASK_BITS as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    rc == 0
}

// ============================================================================
//  Tests
// ============================================================================
