//! The enclave: one application thread and one helper thread sharing a core.
//!
//! An [`Enclave`] owns everything private to that pair: the index sentinel
//! tower, the intermediate entry chain rooted at its head entry, the op
//! ring between the two threads, the two bump arenas, and the pacing and
//! lifecycle state. The shared data layer is reached through the chain
//! sentinel passed in at construction; it is the only thing enclaves have
//! in common.
//!
//! Lifecycle: construct, `start_helper`, populate (optional), index reset
//! handshake, `start_application`, run, `stop_application`, `stop_helper`,
//! drop. Dropping unmaps the arenas, which is what finally releases every
//! node this enclave ever allocated.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::alloc::ZoneAllocator;
use crate::application::{application_loop, initial_populate, AppParams, PopulateParams};
use crate::channel::{OpRecord, OpRing, DEFAULT_CAPACITY};
use crate::config::OpCounters;
use crate::error::SetupError;
use crate::helper::helper_loop;
use crate::index::{head_entry_new, inode_new, Entry, IndexNode};
use crate::node::DataNode;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::topology::CorePair;

/// One application/helper pair bound to a core.
pub struct Enclave {
    id: usize,
    core: CorePair,
    alloc: ZoneAllocator,
    ring: OpRing,

    /// Top of the index sentinel tower. Written by the helper, read by the
    /// application thread on every descent.
    sentinel: AtomicPtr<IndexNode>,
    /// Left-most intermediate entry (key 0, anchored on the chain
    /// sentinel). Its level is the current index height.
    head_entry: *mut Entry,

    /// Index maintenance probability in percent.
    update_freq: u32,
    /// Helper pacing in microseconds; 0 spins.
    sleep_time_us: AtomicU64,

    /// Helper shutdown flag.
    finished: AtomicBool,
    /// Whether a helper thread is currently running.
    running: AtomicBool,
    /// One-shot request to rebuild the index tower from the entry chain.
    reset_index: AtomicBool,

    /// Live level-0 entries seen by the last sweep.
    non_del: AtomicU64,
    /// Deleted entries with towers seen by the last sweep.
    tall_del: AtomicU64,
    /// Keys inserted during initial population.
    populated: AtomicU64,

    helper: Mutex<Option<JoinHandle<()>>>,
    app: Mutex<Option<JoinHandle<OpCounters>>>,
    populate: Mutex<Option<JoinHandle<u64>>>,

    /// (local, foreign) accesses merged from the application thread.
    pub(crate) app_local: AtomicU64,
    /// Foreign half of the application tally.
    pub(crate) app_foreign: AtomicU64,
    /// (local, foreign) accesses merged from the helper thread.
    pub(crate) hlp_local: AtomicU64,
    /// Foreign half of the helper tally.
    pub(crate) hlp_foreign: AtomicU64,
}

// SAFETY: the raw head_entry pointer refers to arena storage owned by this
// enclave and valid for its lifetime; all other shared state is atomic or
// lock-guarded.
unsafe impl Send for Enclave {}
unsafe impl Sync for Enclave {}

impl Enclave {
    /// Build an enclave on `core`, with its index rooted over the shared
    /// chain sentinel `head`.
    ///
    /// # Errors
    ///
    /// Propagates arena mapping failures.
    pub fn new(
        id: usize,
        core: CorePair,
        head: *mut DataNode,
        data_cap: usize,
        index_cap: usize,
        update_freq: u32,
        bind_socket: bool,
    ) -> Result<Arc<Self>, SetupError> {
        let socket = bind_socket.then_some(core.socket);
        let alloc = ZoneAllocator::new(data_cap, index_cap, socket, id)?;
        let head_entry = head_entry_new(alloc.index(), head);
        let sentinel = inode_new(
            alloc.index(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            head_entry,
        );

        Ok(Arc::new(Self {
            id,
            core,
            alloc,
            ring: OpRing::new(DEFAULT_CAPACITY),
            sentinel: AtomicPtr::new(sentinel),
            head_entry,
            update_freq,
            sleep_time_us: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            running: AtomicBool::new(false),
            reset_index: AtomicBool::new(false),
            non_del: AtomicU64::new(0),
            tall_del: AtomicU64::new(0),
            populated: AtomicU64::new(0),
            helper: Mutex::new(None),
            app: Mutex::new(None),
            populate: Mutex::new(None),
            app_local: AtomicU64::new(0),
            app_foreign: AtomicU64::new(0),
            hlp_local: AtomicU64::new(0),
            hlp_foreign: AtomicU64::new(0),
        }))
    }

    /// Enclave id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The core this enclave is bound to.
    #[must_use]
    pub fn core(&self) -> CorePair {
        self.core
    }

    // ========================================================================
    //  Helper lifecycle
    // ========================================================================

    /// Start the helper thread with the given pacing.
    ///
    /// # Errors
    ///
    /// [`SetupError::Spawn`] if the OS refuses the thread.
    pub fn start_helper(self: &Arc<Self>, sleep_us: u64, seed: u64) -> Result<(), SetupError> {
        if self.running.load(READ_ORD) {
            return Ok(());
        }
        self.sleep_time_us.store(sleep_us, RELAXED);
        self.finished.store(false, WRITE_ORD);
        self.running.store(true, WRITE_ORD);

        let enclave = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("hosk-hlp-{}", self.id))
            .spawn(move || helper_loop(&enclave, seed))
            .map_err(|source| SetupError::Spawn {
                role: "helper",
                enclave: self.id,
                source,
            })?;
        *self.helper.lock() = Some(handle);
        Ok(())
    }

    /// Stop and join the helper thread.
    pub fn stop_helper(&self) {
        if !self.running.load(READ_ORD) {
            return;
        }
        self.finished.store(true, WRITE_ORD);
        if let Some(handle) = self.helper.lock().take() {
            let _ = handle.join();
        }
        self.running.store(false, WRITE_ORD);
    }

    /// Whether the helper was asked to stop.
    #[must_use]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(READ_ORD)
    }

    /// Current helper pacing in microseconds.
    #[must_use]
    pub(crate) fn sleep_time_us(&self) -> u64 {
        self.sleep_time_us.load(RELAXED)
    }

    /// Index maintenance probability in percent.
    #[must_use]
    pub(crate) fn update_freq(&self) -> u32 {
        self.update_freq
    }

    // ========================================================================
    //  Application lifecycle
    // ========================================================================

    /// Start the application thread.
    ///
    /// # Errors
    ///
    /// [`SetupError::Spawn`] if the OS refuses the thread.
    pub fn start_application(self: &Arc<Self>, params: AppParams) -> Result<(), SetupError> {
        let enclave = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("hosk-app-{}", self.id))
            .spawn(move || application_loop(&enclave, &params))
            .map_err(|source| SetupError::Spawn {
                role: "application",
                enclave: self.id,
                source,
            })?;
        *self.app.lock() = Some(handle);
        Ok(())
    }

    /// Join the application thread and return its counters.
    #[must_use]
    pub fn stop_application(&self) -> OpCounters {
        self.app
            .lock()
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }

    /// Start inserting `params.num` keys on the application slot.
    ///
    /// # Errors
    ///
    /// [`SetupError::Spawn`] if the OS refuses the thread.
    pub fn begin_population(self: &Arc<Self>, params: PopulateParams) -> Result<(), SetupError> {
        let enclave = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("hosk-pop-{}", self.id))
            .spawn(move || initial_populate(&enclave, &params))
            .map_err(|source| SetupError::Spawn {
                role: "application",
                enclave: self.id,
                source,
            })?;
        *self.populate.lock() = Some(handle);
        Ok(())
    }

    /// Join the population thread; returns the last key it inserted.
    #[must_use]
    pub fn end_population(&self) -> u64 {
        self.populate
            .lock()
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or(0)
    }

    /// Number of keys inserted during population.
    #[must_use]
    pub fn populated(&self) -> u64 {
        self.populated.load(RELAXED)
    }

    pub(crate) fn note_populated(&self) {
        self.populated.fetch_add(1, RELAXED);
    }

    // ========================================================================
    //  Index state
    // ========================================================================

    /// Top of the sentinel tower.
    #[must_use]
    pub(crate) fn sentinel(&self) -> *mut IndexNode {
        self.sentinel.load(READ_ORD)
    }

    /// Publish a new tower top and return it.
    pub(crate) fn set_sentinel(&self, sentinel: *mut IndexNode) -> *mut IndexNode {
        self.sentinel.store(sentinel, WRITE_ORD);
        sentinel
    }

    /// Left-most intermediate entry.
    #[must_use]
    pub(crate) fn head_entry(&self) -> *mut Entry {
        self.head_entry
    }

    /// Current index height (the head entry's tower level).
    #[must_use]
    pub fn index_height(&self) -> u32 {
        // SAFETY: head_entry lives as long as the enclave.
        unsafe { (*self.head_entry).level() }
    }

    /// Ask the helper to discard the index tower and rebuild from the
    /// entry chain.
    pub fn request_index_reset(&self) {
        self.reset_index.store(true, WRITE_ORD);
    }

    /// Consume a pending reset request.
    pub(crate) fn take_reset_request(&self) -> bool {
        self.reset_index.swap(false, READ_ORD)
    }

    /// Record the counts observed by the latest sweep.
    pub(crate) fn set_sweep_counts(&self, non_del: u64, tall_del: u64) {
        self.non_del.store(non_del, RELAXED);
        self.tall_del.store(tall_del, RELAXED);
    }

    /// (live level-0 entries, deleted entries with towers) from the latest
    /// sweep.
    #[must_use]
    pub(crate) fn sweep_counts(&self) -> (u64, u64) {
        (self.non_del.load(RELAXED), self.tall_del.load(RELAXED))
    }

    // ========================================================================
    //  Channel and arenas
    // ========================================================================

    /// Publish a successful update to the helper. Returns false when the
    /// ring is full.
    pub(crate) fn publish(&self, key: u64, node: *mut DataNode) -> bool {
        self.ring.push(OpRecord { key, node })
    }

    /// Take the oldest pending update.
    pub(crate) fn drain_one(&self) -> Option<OpRecord> {
        self.ring.pop()
    }

    /// The data-node arena. Application-thread side.
    #[must_use]
    pub(crate) fn data_arena(&self) -> &crate::alloc::Arena {
        self.alloc.data()
    }

    /// The index-node and entry arena. Helper-thread side.
    #[must_use]
    pub(crate) fn index_arena(&self) -> &crate::alloc::Arena {
        self.alloc.index()
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        self.finished.store(true, WRITE_ORD);
        if let Some(h) = self.helper.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.app.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.populate.lock().take() {
            let _ = h.join();
        }
    }
}
