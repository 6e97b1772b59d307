//! Data-layer node model.
//!
//! A [`DataNode`] is one link of the globally shared sorted chain. Its
//! presence state lives in a single atomic word, [`ValueWord`], packing the
//! three states a node moves through:
//!
//! - `Live(v)`: the key is in the map with payload `v`
//! - `Deleted`: logically deleted, still linked
//! - `Marker`: being physically unlinked (also the permanent state of the
//!   key-0 marker nodes spliced in to pin a removal)
//!
//! All transitions are single compare-and-swaps on that word, so a delete,
//! an undelete and a removal mark race deterministically: exactly one wins.
//!
//! The `prev` link is advisory. It is written best-effort after a splice
//! and read only to back out of nodes that turned into markers mid-walk;
//! traversal always rescans forward afterwards.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64};

use crate::alloc::Arena;
use crate::ordering::{CAS_FAIL, CAS_OK, READ_ORD, RELAXED, WRITE_ORD};

/// Key reserved for sentinels and removal markers. Never stored by users.
pub const SENTINEL_KEY: u64 = 0;

// ============================================================================
//  ValueWord
// ============================================================================

/// Tag in the low bits of a packed value word.
const LIVE_TAG: u64 = 0b01;
/// Packed representation of the logically deleted state.
const DELETED_WORD: u64 = 0b00;
/// Packed representation of the removal marker state.
const MARKER_WORD: u64 = 0b11;
/// Payloads are shifted past the tag bits.
const PAYLOAD_SHIFT: u32 = 2;

/// The three presence states of a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueState {
    /// Present in the map, carrying a payload.
    Live(u64),
    /// Logically deleted; the node stays linked until unlinked.
    Deleted,
    /// Physical removal in progress, or a marker node.
    Marker,
}

impl ValueState {
    /// Whether this state counts as present in the map.
    #[must_use]
    #[inline]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live(_))
    }

    /// Whether this state is the removal marker.
    #[must_use]
    #[inline]
    pub const fn is_marker(self) -> bool {
        matches!(self, Self::Marker)
    }

    #[inline]
    const fn pack(self) -> u64 {
        match self {
            Self::Live(v) => (v << PAYLOAD_SHIFT) | LIVE_TAG,
            Self::Deleted => DELETED_WORD,
            Self::Marker => MARKER_WORD,
        }
    }

    #[inline]
    const fn unpack(word: u64) -> Self {
        match word & 0b11 {
            LIVE_TAG => Self::Live(word >> PAYLOAD_SHIFT),
            MARKER_WORD => Self::Marker,
            _ => Self::Deleted,
        }
    }
}

/// One atomic machine word holding a [`ValueState`].
///
/// Payloads must fit in 62 bits, which covers the full key range.
#[derive(Debug)]
pub struct ValueWord(AtomicU64);

impl ValueWord {
    /// Create a word in the given state.
    #[must_use]
    pub fn new(state: ValueState) -> Self {
        if let ValueState::Live(v) = state {
            debug_assert!(v >> (u64::BITS - PAYLOAD_SHIFT) == 0, "payload too wide");
        }
        Self(AtomicU64::new(state.pack()))
    }

    /// Read the current state.
    #[must_use]
    #[inline]
    pub fn load(&self) -> ValueState {
        ValueState::unpack(self.0.load(READ_ORD))
    }

    /// Transition `current -> new` with a single CAS.
    #[inline]
    pub fn cas(&self, current: ValueState, new: ValueState) -> bool {
        self.0
            .compare_exchange(current.pack(), new.pack(), CAS_OK, CAS_FAIL)
            .is_ok()
    }
}

// ============================================================================
//  DataNode
// ============================================================================

/// One node of the shared sorted chain.
#[repr(C)]
pub struct DataNode {
    key: u64,
    val: ValueWord,
    next: AtomicPtr<DataNode>,
    prev: AtomicPtr<DataNode>,
    /// Height of the tallest index tower pointing here, across enclaves.
    level: AtomicU32,
}

impl DataNode {
    /// The node's key. Immutable after creation.
    #[must_use]
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Current presence state.
    #[must_use]
    #[inline]
    pub fn value(&self) -> ValueState {
        self.val.load()
    }

    /// The value word, for CAS transitions.
    #[inline]
    pub(crate) fn val_word(&self) -> &ValueWord {
        &self.val
    }

    /// Successor in the chain.
    #[must_use]
    #[inline]
    pub(crate) fn next(&self) -> *mut DataNode {
        self.next.load(READ_ORD)
    }

    /// Splice CAS on the successor link.
    #[inline]
    pub(crate) fn cas_next(&self, current: *mut DataNode, new: *mut DataNode) -> bool {
        self.next
            .compare_exchange(current, new, CAS_OK, CAS_FAIL)
            .is_ok()
    }

    /// Advisory predecessor.
    #[must_use]
    #[inline]
    pub(crate) fn prev(&self) -> *mut DataNode {
        self.prev.load(READ_ORD)
    }

    /// Best-effort predecessor repair after a splice.
    #[inline]
    pub(crate) fn set_prev(&self, prev: *mut DataNode) {
        self.prev.store(prev, WRITE_ORD);
    }

    /// Current index height hint.
    #[must_use]
    #[inline]
    pub(crate) fn level(&self) -> u32 {
        self.level.load(RELAXED)
    }

    /// Raise the height hint, keeping it monotone under races.
    #[inline]
    pub(crate) fn raise_level(&self, level: u32) {
        self.level.fetch_max(level, RELAXED);
    }

    /// Lower the height hint by one, saturating at zero.
    #[inline]
    pub(crate) fn lower_level(&self) {
        let cur = self.level.load(RELAXED);
        if cur > 0 {
            self.level.store(cur - 1, RELAXED);
        }
    }
}

/// Create a data node in `arena`, linked between `prev` and `next`.
pub(crate) fn node_new(
    arena: &Arena,
    key: u64,
    value: u64,
    prev: *mut DataNode,
    next: *mut DataNode,
) -> *mut DataNode {
    let node = arena.alloc(std::mem::size_of::<DataNode>()).cast::<DataNode>();
    // SAFETY: alloc returned a properly aligned, exclusively owned region
    // large enough for a DataNode.
    unsafe {
        node.write(DataNode {
            key,
            val: ValueWord::new(ValueState::Live(value)),
            next: AtomicPtr::new(next),
            prev: AtomicPtr::new(prev),
            level: AtomicU32::new(0),
        });
    }
    node
}

/// Create a removal marker in `arena`: key 0, permanently in marker state.
pub(crate) fn marker_new(
    arena: &Arena,
    prev: *mut DataNode,
    next: *mut DataNode,
) -> *mut DataNode {
    let node = arena.alloc(std::mem::size_of::<DataNode>()).cast::<DataNode>();
    // SAFETY: as in node_new.
    unsafe {
        node.write(DataNode {
            key: SENTINEL_KEY,
            val: ValueWord::new(ValueState::Marker),
            next: AtomicPtr::new(next),
            prev: AtomicPtr::new(prev),
            level: AtomicU32::new(0),
        });
    }
    node
}

/// Create the left-most chain sentinel on the heap.
///
/// The sentinel anchors every traversal, is never live, and outlives all
/// arenas. Release it with [`head_free`] after every enclave is gone.
#[must_use]
pub(crate) fn head_new() -> *mut DataNode {
    Box::into_raw(Box::new(DataNode {
        key: SENTINEL_KEY,
        val: ValueWord::new(ValueState::Deleted),
        next: AtomicPtr::new(ptr::null_mut()),
        prev: AtomicPtr::new(ptr::null_mut()),
        level: AtomicU32::new(1),
    }))
}

/// Free a sentinel created by [`head_new`].
///
/// # Safety
///
/// `head` must come from [`head_new`] and no thread may touch the chain
/// afterwards.
pub(crate) unsafe fn head_free(head: *mut DataNode) {
    // SAFETY: per contract, head came from Box::into_raw in head_new.
    unsafe { drop(Box::from_raw(head)) };
}

// ============================================================================
//  Whole-chain helpers
// ============================================================================

/// Count nodes reachable from `head`.
///
/// With `live_only`, counts nodes whose value is live (the map size).
/// Otherwise counts every non-marker node still linked, including
/// logically deleted ones.
///
/// # Safety
///
/// `head` must point at a valid chain sentinel and the chain must not be
/// mutated concurrently in ways that unlink the node being visited.
pub unsafe fn data_layer_size(head: *const DataNode, live_only: bool) -> u64 {
    let mut size = 0;
    // SAFETY: head is valid per contract; successors stay allocated for the
    // lifetime of their arenas.
    let mut node = unsafe { (*head).next() };
    while !node.is_null() {
        // SAFETY: nodes are never unmapped while the chain exists.
        let n = unsafe { &*node };
        if live_only {
            if n.value().is_live() {
                size += 1;
            }
        } else if n.key() != SENTINEL_KEY {
            size += 1;
        }
        node = n.next();
    }
    size
}

/// Reset every node's height hint to zero.
///
/// Runs between population and the timed window, while no helper owns an
/// index over the chain.
///
/// # Safety
///
/// Same contract as [`data_layer_size`], plus no helper may be raising
/// levels concurrently.
pub(crate) unsafe fn reset_levels(head: *const DataNode) {
    // SAFETY: see data_layer_size.
    let mut node = unsafe { (*head).next() };
    while !node.is_null() {
        // SAFETY: nodes stay allocated while the chain exists.
        let n = unsafe { &*node };
        n.level.store(0, RELAXED);
        node = n.next();
    }
}

/// Verify the chain is sorted with unique keys, skipping markers.
///
/// Returns `Err` with a description of the first violation. Used by the
/// test harness after concurrent runs.
///
/// # Safety
///
/// Same contract as [`data_layer_size`].
pub unsafe fn check_chain(head: *const DataNode) -> Result<(), String> {
    let mut last_key = 0u64;
    // SAFETY: see data_layer_size.
    let mut node = unsafe { (*head).next() };
    while !node.is_null() {
        // SAFETY: nodes stay allocated while the chain exists.
        let n = unsafe { &*node };
        if n.key() != SENTINEL_KEY {
            if n.key() <= last_key {
                return Err(format!(
                    "chain order violated: {} follows {}",
                    n.key(),
                    last_key
                ));
            }
            last_key = n.key();
        } else if !n.value().is_marker() {
            return Err("key 0 node that is not a marker".into());
        }
        node = n.next();
    }
    Ok(())
}

// ============================================================================
//  Tests
// ============================================================================
