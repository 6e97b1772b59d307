//! Per-enclave index layer: intermediate entries and index nodes.
//!
//! Each enclave keeps a private model of the keys it has observed: a sorted
//! chain of [`Entry`] records (the intermediate layer) with a skip-list
//! tower of [`IndexNode`]s above it. The helper thread is the only writer
//! of both; the application thread reads them to find a data-layer entry
//! point, so the links it follows are published with release stores.
//!
//! Index height is bounded by [`MAX_LEVELS`]. Levels are raised by the
//! deterministic one-in-three rule and lowered when deleted towers dominate;
//! both live in the helper module.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32};

use crate::alloc::Arena;
use crate::node::DataNode;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Hard bound on index height.
pub const MAX_LEVELS: usize = 128;

// ============================================================================
//  Entry (intermediate layer)
// ============================================================================

/// One record of an enclave's intermediate layer.
///
/// `level` is the height of this entry's tower in the owning enclave's
/// index. `marked` means the enclave observed a delete for the key; marked
/// level-0 entries are removed on the next sweep.
#[repr(C)]
pub struct Entry {
    key: u64,
    node: *mut DataNode,
    next: AtomicPtr<Entry>,
    level: AtomicU32,
    marked: AtomicBool,
}

// SAFETY: entries are allocated in an arena that outlives all readers.
// Mutable fields are atomics; `key` and `node` are written once before the
// entry is published.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

impl Entry {
    /// The tracked key.
    #[must_use]
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The backing data-layer node.
    #[must_use]
    #[inline]
    pub fn node(&self) -> *mut DataNode {
        self.node
    }

    /// Successor in the intermediate chain.
    #[must_use]
    #[inline]
    pub(crate) fn next(&self) -> *mut Entry {
        self.next.load(READ_ORD)
    }

    /// Publish a new successor.
    #[inline]
    pub(crate) fn set_next(&self, next: *mut Entry) {
        self.next.store(next, WRITE_ORD);
    }

    /// Tower height of this entry.
    #[must_use]
    #[inline]
    pub(crate) fn level(&self) -> u32 {
        self.level.load(RELAXED)
    }

    /// Set the tower height.
    #[inline]
    pub(crate) fn set_level(&self, level: u32) {
        self.level.store(level, RELAXED);
    }

    /// Whether a delete was observed for this key.
    #[must_use]
    #[inline]
    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(RELAXED)
    }

    /// Record or clear an observed delete.
    #[inline]
    pub(crate) fn set_marked(&self, marked: bool) {
        self.marked.store(marked, RELAXED);
    }
}

/// Create an intermediate entry in `arena`.
pub(crate) fn entry_new(
    arena: &Arena,
    key: u64,
    node: *mut DataNode,
    next: *mut Entry,
) -> *mut Entry {
    let entry = arena.alloc(std::mem::size_of::<Entry>()).cast::<Entry>();
    // SAFETY: alloc returned an aligned, exclusively owned region of
    // sufficient size.
    unsafe {
        entry.write(Entry {
            key,
            node,
            next: AtomicPtr::new(next),
            level: AtomicU32::new(0),
            marked: AtomicBool::new(false),
        });
    }
    entry
}

/// Create an enclave's left-most entry: key 0, height 1, anchored on the
/// chain sentinel. Never marked.
pub(crate) fn head_entry_new(arena: &Arena, head: *mut DataNode) -> *mut Entry {
    let entry = entry_new(arena, crate::node::SENTINEL_KEY, head, ptr::null_mut());
    // SAFETY: just created, not yet shared.
    unsafe { (*entry).set_level(1) };
    entry
}

// ============================================================================
//  IndexNode
// ============================================================================

/// One node of an enclave's index tower.
#[repr(C)]
pub struct IndexNode {
    key: u64,
    entry: *mut Entry,
    right: AtomicPtr<IndexNode>,
    down: AtomicPtr<IndexNode>,
}

// SAFETY: same reasoning as Entry; `key` and `entry` are written once
// before publication, links are atomics.
unsafe impl Send for IndexNode {}
unsafe impl Sync for IndexNode {}

impl IndexNode {
    /// Cached key of the referenced entry.
    #[must_use]
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The intermediate entry this index node stands on.
    #[must_use]
    #[inline]
    pub(crate) fn entry(&self) -> *mut Entry {
        self.entry
    }

    /// Right neighbour on the same level.
    #[must_use]
    #[inline]
    pub(crate) fn right(&self) -> *mut IndexNode {
        self.right.load(READ_ORD)
    }

    /// Publish a new right neighbour.
    #[inline]
    pub(crate) fn set_right(&self, right: *mut IndexNode) {
        self.right.store(right, WRITE_ORD);
    }

    /// Neighbour one level below, null on the bottom level.
    #[must_use]
    #[inline]
    pub(crate) fn down(&self) -> *mut IndexNode {
        self.down.load(READ_ORD)
    }

    /// Detach the level below (used when lowering).
    #[inline]
    pub(crate) fn clear_down(&self) {
        self.down.store(ptr::null_mut(), WRITE_ORD);
    }
}

/// Create an index node in `arena` above `entry`.
pub(crate) fn inode_new(
    arena: &Arena,
    right: *mut IndexNode,
    down: *mut IndexNode,
    entry: *mut Entry,
) -> *mut IndexNode {
    // SAFETY: entry is valid for the lifetime of the arena it came from.
    let key = unsafe { (*entry).key() };
    let inode = arena.alloc(std::mem::size_of::<IndexNode>()).cast::<IndexNode>();
    // SAFETY: alloc returned an aligned, exclusively owned region of
    // sufficient size.
    unsafe {
        inode.write(IndexNode {
            key,
            entry,
            right: AtomicPtr::new(right),
            down: AtomicPtr::new(down),
        });
    }
    inode
}

// ============================================================================
//  Traversal
// ============================================================================

/// Walk the index from `sentinel` and return a data-layer entry point with
/// key at most `key`, plus the number of hops taken.
///
/// # Safety
///
/// `sentinel` must be a published index sentinel of a live enclave. Nodes
/// reached from it stay allocated until that enclave's arena is unmapped.
pub(crate) unsafe fn descend(sentinel: *mut IndexNode, key: u64) -> (*mut DataNode, u64) {
    // SAFETY: callers pass a valid sentinel; every link followed was
    // published by the helper with release stores.
    unsafe {
        let mut hops = 0;
        let mut item = sentinel;
        loop {
            hops += 1;
            #[cfg(feature = "addr-stats")]
            crate::topology::addrcheck::record(item as *const u8);
            let next = (*item).right();
            if next.is_null() || (*next).key() > key {
                let down = (*item).down();
                if down.is_null() {
                    break;
                }
                item = down;
            } else if (*next).key() == key {
                break;
            } else {
                item = next;
            }
        }
        ((*(*item).entry()).node(), hops)
    }
}

/// Walk the index from `sentinel` and return the bottom-level entry with
/// key at most `key`. Helper-side twin of [`descend`].
///
/// # Safety
///
/// Same contract as [`descend`].
pub(crate) unsafe fn descend_to_entry(sentinel: *mut IndexNode, key: u64) -> *mut Entry {
    let mut item = sentinel;
    // SAFETY: see descend.
    unsafe {
        loop {
            #[cfg(feature = "addr-stats")]
            crate::topology::addrcheck::record(item as *const u8);
            let next = (*item).right();
            if next.is_null() || (*next).key() > key {
                let down = (*item).down();
                if down.is_null() {
                    return (*item).entry();
                }
                item = down;
            } else if (*next).key() == key {
                return (*item).entry();
            } else {
                item = next;
            }
        }
    }
}
