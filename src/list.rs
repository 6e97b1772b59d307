//! Lock-free operations over the shared data layer.
//!
//! The data layer is one sorted chain shared by every enclave. Operations
//! arrive with an entry point obtained from the caller's private index and
//! walk forward from there. All mutation is single-word CAS:
//!
//! - membership changes CAS the node's value word
//!   (`Live -> Deleted` for delete, `Deleted -> Live` for undelete)
//! - structure changes CAS a `next` link (splicing a new node, splicing a
//!   removal marker, unlinking a marked node together with its marker)
//!
//! A node whose value word reads `Marker` is mid-removal. Standing on one
//! means backing out through `prev` and rescanning forward; seeing one as a
//! successor means helping finish the unlink. The `prev` link is only a
//! hint, so the rescan is unconditional.
//!
//! Operations resolve to the compact outcome contract used throughout:
//! retry is internal, callers see done or miss.

use crate::alloc::Arena;
use crate::node::{marker_new, node_new, DataNode, ValueState, SENTINEL_KEY};

/// Operation selector for [`data_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// Membership test.
    Contains,
    /// Insert, or undelete a logically deleted node with the same key.
    Insert,
    /// Logical delete.
    Delete,
}

/// Resolved result of one data-layer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The operation took effect. For inserts this carries the spliced or
    /// undeleted node; for lookups the node found; for deletes it is null.
    Done(*mut DataNode),
    /// Key absent (lookup or delete), or already present (insert).
    Miss,
}

impl Outcome {
    /// Whether the operation took effect.
    #[must_use]
    pub(crate) fn is_done(self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Unresolved step outcome inside the traversal loop.
enum Step {
    Retry,
    Miss,
    Done(*mut DataNode),
}

// ============================================================================
//  Operation driver
// ============================================================================

/// Execute `kind` for `key` starting from `entry`, retrying locally until
/// the operation resolves. Returns the outcome and the number of chain hops
/// taken.
///
/// # Safety
///
/// `entry` must be a reachable chain node with key at most `key` (the chain
/// sentinel always qualifies). `arena` must be the calling thread's data
/// arena. Nodes stay allocated for the lifetime of the enclaves, so stale
/// pointers reached through `prev` hints remain readable.
pub(crate) unsafe fn data_operation(
    arena: &Arena,
    entry: *mut DataNode,
    kind: OpKind,
    key: u64,
    value: u64,
) -> (Outcome, u64) {
    debug_assert!(key != SENTINEL_KEY);
    let mut node = entry;
    let mut hops = 0u64;

    // SAFETY: entry is valid per contract and every pointer followed below
    // stays allocated; see the module docs for the marker protocol.
    unsafe {
        loop {
            // Back out of nodes that turned into removal targets under us.
            let mut node_val = (*node).value();
            while node_val.is_marker() {
                node = (*node).prev();
                node_val = (*node).value();
                hops += 1;
            }
            #[cfg(feature = "addr-stats")]
            crate::topology::addrcheck::record(node as *const u8);

            let next = (*node).next();
            if !next.is_null() && (*next).value().is_marker() {
                unlink_marked(arena, node, next);
                continue;
            }

            if next.is_null() || (*next).key() > key {
                let step = match kind {
                    OpKind::Contains => finish_contains(node, node_val, key),
                    OpKind::Delete => finish_delete(node, node_val, key),
                    OpKind::Insert => finish_insert(arena, node, node_val, next, key, value),
                };
                match step {
                    Step::Retry => continue,
                    Step::Miss => return (Outcome::Miss, hops),
                    Step::Done(n) => return (Outcome::Done(n), hops),
                }
            }
            node = next;
            hops += 1;
        }
    }
}

// ============================================================================
//  Finishers
// ============================================================================

/// Membership test at the stop position.
///
/// # Safety
///
/// `node` must be a readable chain node.
unsafe fn finish_contains(node: *mut DataNode, node_val: ValueState, key: u64) -> Step {
    // SAFETY: node is readable per contract.
    if unsafe { (*node).key() } == key && node_val.is_live() {
        Step::Done(node)
    } else {
        Step::Miss
    }
}

/// Logical delete at the stop position.
///
/// Loops the value CAS until this thread deletes the node, someone else
/// does, or the node starts being physically removed.
///
/// # Safety
///
/// `node` must be a readable chain node.
unsafe fn finish_delete(node: *mut DataNode, node_val: ValueState, key: u64) -> Step {
    // SAFETY: node is readable per contract.
    let n = unsafe { &*node };
    if n.key() != key || !node_val.is_live() {
        return Step::Miss;
    }
    loop {
        match n.value() {
            ValueState::Deleted | ValueState::Marker => return Step::Miss,
            live @ ValueState::Live(_) => {
                if n.val_word().cas(live, ValueState::Deleted) {
                    return Step::Done(std::ptr::null_mut());
                }
            }
        }
    }
}

/// Insert at the stop position: undelete an equal-keyed node, or splice a
/// fresh one between `node` and `next`. The losing side of the splice CAS
/// rolls its allocation back.
///
/// # Safety
///
/// `node` must be a readable chain node with key at most `key`; `next` is
/// its observed successor (possibly null). `arena` must be the calling
/// thread's data arena.
unsafe fn finish_insert(
    arena: &Arena,
    node: *mut DataNode,
    node_val: ValueState,
    next: *mut DataNode,
    key: u64,
    value: u64,
) -> Step {
    // SAFETY: node/next are readable per contract.
    unsafe {
        if (*node).key() == key {
            return match node_val {
                ValueState::Live(_) => Step::Miss,
                ValueState::Deleted => {
                    if (*node)
                        .val_word()
                        .cas(ValueState::Deleted, ValueState::Live(value))
                    {
                        Step::Done(node)
                    } else {
                        Step::Retry
                    }
                }
                // The node started being removed since we read its value.
                ValueState::Marker => Step::Retry,
            };
        }

        let new = node_new(arena, key, value, node, next);
        if (*node).cas_next(next, new) {
            debug_assert!((*node).next() != node);
            if !next.is_null() {
                // Advisory back link; readers rescan forward regardless.
                (*next).set_prev(new);
            }
            Step::Done(new)
        } else {
            arena.free_last(new.cast(), std::mem::size_of::<DataNode>());
            Step::Retry
        }
    }
}

// ============================================================================
//  Physical removal
// ============================================================================

/// Finish physically removing `node`, a marked successor of `prev`.
///
/// A marker (key 0, marker state) is spliced after `node` so concurrent
/// walkers can tell an unlink-in-progress from a plain gap, then
/// `prev.next` is CAS'd past both. Safe to call from any thread that
/// observes the marked node; every CAS tolerates losing.
///
/// # Safety
///
/// `prev` and `node` must be readable chain nodes; `arena` must be the
/// calling thread's data arena.
pub(crate) unsafe fn unlink_marked(arena: &Arena, prev: *mut DataNode, node: *mut DataNode) {
    // SAFETY: both nodes are readable per contract.
    unsafe {
        if !(*node).value().is_marker() || (*node).key() == SENTINEL_KEY {
            return;
        }

        // Pin the removal with a marker directly after the node.
        let mut ptr = (*node).next();
        while ptr.is_null() || (*ptr).key() != SENTINEL_KEY {
            let marker = marker_new(arena, node, ptr);
            if !(*node).cas_next(ptr, marker) {
                arena.free_last(marker.cast(), std::mem::size_of::<DataNode>());
            }
            debug_assert!((*node).next() != node);
            ptr = (*node).next();
        }

        // Unlink node and marker together. Bail if prev moved on, or if
        // prev is itself a marker (the chain sentinel shares key 0 but has
        // no predecessor).
        if (*prev).next() != node {
            return;
        }
        if (*prev).key() == SENTINEL_KEY && !(*prev).prev().is_null() {
            return;
        }
        let after = (*ptr).next();
        let _ = (*prev).cas_next(node, after);
        debug_assert!((*prev).next() != prev);
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{data_layer_size, head_free, head_new};

    fn setup() -> (Arena, *mut DataNode) {
        let arena = Arena::new(1 << 20, None, 0).expect("arena");
        (arena, head_new())
    }

    unsafe fn op(arena: &Arena, head: *mut DataNode, kind: OpKind, key: u64) -> Outcome {
        // SAFETY: forwarded from callers that own the chain.
        unsafe { data_operation(arena, head, kind, key, key).0 }
    }

    #[test]
    fn test_insert_then_contains() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 10).is_done());
            assert!(op(&arena, head, OpKind::Insert, 5).is_done());
            assert!(op(&arena, head, OpKind::Insert, 20).is_done());

            assert!(op(&arena, head, OpKind::Contains, 5).is_done());
            assert!(op(&arena, head, OpKind::Contains, 10).is_done());
            assert!(op(&arena, head, OpKind::Contains, 20).is_done());
            assert_eq!(op(&arena, head, OpKind::Contains, 15), Outcome::Miss);

            assert_eq!(data_layer_size(head, true), 3);
            assert!(crate::node::check_chain(head).is_ok());
            head_free(head);
        }
    }

    #[test]
    fn test_duplicate_insert_misses() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 7).is_done());
            assert_eq!(op(&arena, head, OpKind::Insert, 7), Outcome::Miss);
            assert_eq!(data_layer_size(head, true), 1);
            head_free(head);
        }
    }

    #[test]
    fn test_delete_then_contains_misses() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 3).is_done());
            assert!(op(&arena, head, OpKind::Delete, 3).is_done());
            assert_eq!(op(&arena, head, OpKind::Contains, 3), Outcome::Miss);
            // Logically deleted, still linked.
            assert_eq!(data_layer_size(head, true), 0);
            assert_eq!(data_layer_size(head, false), 1);
            head_free(head);
        }
    }

    #[test]
    fn test_delete_absent_misses() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert_eq!(op(&arena, head, OpKind::Delete, 99), Outcome::Miss);
            assert!(op(&arena, head, OpKind::Insert, 1).is_done());
            assert_eq!(op(&arena, head, OpKind::Delete, 2), Outcome::Miss);
            head_free(head);
        }
    }

    #[test]
    fn test_insert_undeletes() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 8).is_done());
            assert!(op(&arena, head, OpKind::Delete, 8).is_done());
            // Same node comes back, nothing new is spliced.
            let linked_before = data_layer_size(head, false);
            assert!(op(&arena, head, OpKind::Insert, 8).is_done());
            assert_eq!(data_layer_size(head, false), linked_before);
            assert!(op(&arena, head, OpKind::Contains, 8).is_done());
            head_free(head);
        }
    }

    #[test]
    fn test_marked_node_is_unlinked_by_traversal() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 4).is_done());
            assert!(op(&arena, head, OpKind::Insert, 6).is_done());
            assert!(op(&arena, head, OpKind::Delete, 4).is_done());

            // Make node 4 eligible the way a helper sweep does.
            let n4 = (*head).next();
            assert_eq!((*n4).key(), 4);
            assert!((*n4).val_word().cas(ValueState::Deleted, ValueState::Marker));

            // Any traversal past it finishes the removal.
            assert!(op(&arena, head, OpKind::Contains, 6).is_done());
            let first = (*head).next();
            assert_eq!((*first).key(), 6);
            assert_eq!(data_layer_size(head, false), 1);
            assert!(crate::node::check_chain(head).is_ok());
            head_free(head);
        }
    }

    #[test]
    fn test_insert_after_unlink_reinserts_key() {
        let (arena, head) = setup();
        // SAFETY: chain is private to this test.
        unsafe {
            assert!(op(&arena, head, OpKind::Insert, 12).is_done());
            assert!(op(&arena, head, OpKind::Delete, 12).is_done());
            let n = (*head).next();
            assert!((*n).val_word().cas(ValueState::Deleted, ValueState::Marker));

            assert!(op(&arena, head, OpKind::Insert, 12).is_done());
            assert!(op(&arena, head, OpKind::Contains, 12).is_done());
            assert_eq!(data_layer_size(head, true), 1);
            head_free(head);
        }
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        struct Shared(*mut DataNode);
        // SAFETY: the chain is lock-free and nodes outlive the test.
        unsafe impl Send for Shared {}
        unsafe impl Sync for Shared {}

        let head = head_new();
        let shared = std::sync::Arc::new(Shared(head));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let shared = std::sync::Arc::clone(&shared);
                std::thread::spawn(move || {
                    let arena = Arena::new(1 << 20, None, t as usize).expect("arena");
                    for i in 0..250u64 {
                        let key = t * 1000 + i + 1;
                        // SAFETY: head stays valid; arenas leak until the
                        // end of the test.
                        let done =
                            unsafe { op(&arena, shared.0, OpKind::Insert, key).is_done() };
                        assert!(done, "disjoint insert failed for {key}");
                    }
                    // Arena must outlive the chain walk below.
                    std::mem::forget(arena);
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker");
        }

        // SAFETY: all writers joined.
        unsafe {
            assert_eq!(data_layer_size(head, true), 1000);
            assert!(crate::node::check_chain(head).is_ok());
        }
    }

    #[test]
    fn test_concurrent_same_key_insert_single_winner() {
        struct Shared(*mut DataNode);
        // SAFETY: as above.
        unsafe impl Send for Shared {}
        unsafe impl Sync for Shared {}

        for _ in 0..20 {
            let head = head_new();
            let shared = std::sync::Arc::new(Shared(head));
            let wins = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let shared = std::sync::Arc::clone(&shared);
                    let wins = std::sync::Arc::clone(&wins);
                    std::thread::spawn(move || {
                        let arena = Arena::new(1 << 16, None, t as usize).expect("arena");
                        // SAFETY: head stays valid for the test.
                        let done =
                            unsafe { op(&arena, shared.0, OpKind::Insert, 42).is_done() };
                        if done {
                            wins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        std::mem::forget(arena);
                    })
                })
                .collect();
            for h in handles {
                h.join().expect("worker");
            }

            assert_eq!(wins.load(std::sync::atomic::Ordering::Relaxed), 1);
            // SAFETY: all writers joined.
            unsafe { assert_eq!(data_layer_size(head, true), 1) };
        }
    }
}
