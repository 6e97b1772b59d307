//! Helper-thread execution: intermediate-layer updates and index
//! maintenance.
//!
//! The helper drains its enclave's op ring into the intermediate entry
//! chain, then periodically runs a maintenance pass:
//!
//! 1. sweep the chain, unlinking marked level-0 entries and flagging their
//!    data nodes for physical removal
//! 2. raise entries into the bottom index row by the deterministic rule:
//!    of three consecutive unraised, unmarked entries the middle one gets a
//!    tower
//! 3. apply the same rule row by row upwards, detaching deleted towers on
//!    the way
//! 4. grow the sentinel tower when the top row gained nodes, at most one
//!    level per pass
//! 5. drop the bottom index row when deleted towers outnumber live entries
//!    ten to one
//!
//! The helper is the only writer of the entry chain and the tower. The
//! application thread reads both, so every link that becomes reachable is
//! published with a release store.

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::channel::OpRecord;
use crate::enclave::Enclave;
use crate::index::{descend_to_entry, entry_new, inode_new, IndexNode, MAX_LEVELS};
use crate::node::ValueState;
use crate::topology::pin_to_cpu;
use crate::tracing_helpers::{debug_log, trace_log};

/// Longest uninterrupted sleep; keeps shutdown latency bounded while the
/// pacing knob can be arbitrarily large.
const SLEEP_CHUNK_US: u64 = 10_000;

/// The helper thread body. Runs until the enclave is told to finish.
pub(crate) fn helper_loop(enclave: &Arc<Enclave>, seed: u64) {
    pin_to_cpu(enclave.core().hlp_cpu);
    #[cfg(feature = "addr-stats")]
    crate::topology::addrcheck::set_socket(enclave.core().socket);

    let mut rng = SmallRng::seed_from_u64(seed);
    let update_all = enclave.sleep_time_us() == 0;

    loop {
        if enclave.is_finished() {
            break;
        }
        pace(enclave);
        if enclave.is_finished() {
            break;
        }

        if enclave.take_reset_request() {
            reset_index(enclave);
        }

        while let Some(record) = enclave.drain_one() {
            apply_op(enclave, &record);
        }

        if update_all || rng.random_range(0..100u32) < enclave.update_freq() {
            maintain_index(enclave);
        }
    }

    trace_log!(enclave = enclave.id(), "helper thread stopping");

    #[cfg(feature = "addr-stats")]
    {
        let (local, foreign) = crate::topology::addrcheck::take();
        enclave
            .hlp_local
            .fetch_add(local, std::sync::atomic::Ordering::Relaxed);
        enclave
            .hlp_foreign
            .fetch_add(foreign, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Sleep the configured pacing time in bounded chunks.
fn pace(enclave: &Enclave) {
    let mut remaining = enclave.sleep_time_us();
    while remaining > 0 && !enclave.is_finished() {
        let chunk = remaining.min(SLEEP_CHUNK_US);
        std::thread::sleep(Duration::from_micros(chunk));
        remaining -= chunk;
    }
}

// ============================================================================
//  Intermediate layer
// ============================================================================

/// Publish one drained record into the entry chain.
///
/// Inserts add an entry (or unmark an existing one); deletes mark the
/// matching entry. Records for keys this enclave never inserted fall
/// through silently: the shared chain already carries the truth.
pub(crate) fn apply_op(enclave: &Enclave, record: &OpRecord) {
    // SAFETY: entries and the tower live in this enclave's index arena;
    // this thread is their only writer.
    unsafe {
        let mut entry = descend_to_entry(enclave.sentinel(), record.key);
        loop {
            let next = (*entry).next();
            if next.is_null() || (*next).key() > record.key {
                if record.is_delete() {
                    if (*entry).key() == record.key {
                        (*entry).set_marked(true);
                    }
                } else if (*entry).key() == record.key {
                    if (*entry).is_marked() {
                        (*entry).set_marked(false);
                    }
                } else {
                    let fresh = entry_new(enclave.index_arena(), record.key, record.node, next);
                    (*entry).set_next(fresh);
                }
                break;
            }
            entry = next;
        }
    }
}

/// Walk the entry chain: unlink marked level-0 entries, flag their data
/// nodes for physical removal, and count what remains.
pub(crate) fn sweep_entries(enclave: &Enclave) {
    let mut non_del = 0u64;
    let mut tall_del = 0u64;
    // SAFETY: single-writer entry chain, nodes outlive the enclave.
    unsafe {
        let mut prev = enclave.head_entry();
        let mut entry = (*prev).next();
        while !entry.is_null() {
            #[cfg(feature = "addr-stats")]
            crate::topology::addrcheck::record(entry as *const u8);
            if (*entry).level() == 0 && (*entry).is_marked() {
                (*prev).set_next((*entry).next());
                // Hand the node over to physical removal unless it was
                // resurrected in the meantime.
                let node = (*entry).node();
                let _ = (*node)
                    .val_word()
                    .cas(ValueState::Deleted, ValueState::Marker);
                entry = (*prev).next();
            } else {
                if !(*entry).is_marked() {
                    non_del += 1;
                } else if (*entry).level() >= 1 {
                    tall_del += 1;
                }
                prev = entry;
                entry = (*entry).next();
            }
        }
    }
    enclave.set_sweep_counts(non_del, tall_del);
}

// ============================================================================
//  Raising and lowering
// ============================================================================

/// Raise level-0 entries into the bottom index row. Returns whether any
/// tower was created.
fn raise_entries(enclave: &Enclave, bottom_left: *mut IndexNode) -> bool {
    let arena = enclave.index_arena();
    let mut raised = false;
    // SAFETY: single-writer chain and rows; new inodes are published with
    // release stores after their fields are written.
    unsafe {
        let mut ins = bottom_left;
        let mut prev = enclave.head_entry();
        let mut entry = (*prev).next();
        if entry.is_null() {
            return false;
        }
        let mut next = (*entry).next();
        while !next.is_null() {
            if (*prev).level() == 0
                && (*entry).level() == 0
                && (*next).level() == 0
                && !(*prev).is_marked()
                && !(*entry).is_marked()
                && !(*next).is_marked()
            {
                raised = true;

                // Find the insertion point in the bottom row.
                loop {
                    let right = (*ins).right();
                    if right.is_null() || (*right).key() >= (*entry).key() {
                        break;
                    }
                    ins = right;
                }

                let fresh = inode_new(arena, (*ins).right(), ptr::null_mut(), entry);
                (*ins).set_right(fresh);
                (*entry).set_level(1);
                (*(*entry).node()).raise_level(1);
                ins = fresh;
            }
            prev = entry;
            entry = next;
            next = (*next).next();
        }
    }
    raised
}

/// Raise index nodes of `row` (at `height`) into `row_above`, detaching
/// towers whose entries are marked. Returns whether any node was raised.
fn raise_level(
    enclave: &Enclave,
    row: *mut IndexNode,
    row_above: *mut IndexNode,
    height: u32,
) -> bool {
    let arena = enclave.index_arena();
    let mut raised = false;
    // SAFETY: single-writer rows, arena-backed storage.
    unsafe {
        let mut ins = row_above;
        let mut iprev = row;
        let mut index = (*iprev).right();
        loop {
            if index.is_null() {
                break;
            }
            let mut inext = (*index).right();
            if inext.is_null() {
                break;
            }

            // Detach deleted towers from this row as they are found.
            while (*(*index).entry()).is_marked() {
                (*iprev).set_right(inext);
                if inext.is_null() {
                    break;
                }
                index = inext;
                inext = (*index).right();
            }
            if inext.is_null() {
                break;
            }

            if (*(*iprev).entry()).level() <= height
                && (*(*index).entry()).level() <= height
                && (*(*inext).entry()).level() <= height
            {
                raised = true;

                loop {
                    let right = (*ins).right();
                    if right.is_null() || (*right).key() >= (*index).key() {
                        break;
                    }
                    ins = right;
                }

                let fresh = inode_new(arena, (*ins).right(), index, (*index).entry());
                (*ins).set_right(fresh);
                (*(*index).entry()).set_level(height + 1);
                (*(*(*index).entry()).node()).raise_level(height + 1);
                ins = fresh;
            }

            iprev = index;
            index = inext;
        }
    }
    raised
}

/// Push a fresh sentinel above the current tower top. Bounded by
/// [`MAX_LEVELS`].
fn grow_sentinel(enclave: &Enclave) -> *mut IndexNode {
    let head = enclave.head_entry();
    // SAFETY: head entry and sentinel live in this enclave's arena.
    unsafe {
        if (*head).level() as usize >= MAX_LEVELS - 1 {
            return enclave.sentinel();
        }
        let fresh = inode_new(
            enclave.index_arena(),
            ptr::null_mut(),
            enclave.sentinel(),
            head,
        );
        (*head).set_level((*head).level() + 1);
        enclave.set_sentinel(fresh)
    }
}

/// Detach the bottom index row. `second_lowest` becomes the new bottom;
/// every tower standing on it shrinks by one level.
fn lower_index(second_lowest: *mut IndexNode) {
    // SAFETY: single-writer rows; detached inodes stay allocated so stale
    // readers finish their descent.
    unsafe {
        let mut inode = second_lowest;
        while !inode.is_null() {
            (*inode).clear_down();
            let entry = (*inode).entry();
            let level = (*entry).level();
            if level > 0 {
                (*entry).set_level(level - 1);
            }
            (*(*entry).node()).lower_level();
            inode = (*inode).right();
        }
    }
}

// ============================================================================
//  Maintenance pass
// ============================================================================

/// One full maintenance pass: sweep, raise, grow, lower.
///
/// The sentinel tower changes height by at most one in either direction
/// per pass.
pub(crate) fn maintain_index(enclave: &Enclave) {
    sweep_entries(enclave);

    // SAFETY: the tower belongs to this enclave; this thread is its only
    // writer.
    unsafe {
        let head = enclave.head_entry();
        let height = (*head).level() as usize;
        debug_assert!(height >= 1 && height < MAX_LEVELS);

        // Left-most index node of each row, bottom row first.
        let mut rows: Vec<*mut IndexNode> = vec![ptr::null_mut(); height];
        let mut inode = enclave.sentinel();
        for i in (0..height).rev() {
            rows[i] = inode;
            inode = (*inode).down();
        }
        debug_assert!(inode.is_null());

        // Raise bottom-up. Each row raise overwrites `raised`, so after the
        // loop it reflects the top row: gaining nodes there is what calls
        // for a new sentinel level.
        let mut raised = raise_entries(enclave, rows[0]);
        for i in 0..height - 1 {
            raised = raise_level(enclave, rows[i], rows[i + 1], (i + 1) as u32);
        }

        let mut grew = false;
        if raised {
            grow_sentinel(enclave);
            grew = true;
            debug_log!(
                enclave = enclave.id(),
                height = height + 1,
                "sentinel grew"
            );
        }

        let (non_del, tall_del) = enclave.sweep_counts();
        if !grew && tall_del > non_del * 10 && height >= 2 {
            lower_index(rows[1]);
            debug_log!(enclave = enclave.id(), height = height - 1, "sentinel lowered");
        }
    }
}

/// Discard the tower and start over from the entry chain: every entry
/// drops to level 0 and a fresh single-level sentinel is published.
pub(crate) fn reset_index(enclave: &Enclave) {
    // SAFETY: single-writer chain and tower.
    unsafe {
        let head = enclave.head_entry();
        let mut entry = (*head).next();
        while !entry.is_null() {
            (*entry).set_level(0);
            entry = (*entry).next();
        }
        (*head).set_level(1);
        let fresh = inode_new(
            enclave.index_arena(),
            ptr::null_mut(),
            ptr::null_mut(),
            head,
        );
        enclave.set_sentinel(fresh);
    }
    debug_log!(enclave = enclave.id(), "index reset");
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::{data_operation, OpKind, Outcome};
    use crate::node::{head_new, DataNode};
    use crate::topology::CorePair;

    fn core() -> CorePair {
        CorePair {
            socket: 0,
            core: 0,
            app_cpu: 0,
            hlp_cpu: 0,
        }
    }

    fn enclave_over(head: *mut DataNode) -> Arc<Enclave> {
        Enclave::new(0, core(), head, 1 << 20, 1 << 20, 100, false).expect("enclave")
    }

    /// Insert keys through the data layer and publish them into the
    /// intermediate chain the way a drained ring would.
    fn track_inserts(enclave: &Enclave, head: *mut DataNode, keys: impl Iterator<Item = u64>) {
        for key in keys {
            // SAFETY: head and arenas belong to this test.
            let (outcome, _) = unsafe {
                data_operation(enclave.data_arena(), head, OpKind::Insert, key, key)
            };
            let Outcome::Done(node) = outcome else {
                panic!("insert of {key} did not take effect");
            };
            apply_op(enclave, &OpRecord { key, node });
        }
    }

    fn entry_keys(enclave: &Enclave) -> Vec<u64> {
        let mut keys = Vec::new();
        // SAFETY: chain is quiescent in tests.
        unsafe {
            let mut e = (*enclave.head_entry()).next();
            while !e.is_null() {
                keys.push((*e).key());
                e = (*e).next();
            }
        }
        keys
    }

    #[test]
    fn test_apply_op_keeps_entries_sorted_and_deduped() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, [5, 1, 9, 3, 7].into_iter());
        assert_eq!(entry_keys(&enclave), vec![1, 3, 5, 7, 9]);

        // A second record for a known key must not duplicate the entry.
        apply_op(
            &enclave,
            &OpRecord {
                key: 5,
                node: ptr::null_mut(),
            },
        );
        assert_eq!(entry_keys(&enclave), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_delete_record_marks_then_insert_unmarks() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, [4].into_iter());

        apply_op(
            &enclave,
            &OpRecord {
                key: 4,
                node: ptr::null_mut(),
            },
        );
        // SAFETY: quiescent chain.
        unsafe {
            let e = (*enclave.head_entry()).next();
            assert!((*e).is_marked());
            let node = (*e).node();
            apply_op(&enclave, &OpRecord { key: 4, node });
            assert!(!(*e).is_marked());
        }
    }

    #[test]
    fn test_sweep_unlinks_marked_and_flags_node() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, [2, 4, 6].into_iter());

        // Delete key 4 in the data layer, then tell the helper.
        // SAFETY: quiescent chain.
        unsafe {
            let (outcome, _) =
                data_operation(enclave.data_arena(), head, OpKind::Delete, 4, 4);
            assert!(outcome.is_done());
        }
        apply_op(
            &enclave,
            &OpRecord {
                key: 4,
                node: ptr::null_mut(),
            },
        );

        sweep_entries(&enclave);
        assert_eq!(entry_keys(&enclave), vec![2, 6]);
        assert_eq!(enclave.sweep_counts(), (2, 0));

        // The backing node is now flagged for physical removal.
        // SAFETY: quiescent chain.
        unsafe {
            let mut n = (*head).next();
            while !n.is_null() && (*n).key() != 4 {
                n = (*n).next();
            }
            assert!(!n.is_null());
            assert!((*n).value().is_marker());
        }
    }

    #[test]
    fn test_maintenance_grows_index_one_level_per_pass() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, 1..=64);

        assert_eq!(enclave.index_height(), 1);
        maintain_index(&enclave);
        assert_eq!(enclave.index_height(), 2);

        let mut last = enclave.index_height();
        for _ in 0..10 {
            maintain_index(&enclave);
            let now = enclave.index_height();
            assert!(now >= last && now - last <= 1, "height jumped {last} -> {now}");
            last = now;
        }
        assert!(last >= 4, "index never reached useful height: {last}");
    }

    #[test]
    fn test_descend_uses_towers() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, 1..=128);
        for _ in 0..10 {
            maintain_index(&enclave);
        }

        // SAFETY: quiescent index.
        let (node, hops) = unsafe { crate::index::descend(enclave.sentinel(), 100) };
        // SAFETY: node is a live chain node.
        unsafe {
            assert!((*node).key() <= 100);
            assert!((*node).key() > 0 || (*node).prev().is_null());
        }
        // A populated tower must beat a linear scan of 100 entries.
        assert!(hops < 64, "descent took {hops} hops");
    }

    #[test]
    fn test_reset_rebuilds_from_entries() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, 1..=32);
        for _ in 0..6 {
            maintain_index(&enclave);
        }
        assert!(enclave.index_height() > 1);

        reset_index(&enclave);
        assert_eq!(enclave.index_height(), 1);
        assert_eq!(entry_keys(&enclave).len(), 32);

        for _ in 0..6 {
            maintain_index(&enclave);
        }
        assert!(enclave.index_height() > 1, "index did not regrow after reset");
    }

    #[test]
    fn test_tall_deleted_towers_trigger_lowering() {
        let head = head_new();
        let enclave = enclave_over(head);
        track_inserts(&enclave, head, 1..=60);
        for _ in 0..6 {
            maintain_index(&enclave);
        }
        let grown = enclave.index_height();
        assert!(grown >= 2);

        // Delete everything but one key, in the data layer and the chain.
        for key in 2..=60 {
            // SAFETY: quiescent chain.
            unsafe {
                let (outcome, _) =
                    data_operation(enclave.data_arena(), head, OpKind::Delete, key, key);
                assert!(outcome.is_done());
            }
            apply_op(
                &enclave,
                &OpRecord {
                    key,
                    node: ptr::null_mut(),
                },
            );
        }

        maintain_index(&enclave);
        assert_eq!(
            enclave.index_height(),
            grown - 1,
            "dominating deleted towers must lower the index"
        );
    }
}
