//! The per-enclave op channel.
//!
//! A fixed-capacity single-producer single-consumer ring carrying
//! `(key, node)` records from an enclave's application thread to its helper.
//! A null node pointer means the operation was a delete; otherwise it is the
//! data-layer node a successful insert produced.
//!
//! The ring is empty when `head == tail` and full when
//! `(head + 1) % capacity == tail`, with `head` owned by the producer and
//! `tail` by the consumer. Each side advances its own cursor with a single
//! release store after touching the slot, so the consumer observes records
//! in exactly the order the producer published them.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicUsize;

use crate::node::DataNode;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Default ring capacity, one less than this many records can be in flight.
pub const DEFAULT_CAPACITY: usize = 2500;

/// One update record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    /// The key the operation touched.
    pub key: u64,
    /// The inserted node, or null for a delete.
    pub node: *mut DataNode,
}

impl OpRecord {
    /// Whether this record describes a delete.
    #[must_use]
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.node.is_null()
    }
}

/// Bounded SPSC ring of [`OpRecord`]s.
pub struct OpRing {
    slots: Box<[UnsafeCell<OpRecord>]>,
    /// Producer cursor: next slot to write.
    head: AtomicUsize,
    /// Consumer cursor: next slot to read.
    tail: AtomicUsize,
}

// SAFETY: slot access is partitioned by the cursor protocol. The producer
// only writes slots in [head, tail) (mod capacity, exclusive of the full
// boundary) before publishing them with a release store of head; the
// consumer only reads slots it observed through an acquire load of head.
// The embedded raw node pointers refer to arena storage that outlives the
// ring.
unsafe impl Send for OpRing {}
unsafe impl Sync for OpRing {}

impl OpRing {
    /// Create a ring holding up to `capacity - 1` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring needs at least one usable slot");
        let slots = (0..capacity)
            .map(|_| {
                UnsafeCell::new(OpRecord {
                    key: 0,
                    node: std::ptr::null_mut(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Total slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publish a record. Returns false when the ring is full; the producer
    /// is expected to retry (bounded backpressure, records are never
    /// dropped).
    ///
    /// Producer side only.
    pub fn push(&self, record: OpRecord) -> bool {
        let head = self.head.load(RELAXED);
        let tail = self.tail.load(READ_ORD);
        let next = (head + 1) % self.slots.len();
        if next == tail {
            return false;
        }
        // SAFETY: slot `head` is outside the consumer's visible window
        // until the release store below.
        unsafe { *self.slots[head].get() = record };
        self.head.store(next, WRITE_ORD);
        true
    }

    /// Take the oldest record, or None when the ring is empty.
    ///
    /// Consumer side only.
    pub fn pop(&self) -> Option<OpRecord> {
        let tail = self.tail.load(RELAXED);
        let head = self.head.load(READ_ORD);
        if tail == head {
            return None;
        }
        // SAFETY: the acquire load of head makes the producer's write of
        // this slot visible; the producer will not touch it again until
        // tail advances past it.
        let record = unsafe { *self.slots[tail].get() };
        self.tail.store((tail + 1) % self.slots.len(), WRITE_ORD);
        Some(record)
    }

    /// Whether the ring currently holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(READ_ORD) == self.tail.load(READ_ORD)
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rec(key: u64) -> OpRecord {
        OpRecord {
            key,
            node: std::ptr::null_mut(),
        }
    }

    #[test]
    fn test_starts_empty() {
        let ring = OpRing::new(8);
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_fifo_order() {
        let ring = OpRing::new(8);
        for k in 1..=5 {
            assert!(ring.push(rec(k)));
        }
        for k in 1..=5 {
            assert_eq!(ring.pop().map(|r| r.key), Some(k));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_full_ring_rejects_push() {
        let ring = OpRing::new(4);
        assert!(ring.push(rec(1)));
        assert!(ring.push(rec(2)));
        assert!(ring.push(rec(3)));
        // One slot stays open to distinguish full from empty.
        assert!(!ring.push(rec(4)));

        assert_eq!(ring.pop().map(|r| r.key), Some(1));
        assert!(ring.push(rec(4)));
        assert!(!ring.push(rec(5)));
    }

    #[test]
    fn test_wraps_around() {
        let ring = OpRing::new(4);
        for round in 0..10u64 {
            for k in 0..3 {
                assert!(ring.push(rec(round * 3 + k)));
            }
            for k in 0..3 {
                assert_eq!(ring.pop().map(|r| r.key), Some(round * 3 + k));
            }
        }
    }

    #[test]
    fn test_delete_records_carry_null() {
        let ring = OpRing::new(4);
        assert!(ring.push(rec(9)));
        let r = ring.pop().expect("record");
        assert!(r.is_delete());
        assert_eq!(r.key, 9);
    }

    #[test]
    fn test_spsc_order_preserved_across_threads() {
        const N: u64 = 200_000;
        let ring = Arc::new(OpRing::new(DEFAULT_CAPACITY));

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for k in 0..N {
                    while !ring.push(rec(k)) {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut expected = 0;
                while expected < N {
                    if let Some(r) = ring.pop() {
                        assert_eq!(r.key, expected, "record out of order");
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        producer.join().expect("producer");
        consumer.join().expect("consumer");
        assert!(ring.is_empty());
    }
}
