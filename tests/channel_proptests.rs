//! Property-based tests for the op ring.
//!
//! The properties mirror the channel contract: consumption order is a
//! prefix of production order, and occupancy never exceeds capacity minus
//! one.

use hosk::channel::{OpRecord, OpRing};
use proptest::prelude::*;

fn rec(key: u64) -> OpRecord {
    OpRecord {
        key,
        node: std::ptr::null_mut(),
    }
}

proptest! {
    /// Whatever interleaving of pushes and pops happens, the consumed
    /// sequence equals the accepted-produce sequence, in order.
    #[test]
    fn consumed_is_prefix_of_produced(
        keys in prop::collection::vec(any::<u64>(), 1..300),
        pop_stride in 1usize..5,
        cap in 2usize..64,
    ) {
        let ring = OpRing::new(cap);
        let mut produced = Vec::new();
        let mut consumed = Vec::new();

        for (i, &key) in keys.iter().enumerate() {
            if ring.push(rec(key)) {
                produced.push(key);
            }
            if i % pop_stride == 0 {
                if let Some(r) = ring.pop() {
                    consumed.push(r.key);
                }
            }
            prop_assert!(consumed.len() <= produced.len());
            prop_assert_eq!(&produced[..consumed.len()], &consumed[..]);
        }

        while let Some(r) = ring.pop() {
            consumed.push(r.key);
        }
        prop_assert_eq!(produced, consumed);
    }

    /// Without pops, exactly capacity - 1 pushes are accepted.
    #[test]
    fn occupancy_is_bounded_by_capacity(cap in 2usize..128, extra in 0usize..32) {
        let ring = OpRing::new(cap);
        let mut accepted = 0;
        for key in 0..(cap + extra) as u64 {
            if ring.push(rec(key)) {
                accepted += 1;
            }
        }
        prop_assert_eq!(accepted, cap - 1);
        prop_assert!(!ring.push(rec(0)));
    }

    /// Draining after a full cycle leaves the ring reusable at any phase.
    #[test]
    fn wraparound_preserves_order(cap in 2usize..32, rounds in 1usize..20) {
        let ring = OpRing::new(cap);
        let batch = cap - 1;
        let mut next = 0u64;
        for _ in 0..rounds {
            for _ in 0..batch {
                prop_assert!(ring.push(rec(next)));
                next += 1;
            }
            for expect in (next - batch as u64)..next {
                prop_assert_eq!(ring.pop().map(|r| r.key), Some(expect));
            }
            prop_assert!(ring.is_empty());
        }
    }
}
