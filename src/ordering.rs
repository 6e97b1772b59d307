//! Standard memory orderings for shared node access.
//!
//! These constants keep ordering usage consistent across the data layer,
//! the index layer, and the op channel, and make the intent clear at each
//! access point.

use std::sync::atomic::Ordering;

/// Ordering for reading chain and index links during traversal.
/// Pairs with writers' Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing a newly linked node.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success on `next` links and value words.
pub const CAS_OK: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure. Only the current value is needed.
pub const CAS_FAIL: Ordering = Ordering::Acquire;

/// Ordering for fields confined to a single thread by protocol
/// (helper-owned entry fields, allocator cursors).
pub const RELAXED: Ordering = Ordering::Relaxed;
