//! # HOSK
//!
//! A concurrent ordered integer map for large multi-socket machines, built
//! as a hybrid two-plane skip list.
//!
//! The sorted data layer (one lock-free doubly linked chain) is shared by
//! every thread. The index above it is not: each *enclave*, an application
//! thread and a helper thread pinned to the two hardware threads of one
//! core, keeps a thread-private skip-list index over the keys it has
//! observed. The application thread performs lookups and updates against
//! the shared chain; its helper asynchronously rebuilds the private index
//! from the updates streamed over a bounded SPSC ring and takes care of
//! physical node reclamation.
//!
//! ## Design
//!
//! - Chain membership lives in one atomic word per node: live, logically
//!   deleted, or marked for physical removal. Every transition is a single
//!   CAS, so data-layer operations linearize at that CAS.
//! - Index levels are raised deterministically (of three consecutive
//!   unraised entries, the middle gets a tower) and lowered when deleted
//!   towers dominate. No randomness on the operation hot path.
//! - Each enclave feeds its nodes from two socket-local bump arenas, so
//!   the only cross-socket traffic is the walk of the shared chain itself.
//! - The private index is eventually consistent: a key inserted by one
//!   enclave is immediately visible to all through the chain, and becomes
//!   cheap to find in another enclave's index after that enclave's helper
//!   has observed it.
//!
//! The crate ships one binary, the benchmark coordinator, which drives
//! configurable integer-set workloads over the map and reports throughput
//! and size oracles.

pub mod alloc;
pub mod application;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod enclave;
pub mod error;
mod helper;
mod index;
mod list;
pub mod node;
pub mod ordering;
pub mod topology;

mod tracing_helpers;

pub use config::{BenchConfig, BenchReport, OpCounters};
pub use coordinator::Coordinator;
pub use error::SetupError;
pub use topology::Topology;
