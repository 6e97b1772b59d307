//! Shared test utilities.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // test body
//! }
//! ```
//!
//! Filter with `RUST_LOG`, e.g. `RUST_LOG=hosk=debug cargo test`.

#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a console tracing subscriber once per test binary.
///
/// Safe to call from every test; only the first call takes effect. Without
/// the crate's `tracing` feature the library emits nothing, but test-side
/// `tracing::` calls still work.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hosk=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
