//! Fail-fast setup errors.
//!
//! Everything that can go wrong before the workload starts (bad flags,
//! unusable hardware, thread spawn failures) surfaces as a [`SetupError`].
//! Once the workload is running, the data layer never errors: operations
//! resolve to small outcome values and contention is retried in place.

use thiserror::Error;

/// Errors raised while validating configuration or bringing up enclaves.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A configuration value is outside its legal range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The host has no NUMA topology exposed.
    #[error("NUMA is unavailable on this system")]
    NumaUnavailable,

    /// Cores do not expose two hardware threads each.
    #[error("SMT is not enabled: {0}")]
    SmtUnavailable(String),

    /// Sysfs topology enumeration failed.
    #[error("failed to read hardware topology: {0}")]
    Topology(String),

    /// Requested more enclaves than the machine has cores.
    #[error("requested {requested} enclaves but only {available} cores are usable")]
    NotEnoughCores {
        /// Enclaves requested via `threads`.
        requested: usize,
        /// SMT core pairs discovered.
        available: usize,
    },

    /// An OS thread could not be spawned.
    #[error("failed to spawn {role} thread for enclave {enclave}: {source}")]
    Spawn {
        /// "application" or "helper".
        role: &'static str,
        /// Enclave id.
        enclave: usize,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// Arena backing memory could not be mapped.
    #[error("failed to map {bytes} bytes for enclave {enclave}")]
    ArenaMap {
        /// Requested mapping size.
        bytes: usize,
        /// Enclave id.
        enclave: usize,
    },
}
