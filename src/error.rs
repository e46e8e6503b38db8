//! Error taxonomy for the measurement backend.
//!
//! Each boundary (provider, coordinator, session) exposes a small enum of
//! *kinds*, wrapping an opaque [`anyhow::Error`] diagnostic chain for the
//! underlying IO/parse failure. Everything below a boundary (hardware
//! detection, file parsing) uses `anyhow::Result` with `.context(...)`
//! instead of inventing a typed error per failure mode.

use thiserror::Error;

/// Failure to bring up or use a single [`EnergyProvider`](crate::provider::EnergyProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Required hardware interface is missing entirely (no RAPL, no sysfs entry).
    #[error("{provider} unavailable: {source}")]
    Unavailable {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single `get_reading` call failed (permission, EIO, timeout).
    #[error("{provider} transient read failure: {source}")]
    TransientRead {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    /// `self_test` failed after `initialize` succeeded.
    #[error("{provider} failed self-test: {reason}")]
    SelfTestFailed { provider: String, reason: String },
}

/// Failure affecting the measurement coordinator as a whole.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// `start_measurements` was called while zero providers could be initialized.
    #[error("no energy provider could be initialized")]
    NoProvidersAvailable,

    /// The sampler or health-monitor thread could not be spawned.
    #[error("failed to start background thread: {0}")]
    ThreadSpawnFailed(#[source] std::io::Error),

    /// An operation that is only valid in a particular coordinator state was attempted.
    #[error("invalid coordinator state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

/// Failure affecting a whole [`Session`](crate::session::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    /// No monotonic clock source exists on this system.
    #[error("no monotonic clock source available: {0}")]
    NoMonotonicClock(#[source] anyhow::Error),

    /// The coordinator could not be started.
    #[error("coordinator failed to start: {0}")]
    CoordinatorStartFailed(#[source] CoordinatorError),

    /// `stop()` was called on a session that never started.
    #[error("session was never started")]
    NotStarted,
}
