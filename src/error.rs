//! Error kinds shared across the control plane
//!
//! Validation and registration errors are surfaced synchronously to the caller.
//! Transport and notify-delivery errors are recovered locally (retry/backoff,
//! per-channel isolation) and never reach a pool's task-execution path.

use std::time::Duration;

use crate::model::GroupKey;

/// Invalid group key, parameters or alarm settings.
///
/// Raised before any mutation; the target is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("core pool size must be greater than zero")]
    ZeroCorePoolSize,

    #[error("max pool size must be greater than zero")]
    ZeroMaxPoolSize,

    #[error("core pool size {core} exceeds max pool size {max}")]
    CoreExceedsMax { core: usize, max: usize },

    #[error("core threads may only time out with a non-zero keep-alive")]
    CoreTimeoutWithoutKeepAlive,

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} contains reserved character {found:?}")]
    ReservedCharacter { field: &'static str, found: char },

    #[error("threshold {field} must be within 0..=100, got {value}")]
    ThresholdOutOfRange { field: &'static str, value: u32 },

    #[error("invalid pool configuration content: {0}")]
    Content(String),
}

/// Pool registry failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("pool {0} is already registered")]
    DuplicateRegistration(GroupKey),

    #[error("pool {0} is not registered")]
    NotFound(GroupKey),
}

/// Failures of a client-side pool registration; nothing is registered locally
/// when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("server refused registration: {0}")]
    Transport(#[from] TransportError),
}

/// Task submission and pool lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Queue full and threads saturated under the abort policy.
    #[error("task rejected by pool {pool_id}: queue full and {max_pool_size} workers busy")]
    Rejected {
        pool_id: String,
        max_pool_size: usize,
    },

    #[error("pool {0} is shut down")]
    Shutdown(String),

    #[error("failed to spawn worker thread for pool {pool_id}: {source}")]
    WorkerSpawn {
        pool_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Network/timeout failures on any outbound call
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("server {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("no server address configured")]
    NoServer,
}

/// Errors raised by the client worker when applying pulled content
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A pulled version not newer than the one already applied.
    #[error("stale notification for {key}: version {pulled} <= applied {applied}")]
    StaleNotification {
        key: GroupKey,
        pulled: u64,
        applied: u64,
    },

    #[error("no subscription for {0}")]
    NotSubscribed(GroupKey),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-channel alert delivery failure
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no notifier registered for channel {0}")]
    UnknownChannel(String),

    #[error("delivery to {target} failed: {reason}")]
    Delivery { target: String, reason: String },
}
