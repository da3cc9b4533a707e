//! Error types.

use thiserror::Error;

/// Misuse and configuration errors, surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration setter was called after `start()`.
    #[error("job already started")]
    AlreadyStarted,

    /// A control operation that requires a started job was called before `start()`.
    #[error("job not started")]
    NotStarted,

    /// Thread count must be at least 1.
    #[error("thread count must be at least 1, got {0}")]
    InvalidThreadCount(usize),

    /// A shard directory entry is missing a preferred host.
    #[error("shard {0:?} has no preferred host")]
    MissingPreferredHost(crate::directory::ShardId),

    /// `retry()` was called for a shard no longer present in the directory.
    #[error("shard {0:?} is no longer in the configuration")]
    UnknownShard(crate::directory::ShardId),
}

/// Error surfaced by the transport facade (C2) for a single page fetch.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The previous page was exactly full and no further results exist.
    /// Equivalent to a terminal empty page.
    #[error("resource not found")]
    NotFound,

    /// Any other transient failure (network, server error, timeout, ...).
    #[error("transport error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Error surfaced by `retry()`: either a misuse error (job not started, or
/// the shard named by the failure event is no longer in the directory) or
/// the transport error the retried page itself raised, re-propagated to
/// the caller of `retry()` rather than routed through failure listeners.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Misuse(#[from] Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
