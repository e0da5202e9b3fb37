//! Error types for harborclock
//!
//! Defines the domain error kinds used by the clock scheduler and the
//! harbor input source.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    /// Unifying two distinct known clock variables.
    #[error("clock conflict: cannot unify clock '{0}' with clock '{1}'")]
    ClockConflict(String, String),

    /// `get_ready` or `output_get_ready` raised during `start_outputs`.
    #[error("startup failed for source '{0}': {1}")]
    StartupFailure(String, String),

    /// `output()` raised during a tick.
    #[error("streaming failed for source '{0}': {1}")]
    StreamingFailure(String, String),

    /// The harbor could not find a decoder for the negotiated codec.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// The harbor has no decoder installed at all for this mountpoint.
    #[error("no decoder available")]
    NoDecoder,

    /// `put()` called on a harbor input after the client disconnected.
    #[error("relaying has stopped")]
    RelayingStopped,

    /// The harbor's socket reached end of file.
    #[error("end of file")]
    EndOfFile,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A thread the runtime needed could not be spawned.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses [`ClockError`].
pub type Result<T> = std::result::Result<T, ClockError>;
