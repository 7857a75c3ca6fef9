// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the sync engine, organized by kind rather than by
/// originating type. Every mutating operation in the crate
/// returns one of these variants so callers can dispatch on `kind`
/// without string-matching a message.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    /// Bad input; surfaced to the caller, never retried automatically.
    #[error("validation error: {0}")]
    Validation(String),

    /// A record already exists under the given id.
    #[error("entity already exists: {0}")]
    EntityExists(String),

    /// No record found for the given id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or timeout failure. Retried by the Request Mediator
    /// under its own policy; surfaced as `Unavailable` once exhausted.
    #[error("transient error: {0}")]
    Transient(TransientKind),

    /// Retries under the mediator's policy were exhausted.
    #[error("server unavailable after retries")]
    Unavailable,

    /// The server returned a structured error envelope.
    /// `retry_after_ms` carries the `details.retry_after_ms` hint a
    /// 503 response may include.
    #[error("remote error {code}: {message}")]
    Remote {
        code: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Caller-initiated or deadline-triggered cancellation of an
    /// in-flight operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A reconciliation produced a conflict; never fatal, always
    /// resolved deterministically by the Conflict Resolver before
    /// reaching the caller. Surfaced only for observability.
    #[error("conflict on task {0}")]
    Conflict(String),

    /// A programming invariant was violated (e.g. mismatched id between
    /// local/server/authoritative snapshots passed to the resolver).
    /// Fatal to the enclosing pass, never to the process.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An on-disk record failed to parse; the record is quarantined,
    /// not exposed, and startup continues.
    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Sub-classification of [`Error::Transient`], matching the Request
/// Mediator's retry classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransientKind {
    #[error("timeout")]
    Timeout,
    #[error("transport failure")]
    Transport,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transient(TransientKind::Timeout)
        } else {
            Error::Transient(TransientKind::Transport)
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
