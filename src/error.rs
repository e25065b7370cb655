//! Typed error kinds
//!
//! Library code mostly propagates with `anyhow::Error` (matching the rest of
//! this crate), but a handful of call sites need to discriminate on *why*
//! something failed - the orchestrator picks a rollback step based on it,
//! the sender decides whether to retry, the CLI picks an exit message. Those
//! sites return one of the enums below instead of a bare `anyhow::Error`.

use thiserror::Error;

/// Failures from the local database service controller (component A).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{name}' not found (did you mean: {suggestions:?})")]
    NotFound {
        name: String,
        suggestions: Vec<String>,
    },
    #[error("insufficient privilege to control service '{name}' - try running as root or with CAP_SYS_ADMIN")]
    NoPermission { name: String },
    #[error("service '{name}' is busy and refused to stop")]
    Busy { name: String },
    #[error("timed out waiting for service '{name}' to reach the requested state")]
    Timeout { name: String },
}

/// Failures from the chunked transfer protocol (components E, F, G).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    #[error("connection failed")]
    Connect,
    #[error("TLS handshake failed")]
    Tls,
    #[error("protocol violation")]
    Protocol,
    #[error("operation timed out")]
    Timeout,
    #[error("authentication failed")]
    Auth,
    #[error("resume token does not match a known session")]
    ResumeConflict,
    #[error("integrity verification failed after transfer")]
    IntegrityFailure,
}

impl TransportErrorKind {
    /// The first four kinds are transient and may be
    /// retried by the backoff wrapper; the last three never are.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Connect
                | TransportErrorKind::Tls
                | TransportErrorKind::Protocol
                | TransportErrorKind::Timeout
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Failures from the receiver's storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("out of disk space under '{path}'")]
    OutOfSpace { path: String },
    #[error("permission denied writing to '{path}'")]
    Permission { path: String },
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The coarse classification recorded on a terminal `BackupRun`.
///
/// This is deliberately a flat enum rather than a nested `Box<dyn Error>`
/// tree: the orchestrator and the catalog both need to pattern-match on it,
/// and a `BackupRun.error_message` is a single user-facing string anyway.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("post-restart verification failed: {0}")]
    Verify(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("operation cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// User-facing advisory string, used to populate
    /// `BackupRun.error_message`.
    pub fn advisory(&self) -> String {
        self.to_string()
    }
}
