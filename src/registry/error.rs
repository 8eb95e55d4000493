//! Registry error taxonomy.

use thiserror::Error;

/// Errors returned by every registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backend connection dropped. Backends reconnect on their own;
    /// callers may retry.
    #[error("registry connection lost")]
    ConnectionLost,

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Optimistic write lost against a concurrent writer.
    #[error("version conflict on {path}: expected {expected}")]
    VersionConflict { path: String, expected: i64 },

    /// Operation attempted after `close()`.
    #[error("registry closed")]
    Closed,

    #[error("invalid registry address '{0}'")]
    InvalidAddress(String),

    #[error("invalid registry path '{0}'")]
    InvalidPath(String),

    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::ConnectionLost | RegistryError::Backend(_))
    }
}
