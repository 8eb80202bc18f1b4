//! Error types for key-value backends

/// Errors from key-value backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    #[error("backend unavailable: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
