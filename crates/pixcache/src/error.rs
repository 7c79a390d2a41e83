use std::sync::Arc;

use reqwest::StatusCode;

/// Errors raised by the persistent cache tier
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache is closed")]
    Closed,

    #[error("Corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("Insufficient space: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why the persistent tier could not be brought up.
///
/// Callers treat every variant the same way (memory-only caching); the reason
/// is kept for diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InitError {
    #[error("Insufficient space for disk cache: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("Disk cache I/O failure: {0}")]
    Io(String),

    #[error("Disk cache disabled by configuration")]
    Disabled,
}

impl From<CacheError> for InitError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InsufficientSpace {
                available,
                required,
            } => InitError::InsufficientSpace {
                available,
                required,
            },
            other => InitError::Io(other.to_string()),
        }
    }
}

/// Errors raised while transferring bytes from a remote endpoint
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("Server does not support resuming from byte {offset}")]
    ResumeNotSupported { offset: u64 },

    #[error("Unexpected Content-Range: {0}")]
    InvalidContentRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer timed out: {0}")]
    Timeout(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Raised when stored or produced bytes are not a valid payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,

    #[error("Unrecognized payload format")]
    UnknownFormat,

    #[error("Truncated {format} payload")]
    Truncated { format: &'static str },

    #[error("Malformed {format} payload: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },
}

/// Errors produced by a [`crate::source::Source`]
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Storage medium error: {0}")]
    Medium(#[from] std::io::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Source error: {0}")]
    Generic(String),
}

/// The only error type that crosses the fetch boundary.
///
/// Cloneable so a single failure can be handed to every caller waiting on the
/// same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Source failed: {0}")]
    Source(Arc<SourceError>),

    #[error("Commit failed: {0}")]
    Commit(Arc<CacheError>),

    #[error("Produced bytes could not be decoded: {0}")]
    Decode(#[from] DecodeError),

    #[error("Populate task failed: {0}")]
    Internal(String),
}

// Manual From impls because of the Arc wrapping.
impl From<SourceError> for FetchError {
    fn from(err: SourceError) -> Self {
        FetchError::Source(Arc::new(err))
    }
}

impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        FetchError::Commit(Arc::new(err))
    }
}

impl From<TransferError> for FetchError {
    fn from(err: TransferError) -> Self {
        FetchError::Source(Arc::new(SourceError::Transfer(err)))
    }
}
