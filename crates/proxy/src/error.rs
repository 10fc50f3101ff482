//! Proxy error types.

use silo_metadata::MetadataError;
use silo_storage::StorageError;
use thiserror::Error;

/// Errors from the content-addressing layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("currently in read-only maintenance mode; try again later")]
    ReadOnly,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("core error: {0}")]
    Core(#[from] silo_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Whether this error means "the object or mapping does not exist",
    /// at whichever layer it was detected.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Storage(StorageError::NotFound(_))
                | Self::Metadata(MetadataError::NotFound(_))
        )
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
