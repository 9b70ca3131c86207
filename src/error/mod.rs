// Error handling module for the object storage node
//
// This module defines error types and utility functions for error handling.
// Every variant maps to exactly one stable code string, so callers and
// operators can match on classes without parsing messages.

use std::io;
use std::result;
use thiserror::Error;

/// Result type for storage node operations
pub type Result<T> = result::Result<T, StorageNodeError>;

/// Error type for storage node operations
#[derive(Debug, Error, Clone)]
pub enum StorageNodeError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists (locks, indexes)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not permitted
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Payload exceeds the configured size limit
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Peer or subsystem unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Stored data failed verification
    #[error("Corrupted: {0}")]
    Corrupted(String),

    /// Replica state violates the requested consistency level
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Malformed storage key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Malformed stored value or metadata
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Metadata backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Secondary index failure
    #[error("Index error: {0}")]
    Index(String),

    /// Metadata cache failure
    #[error("Cache error: {0}")]
    Cache(String),
}

impl StorageNodeError {
    /// Stable machine-readable code for this error class.
    ///
    /// These strings are part of the external contract and must not change.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Corrupted(_) => "CORRUPTED",
            Self::Consistency(_) => "CONSISTENCY_ERROR",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::InvalidValue(_) => "INVALID_VALUE",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Index(_) => "INDEX_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an already-exists error
    pub fn already_exists<S: Into<String>>(message: S) -> Self {
        Self::AlreadyExists(message.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create an unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a corruption error
    pub fn corrupted<S: Into<String>>(message: S) -> Self {
        Self::Corrupted(message.into())
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }

    /// Create an index error
    pub fn index<S: Into<String>>(message: S) -> Self {
        Self::Index(message.into())
    }

    /// True for error classes that are worth retrying against a peer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Internal(_)
        )
    }
}

// Implement conversion from io::Error to StorageNodeError
impl From<io::Error> for StorageNodeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageNodeError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => StorageNodeError::PermissionDenied(err.to_string()),
            _ => StorageNodeError::Internal(format!("io error: {err}")),
        }
    }
}

// Implement conversion from serde_json::Error to StorageNodeError
impl From<serde_json::Error> for StorageNodeError {
    fn from(err: serde_json::Error) -> Self {
        StorageNodeError::InvalidValue(format!("json error: {err}"))
    }
}

// Implement conversion from rusqlite error to StorageNodeError
impl From<rusqlite::Error> for StorageNodeError {
    fn from(err: rusqlite::Error) -> Self {
        StorageNodeError::Backend(format!("sqlite error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(StorageNodeError::not_found("k").code(), "NOT_FOUND");
        assert_eq!(StorageNodeError::already_exists("l").code(), "ALREADY_EXISTS");
        assert_eq!(StorageNodeError::QuotaExceeded("q".into()).code(), "QUOTA_EXCEEDED");
        assert_eq!(StorageNodeError::invalid_argument("a").code(), "INVALID_ARGUMENT");
        assert_eq!(StorageNodeError::Consistency("c".into()).code(), "CONSISTENCY_ERROR");
        assert_eq!(StorageNodeError::backend("b").code(), "BACKEND_ERROR");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: StorageNodeError =
            io::Error::new(io::ErrorKind::NotFound, "missing file").into();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn retryable_classes() {
        assert!(StorageNodeError::unavailable("peer down").is_retryable());
        assert!(StorageNodeError::timeout("slow").is_retryable());
        assert!(!StorageNodeError::invalid_argument("bad").is_retryable());
    }
}
