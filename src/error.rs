//! Error types for mirror sync

use thiserror::Error;

use crate::types::ItemId;

/// Result type alias for mirror sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for mirror sync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Records not found in '{resource}': {ids:?}")]
    NotFound { resource: String, ids: Vec<ItemId> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "http")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error taxonomy used to decide who handles a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lock/busy contention in the local store; retried inside `Storage`
    TransientStore,
    /// Referenced ids are missing; fatal
    NotFound,
    /// Remote unreachable; handled by the network fallback
    Network,
    /// Everything else; propagated unchanged
    Data,
}

impl SyncError {
    /// Classify this error into the sync taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientStore(_) => ErrorKind::TransientStore,
            SyncError::Database(e) if is_busy_or_locked(e) => ErrorKind::TransientStore,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::Network(_) => ErrorKind::Network,
            #[cfg(feature = "http")]
            SyncError::Http(e) if e.is_connect() || e.is_timeout() => ErrorKind::Network,
            _ => ErrorKind::Data,
        }
    }

    /// Check if error is retryable by the local store
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }

    /// Check if error is a typed network failure
    pub fn is_network(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// True for errors raised by the local store itself
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            SyncError::Database(_) | SyncError::TransientStore(_) | SyncError::NotFound { .. }
        )
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, including their extended codes
fn is_busy_or_locked(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> SyncError {
        SyncError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        assert_eq!(sqlite_failure(5).kind(), ErrorKind::TransientStore);
        assert_eq!(sqlite_failure(6).kind(), ErrorKind::TransientStore);
        assert!(sqlite_failure(5).is_retryable());
    }

    #[test]
    fn test_constraint_failure_is_fatal() {
        // SQLITE_CONSTRAINT
        let err = sqlite_failure(19);
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_taxonomy() {
        let not_found = SyncError::NotFound {
            resource: "tags".to_string(),
            ids: vec![4, 7],
        };
        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        assert!(!not_found.is_retryable());
        assert!(not_found.to_string().contains("[4, 7]"));

        assert!(SyncError::Network("offline".into()).is_network());
        assert_eq!(SyncError::Data("bad".into()).kind(), ErrorKind::Data);
        assert!(SyncError::TransientStore("lock timeout".into()).is_store_error());
    }
}
