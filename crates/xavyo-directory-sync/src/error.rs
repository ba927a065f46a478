//! Sync error types.

use thiserror::Error;
use xavyo_directory::DirectoryError;

use crate::config::ConfigError;

/// Errors raised by the identity store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named authority does not exist.
    #[error("authority not found: {name}")]
    AuthorityNotFound { name: String },

    /// An authority with this name already exists.
    #[error("authority already exists: {name}")]
    AlreadyExists { name: String },

    /// The store does not accept writes.
    #[error("identity store is read-only")]
    ReadOnly,

    /// Any other store failure.
    #[error("store operation failed: {message}")]
    Operation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Create an authority not found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::AuthorityNotFound { name: name.into() }
    }

    /// Create an operation error.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation error with source.
    pub fn operation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Operation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type for identity store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the distributed lock service.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held elsewhere and retries were exhausted.
    #[error("lock '{name}' is held by another process")]
    Unavailable { name: String },

    /// The lock expired or was taken over.
    #[error("lock '{name}' is no longer held")]
    Lost { name: String },

    /// The lock service itself failed.
    #[error("lock service failure: {message}")]
    Service { message: String },
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Directory error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Identity store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lock service error.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No user registry is configured under this id.
    #[error("User registry not found: {source_id}")]
    SourceNotFound { source_id: String },

    /// The run lost its lock and stopped issuing batches.
    #[error("Synchronization lock lost for tenant {tenant}")]
    LockLost { tenant: String },

    /// A unit of work failed inside a batch.
    #[error("Failed to process {item} in '{process}': {source}")]
    Batch {
        process: String,
        item: String,
        #[source]
        source: Box<SyncError>,
    },

    /// A batch task panicked or was aborted.
    #[error("Batch task failed: {message}")]
    Task { message: String },

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Create a source not found error.
    pub fn source_not_found(source_id: impl Into<String>) -> Self {
        Self::SourceNotFound {
            source_id: source_id.into(),
        }
    }

    /// Create a store operation error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(StoreError::operation(message))
    }

    /// Create a lock lost error.
    pub fn lock_lost(tenant: impl Into<String>) -> Self {
        Self::LockLost {
            tenant: tenant.into(),
        }
    }

    /// Wrap a unit-of-work failure with the process and item it belongs to.
    pub fn batch(process: impl Into<String>, item: impl Into<String>, source: SyncError) -> Self {
        Self::Batch {
            process: process.into(),
            item: item.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if a later run may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Directory(e) => e.is_transient(),
            SyncError::Lock(LockError::Unavailable { .. }) | SyncError::LockLost { .. } => true,
            SyncError::Batch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Directory(e) => e.error_code(),
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::Lock(_) => "LOCK_ERROR",
            SyncError::Config(_) => "INVALID_CONFIG",
            SyncError::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            SyncError::LockLost { .. } => "LOCK_LOST",
            SyncError::Batch { source, .. } => source.error_code(),
            SyncError::Task { .. } => "TASK_FAILED",
            SyncError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::source_not_found("corporate-ldap");
        assert_eq!(err.to_string(), "User registry not found: corporate-ldap");

        let err = SyncError::batch(
            "Synchronization,Category=directory,id1=ldap1,id2=1 Group Analysis",
            "cn=dev,ou=groups,dc=example,dc=com",
            StoreError::ReadOnly.into(),
        );
        assert!(err.to_string().contains("cn=dev"));
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(SyncError::from(DirectoryError::communication("reset")).is_retryable());
        assert!(SyncError::lock_lost("acme").is_retryable());
        assert!(!SyncError::from(DirectoryError::AuthenticationFailed).is_retryable());
        assert!(!SyncError::from(StoreError::not_found("GROUP_dev")).is_retryable());
        assert!(!SyncError::source_not_found("x").is_retryable());
    }

    #[test]
    fn test_error_code_passes_through_batch() {
        let err = SyncError::batch(
            "p",
            "i",
            DirectoryError::DuplicateId {
                kind: "group",
                id: "dev".to_string(),
            }
            .into(),
        );
        assert_eq!(err.error_code(), "DUPLICATE_ID");
    }
}
