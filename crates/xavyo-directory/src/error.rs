//! Directory error types
//!
//! Error definitions with transient/permanent classification, used by the
//! cursor to decide between reconnect-and-resume and failing the query.

use thiserror::Error;

/// Error that can occur while talking to a directory source.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Communication errors (transient, recovered by resume)
    /// Failed to open a session with the directory server.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The session broke down mid-query.
    #[error("communication failure: {message}")]
    Communication {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server did not answer in time.
    #[error("directory operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    // Authentication errors (permanent)
    /// Bind rejected the configured credentials.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    // Configuration errors (permanent)
    /// Registry or connection configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Query errors
    /// The server rejected a search.
    #[error("search failed: {message}")]
    SearchFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A directory name could not be parsed.
    #[error("invalid distinguished name '{dn}': {message}")]
    InvalidName { dn: String, message: String },

    /// A row lacks its mandatory id attribute and strict mode is on.
    #[error("entry {dn} is missing id attribute '{attribute}'")]
    MissingIdAttribute { dn: String, attribute: String },

    /// The same id was returned more than once and strict mode is on.
    #[error("duplicate {kind} id found: {id}")]
    DuplicateId { kind: &'static str, id: String },

    /// A member value could not be resolved and strict mode is on.
    #[error("failed to resolve member '{member}' of group '{group}'")]
    UnresolvableMember {
        group: String,
        member: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A timestamp attribute did not match the configured format.
    #[error("invalid timestamp '{value}': {message}")]
    InvalidTimestamp { value: String, message: String },

    /// Reconnect after a communication failure did not succeed.
    #[error("resume after communication failure failed: {message}")]
    ResumeFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Internal errors
    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DirectoryError {
    /// Check if this error is transient and the query can be resumed.
    ///
    /// Transient errors come from a broken session; the cursor reopens the
    /// session and replays from the last page cookie.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::Communication { .. }
                | DirectoryError::Timeout { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::Communication { .. } => "COMMUNICATION_FAILURE",
            DirectoryError::Timeout { .. } => "TIMEOUT",
            DirectoryError::AuthenticationFailed => "AUTH_FAILED",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::SearchFailed { .. } => "SEARCH_FAILED",
            DirectoryError::InvalidName { .. } => "INVALID_NAME",
            DirectoryError::MissingIdAttribute { .. } => "MISSING_ID_ATTRIBUTE",
            DirectoryError::DuplicateId { .. } => "DUPLICATE_ID",
            DirectoryError::UnresolvableMember { .. } => "UNRESOLVABLE_MEMBER",
            DirectoryError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            DirectoryError::ResumeFailed { .. } => "RESUME_FAILED",
            DirectoryError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a communication failure.
    pub fn communication(message: impl Into<String>) -> Self {
        DirectoryError::Communication {
            message: message.into(),
            source: None,
        }
    }

    /// Create a communication failure with source.
    pub fn communication_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::Communication {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a search failed error.
    pub fn search_failed(message: impl Into<String>) -> Self {
        DirectoryError::SearchFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a search failed error with source.
    pub fn search_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::SearchFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a resume failure wrapping the error that broke the retry.
    pub fn resume_failed(cause: DirectoryError) -> Self {
        DirectoryError::ResumeFailed {
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        DirectoryError::Internal {
            message: message.into(),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
