//! Error types and result aliases shared by every lakelog crate.
//!
//! These errors describe infrastructure-level failures (storage, encoding,
//! configuration). Semantic state-store failures live in
//! `lakelog_statestore::StateStoreError`, which wraps this type unchanged.

use std::fmt;

/// The result type used throughout lakelog.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lakelog infrastructure operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error describing what was being encoded.
    #[must_use]
    pub fn serialization(context: impl fmt::Display, cause: impl fmt::Display) -> Self {
        Self::Serialization {
            message: format!("{context}: {cause}"),
        }
    }

    /// Returns true if this error means the object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_keeps_source() {
        let io = std::io::Error::other("disk unplugged");
        let err = Error::storage_with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "storage error: write failed");
    }

    #[test]
    fn test_serialization_error_formats_context() {
        let err = Error::serialization("encode entry 7", "unexpected end of input");
        assert_eq!(
            err.to_string(),
            "serialization error: encode entry 7: unexpected end of input"
        );
        assert!(!err.is_not_found());
        assert!(Error::NotFound("x".into()).is_not_found());
    }
}
