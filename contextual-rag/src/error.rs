//! Error types for the `contextual-rag` crate.

use thiserror::Error;

/// Errors that can occur in RAG operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// User-supplied input was rejected before any remote call was made.
    #[error("Invalid input: {0}")]
    ValidationError(String),

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred while requesting a chat completion.
    #[error("Completion error ({provider}): {message}")]
    CompletionError {
        /// The completion provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// The backend rejected the configured credentials.
    #[error("Authentication error ({provider}): {message}")]
    AuthError {
        /// The provider that rejected the request.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A remote call did not complete within the configured timeout.
    #[error("Timeout ({provider}): {operation} did not complete in time")]
    Timeout {
        /// The provider that timed out.
        provider: String,
        /// The remote operation that was in flight.
        operation: String,
    },

    /// A write to the document store failed.
    #[error("Storage error during {operation}: {message}")]
    StorageError {
        /// The store operation that failed.
        operation: String,
        /// A description of the failure.
        message: String,
    },

    /// A value violated a data-model invariant at construction time.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An error in the RAG pipeline orchestration.
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// A follow-up question was asked in an image chat with no image loaded.
    #[error("No image in context for session '{session}'")]
    NoImageContext {
        /// The chat session identifier.
        session: String,
    },
}

impl RagError {
    /// Whether the failure is worth a single retry by the caller.
    ///
    /// Only backend-side failures qualify. Validation, configuration,
    /// authentication, storage and invariant errors never succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::Timeout { .. }
                | RagError::EmbeddingError { .. }
                | RagError::CompletionError { .. }
        )
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_backend_errors_are_transient() {
        let timeout =
            RagError::Timeout { provider: "OpenRouter".into(), operation: "embeddings".into() };
        assert!(timeout.is_transient());
        assert!(
            RagError::EmbeddingError { provider: "x".into(), message: "503".into() }.is_transient()
        );
    }

    #[test]
    fn input_and_auth_errors_are_not_transient() {
        assert!(!RagError::ValidationError("empty query".into()).is_transient());
        assert!(!RagError::AuthError { provider: "x".into(), message: "401".into() }.is_transient());
        assert!(!RagError::ConfigError("missing key".into()).is_transient());
    }

    #[test]
    fn messages_name_the_operation() {
        let err = RagError::StorageError {
            operation: "store_document".into(),
            message: "disk full".into(),
        };
        assert_eq!(err.to_string(), "Storage error during store_document: disk full");
    }
}
