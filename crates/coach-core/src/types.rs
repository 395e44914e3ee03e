//! ============================================================================
//! Core Types for the Coach memory subsystem
//! ============================================================================
//! Error taxonomy shared by every backend and orchestration layer.
//! ============================================================================

/// Result alias used at every component boundary
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Error types for the memory subsystem
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    /// Profile store or turn log could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Vector backend could not be reached or rejected the request
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Missing credentials or endpoints. Only raised while starting up.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Empty or malformed input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A stored record could not be decoded
    #[error("Corrupt record: {0}")]
    Serialization(String),

    /// The remote API refused the request itself (bad key, bad payload)
    #[error("{service} rejected the request ({status}): {message}")]
    Rejected {
        service: String,
        status: u16,
        message: String,
    },
}

impl MemoryError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemoryError::StorageUnavailable(_)
                | MemoryError::IndexUnavailable(_)
                | MemoryError::Embedding(_)
                | MemoryError::LanguageModel(_)
                | MemoryError::Timeout { .. }
        )
    }

    pub(crate) fn storage(context: &str, e: impl std::fmt::Display) -> Self {
        MemoryError::StorageUnavailable(format!("{}: {}", context, e))
    }

    pub(crate) fn index(context: &str, e: impl std::fmt::Display) -> Self {
        MemoryError::IndexUnavailable(format!("{}: {}", context, e))
    }

    /// Map a non-success HTTP status. Throttling and server errors go
    /// through `transient`, other client errors are final.
    pub(crate) fn from_status(
        service: &str,
        status: u16,
        message: String,
        transient: fn(String) -> MemoryError,
    ) -> Self {
        if status == 429 || !(400..500).contains(&status) {
            transient(format!("{} error ({}): {}", service, status, message))
        } else {
            MemoryError::Rejected {
                service: service.to_string(),
                status,
                message,
            }
        }
    }
}
