//! Error types for Strata

use thiserror::Error;

use crate::memory::types::ItemId;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed item or argument, rejected at the boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Active buffer bounds would be exceeded even after eviction
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Embedding port or similarity index unreachable
    #[error("Backend unavailable ({backend}): {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// Item exceeded its retry budget in the consolidation pipeline
    #[error("Item {id} stuck after {attempts} attempts")]
    StuckItem { id: ItemId, attempts: u32 },

    /// Referenced item does not exist in the addressed tier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors (LanceDB, arrow conversions)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StrataError {
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Io(_))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
