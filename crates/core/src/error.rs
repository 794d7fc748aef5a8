//! Repository error model.

use thiserror::Error;

/// Result type used across the repository layer.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Boxed backend error, carried unmodified.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Repository-level error.
///
/// Only `EntityNotFound` is produced by the repository itself. Everything
/// else comes from the storage layer and is passed through as-is.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// `get` found no entity with the requested key.
    #[error("entity not found: {entity_type} with key {key}")]
    EntityNotFound {
        entity_type: &'static str,
        key: String,
    },

    /// A commit observed a stale concurrency stamp (or a vanished row).
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The cancellation signal fired before the storage call completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other backend failure (connectivity, constraints, serialization).
    #[error("storage failure: {0}")]
    Storage(#[source] BoxError),

    /// Storage could not be configured from the environment.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl RepositoryError {
    pub fn not_found<E>(key: &impl core::fmt::Debug) -> Self {
        Self::EntityNotFound {
            entity_type: std::any::type_name::<E>(),
            key: format!("{key:?}"),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn storage(err: impl Into<BoxError>) -> Self {
        Self::Storage(err.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(Box::new(value))
    }
}
