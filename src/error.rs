//! Error types for protrial
//!
//! Every variant is surfaced verbatim to the admin console, so messages
//! name the entity and the rule that was violated.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Protrial error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Trial start denied by policy or eligibility rules
    #[error("User {user_id} is not eligible for a trial: {reason}")]
    NotEligible {
        /// User that asked for the trial
        user_id: String,
        /// Rule that rejected the request
        reason: String,
    },

    /// Illegal state-machine move
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        /// Entity identifier (trial or experiment id)
        entity: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Unknown identifier
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity looked up
        entity: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// Durability layer unavailable (fatal to the caller's transaction)
    #[error("Storage error: {0}\nNo changes were applied; retry with backoff")]
    StorageError(String),

    /// Lost an optimistic-concurrency race
    #[error("Conflict: expected version {expected}, current version is {actual}\nRe-read and retry")]
    Conflict {
        /// Version the caller based its change on
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Invalid service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller should re-read and retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError(_) | Self::Conflict { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn transition(
        entity: impl Into<String>,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}
