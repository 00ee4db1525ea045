//! Error types for cortex-core.

use thiserror::Error;

use crate::types::ConsolidationPhase;

/// Result type alias using cortex-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for cortex operations
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (rejected before any write)
    #[error("Validation error: {0}")]
    Validation(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Unsupported schema version {found} (newest known: {supported})")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Sandbox errors. A missed deadline is an experiment status, not an error.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Sandbox experiment {0} is already finalized")]
    AlreadyFinalized(i64),

    // Consolidation errors
    #[error("Consolidation phase {phase} failed: {message}")]
    ConsolidationPhase {
        phase: ConsolidationPhase,
        message: String,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a consolidation phase error
    pub fn consolidation_phase(phase: ConsolidationPhase, message: impl Into<String>) -> Self {
        Self::ConsolidationPhase {
            phase,
            message: message.into(),
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Transient contention (SQLITE_BUSY / SQLITE_LOCKED) that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
