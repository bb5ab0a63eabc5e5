//! Error types for registrar-core

use thiserror::Error;

/// Result type alias for registrar operations
pub type Result<T> = std::result::Result<T, RegistrarError>;

/// Main error type for location registry operations
#[derive(Error, Debug)]
pub enum RegistrarError {
    /// Invalid configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store rejected the operation or is unreachable
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database driver error
    #[error("Database error: {0}")]
    Database(String),

    /// Contact data violates a registry invariant (e.g. missing ruid)
    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    /// No domain table registered under this name
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Address-of-record not present in the domain
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Contact not found for the address-of-record
    #[error("Contact not found: {contact} for aor {aor}")]
    ContactNotFound { aor: String, contact: String },

    /// Operation not valid in the current registry state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistrarError {
    /// True for failures reported by the backing store
    pub fn is_storage(&self) -> bool {
        matches!(self, RegistrarError::Storage(_) | RegistrarError::Database(_))
    }
}

impl From<sqlx::Error> for RegistrarError {
    fn from(err: sqlx::Error) -> Self {
        RegistrarError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RegistrarError {
    fn from(err: serde_json::Error) -> Self {
        RegistrarError::Config(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for RegistrarError {
    fn from(err: tokio::task::JoinError) -> Self {
        RegistrarError::Internal(format!("worker task failed: {}", err))
    }
}
