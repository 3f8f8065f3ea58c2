//! Storage Layer
//!
//! Append-only log of classified incidents. Records are keyed by incident
//! id and never modified once written; history and analytics views read
//! them back in this exact JSON shape.

mod config;
mod record;
mod repository;

pub use config::{StorageBackend, StorageConfig};
pub use record::{Channel, ClassifiedRecord, EscalationStatus, RecordQuery, Severity, UserResponse};
pub use repository::IncidentLog;

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Record {0} already logged")]
    Duplicate(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}
