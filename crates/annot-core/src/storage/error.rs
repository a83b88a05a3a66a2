//! Storage errors

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the annotation and project databases
#[derive(Error, Debug)]
pub enum StorageError {
    /// The directory holding a database could not be created
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Database file could not be opened
    #[error("Failed to open database '{path}': {source}. Is another annot process holding it?")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored row does not decode into its model
    #[error("Invalid row in '{table}': {details}")]
    InvalidRow { table: &'static str, details: String },

    /// A referenced row does not exist
    #[error("No {entity} with id {id}")]
    MissingRow { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StorageError {
    /// Create an error for a missing row
    pub fn missing(entity: &'static str, id: impl ToString) -> Self {
        StorageError::MissingRow {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the row was simply not there, as opposed to a database failure
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::MissingRow { .. })
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
