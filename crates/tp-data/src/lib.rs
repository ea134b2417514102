//! Row stores the projection engine can be attached to

pub mod config;
pub mod memory;
pub mod schema;
pub mod sqlite;

use arrow::error::ArrowError;
use thiserror::Error;
use tp_core::ProjectionError;

// Re-exports
pub use config::{CsvOptions, NullConfig};
pub use memory::MemorySource;
pub use schema::{ColumnStats, SchemaDetector, SchemaInfo};
pub use sqlite::SqliteSource;

/// Errors that can occur while loading or querying a row store
#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(ArrowError),

    #[error("CSV parsing error: {0}")]
    Csv(String),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Schema detection error: {0}")]
    SchemaDetection(String),

    #[error("Invalid key column: {0}")]
    InvalidKey(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<csv::Error> for DataError {
    fn from(error: csv::Error) -> Self {
        match error.kind() {
            csv::ErrorKind::Io(io_err) => DataError::Io(std::io::Error::new(io_err.kind(), error.to_string())),
            _ => DataError::Csv(error.to_string()),
        }
    }
}

impl From<ArrowError> for DataError {
    fn from(error: ArrowError) -> Self {
        DataError::Arrow(error)
    }
}

impl From<rusqlite::Error> for DataError {
    fn from(error: rusqlite::Error) -> Self {
        DataError::Sqlite(error.to_string())
    }
}

impl From<DataError> for ProjectionError {
    fn from(error: DataError) -> Self {
        match error {
            DataError::Io(e) => ProjectionError::Io(e.to_string()),
            DataError::Csv(msg) => ProjectionError::Io(msg),
            DataError::Sqlite(msg) => ProjectionError::QueryFailed(msg),
            other => ProjectionError::QueryFailed(other.to_string()),
        }
    }
}
