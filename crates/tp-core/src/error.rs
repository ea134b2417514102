//! Error taxonomy shared by every layer of the projection

use thiserror::Error;

use crate::index::{IndexSpaceKind, SourceRowId};

/// Errors that can occur while projecting a data source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("Invalid column index {0}")]
    InvalidColumn(usize),

    #[error("Row {row} is not valid in the {space} space")]
    InvalidRow { row: i64, space: IndexSpaceKind },

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Mapping table is stale or missing")]
    StaleMapping,

    #[error("Row identity is ambiguous: {candidates} rows match, chose {chosen}")]
    AmbiguousRowIdentity { chosen: SourceRowId, candidates: usize },

    #[error("No data source attached")]
    EmptySource,

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ProjectionError {
    /// Shorthand for a row outside of an index space
    pub fn invalid_row(row: usize, space: IndexSpaceKind) -> Self {
        ProjectionError::InvalidRow {
            row: i64::try_from(row).unwrap_or(i64::MAX),
            space,
        }
    }

    /// Shorthand for an unknown source row id
    pub fn unknown_id(id: SourceRowId) -> Self {
        ProjectionError::InvalidRow {
            row: id.get(),
            space: IndexSpaceKind::Source,
        }
    }
}

impl From<std::io::Error> for ProjectionError {
    fn from(error: std::io::Error) -> Self {
        ProjectionError::Io(error.to_string())
    }
}

/// Result alias used throughout the projection crates
pub type Result<T, E = ProjectionError> = std::result::Result<T, E>;
