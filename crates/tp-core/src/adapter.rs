//! Traits implemented by the row stores a projection can sit on top of
//!
//! [`DataSourceAdapter`] is all the in-memory backend needs: typed cell reads
//! keyed by [`SourceRowId`]. [`QueryBackend`] adds what the query backend
//! needs to keep its mapping table inside the store: SQL execution, identifier
//! quoting, and control over the connection mode.

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{ProjectionError, Result};
use crate::index::SourceRowId;
use crate::value::{CellValue, ColumnDescriptor, ColumnKind};

/// Read access to a row store
pub trait DataSourceAdapter: Send + Sync {
    /// Human readable name, e.g. the table or file name
    fn source_name(&self) -> String;

    /// Number of rows, hidden rows included
    fn row_count(&self) -> Result<usize>;

    /// Schema of the store, in display order
    fn columns(&self) -> Vec<ColumnDescriptor>;

    fn column_count(&self) -> usize {
        self.columns().len()
    }

    fn column(&self, col: usize) -> Result<ColumnDescriptor> {
        self.columns()
            .into_iter()
            .nth(col)
            .ok_or(ProjectionError::InvalidColumn(col))
    }

    fn column_name(&self, col: usize) -> Result<String> {
        self.column(col).map(|c| c.name)
    }

    fn column_kind(&self, col: usize) -> Result<ColumnKind> {
        self.column(col).map(|c| c.kind)
    }

    /// Case-insensitive lookup of a column by name
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Identifiers of every row, in the store's natural order
    ///
    /// The position of an id in this listing is its source position.
    fn row_ids(&self) -> Result<Vec<SourceRowId>>;

    /// Read one cell
    fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue>;

    /// Name of the column whose values are the row ids, if the store has one
    fn primary_key_column(&self) -> Option<String>;

    /// Rows whose cells equal the given values, lowest id first, at most
    /// `limit` of them
    ///
    /// Null matches null. The default implementation scans every row.
    fn find_rows(
        &self,
        conditions: &[(usize, CellValue)],
        limit: usize,
    ) -> Result<Vec<SourceRowId>> {
        for (col, _) in conditions {
            if *col >= self.column_count() {
                return Err(ProjectionError::InvalidColumn(*col));
            }
        }

        let mut ids = self.row_ids()?;
        ids.sort_unstable();

        let mut found = Vec::new();
        for id in ids {
            if found.len() >= limit {
                break;
            }
            let mut matched = true;
            for (col, expected) in conditions {
                if !cells_match(&self.cell_value(id, *col)?, expected) {
                    matched = false;
                    break;
                }
            }
            if matched {
                found.push(id);
            }
        }

        debug!(
            "find_rows scanned {} for {} conditions, {} found",
            self.source_name(),
            conditions.len(),
            found.len()
        );
        Ok(found)
    }
}

/// Equality with null matching null, as SQL's `IS`
pub fn cells_match(a: &CellValue, b: &CellValue) -> bool {
    match (a.is_null(), b.is_null()) {
        (true, true) => true,
        (false, false) => a.compare(b) == Some(Ordering::Equal),
        _ => false,
    }
}

/// Access mode of a backend's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    ReadOnly,
    Write,
}

/// A row store that can run SQL against the table it exposes
pub trait QueryBackend: DataSourceAdapter {
    /// View of this backend as a plain adapter
    fn as_adapter(&self) -> &dyn DataSourceAdapter;

    /// Unquoted name of the projected table
    fn table_name(&self) -> String;

    /// SQL expression yielding the row id, e.g. a quoted key column or `rowid`
    fn key_column_sql(&self) -> String;

    fn escape_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn escape_literal(&self, value: &CellValue) -> String {
        match value {
            CellValue::Null => "NULL".to_string(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Real(f) if f.is_finite() => format!("{:?}", f),
            CellValue::Real(_) => "NULL".to_string(),
            CellValue::Text(_) | CellValue::DateTime(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }

    fn connection_mode(&self) -> ConnectionMode;

    /// Incremented every time the connection is reopened
    fn connection_epoch(&self) -> u64;

    fn open_read_only(&self) -> Result<()>;

    fn open_write(&self) -> Result<()>;

    /// Run the statements in one transaction, rolling back if any fails
    fn execute_transacted(&self, statements: &[String]) -> Result<()>;

    /// Run a query and collect every row
    fn query_rows(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>>;

    /// Whether a table exists in the main (or temp) schema
    fn table_exists(&self, name: &str, temporary: bool) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        ids: Vec<SourceRowId>,
        cells: Vec<Vec<CellValue>>,
    }

    impl DataSourceAdapter for Fixed {
        fn source_name(&self) -> String {
            "fixed".into()
        }

        fn row_count(&self) -> Result<usize> {
            Ok(self.ids.len())
        }

        fn columns(&self) -> Vec<ColumnDescriptor> {
            vec![
                ColumnDescriptor::new("Name", ColumnKind::Text),
                ColumnDescriptor::new("size", ColumnKind::Integer),
            ]
        }

        fn row_ids(&self) -> Result<Vec<SourceRowId>> {
            Ok(self.ids.clone())
        }

        fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue> {
            let pos = self
                .ids
                .iter()
                .position(|i| *i == id)
                .ok_or(ProjectionError::unknown_id(id))?;
            self.cells[pos]
                .get(col)
                .cloned()
                .ok_or(ProjectionError::InvalidColumn(col))
        }

        fn primary_key_column(&self) -> Option<String> {
            None
        }
    }

    fn fixed() -> Fixed {
        Fixed {
            ids: vec![SourceRowId(7), SourceRowId(3), SourceRowId(5)],
            cells: vec![
                vec!["a".into(), CellValue::Integer(1)],
                vec!["b".into(), CellValue::Null],
                vec!["a".into(), CellValue::Integer(1)],
            ],
        }
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let source = fixed();
        assert_eq!(source.column_index("name"), Some(0));
        assert_eq!(source.column_index("SIZE"), Some(1));
        assert_eq!(source.column_index("other"), None);
        assert_eq!(source.column_kind(1).unwrap(), ColumnKind::Integer);
        assert_eq!(source.column(2), Err(ProjectionError::InvalidColumn(2)));
    }

    #[test]
    fn test_default_find_rows_returns_lowest_ids_first() {
        let source = fixed();
        let found = source
            .find_rows(&[(0, "a".into()), (1, CellValue::Integer(1))], 10)
            .unwrap();
        assert_eq!(found, vec![SourceRowId(5), SourceRowId(7)]);

        let limited = source.find_rows(&[(0, "a".into())], 1).unwrap();
        assert_eq!(limited, vec![SourceRowId(5)]);

        let nulls = source.find_rows(&[(1, CellValue::Null)], 10).unwrap();
        assert_eq!(nulls, vec![SourceRowId(3)]);
    }

    #[test]
    fn test_find_rows_rejects_unknown_column() {
        assert_eq!(
            fixed().find_rows(&[(9, CellValue::Null)], 1),
            Err(ProjectionError::InvalidColumn(9))
        );
    }
}
