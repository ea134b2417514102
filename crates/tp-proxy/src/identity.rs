//! Identifying a clicked row in a store without a primary key
//!
//! Rows are matched on their displayed values, adding one column at a time
//! until exactly one row matches. Fully duplicated rows cannot be told apart;
//! the lowest matching id is chosen and the outcome says so.

use tracing::{debug, warn};

use tp_core::{CellValue, DataSourceAdapter, ProjectionError, Result, SourceRowId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIdentity {
    /// The store has a primary key
    Key(SourceRowId),
    /// The values of `columns` single out the row
    Composite { id: SourceRowId, columns: Vec<String> },
    /// `candidates` rows share the values of every column tried
    Ambiguous {
        chosen: SourceRowId,
        candidates: usize,
        columns: Vec<String>,
    },
}

impl RowIdentity {
    /// The row the identity resolved to
    pub fn id(&self) -> SourceRowId {
        match self {
            RowIdentity::Key(id) => *id,
            RowIdentity::Composite { id, .. } => *id,
            RowIdentity::Ambiguous { chosen, .. } => *chosen,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RowIdentity::Ambiguous { .. })
    }

    /// The ambiguity as an error value, for callers that record it
    pub fn ambiguity(&self) -> Option<ProjectionError> {
        match self {
            RowIdentity::Ambiguous {
                chosen, candidates, ..
            } => Some(ProjectionError::AmbiguousRowIdentity {
                chosen: *chosen,
                candidates: *candidates,
            }),
            _ => None,
        }
    }
}

/// Resolve the identity of row `id`
///
/// `max_columns` caps how many leading columns are compared.
pub fn resolve_row_identity(
    adapter: &dyn DataSourceAdapter,
    id: SourceRowId,
    max_columns: Option<usize>,
) -> Result<RowIdentity> {
    if adapter.primary_key_column().is_some() {
        return Ok(RowIdentity::Key(id));
    }

    let column_count = max_columns.map_or(adapter.column_count(), |max| max.min(adapter.column_count()));
    let mut conditions: Vec<(usize, CellValue)> = Vec::with_capacity(column_count);
    let mut columns = Vec::with_capacity(column_count);

    for col in 0..column_count {
        conditions.push((col, adapter.cell_value(id, col)?));
        columns.push(adapter.column_name(col)?);

        let found = adapter.find_rows(&conditions, 2)?;
        if let [only] = found.as_slice() {
            debug!("Row {} identified by {} columns", only, columns.len());
            return Ok(RowIdentity::Composite { id: *only, columns });
        }
    }

    let candidates = adapter.find_rows(&conditions, usize::MAX)?;
    match candidates.as_slice() {
        [] => Ok(RowIdentity::Composite { id, columns }),
        [only] => Ok(RowIdentity::Composite { id: *only, columns }),
        [chosen, ..] => {
            warn!(
                "{} rows of {} match row {} on {} columns, choosing {}",
                candidates.len(),
                adapter.source_name(),
                id,
                columns.len(),
                chosen
            );
            Ok(RowIdentity::Ambiguous {
                chosen: *chosen,
                candidates: candidates.len(),
                columns,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scenario_memory;
    use tp_core::{ColumnDescriptor, ColumnKind};
    use tp_data::{MemorySource, SqliteSource};

    fn keyless() -> MemorySource {
        MemorySource::from_columns(
            "keyless",
            vec![
                (
                    ColumnDescriptor::new("name", ColumnKind::Text),
                    vec!["a".into(), "a".into(), "b".into(), "a".into()],
                ),
                (
                    ColumnDescriptor::new("size", ColumnKind::Integer),
                    vec![
                        CellValue::Integer(1),
                        CellValue::Integer(2),
                        CellValue::Integer(1),
                        CellValue::Integer(1),
                    ],
                ),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_primary_key_short_circuits() {
        let source = scenario_memory();
        assert_eq!(
            resolve_row_identity(source.as_ref(), SourceRowId(30), None).unwrap(),
            RowIdentity::Key(SourceRowId(30))
        );
    }

    #[test]
    fn test_columns_are_added_until_unique() {
        let source = keyless();
        assert_eq!(
            resolve_row_identity(&source, SourceRowId(2), None).unwrap(),
            RowIdentity::Composite {
                id: SourceRowId(2),
                columns: vec!["name".into()]
            }
        );
        assert_eq!(
            resolve_row_identity(&source, SourceRowId(1), None).unwrap(),
            RowIdentity::Composite {
                id: SourceRowId(1),
                columns: vec!["name".into(), "size".into()]
            }
        );
    }

    #[test]
    fn test_duplicates_choose_lowest_id() {
        let source = keyless();
        let identity = resolve_row_identity(&source, SourceRowId(3), None).unwrap();
        assert_eq!(
            identity,
            RowIdentity::Ambiguous {
                chosen: SourceRowId(0),
                candidates: 2,
                columns: vec!["name".into(), "size".into()]
            }
        );
        assert!(identity.is_ambiguous());
        assert_eq!(identity.id(), SourceRowId(0));
        assert_eq!(
            identity.ambiguity(),
            Some(ProjectionError::AmbiguousRowIdentity {
                chosen: SourceRowId(0),
                candidates: 2
            })
        );
    }

    #[test]
    fn test_column_budget_limits_comparison() {
        let source = keyless();
        let identity = resolve_row_identity(&source, SourceRowId(1), Some(1)).unwrap();
        assert_eq!(identity.id(), SourceRowId(0));
        assert!(matches!(identity, RowIdentity::Ambiguous { candidates: 3, .. }));
    }

    #[test]
    fn test_rowid_table_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.sqlite");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE notes (body TEXT, stars INTEGER);
                 INSERT INTO notes VALUES ('x', NULL), ('y', 1), ('x', NULL), ('x', 2);",
            )
            .unwrap();
        let source = SqliteSource::open(&path, "notes").unwrap();

        let identity = resolve_row_identity(&source, SourceRowId(4), None).unwrap();
        assert_eq!(identity.id(), SourceRowId(4));
        assert!(!identity.is_ambiguous());

        // null matches null, so rows 1 and 3 are duplicates
        let identity = resolve_row_identity(&source, SourceRowId(3), None).unwrap();
        assert!(matches!(
            identity,
            RowIdentity::Ambiguous { chosen: SourceRowId(1), candidates: 2, .. }
        ));
    }
}
