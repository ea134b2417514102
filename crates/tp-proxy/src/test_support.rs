//! Fixtures shared by the unit tests
//!
//! The scenario table has ids 10..=50 and these columns:
//!
//! | col | name  | values                          |
//! |-----|-------|---------------------------------|
//! | 0   | id    | 10, 20, 30, 40, 50              |
//! | 1   | value | 5, 1, 4, 2, 3                   |
//! | 2   | name  | Oak, ash, Elm, birch, Pine      |
//! | 3   | group | b, a, b, a, b                   |
//! | 4   | area  | 1.5, NULL, 2.5, 4.0, NULL       |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use tp_core::{
    ArtifactScope, CellValue, ColumnDescriptor, ColumnKind, ConnectionMode, DataSourceAdapter,
    MappingSettings, ProjectionError, ProjectionSettings, QueryBackend, Result, SourceRowId,
};
use tp_data::{MemorySource, SqliteSource};

use crate::backend::SourceHandle;
use crate::projection::Projection;

const IDS: [i64; 5] = [10, 20, 30, 40, 50];
const VALUES: [i64; 5] = [5, 1, 4, 2, 3];
const NAMES: [&str; 5] = ["Oak", "ash", "Elm", "birch", "Pine"];
const GROUPS: [&str; 5] = ["b", "a", "b", "a", "b"];
const AREAS: [Option<f64>; 5] = [Some(1.5), None, Some(2.5), Some(4.0), None];

pub fn scenario_memory() -> Arc<MemorySource> {
    let columns = vec![
        (
            ColumnDescriptor::new("id", ColumnKind::Integer),
            IDS.iter().map(|&i| CellValue::Integer(i)).collect(),
        ),
        (
            ColumnDescriptor::new("value", ColumnKind::Integer),
            VALUES.iter().map(|&v| CellValue::Integer(v)).collect(),
        ),
        (
            ColumnDescriptor::new("name", ColumnKind::Text),
            NAMES.iter().map(|&n| CellValue::from(n)).collect(),
        ),
        (
            ColumnDescriptor::new("group", ColumnKind::Text),
            GROUPS.iter().map(|&g| CellValue::from(g)).collect(),
        ),
        (
            ColumnDescriptor::new("area", ColumnKind::Real),
            AREAS.iter().map(|a| a.map_or(CellValue::Null, CellValue::Real)).collect(),
        ),
    ];
    Arc::new(MemorySource::from_columns("scenario", columns, Some("id")).unwrap())
}

pub fn scenario_sqlite() -> (TempDir, Arc<SqliteSource>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.sqlite");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE scenario (id INTEGER PRIMARY KEY, value INTEGER, name TEXT, \"group\" TEXT, area REAL)",
    )
    .unwrap();
    for i in 0..IDS.len() {
        conn.execute(
            "INSERT INTO scenario VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![IDS[i], VALUES[i], NAMES[i], GROUPS[i], AREAS[i]],
        )
        .unwrap();
    }
    drop(conn);

    let source = SqliteSource::open(&path, "scenario").unwrap();
    (dir, Arc::new(source))
}

fn with_scope(scope: ArtifactScope) -> ProjectionSettings {
    ProjectionSettings {
        mapping: MappingSettings {
            scope,
            ..MappingSettings::default()
        },
        ..ProjectionSettings::default()
    }
}

/// Run `check` on a scenario projection over each backend
pub fn each_backend(mut check: impl FnMut(&mut Projection)) {
    let mut memory = Projection::new(ProjectionSettings::default()).unwrap();
    memory.attach(SourceHandle::Memory(scenario_memory())).unwrap();
    check(&mut memory);

    for scope in [ArtifactScope::Session, ArtifactScope::Persistent] {
        let (_dir, source) = scenario_sqlite();
        let mut query = Projection::new(with_scope(scope)).unwrap();
        query.attach(SourceHandle::Query(source)).unwrap();
        check(&mut query);
    }
}

pub fn ids(raw: &[i64]) -> Vec<SourceRowId> {
    raw.iter().copied().map(SourceRowId).collect()
}

/// Adapter whose cell reads can be made to fail
pub struct BrokenCells {
    inner: Arc<dyn DataSourceAdapter>,
    failing: AtomicBool,
}

impl BrokenCells {
    pub fn new(inner: Arc<dyn DataSourceAdapter>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DataSourceAdapter for BrokenCells {
    fn source_name(&self) -> String {
        self.inner.source_name()
    }

    fn row_count(&self) -> Result<usize> {
        self.inner.row_count()
    }

    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.inner.columns()
    }

    fn row_ids(&self) -> Result<Vec<SourceRowId>> {
        self.inner.row_ids()
    }

    fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProjectionError::QueryFailed("cell read failed".into()));
        }
        self.inner.cell_value(id, col)
    }

    fn primary_key_column(&self) -> Option<String> {
        self.inner.primary_key_column()
    }
}

/// SQLite backend whose transactions can be made to fail on their last
/// statement
pub struct FailingBackend {
    inner: Arc<SqliteSource>,
    armed: AtomicBool,
}

impl FailingBackend {
    pub fn new(inner: Arc<SqliteSource>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
        }
    }

    pub fn arm(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl DataSourceAdapter for FailingBackend {
    fn source_name(&self) -> String {
        self.inner.source_name()
    }

    fn row_count(&self) -> Result<usize> {
        self.inner.row_count()
    }

    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.inner.columns()
    }

    fn row_ids(&self) -> Result<Vec<SourceRowId>> {
        self.inner.row_ids()
    }

    fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue> {
        self.inner.cell_value(id, col)
    }

    fn primary_key_column(&self) -> Option<String> {
        self.inner.primary_key_column()
    }

    fn find_rows(&self, conditions: &[(usize, CellValue)], limit: usize) -> Result<Vec<SourceRowId>> {
        self.inner.find_rows(conditions, limit)
    }
}

impl QueryBackend for FailingBackend {
    fn as_adapter(&self) -> &dyn DataSourceAdapter {
        self
    }

    fn table_name(&self) -> String {
        self.inner.table_name()
    }

    fn key_column_sql(&self) -> String {
        self.inner.key_column_sql()
    }

    fn connection_mode(&self) -> ConnectionMode {
        self.inner.connection_mode()
    }

    fn connection_epoch(&self) -> u64 {
        self.inner.connection_epoch()
    }

    fn open_read_only(&self) -> Result<()> {
        self.inner.open_read_only()
    }

    fn open_write(&self) -> Result<()> {
        self.inner.open_write()
    }

    fn execute_transacted(&self, statements: &[String]) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            let mut statements = statements.to_vec();
            statements.push("SELECT * FROM no_such_table".to_string());
            return self.inner.execute_transacted(&statements);
        }
        self.inner.execute_transacted(statements)
    }

    fn query_rows(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>> {
        self.inner.query_rows(sql, params)
    }

    fn table_exists(&self, name: &str, temporary: bool) -> Result<bool> {
        self.inner.table_exists(name, temporary)
    }
}
