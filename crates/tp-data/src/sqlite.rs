//! SQLite table exposed as a row store
//!
//! The source owns a single connection. It is opened read-only; writes go
//! through [`SqliteSource::with_write`], which reopens the connection in
//! read-write mode for the duration of one transaction and always returns to
//! read-only afterwards. Every reopen bumps the connection epoch, which lets
//! callers notice that session-scoped state (temporary tables) was lost.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension, Transaction};
use tracing::{debug, error, info};

use tp_core::{
    CellValue, ColumnDescriptor, ColumnKind, ConnectionMode, DataSourceAdapter, ProjectionError,
    QueryBackend, Result, SourceRowId,
};

use crate::DataError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A table in a SQLite database file
pub struct SqliteSource {
    path: PathBuf,
    table: String,
    slot: Mutex<ConnectionSlot>,
    schema: RwLock<TableSchema>,
}

struct ConnectionSlot {
    conn: Option<Connection>,
    mode: ConnectionMode,
    epoch: u64,
}

#[derive(Debug, Clone)]
struct TableSchema {
    columns: Vec<ColumnDescriptor>,
    /// `INTEGER PRIMARY KEY` column, an alias of the rowid
    key_column: Option<String>,
}

impl SqliteSource {
    /// Open `table` in an existing database file
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>) -> Result<Self, DataError> {
        let path = path.as_ref().to_path_buf();
        let table = table.into();

        let conn = open_connection(&path, ConnectionMode::ReadOnly)?;
        let schema = detect_schema(&conn, &table)?;

        info!(
            "Opened SQLite table {} in {} ({} columns, key: {})",
            table,
            path.display(),
            schema.columns.len(),
            schema.key_column.as_deref().unwrap_or("rowid")
        );

        Ok(Self {
            path,
            table,
            slot: Mutex::new(ConnectionSlot {
                conn: Some(conn),
                mode: ConnectionMode::ReadOnly,
                epoch: 0,
            }),
            schema: RwLock::new(schema),
        })
    }

    /// User tables of a database file
    pub fn list_tables(path: impl AsRef<Path>) -> Result<Vec<String>, DataError> {
        let conn = open_connection(path.as_ref(), ConnectionMode::ReadOnly)?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current connection
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, DataError>) -> Result<T, DataError> {
        let slot = self.slot.lock();
        let conn = slot
            .conn
            .as_ref()
            .ok_or_else(|| DataError::Sqlite("connection is closed".into()))?;
        f(conn)
    }

    /// Close the connection and open it again in `mode`
    fn reopen(&self, mode: ConnectionMode) -> Result<(), DataError> {
        let mut slot = self.slot.lock();
        // close first so a write connection never overlaps a reader
        slot.conn = None;
        slot.epoch += 1;
        let conn = open_connection(&self.path, mode)?;
        slot.conn = Some(conn);
        slot.mode = mode;
        debug!("Reopened {} in {:?} mode (epoch {})", self.path.display(), mode, slot.epoch);
        Ok(())
    }

    /// Run `f` in one read-write transaction
    ///
    /// The transaction is rolled back if `f` fails. The connection is back in
    /// read-only mode when this returns, on every path.
    pub fn with_write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        self.reopen(ConnectionMode::Write)?;

        let result = {
            let mut slot = self.slot.lock();
            match slot.conn.as_mut() {
                Some(conn) => run_transaction(conn, f),
                None => Err(DataError::Sqlite("connection is closed".into())),
            }
        };

        let restored = self.reopen(ConnectionMode::ReadOnly);
        if let Err(e) = &result {
            error!("Write transaction on {} rolled back: {}", self.table, e);
        }
        let value = result?;
        restored?;
        Ok(value)
    }

    fn refresh_schema(&self) -> Result<(), DataError> {
        let schema = self.with_conn(|conn| detect_schema(conn, &self.table))?;
        *self.schema.write() = schema;
        Ok(())
    }

    fn key_sql(&self) -> String {
        match &self.schema.read().key_column {
            Some(name) => quote_identifier(name),
            None => "rowid".to_string(),
        }
    }

    fn column_sql(&self, col: usize) -> Result<String> {
        let schema = self.schema.read();
        schema
            .columns
            .get(col)
            .map(|c| quote_identifier(&c.name))
            .ok_or(ProjectionError::InvalidColumn(col))
    }

    /// Append a column to the table
    pub fn add_column(&self, name: &str, kind: ColumnKind) -> Result<(), DataError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_identifier(&self.table),
            quote_identifier(name),
            kind.sql_type()
        );
        self.with_write(|tx| {
            tx.execute_batch(&sql)?;
            Ok(())
        })?;
        self.refresh_schema()
    }

    /// Delete rows by id; returns the number of rows removed
    pub fn delete_rows(&self, ids: &[SourceRowId]) -> Result<usize, DataError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_identifier(&self.table),
            self.key_sql()
        );
        self.with_write(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute([id.get()])?;
            }
            Ok(removed)
        })
    }

    /// Insert a row from named values; unnamed columns take their defaults
    pub fn insert_row(&self, values: &[(&str, CellValue)]) -> Result<SourceRowId, DataError> {
        let table = quote_identifier(&self.table);
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            let names = values
                .iter()
                .map(|(name, _)| quote_identifier(name))
                .collect::<Vec<_>>()
                .join(", ");
            let params = (1..=values.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {} ({}) VALUES ({})", table, names, params)
        };

        self.with_write(|tx| {
            tx.execute(&sql, params_from_iter(values.iter().map(|(_, v)| to_sql(v))))?;
            Ok(SourceRowId(tx.last_insert_rowid()))
        })
    }

    /// Overwrite one cell
    pub fn update_cell(&self, id: SourceRowId, col: usize, value: CellValue) -> Result<(), DataError> {
        let column = self.column_sql(col).map_err(|e| DataError::Other(e.to_string()))?;
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_identifier(&self.table),
            column,
            self.key_sql()
        );
        self.with_write(|tx| {
            let changed = tx.execute(&sql, rusqlite::params![to_sql(&value), id.get()])?;
            if changed == 0 {
                return Err(DataError::Other(format!("no row with id {}", id)));
            }
            Ok(())
        })
    }
}

impl DataSourceAdapter for SqliteSource {
    fn source_name(&self) -> String {
        self.table.clone()
    }

    fn row_count(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&self.table));
        let count = self.with_conn(|conn| Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?))?;
        Ok(count.max(0) as usize)
    }

    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.schema.read().columns.clone()
    }

    fn column_count(&self) -> usize {
        self.schema.read().columns.len()
    }

    fn column(&self, col: usize) -> Result<ColumnDescriptor> {
        self.schema
            .read()
            .columns
            .get(col)
            .cloned()
            .ok_or(ProjectionError::InvalidColumn(col))
    }

    fn row_ids(&self) -> Result<Vec<SourceRowId>> {
        let key = self.key_sql();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            key,
            quote_identifier(&self.table),
            key
        );
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(SourceRowId))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids)
    }

    fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue> {
        let kind = self.column_kind(col)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            self.column_sql(col)?,
            quote_identifier(&self.table),
            self.key_sql()
        );
        let value = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let value = stmt
                .query_row([id.get()], |row| Ok(from_sql(row.get_ref(0)?)))
                .optional()?;
            Ok(value)
        })?;
        value
            .map(|v| v.coerce(kind))
            .ok_or(ProjectionError::unknown_id(id))
    }

    fn primary_key_column(&self) -> Option<String> {
        self.schema.read().key_column.clone()
    }

    fn find_rows(
        &self,
        conditions: &[(usize, CellValue)],
        limit: usize,
    ) -> Result<Vec<SourceRowId>> {
        let mut terms = Vec::with_capacity(conditions.len());
        let mut params = Vec::with_capacity(conditions.len() + 1);
        for (i, (col, value)) in conditions.iter().enumerate() {
            terms.push(format!("{} IS ?{}", self.column_sql(*col)?, i + 1));
            params.push(to_sql(value));
        }
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let key = self.key_sql();
        let filter = if terms.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", terms.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT ?{}",
            key,
            quote_identifier(&self.table),
            filter,
            key,
            params.len()
        );

        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
                .map(|id| id.map(SourceRowId))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids)
    }
}

impl QueryBackend for SqliteSource {
    fn as_adapter(&self) -> &dyn DataSourceAdapter {
        self
    }

    fn table_name(&self) -> String {
        self.table.clone()
    }

    fn key_column_sql(&self) -> String {
        self.key_sql()
    }

    fn escape_identifier(&self, name: &str) -> String {
        quote_identifier(name)
    }

    fn connection_mode(&self) -> ConnectionMode {
        self.slot.lock().mode
    }

    fn connection_epoch(&self) -> u64 {
        self.slot.lock().epoch
    }

    fn open_read_only(&self) -> Result<()> {
        Ok(self.reopen(ConnectionMode::ReadOnly)?)
    }

    fn open_write(&self) -> Result<()> {
        Ok(self.reopen(ConnectionMode::Write)?)
    }

    fn execute_transacted(&self, statements: &[String]) -> Result<()> {
        let mut slot = self.slot.lock();
        let conn = slot
            .conn
            .as_mut()
            .ok_or_else(|| ProjectionError::QueryFailed("connection is closed".into()))?;

        run_transaction(conn, |tx| {
            for statement in statements {
                tx.execute_batch(statement).map_err(|e| {
                    DataError::Sqlite(format!("{} (in: {})", e, statement))
                })?;
            }
            Ok(())
        })
        .map_err(|e| {
            error!("Transaction on {} rolled back: {}", self.table, e);
            ProjectionError::from(e)
        })
    }

    fn query_rows(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(width);
                for i in 0..width {
                    cells.push(from_sql(row.get_ref(i)?));
                }
                out.push(cells);
            }
            Ok(out)
        })?;
        Ok(rows)
    }

    fn table_exists(&self, name: &str, temporary: bool) -> Result<bool> {
        let catalog = if temporary { "sqlite_temp_master" } else { "sqlite_master" };
        let sql = format!("SELECT 1 FROM {} WHERE type = 'table' AND name = ?1", catalog);
        let found = self.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, [name], |_| Ok(()))
                .optional()?
                .is_some())
        })?;
        Ok(found)
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn open_connection(path: &Path, mode: ConnectionMode) -> Result<Connection, DataError> {
    let access = match mode {
        ConnectionMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
        ConnectionMode::Write => OpenFlags::SQLITE_OPEN_READ_WRITE,
    };
    let conn = Connection::open_with_flags(
        path,
        access | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| DataError::Sqlite(format!("Failed to open {}: {}", path.display(), e)))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn run_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, DataError>,
) -> Result<T, DataError> {
    let tx = conn.transaction()?;
    // dropping an uncommitted transaction rolls it back
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn detect_schema(conn: &Connection, table: &str) -> Result<TableSchema, DataError> {
    let mut stmt = conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Err(DataError::SchemaDetection(format!(
            "Table '{}' does not exist or has no columns",
            table
        )));
    }

    let pk_columns: Vec<_> = rows.iter().filter(|(_, _, pk)| *pk > 0).collect();
    let key_column = match pk_columns.as_slice() {
        [(name, declared, _)] if declared.eq_ignore_ascii_case("INTEGER") => Some(name.clone()),
        _ => None,
    };

    if key_column.is_none() {
        let probe = format!("SELECT rowid FROM {} LIMIT 0", quote_identifier(table));
        conn.prepare(&probe).map_err(|_| {
            DataError::InvalidKey(format!(
                "Table '{}' has neither an INTEGER PRIMARY KEY nor a rowid",
                table
            ))
        })?;
    }

    let columns = rows
        .into_iter()
        .map(|(name, declared, _)| ColumnDescriptor::new(name, ColumnKind::from_sql_type(&declared)))
        .collect();

    Ok(TableSchema { columns, key_column })
}

fn to_sql(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Integer(i) => Value::Integer(*i),
        CellValue::Real(f) => Value::Real(*f),
        CellValue::Text(t) => Value::Text(t.clone()),
        CellValue::DateTime(_) => Value::Text(value.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Real(f),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Text(format!("<{} bytes>", b.len())),
    }
}
