//! In-memory column store backed by arrow arrays

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{
    Array, ArrayRef, AsArray, Float64Builder, Int64Builder, StringBuilder,
    TimestampMillisecondBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, TimeUnit, TimestampMillisecondType};
use arrow::record_batch::RecordBatch;
use arrow::temporal_conversions::timestamp_ms_to_datetime;
use csv::ReaderBuilder;
use tracing::{debug, info, warn};

use tp_core::value::parse_datetime;
use tp_core::{
    CellValue, ColumnDescriptor, ColumnKind, DataSourceAdapter, ProjectionError, Result,
    SourceRowId,
};

use crate::config::CsvOptions;
use crate::schema::SchemaDetector;
use crate::DataError;

/// Read-only table held as one arrow array per column
///
/// Arrays are normalised on construction so every column of a given
/// [`ColumnKind`] has a single physical type.
pub struct MemorySource {
    name: String,
    descriptors: Vec<ColumnDescriptor>,
    arrays: Vec<ArrayRef>,
    ids: Vec<SourceRowId>,
    positions: AHashMap<SourceRowId, usize>,
    key_column: Option<String>,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("columns", &self.descriptors)
            .field("rows", &self.ids.len())
            .field("key_column", &self.key_column)
            .finish()
    }
}

impl MemorySource {
    /// Wrap a record batch
    ///
    /// `key_column`, when given, must be an integer column without nulls or
    /// duplicates; its values become the row ids. Otherwise rows are
    /// identified by position.
    pub fn from_batch(
        name: impl Into<String>,
        batch: &RecordBatch,
        key_column: Option<&str>,
    ) -> Result<Self, DataError> {
        let schema = batch.schema();
        let mut descriptors = Vec::with_capacity(schema.fields().len());
        let mut arrays = Vec::with_capacity(schema.fields().len());

        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let (kind, target) = normalized_type(field.data_type());
            let array = if array.data_type() == &target {
                array.clone()
            } else {
                cast(array, &target)?
            };
            descriptors.push(ColumnDescriptor::new(field.name().clone(), kind));
            arrays.push(array);
        }

        let row_count = batch.num_rows();
        let (ids, key_column): (Vec<SourceRowId>, Option<String>) = match key_column {
            Some(name) => {
                let col = descriptors
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| DataError::InvalidKey(format!("no column named '{}'", name)))?;
                if descriptors[col].kind != ColumnKind::Integer {
                    return Err(DataError::InvalidKey(format!(
                        "column '{}' is not an integer column",
                        descriptors[col].name
                    )));
                }
                let values = arrays[col]
                    .as_primitive_opt::<Int64Type>()
                    .ok_or_else(|| DataError::Other("key column was not normalised".into()))?;
                if values.null_count() > 0 {
                    return Err(DataError::InvalidKey(format!(
                        "column '{}' contains nulls",
                        descriptors[col].name
                    )));
                }
                let ids = values.values().iter().map(|v| SourceRowId(*v)).collect();
                (ids, Some(descriptors[col].name.clone()))
            }
            None => ((0..row_count as i64).map(SourceRowId).collect(), None),
        };

        let mut positions = AHashMap::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            if positions.insert(*id, position).is_some() {
                return Err(DataError::InvalidKey(format!(
                    "duplicate key {} in column '{}'",
                    id,
                    key_column.as_deref().unwrap_or_default()
                )));
            }
        }

        let source = Self {
            name: name.into(),
            descriptors,
            arrays,
            ids,
            positions,
            key_column,
        };
        debug!(
            "Built in-memory source {} with {} rows and {} columns",
            source.name,
            row_count,
            source.descriptors.len()
        );
        Ok(source)
    }

    /// Build a table from typed columns
    pub fn from_columns(
        name: impl Into<String>,
        columns: Vec<(ColumnDescriptor, Vec<CellValue>)>,
        key_column: Option<&str>,
    ) -> Result<Self, DataError> {
        if columns.is_empty() {
            return Err(DataError::SchemaDetection("a table needs at least one column".into()));
        }
        let row_count = columns[0].1.len();

        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays = Vec::with_capacity(columns.len());
        for (descriptor, values) in columns {
            if values.len() != row_count {
                return Err(DataError::SchemaDetection(format!(
                    "column '{}' has {} values, expected {}",
                    descriptor.name,
                    values.len(),
                    row_count
                )));
            }
            arrays.push(build_array(&descriptor, values)?);
            fields.push(Field::new(descriptor.name, arrow_type(descriptor.kind), true));
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Self::from_batch(name, &batch, key_column)
    }

    /// Import a delimited text file, inferring column kinds from a sample
    pub fn from_csv(path: impl AsRef<Path>, options: &CsvOptions) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = ReaderBuilder::new()
            .delimiter(options.delimiter)
            .has_headers(options.has_headers)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let mut headers: Vec<String> = if options.has_headers {
            reader.headers()?.iter().map(|h| h.trim().to_string()).collect()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        while headers.len() < width {
            headers.push(format!("column_{}", headers.len() + 1));
        }
        if headers.is_empty() {
            return Err(DataError::SchemaDetection(format!("{} has no columns", path.display())));
        }

        let info = SchemaDetector::new()
            .with_sample_size(options.sample_size)
            .with_nulls(options.nulls.clone())
            .detect_from_samples(&headers, &rows);

        let mut fields = Vec::with_capacity(info.columns.len());
        let mut arrays = Vec::with_capacity(info.columns.len());
        for (col, descriptor) in info.columns.iter().enumerate() {
            let mut rejected = 0usize;
            let values = rows
                .iter()
                .map(|row| match row.get(col) {
                    Some(text) if !options.nulls.is_null(text) => {
                        let value = parse_cell(text, descriptor.kind);
                        if value.is_null() {
                            rejected += 1;
                        }
                        value
                    }
                    _ => CellValue::Null,
                })
                .collect::<Vec<_>>();
            if rejected > 0 {
                warn!(
                    "{} values in column '{}' are not {:?} and were read as null",
                    rejected, descriptor.name, descriptor.kind
                );
            }
            arrays.push(build_array(descriptor, values)?);
            fields.push(Field::new(descriptor.name.clone(), arrow_type(descriptor.kind), true));
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let source = match (&options.key_column, &info.suggested_key_column) {
            (Some(key), _) => Self::from_batch(name, &batch, Some(key))?,
            (None, Some(suggested)) if options.detect_key => {
                match Self::from_batch(name.clone(), &batch, Some(suggested)) {
                    Ok(source) => source,
                    Err(DataError::InvalidKey(reason)) => {
                        debug!("Not using '{}' as key column: {}", suggested, reason);
                        Self::from_batch(name, &batch, None)?
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => Self::from_batch(name, &batch, None)?,
        };

        info!(
            "Loaded {} rows from {} (key column: {})",
            source.ids.len(),
            path.display(),
            source.key_column.as_deref().unwrap_or("<position>")
        );
        Ok(source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn position(&self, id: SourceRowId) -> Result<usize> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(ProjectionError::unknown_id(id))
    }
}

impl DataSourceAdapter for MemorySource {
    fn source_name(&self) -> String {
        self.name.clone()
    }

    fn row_count(&self) -> Result<usize> {
        Ok(self.ids.len())
    }

    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.descriptors.clone()
    }

    fn column_count(&self) -> usize {
        self.descriptors.len()
    }

    fn column(&self, col: usize) -> Result<ColumnDescriptor> {
        self.descriptors
            .get(col)
            .cloned()
            .ok_or(ProjectionError::InvalidColumn(col))
    }

    fn row_ids(&self) -> Result<Vec<SourceRowId>> {
        Ok(self.ids.clone())
    }

    fn cell_value(&self, id: SourceRowId, col: usize) -> Result<CellValue> {
        let row = self.position(id)?;
        let array = self.arrays.get(col).ok_or(ProjectionError::InvalidColumn(col))?;
        read_cell(array, self.descriptors[col].kind, row)
    }

    fn primary_key_column(&self) -> Option<String> {
        self.key_column.clone()
    }
}

/// Kind and physical arrow type a column is normalised to
fn normalized_type(data_type: &DataType) -> (ColumnKind, DataType) {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => (ColumnKind::Integer, DataType::Int64),
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => (ColumnKind::Real, DataType::Float64),
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            (ColumnKind::DateTime, arrow_type(ColumnKind::DateTime))
        }
        _ => (ColumnKind::Text, DataType::Utf8),
    }
}

fn arrow_type(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Integer => DataType::Int64,
        ColumnKind::Real => DataType::Float64,
        ColumnKind::Text => DataType::Utf8,
        ColumnKind::DateTime => DataType::Timestamp(TimeUnit::Millisecond, None),
    }
}

fn parse_cell(text: &str, kind: ColumnKind) -> CellValue {
    let text = text.trim();
    match kind {
        ColumnKind::Integer => text.parse().map(CellValue::Integer).unwrap_or_default(),
        ColumnKind::Real => text.parse().map(CellValue::Real).unwrap_or_default(),
        ColumnKind::DateTime => parse_datetime(text).map(CellValue::DateTime).unwrap_or_default(),
        ColumnKind::Text => CellValue::Text(text.to_string()),
    }
}

fn build_array(descriptor: &ColumnDescriptor, values: Vec<CellValue>) -> Result<ArrayRef, DataError> {
    let mismatch = |value: &CellValue| {
        DataError::SchemaDetection(format!(
            "value '{}' does not fit {:?} column '{}'",
            value, descriptor.kind, descriptor.name
        ))
    };

    let array: ArrayRef = match descriptor.kind {
        ColumnKind::Integer => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for value in values {
                match value.coerce(ColumnKind::Integer) {
                    CellValue::Null => builder.append_null(),
                    CellValue::Integer(i) => builder.append_value(i),
                    other => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Real => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for value in values {
                match value.coerce(ColumnKind::Real) {
                    CellValue::Null => builder.append_null(),
                    CellValue::Real(f) => builder.append_value(f),
                    other => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnKind::DateTime => {
            let mut builder = TimestampMillisecondBuilder::with_capacity(values.len());
            for value in values {
                match value.coerce(ColumnKind::DateTime) {
                    CellValue::Null => builder.append_null(),
                    CellValue::DateTime(dt) => builder.append_value(dt.and_utc().timestamp_millis()),
                    other => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Text => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    CellValue::Null => builder.append_null(),
                    other => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

fn read_cell(array: &ArrayRef, kind: ColumnKind, row: usize) -> Result<CellValue> {
    if array.is_null(row) {
        return Ok(CellValue::Null);
    }
    let unexpected = || ProjectionError::QueryFailed(format!("column is not stored as {:?}", kind));

    let value = match kind {
        ColumnKind::Integer => {
            CellValue::Integer(array.as_primitive_opt::<Int64Type>().ok_or_else(unexpected)?.value(row))
        }
        ColumnKind::Real => {
            CellValue::Real(array.as_primitive_opt::<Float64Type>().ok_or_else(unexpected)?.value(row))
        }
        ColumnKind::DateTime => {
            let millis = array
                .as_primitive_opt::<TimestampMillisecondType>()
                .ok_or_else(unexpected)?
                .value(row);
            timestamp_ms_to_datetime(millis)
                .map(CellValue::DateTime)
                .unwrap_or_default()
        }
        ColumnKind::Text => CellValue::Text(
            array
                .as_string_opt::<i32>()
                .ok_or_else(unexpected)?
                .value(row)
                .to_string(),
        ),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BooleanArray, Int32Array, StringArray};
    use std::io::Write;

    #[test]
    fn test_from_columns_with_key() {
        let source = MemorySource::from_columns(
            "parcels",
            vec![
                (
                    ColumnDescriptor::new("id", ColumnKind::Integer),
                    vec![CellValue::Integer(10), CellValue::Integer(20), CellValue::Integer(30)],
                ),
                (
                    ColumnDescriptor::new("area", ColumnKind::Real),
                    vec![CellValue::Real(1.5), CellValue::Null, CellValue::Integer(2)],
                ),
            ],
            Some("id"),
        )
        .unwrap();

        assert_eq!(source.row_ids().unwrap(), vec![SourceRowId(10), SourceRowId(20), SourceRowId(30)]);
        assert_eq!(source.primary_key_column().as_deref(), Some("id"));
        assert_eq!(source.cell_value(SourceRowId(30), 1).unwrap(), CellValue::Real(2.0));
        assert_eq!(source.cell_value(SourceRowId(20), 1).unwrap(), CellValue::Null);
        assert!(matches!(
            source.cell_value(SourceRowId(99), 0),
            Err(ProjectionError::InvalidRow { row: 99, .. })
        ));
        assert_eq!(source.cell_value(SourceRowId(10), 5), Err(ProjectionError::InvalidColumn(5)));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let result = MemorySource::from_columns(
            "dup",
            vec![(ColumnDescriptor::new("id", ColumnKind::Integer), vec![CellValue::Integer(1), CellValue::Integer(1)])],
            Some("id"),
        );
        assert!(matches!(result, Err(DataError::InvalidKey(_))));
    }

    #[test]
    fn test_from_batch_normalises_types() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("small", DataType::Int32, true),
            Field::new("flag", DataType::Boolean, true),
            Field::new("label", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(3), None])),
                Arc::new(BooleanArray::from(vec![true, false])),
                Arc::new(StringArray::from(vec!["x", "y"])),
            ],
        )
        .unwrap();

        let source = MemorySource::from_batch("batch", &batch, None).unwrap();
        let kinds: Vec<_> = source.columns().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ColumnKind::Integer, ColumnKind::Integer, ColumnKind::Text]);
        assert_eq!(source.row_ids().unwrap(), vec![SourceRowId(0), SourceRowId(1)]);
        assert_eq!(source.cell_value(SourceRowId(0), 0).unwrap(), CellValue::Integer(3));
        assert_eq!(source.cell_value(SourceRowId(1), 0).unwrap(), CellValue::Null);
        assert_eq!(source.cell_value(SourceRowId(0), 1).unwrap(), CellValue::Integer(1));
        assert_eq!(source.cell_value(SourceRowId(1), 2).unwrap(), CellValue::Text("y".into()));
    }

    #[test]
    fn test_from_csv_detects_kinds_and_key() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "fid,name,area,surveyed").unwrap();
        writeln!(file, "7,north,12.5,2020-05-01").unwrap();
        writeln!(file, "3,south,N/A,2021-06-02 08:30:00").unwrap();
        writeln!(file, "5,east,4,").unwrap();
        file.flush().unwrap();

        let source = MemorySource::from_csv(file.path(), &CsvOptions::default()).unwrap();
        let kinds: Vec<_> = source.columns().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ColumnKind::Integer, ColumnKind::Text, ColumnKind::Real, ColumnKind::DateTime]
        );
        assert_eq!(source.primary_key_column().as_deref(), Some("fid"));
        assert_eq!(source.row_ids().unwrap(), vec![SourceRowId(7), SourceRowId(3), SourceRowId(5)]);
        assert_eq!(source.cell_value(SourceRowId(3), 2).unwrap(), CellValue::Null);
        assert_eq!(
            source.cell_value(SourceRowId(3), 3).unwrap(),
            CellValue::DateTime(parse_datetime("2021-06-02 08:30:00").unwrap())
        );
    }

    #[test]
    fn test_from_csv_falls_back_to_positions() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "a;b").unwrap();
        writeln!(file, "x;1").unwrap();
        writeln!(file, "y;1").unwrap();
        file.flush().unwrap();

        let options = CsvOptions::default().with_delimiter(b';');
        let source = MemorySource::from_csv(file.path(), &options).unwrap();
        assert_eq!(source.primary_key_column(), None);
        assert_eq!(source.row_ids().unwrap(), vec![SourceRowId(0), SourceRowId(1)]);

        let explicit = MemorySource::from_csv(file.path(), &options.with_key_column("b"));
        assert!(matches!(explicit, Err(DataError::InvalidKey(_))));
    }
}
