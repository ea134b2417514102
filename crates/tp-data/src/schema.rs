use ahash::AHashSet;
use tp_core::value::parse_datetime;
use tp_core::{ColumnDescriptor, ColumnKind};

use crate::config::NullConfig;

/// Infers column kinds from sampled text cells
pub struct SchemaDetector {
    sample_size: usize,
    nulls: NullConfig,
}

/// Information about a detected schema
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub columns: Vec<ColumnDescriptor>,
    pub column_stats: Vec<ColumnStats>,
    /// First integer column that is unique and never null in the sample
    pub suggested_key_column: Option<String>,
}

/// Statistics about a sampled column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnStats {
    pub null_count: usize,
    pub distinct_count: usize,
    pub is_unique: bool,
    pub is_sorted: bool,
}

impl SchemaDetector {
    pub fn new() -> Self {
        Self {
            sample_size: 1000,
            nulls: NullConfig::default(),
        }
    }

    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size.max(1);
        self
    }

    pub fn with_nulls(mut self, nulls: NullConfig) -> Self {
        self.nulls = nulls;
        self
    }

    /// Detect the schema from sample rows; only the first `sample_size` rows
    /// are inspected
    pub fn detect_from_samples(&self, headers: &[String], samples: &[Vec<String>]) -> SchemaInfo {
        let samples = &samples[..samples.len().min(self.sample_size)];

        let mut columns = Vec::with_capacity(headers.len());
        let mut column_stats = Vec::with_capacity(headers.len());
        let mut suggested_key_column = None;

        for (col_idx, header) in headers.iter().enumerate() {
            let (kind, stats) = self.analyze_column(samples, col_idx);

            if suggested_key_column.is_none() && Self::is_good_key_column(kind, &stats) {
                suggested_key_column = Some(header.clone());
            }

            columns.push(ColumnDescriptor::new(header.clone(), kind));
            column_stats.push(stats);
        }

        SchemaInfo {
            columns,
            column_stats,
            suggested_key_column,
        }
    }

    fn analyze_column(&self, samples: &[Vec<String>], col_idx: usize) -> (ColumnKind, ColumnStats) {
        let mut null_count = 0;
        let mut values = Vec::new();
        let mut is_int = true;
        let mut is_float = true;
        let mut is_datetime = true;

        for row in samples {
            match row.get(col_idx) {
                Some(value) if !self.nulls.is_null(value) => {
                    let value = value.trim();
                    if is_int && value.parse::<i64>().is_err() {
                        is_int = false;
                    }
                    if is_float && value.parse::<f64>().is_err() {
                        is_float = false;
                    }
                    if is_datetime && parse_datetime(value).is_none() {
                        is_datetime = false;
                    }
                    values.push(value);
                }
                _ => null_count += 1,
            }
        }

        // an all-null column stays text
        let kind = if values.is_empty() {
            ColumnKind::Text
        } else if is_int {
            ColumnKind::Integer
        } else if is_float {
            ColumnKind::Real
        } else if is_datetime {
            ColumnKind::DateTime
        } else {
            ColumnKind::Text
        };

        let distinct_count = values.iter().collect::<AHashSet<_>>().len();
        let is_unique = distinct_count == values.len();
        let is_sorted = kind == ColumnKind::Integer
            && values
                .iter()
                .filter_map(|v| v.parse::<i64>().ok())
                .collect::<Vec<_>>()
                .windows(2)
                .all(|w| w[0] <= w[1]);

        let stats = ColumnStats {
            null_count,
            distinct_count,
            is_unique,
            is_sorted,
        };

        (kind, stats)
    }

    fn is_good_key_column(kind: ColumnKind, stats: &ColumnStats) -> bool {
        kind == ColumnKind::Integer && stats.null_count == 0 && stats.is_unique && stats.distinct_count > 0
    }
}

impl Default for SchemaDetector {
    fn default() -> Self {
        Self::new()
    }
}
