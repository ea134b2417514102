//! Import options for delimited text files

use serde::{Deserialize, Serialize};

/// Cell spellings that are read as null
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullConfig {
    pub patterns: Vec<String>,
    pub trim_whitespace: bool,
    pub case_sensitive: bool,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            patterns: ["", "NULL", "N/A", "NA", "NaN", "None", "-"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            trim_whitespace: true,
            case_sensitive: false,
        }
    }
}

impl NullConfig {
    pub fn is_null(&self, value: &str) -> bool {
        let value = if self.trim_whitespace { value.trim() } else { value };
        self.patterns.iter().any(|pattern| {
            if self.case_sensitive {
                value == pattern
            } else {
                value.eq_ignore_ascii_case(pattern)
            }
        })
    }
}

/// How a CSV file is turned into a [`crate::MemorySource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub has_headers: bool,
    /// Rows inspected when inferring column kinds
    pub sample_size: usize,
    pub nulls: NullConfig,
    /// Integer column holding row ids. When unset, a unique integer column
    /// found during schema detection is used if its values turn out unique;
    /// otherwise rows are identified by position.
    pub key_column: Option<String>,
    pub detect_key: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_headers: true,
            sample_size: 1000,
            nulls: NullConfig::default(),
            key_column: None,
            detect_key: true,
        }
    }
}

impl CsvOptions {
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Identify rows by position even if a key column could be detected
    pub fn without_key_detection(mut self) -> Self {
        self.detect_key = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_patterns() {
        let nulls = NullConfig::default();
        assert!(nulls.is_null(""));
        assert!(nulls.is_null("  n/a "));
        assert!(nulls.is_null("null"));
        assert!(!nulls.is_null("0"));

        let strict = NullConfig {
            case_sensitive: true,
            ..Default::default()
        };
        assert!(!strict.is_null("null"));
        assert!(strict.is_null("NULL"));
    }
}
