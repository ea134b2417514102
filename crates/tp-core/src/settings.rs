//! Projection configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProjectionError, Result};

/// Whether equal sort keys keep their previous relative order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortStability {
    /// In-place partition sort; equal keys may be reordered
    #[default]
    Unstable,
    /// Equal keys keep their order; the query backend adds the row key as a
    /// secondary sort term
    Stable,
}

/// Lifetime of the query backend's mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactScope {
    /// Regular table, rebuilt under write mode; survives reconnects
    #[default]
    Persistent,
    /// `TEMP` table on the current connection; lost when it is cycled
    Session,
}

/// Mapping table settings for the query backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    pub scope: ArtifactScope,
    /// Prepended to the source table name to form the mapping table name
    pub table_prefix: String,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            scope: ArtifactScope::default(),
            table_prefix: "_tp_map_".to_string(),
        }
    }
}

/// Settings shared by both projection backends
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSettings {
    pub sort_stability: SortStability,
    pub mapping: MappingSettings,
    /// Upper bound on the columns used to identify a row without a primary
    /// key; `None` allows every column
    pub composite_key_columns: Option<usize>,
}

impl ProjectionSettings {
    /// Parse settings from JSON; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)
            .map_err(|e| ProjectionError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ProjectionError::InvalidSettings(e.to_string()))
    }

    /// Reject values that cannot be used to build SQL identifiers or keys
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.mapping.table_prefix;
        if prefix.is_empty() {
            return Err(ProjectionError::InvalidSettings(
                "mapping.table_prefix must not be empty".into(),
            ));
        }
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ProjectionError::InvalidSettings(format!(
                "mapping.table_prefix {:?} may only contain ASCII letters, digits and '_'",
                prefix
            )));
        }
        if self.composite_key_columns == Some(0) {
            return Err(ProjectionError::InvalidSettings(
                "composite_key_columns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProjectionSettings::default();
        assert_eq!(settings.sort_stability, SortStability::Unstable);
        assert_eq!(settings.mapping.scope, ArtifactScope::Persistent);
        assert_eq!(settings.mapping.table_prefix, "_tp_map_");
        assert_eq!(settings.composite_key_columns, None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings =
            ProjectionSettings::from_json(r#"{"sort_stability": "stable", "mapping": {"scope": "session"}}"#)
                .unwrap();
        assert_eq!(settings.sort_stability, SortStability::Stable);
        assert_eq!(settings.mapping.scope, ArtifactScope::Session);
        assert_eq!(settings.mapping.table_prefix, "_tp_map_");
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = ProjectionSettings {
            composite_key_columns: Some(3),
            ..Default::default()
        };
        std::fs::write(&path, settings.to_json().unwrap()).unwrap();
        assert_eq!(ProjectionSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let err = ProjectionSettings::from_json(r#"{"mapping": {"table_prefix": "x; DROP"}}"#).unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidSettings(_)));
        assert!(ProjectionSettings::from_json("not json").is_err());
        assert!(matches!(
            ProjectionSettings::load("/definitely/not/here.json"),
            Err(ProjectionError::Io(_))
        ));
    }
}
