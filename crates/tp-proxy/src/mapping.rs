//! Mapping table for the query backend
//!
//! The current proxy order is materialised inside the backing store as a
//! table `(proxy INTEGER PRIMARY KEY, source INTEGER NOT NULL, filtered
//! INTEGER)`, indexed on `source` and `filtered`. Translating a single index
//! is then a point lookup. The table is rebuilt lazily, in one transaction,
//! into a staging table that replaces the previous artifact only on commit.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use tp_core::{
    ArtifactScope, CellValue, EventBus, MappingRebuilt, MappingSettings, ProjectionError,
    QueryBackend, Result, SourceRowId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// No artifact exists; translations fail
    NoMapping,
    /// The artifact matches the recorded sort, filter and hidden rows
    Built,
    /// The artifact is out of date or missing and must be rebuilt first
    Stale,
}

/// What the next rebuild materialises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    /// `ORDER BY` terms producing the proxy order
    pub order_by: String,
    /// Boolean SQL expression selecting the rows of the filter space
    pub passes: String,
    pub hidden: Vec<SourceRowId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingCounts {
    pub proxy_rows: usize,
    pub filtered_rows: usize,
}

pub struct MappingTableManager {
    backend: Arc<dyn QueryBackend>,
    scope: ArtifactScope,
    artifact: String,
    state: MappingState,
    built_epoch: u64,
    counts: MappingCounts,
    events: EventBus,
}

impl MappingTableManager {
    pub fn new(backend: Arc<dyn QueryBackend>, settings: &MappingSettings, events: EventBus) -> Self {
        let artifact = format!("{}{}", settings.table_prefix, backend.table_name());
        Self {
            backend,
            scope: settings.scope,
            artifact,
            state: MappingState::NoMapping,
            built_epoch: 0,
            counts: MappingCounts::default(),
            events,
        }
    }

    pub fn state(&self) -> MappingState {
        self.state
    }

    /// Unquoted name of the mapping table
    pub fn artifact_name(&self) -> &str {
        &self.artifact
    }

    pub fn counts(&self) -> MappingCounts {
        self.counts
    }

    /// Mark the artifact out of date after a sort, filter or visibility change
    pub fn invalidate(&mut self) {
        if self.state == MappingState::Built {
            debug!("Mapping {} is stale", self.artifact);
            self.state = MappingState::Stale;
        }
    }

    /// Detect an artifact lost to a connection cycle
    pub fn check_artifact(&mut self) -> Result<MappingState> {
        if self.state == MappingState::Built && self.backend.connection_epoch() != self.built_epoch {
            if self.artifact_exists()? {
                self.built_epoch = self.backend.connection_epoch();
            } else {
                warn!(
                    "Mapping {} vanished when the connection was reopened",
                    self.artifact
                );
                self.state = MappingState::Stale;
            }
        }
        Ok(self.state)
    }

    /// Materialise `plan`, replacing the current artifact
    ///
    /// On failure the transaction is rolled back and the previous artifact,
    /// if any, is untouched; the state is left as it was.
    pub fn rebuild(&mut self, plan: &RebuildPlan) -> Result<MappingCounts> {
        let start = Instant::now();
        let statements = self.rebuild_statements(plan);

        let result = match self.scope {
            ArtifactScope::Session => self.backend.execute_transacted(&statements),
            ArtifactScope::Persistent => {
                let result = self
                    .backend
                    .open_write()
                    .and_then(|()| self.backend.execute_transacted(&statements));
                let restored = self.backend.open_read_only();
                result.and(restored)
            }
        };
        if let Err(e) = result {
            error!("Rebuilding mapping {} failed: {}", self.artifact, e);
            return Err(e);
        }

        self.state = MappingState::Built;
        self.built_epoch = self.backend.connection_epoch();
        self.counts = self.query_counts()?;

        info!(
            "Rebuilt mapping {} in {:?} ({} rows, {} filtered)",
            self.artifact,
            start.elapsed(),
            self.counts.proxy_rows,
            self.counts.filtered_rows
        );
        self.events.publish(MappingRebuilt {
            table: self.artifact.clone(),
            proxy_rows: self.counts.proxy_rows,
            filtered_rows: self.counts.filtered_rows,
        });
        Ok(self.counts)
    }

    /// Settle the state after a failed rebuild
    ///
    /// An artifact that survived the rollback is current again for the
    /// restored projection state; otherwise there is no mapping.
    pub fn recover(&mut self) -> Result<MappingState> {
        if self.artifact_exists()? {
            self.state = MappingState::Built;
            self.built_epoch = self.backend.connection_epoch();
            self.counts = self.query_counts()?;
        } else {
            self.state = MappingState::NoMapping;
            self.counts = MappingCounts::default();
        }
        debug!("Mapping {} recovered as {:?}", self.artifact, self.state);
        Ok(self.state)
    }

    /// Remove the artifact from the store
    pub fn drop_artifact(&mut self) -> Result<()> {
        let statements = [format!("DROP TABLE IF EXISTS {}", self.qualified(&self.artifact))];
        let result = match self.scope {
            ArtifactScope::Session => self.backend.execute_transacted(&statements),
            ArtifactScope::Persistent => {
                let result = self
                    .backend
                    .open_write()
                    .and_then(|()| self.backend.execute_transacted(&statements));
                let restored = self.backend.open_read_only();
                result.and(restored)
            }
        };
        self.state = MappingState::NoMapping;
        self.counts = MappingCounts::default();
        result
    }

    pub fn filter_to_source(&self, filtered: usize) -> Result<Option<SourceRowId>> {
        let sql = format!("SELECT source FROM {} WHERE filtered = ?1", self.table_sql());
        let rows = self.query(&sql, &[position_param(filtered)])?;
        Ok(rows.first().and_then(|r| r[0].as_i64()).map(SourceRowId))
    }

    pub fn source_to_filter(&self, id: SourceRowId) -> Result<Option<usize>> {
        let sql = format!("SELECT filtered FROM {} WHERE source = ?1", self.table_sql());
        let rows = self.query(&sql, &[CellValue::Integer(id.get())])?;
        Ok(rows
            .first()
            .and_then(|r| r[0].as_i64())
            .and_then(|f| usize::try_from(f).ok()))
    }

    pub fn proxy_to_source(&self, proxy: usize) -> Result<Option<SourceRowId>> {
        let sql = format!("SELECT source FROM {} WHERE proxy = ?1", self.table_sql());
        let rows = self.query(&sql, &[position_param(proxy)])?;
        Ok(rows.first().and_then(|r| r[0].as_i64()).map(SourceRowId))
    }

    /// Row ids in proxy order
    pub fn proxy_order(&self) -> Result<Vec<SourceRowId>> {
        let sql = format!("SELECT source FROM {} ORDER BY proxy", self.table_sql());
        self.ids(&sql, &[])
    }

    /// Row ids in filter order
    pub fn filter_order(&self) -> Result<Vec<SourceRowId>> {
        let sql = format!(
            "SELECT source FROM {} WHERE filtered IS NOT NULL ORDER BY filtered",
            self.table_sql()
        );
        self.ids(&sql, &[])
    }

    /// Ids of filter-space rows for which `passes` holds, in filter order
    pub fn matching_ids(&self, passes: &str) -> Result<Vec<SourceRowId>> {
        let sql = format!(
            "SELECT m.source FROM {map} AS m WHERE m.filtered IS NOT NULL \
             AND m.source IN (SELECT {key} FROM {table} WHERE {passes}) ORDER BY m.filtered",
            map = self.table_sql(),
            key = self.backend.key_column_sql(),
            table = self.backend.escape_identifier(&self.backend.table_name()),
            passes = passes
        );
        self.ids(&sql, &[])
    }

    fn rebuild_statements(&self, plan: &RebuildPlan) -> Vec<String> {
        let staging = format!("{}_staging", self.artifact);
        let key = self.backend.key_column_sql();
        let hidden = if plan.hidden.is_empty() {
            String::new()
        } else {
            let ids: Vec<String> = plan.hidden.iter().map(|id| id.get().to_string()).collect();
            format!(" WHERE {} NOT IN ({})", key, ids.join(", "))
        };

        vec![
            format!("DROP TABLE IF EXISTS {}", self.qualified(&staging)),
            format!(
                "CREATE TABLE {} (proxy INTEGER PRIMARY KEY, source INTEGER NOT NULL, filtered INTEGER)",
                self.qualified(&staging)
            ),
            format!(
                "INSERT INTO {staging} (proxy, source, filtered) \
                 SELECT proxy, source, CASE WHEN passes = 1 THEN \
                 SUM(passes) OVER (ORDER BY proxy ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) - 1 END \
                 FROM (SELECT ROW_NUMBER() OVER (ORDER BY {order}) - 1 AS proxy, {key} AS source, \
                 CASE WHEN {passes} THEN 1 ELSE 0 END AS passes FROM {table}{hidden})",
                staging = self.qualified(&staging),
                order = plan.order_by,
                key = key,
                passes = plan.passes,
                table = self.backend.escape_identifier(&self.backend.table_name()),
                hidden = hidden
            ),
            format!("DROP TABLE IF EXISTS {}", self.qualified(&self.artifact)),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                self.qualified(&staging),
                self.backend.escape_identifier(&self.artifact)
            ),
            format!(
                "CREATE INDEX {} ON {} (source)",
                self.qualified(&format!("{}_source", self.artifact)),
                self.backend.escape_identifier(&self.artifact)
            ),
            format!(
                "CREATE INDEX {} ON {} (filtered)",
                self.qualified(&format!("{}_filtered", self.artifact)),
                self.backend.escape_identifier(&self.artifact)
            ),
        ]
    }

    fn schema(&self) -> &'static str {
        match self.scope {
            ArtifactScope::Session => "temp",
            ArtifactScope::Persistent => "main",
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.schema(), self.backend.escape_identifier(name))
    }

    fn table_sql(&self) -> String {
        self.qualified(&self.artifact)
    }

    fn artifact_exists(&self) -> Result<bool> {
        self.backend
            .table_exists(&self.artifact, self.scope == ArtifactScope::Session)
    }

    fn query_counts(&self) -> Result<MappingCounts> {
        let sql = format!("SELECT COUNT(*), COUNT(filtered) FROM {}", self.table_sql());
        let rows = self.backend.query_rows(&sql, &[])?;
        let count = |i: usize| {
            rows.first()
                .and_then(|r| r.get(i))
                .and_then(CellValue::as_i64)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0)
        };
        Ok(MappingCounts {
            proxy_rows: count(0),
            filtered_rows: count(1),
        })
    }

    fn query(&self, sql: &str, params: &[CellValue]) -> Result<Vec<Vec<CellValue>>> {
        match self.state {
            MappingState::Built => self.backend.query_rows(sql, params),
            MappingState::Stale => Err(ProjectionError::StaleMapping),
            MappingState::NoMapping => Err(ProjectionError::QueryFailed(format!(
                "mapping {} has not been built",
                self.artifact
            ))),
        }
    }

    fn ids(&self, sql: &str, params: &[CellValue]) -> Result<Vec<SourceRowId>> {
        Ok(self
            .query(sql, params)?
            .iter()
            .filter_map(|r| r.first().and_then(CellValue::as_i64))
            .map(SourceRowId)
            .collect())
    }
}

impl std::fmt::Debug for MappingTableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingTableManager")
            .field("artifact", &self.artifact)
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("counts", &self.counts)
            .finish()
    }
}

fn position_param(position: usize) -> CellValue {
    CellValue::Integer(i64::try_from(position).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scenario_sqlite, FailingBackend};
    use parking_lot::Mutex;

    fn ids(raw: &[i64]) -> Vec<SourceRowId> {
        raw.iter().copied().map(SourceRowId).collect()
    }

    fn descending_plan() -> RebuildPlan {
        RebuildPlan {
            order_by: "\"value\" DESC".into(),
            passes: "(\"value\" > 2)".into(),
            hidden: Vec::new(),
        }
    }

    fn manager(backend: Arc<dyn QueryBackend>, scope: ArtifactScope) -> MappingTableManager {
        let settings = MappingSettings {
            scope,
            ..MappingSettings::default()
        };
        MappingTableManager::new(backend, &settings, EventBus::new())
    }

    #[test]
    fn test_rebuild_materialises_order_and_filter() {
        let (_dir, source) = scenario_sqlite();
        for scope in [ArtifactScope::Persistent, ArtifactScope::Session] {
            let mut mapping = manager(source.clone(), scope);
            assert_eq!(mapping.state(), MappingState::NoMapping);
            assert!(mapping.filter_order().is_err());

            let counts = mapping.rebuild(&descending_plan()).unwrap();
            assert_eq!(counts, MappingCounts { proxy_rows: 5, filtered_rows: 3 });
            assert_eq!(mapping.state(), MappingState::Built);
            assert_eq!(mapping.artifact_name(), "_tp_map_scenario");

            assert_eq!(mapping.proxy_order().unwrap(), ids(&[10, 30, 50, 40, 20]));
            assert_eq!(mapping.filter_order().unwrap(), ids(&[10, 30, 50]));
            assert_eq!(mapping.filter_to_source(1).unwrap(), Some(SourceRowId(30)));
            assert_eq!(mapping.filter_to_source(3).unwrap(), None);
            assert_eq!(mapping.source_to_filter(SourceRowId(50)).unwrap(), Some(2));
            assert_eq!(mapping.source_to_filter(SourceRowId(40)).unwrap(), None);
            assert_eq!(mapping.proxy_to_source(4).unwrap(), Some(SourceRowId(20)));
            assert_eq!(
                mapping.matching_ids("\"group\" = 'b'").unwrap(),
                ids(&[10, 30, 50])
            );
            assert_eq!(source.connection_mode(), tp_core::ConnectionMode::ReadOnly);
        }
    }

    #[test]
    fn test_hidden_rows_are_left_out() {
        let (_dir, source) = scenario_sqlite();
        let mut mapping = manager(source, ArtifactScope::Session);
        let plan = RebuildPlan {
            hidden: ids(&[30, 40]),
            ..descending_plan()
        };
        mapping.rebuild(&plan).unwrap();
        assert_eq!(mapping.proxy_order().unwrap(), ids(&[10, 50, 20]));
        assert_eq!(mapping.filter_order().unwrap(), ids(&[10, 50]));
        assert_eq!(mapping.counts(), MappingCounts { proxy_rows: 3, filtered_rows: 2 });
    }

    #[test]
    fn test_stale_until_rebuilt() {
        let (_dir, source) = scenario_sqlite();
        let mut mapping = manager(source, ArtifactScope::Session);
        mapping.rebuild(&descending_plan()).unwrap();

        mapping.invalidate();
        assert_eq!(mapping.state(), MappingState::Stale);
        assert_eq!(mapping.filter_order(), Err(ProjectionError::StaleMapping));

        let ascending = RebuildPlan {
            order_by: "\"value\" ASC".into(),
            passes: "1".into(),
            hidden: Vec::new(),
        };
        mapping.rebuild(&ascending).unwrap();
        assert_eq!(mapping.filter_order().unwrap(), ids(&[20, 40, 50, 30, 10]));
    }

    #[test]
    fn test_session_artifact_is_lost_on_connection_cycle() {
        let (_dir, source) = scenario_sqlite();
        let mut session = manager(source.clone(), ArtifactScope::Session);
        session.rebuild(&descending_plan()).unwrap();
        assert_eq!(session.check_artifact().unwrap(), MappingState::Built);

        source.open_read_only().unwrap();
        assert_eq!(session.check_artifact().unwrap(), MappingState::Stale);

        let mut persistent = manager(source.clone(), ArtifactScope::Persistent);
        persistent.rebuild(&descending_plan()).unwrap();
        source.open_read_only().unwrap();
        assert_eq!(persistent.check_artifact().unwrap(), MappingState::Built);
        assert_eq!(persistent.filter_order().unwrap(), ids(&[10, 30, 50]));
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_artifact() {
        let (_dir, source) = scenario_sqlite();
        let failing = Arc::new(FailingBackend::new(source));
        let mut mapping = manager(failing.clone(), ArtifactScope::Persistent);
        mapping.rebuild(&descending_plan()).unwrap();

        failing.arm(true);
        mapping.invalidate();
        let result = mapping.rebuild(&RebuildPlan {
            order_by: "\"value\" ASC".into(),
            ..descending_plan()
        });
        assert!(matches!(result, Err(ProjectionError::QueryFailed(_))));
        assert_eq!(mapping.state(), MappingState::Stale);

        assert_eq!(mapping.recover().unwrap(), MappingState::Built);
        assert_eq!(mapping.filter_order().unwrap(), ids(&[10, 30, 50]));
        assert_eq!(failing.connection_mode(), tp_core::ConnectionMode::ReadOnly);
    }

    #[test]
    fn test_failed_first_build_leaves_no_mapping() {
        let (_dir, source) = scenario_sqlite();
        let failing = Arc::new(FailingBackend::new(source));
        failing.arm(true);
        let mut mapping = manager(failing, ArtifactScope::Session);
        assert!(mapping.rebuild(&descending_plan()).is_err());
        assert_eq!(mapping.recover().unwrap(), MappingState::NoMapping);
        assert!(matches!(mapping.filter_to_source(0), Err(ProjectionError::QueryFailed(_))));
    }

    #[test]
    fn test_drop_artifact_and_rebuild_event() {
        let (_dir, source) = scenario_sqlite();
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe_fn(move |e: &MappingRebuilt| sink.lock().push(e.clone()));

        let mut mapping =
            MappingTableManager::new(source.clone(), &MappingSettings::default(), events);
        mapping.rebuild(&descending_plan()).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![MappingRebuilt {
                table: "_tp_map_scenario".into(),
                proxy_rows: 5,
                filtered_rows: 3,
            }]
        );

        mapping.drop_artifact().unwrap();
        assert_eq!(mapping.state(), MappingState::NoMapping);
        assert!(!source.table_exists("_tp_map_scenario", false).unwrap());
    }
}
