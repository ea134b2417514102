//! Query-backed projection
//!
//! Sort and filter changes are only recorded; the mapping table is rebuilt
//! the next time a count or translation is needed. The sort, filter and
//! hidden rows behind the last successful rebuild are kept so that a failed
//! rebuild can put them back, leaving translations as they were.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tp_core::{
    DataSourceAdapter, EventBus, FilterIndex, ProjectionError, ProjectionSettings, QueryBackend,
    RawIndex, Result, SourceRowId,
};

use super::{IndexProjection, Strategy};
use crate::filter::{FilterEngine, FilterSpec};
use crate::index_space::IndexSpace;
use crate::mapping::{MappingState, MappingTableManager, RebuildPlan};
use crate::sort::{SortEngine, SortKey};

/// State the current mapping table was built from
#[derive(Debug, Clone)]
struct Committed {
    sort: Option<SortKey>,
    filter: Option<FilterSpec>,
    space: IndexSpace,
}

pub struct QueryProjection {
    backend: Arc<dyn QueryBackend>,
    space: IndexSpace,
    sorter: SortEngine,
    filter: FilterEngine,
    mapping: MappingTableManager,
    committed: Committed,
}

impl QueryProjection {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        settings: &ProjectionSettings,
        events: EventBus,
    ) -> Result<Self> {
        let space = IndexSpace::from_adapter(backend.as_adapter())?;
        let mapping = MappingTableManager::new(backend.clone(), &settings.mapping, events);
        info!(
            "Projecting {} through {} ({} rows)",
            backend.table_name(),
            mapping.artifact_name(),
            space.source_len()
        );

        Ok(Self {
            committed: Committed {
                sort: None,
                filter: None,
                space: space.clone(),
            },
            backend,
            space,
            sorter: SortEngine::new(settings.sort_stability),
            filter: FilterEngine::new(),
            mapping,
        })
    }

    pub fn mapping(&self) -> &MappingTableManager {
        &self.mapping
    }

    fn plan(&self) -> Result<RebuildPlan> {
        Ok(RebuildPlan {
            order_by: self.sorter.order_by_sql(self.backend.as_ref())?,
            passes: FilterEngine::passes_sql(self.filter.active(), self.backend.as_ref())?,
            hidden: self.space.hidden_ids(),
        })
    }

    /// Rebuild the mapping table if it is stale or missing
    ///
    /// A failed rebuild restores the committed state and is reported as
    /// `QueryFailed`.
    fn ensure_mapping(&mut self) -> Result<()> {
        if self.mapping.check_artifact()? == MappingState::Built {
            return Ok(());
        }

        let rebuilt = self.plan().and_then(|plan| self.mapping.rebuild(&plan));
        match rebuilt {
            Ok(_) => {
                self.committed = Committed {
                    sort: self.sorter.active(),
                    filter: self.filter.active().cloned(),
                    space: self.space.clone(),
                };
                Ok(())
            }
            Err(e) => {
                warn!("Restoring the last built sort and filter after: {}", e);
                self.sorter.record(self.committed.sort);
                self.filter.record(self.committed.filter.clone());
                self.space = self.committed.space.clone();
                self.mapping.recover()?;
                Err(match e {
                    ProjectionError::QueryFailed(message) => ProjectionError::QueryFailed(message),
                    other => ProjectionError::QueryFailed(other.to_string()),
                })
            }
        }
    }

    fn positions(&self, ids: Vec<SourceRowId>) -> Vec<usize> {
        ids.into_iter()
            .filter_map(|id| self.space.position_of(id))
            .collect()
    }
}

impl IndexProjection for QueryProjection {
    fn strategy(&self) -> Strategy {
        Strategy::Query
    }

    fn adapter(&self) -> &dyn DataSourceAdapter {
        self.backend.as_adapter()
    }

    fn index_space(&self) -> &IndexSpace {
        &self.space
    }

    fn row_count(&mut self) -> Result<usize> {
        self.ensure_mapping()?;
        Ok(self.mapping.counts().filtered_rows)
    }

    fn sort(&mut self, key: Option<SortKey>) -> Result<bool> {
        if self.sorter.is_current(key) {
            return Ok(false);
        }
        if let Some(key) = key {
            self.backend.as_adapter().column(key.column)?;
        }
        self.sorter.record(key);
        self.mapping.invalidate();
        Ok(true)
    }

    fn sort_key(&self) -> Option<SortKey> {
        self.sorter.active()
    }

    fn set_filter(&mut self, spec: Option<FilterSpec>) -> Result<bool> {
        if self.filter.is_current(spec.as_ref()) {
            return Ok(false);
        }
        // reject bad predicates now rather than at the next rebuild
        FilterEngine::passes_sql(spec.as_ref(), self.backend.as_ref())?;
        self.filter.record(spec);
        self.mapping.invalidate();
        Ok(true)
    }

    fn filter_spec(&self) -> Option<&FilterSpec> {
        self.filter.active()
    }

    fn matching_sources(&mut self, spec: &FilterSpec) -> Result<Vec<usize>> {
        let passes = FilterEngine::passes_sql(Some(spec), self.backend.as_ref())?;
        self.ensure_mapping()?;
        let ids = self.mapping.matching_ids(&passes)?;
        Ok(self.positions(ids))
    }

    fn hide(&mut self, raw: &[RawIndex]) -> Result<Vec<usize>> {
        let hidden = self.space.hide(raw);
        if !hidden.is_empty() {
            self.mapping.invalidate();
        }
        Ok(hidden)
    }

    fn show(&mut self, sources: &[usize]) -> Result<Vec<usize>> {
        let shown = self.space.show(sources);
        if !shown.is_empty() {
            self.mapping.invalidate();
        }
        Ok(shown)
    }

    fn filter_to_source(&mut self, filtered: FilterIndex) -> Result<Option<usize>> {
        self.ensure_mapping()?;
        Ok(self
            .mapping
            .filter_to_source(filtered)?
            .and_then(|id| self.space.position_of(id)))
    }

    fn source_to_filter(&mut self, source: usize) -> Result<Option<FilterIndex>> {
        self.ensure_mapping()?;
        match self.space.id_at(source) {
            Some(id) => self.mapping.source_to_filter(id),
            None => Ok(None),
        }
    }

    fn proxy_order(&mut self) -> Result<Vec<usize>> {
        self.ensure_mapping()?;
        let ids = self.mapping.proxy_order()?;
        Ok(self.positions(ids))
    }

    fn filter_order(&mut self) -> Result<Vec<usize>> {
        self.ensure_mapping()?;
        let ids = self.mapping.filter_order()?;
        Ok(self.positions(ids))
    }

    fn reload(&mut self) -> Result<()> {
        let hidden = self.space.hidden_ids();
        let mut space = IndexSpace::from_adapter(self.backend.as_adapter())?;
        space.hide_ids(&hidden);
        self.space = space;

        let column_count = self.backend.as_adapter().column_count();
        if let Some(key) = self.sorter.active() {
            if key.column >= column_count {
                warn!("Dropping sort on column {} after reload", key.column);
                self.sorter.record(None);
            }
        }
        if let Some(spec) = self.filter.active() {
            if let Err(e) = FilterEngine::passes_sql(Some(spec), self.backend.as_ref()) {
                warn!("Dropping filter after reload: {}", e);
                self.filter.record(None);
            }
        }

        // the committed state still describes the current artifact, so a
        // failed rebuild falls back to the rows as they were before reload
        self.mapping.invalidate();
        self.ensure_mapping()?;
        debug!(
            "Reloaded {} ({} rows, {} hidden)",
            self.backend.table_name(),
            self.space.source_len(),
            self.space.hidden_count()
        );
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        info!("Dropping mapping {}", self.mapping.artifact_name());
        self.mapping.drop_artifact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scenario_sqlite, FailingBackend};
    use tp_core::{ArtifactScope, MappingSettings};

    fn session_settings() -> ProjectionSettings {
        ProjectionSettings {
            mapping: MappingSettings {
                scope: ArtifactScope::Session,
                ..MappingSettings::default()
            },
            ..ProjectionSettings::default()
        }
    }

    #[test]
    fn test_changes_are_applied_lazily() {
        let (_dir, source) = scenario_sqlite();
        let mut projection = QueryProjection::new(source, &session_settings(), EventBus::new()).unwrap();
        assert_eq!(projection.mapping().state(), MappingState::NoMapping);

        assert_eq!(projection.row_count().unwrap(), 5);
        assert_eq!(projection.mapping().state(), MappingState::Built);

        projection.sort(Some(SortKey::descending(1))).unwrap();
        assert_eq!(projection.mapping().state(), MappingState::Stale);
        assert_eq!(projection.proxy_order().unwrap(), vec![0, 2, 4, 3, 1]);
        assert_eq!(projection.mapping().state(), MappingState::Built);
    }

    #[test]
    fn test_invalid_inputs_are_rejected_up_front() {
        let (_dir, source) = scenario_sqlite();
        let mut projection = QueryProjection::new(source, &session_settings(), EventBus::new()).unwrap();
        assert_eq!(
            projection.sort(Some(SortKey::ascending(9))),
            Err(ProjectionError::InvalidColumn(9))
        );
        assert!(matches!(
            projection.set_filter(Some(FilterSpec::query("value >"))),
            Err(ProjectionError::InvalidPredicate(_))
        ));
        assert!(projection.filter_spec().is_none());
    }

    #[test]
    fn test_lost_session_artifact_is_rebuilt() {
        let (_dir, source) = scenario_sqlite();
        let mut projection =
            QueryProjection::new(source.clone(), &session_settings(), EventBus::new()).unwrap();
        projection.sort(Some(SortKey::descending(1))).unwrap();
        assert_eq!(projection.filter_to_source(0).unwrap(), Some(0));

        source.open_read_only().unwrap();
        assert_eq!(projection.filter_to_source(1).unwrap(), Some(2));
        assert_eq!(projection.mapping().state(), MappingState::Built);
    }

    #[test]
    fn test_failed_rebuild_restores_committed_state() {
        let (_dir, source) = scenario_sqlite();
        let failing = Arc::new(FailingBackend::new(source));
        let mut projection =
            QueryProjection::new(failing.clone(), &ProjectionSettings::default(), EventBus::new()).unwrap();
        projection.sort(Some(SortKey::descending(1))).unwrap();
        projection.set_filter(Some(FilterSpec::query("value > 2"))).unwrap();
        assert_eq!(projection.filter_order().unwrap(), vec![0, 2, 4]);

        failing.arm(true);
        projection.sort(Some(SortKey::ascending(1))).unwrap();
        projection.hide(&[0]).unwrap();
        assert!(matches!(projection.row_count(), Err(ProjectionError::QueryFailed(_))));

        assert_eq!(projection.sort_key(), Some(SortKey::descending(1)));
        assert!(!projection.index_space().is_hidden(0));
        assert_eq!(projection.filter_order().unwrap(), vec![0, 2, 4]);
        assert_eq!(projection.filter_to_source(2).unwrap(), Some(4));

        failing.arm(false);
        projection.sort(Some(SortKey::ascending(1))).unwrap();
        assert_eq!(projection.filter_order().unwrap(), vec![4, 2, 0]);
    }

    #[test]
    fn test_failed_reload_keeps_previous_rows() {
        let (_dir, source) = scenario_sqlite();
        let failing = Arc::new(FailingBackend::new(source.clone()));
        let mut projection =
            QueryProjection::new(failing.clone(), &ProjectionSettings::default(), EventBus::new()).unwrap();
        projection.sort(Some(SortKey::descending(1))).unwrap();
        assert_eq!(projection.row_count().unwrap(), 5);

        source.delete_rows(&[SourceRowId(30)]).unwrap();
        failing.arm(true);
        assert!(matches!(projection.reload(), Err(ProjectionError::QueryFailed(_))));
        assert_eq!(projection.index_space().raw_row_count(), 5);
        assert_eq!(projection.row_count().unwrap(), 5);
        assert_eq!(projection.filter_order().unwrap(), vec![0, 2, 4, 3, 1]);
        assert_eq!(projection.filter_to_source(4).unwrap(), Some(1));

        failing.arm(false);
        projection.reload().unwrap();
        assert_eq!(projection.index_space().raw_row_count(), 4);
        assert_eq!(projection.row_count().unwrap(), 4);
        // ids 10, 20, 40, 50 by value descending
        assert_eq!(projection.filter_order().unwrap(), vec![0, 3, 2, 1]);
    }

    #[test]
    fn test_detach_drops_the_artifact() {
        let (_dir, source) = scenario_sqlite();
        let mut projection =
            QueryProjection::new(source.clone(), &ProjectionSettings::default(), EventBus::new()).unwrap();
        projection.row_count().unwrap();
        assert!(source.table_exists("_tp_map_scenario", false).unwrap());

        projection.detach().unwrap();
        assert!(!source.table_exists("_tp_map_scenario", false).unwrap());
    }
}
