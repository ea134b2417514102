//! In-memory projection
//!
//! Keeps `proxy2source` and `filter2proxy` as plain arrays. Sorting permutes
//! a copy of the raw order and swaps it in only once every comparison
//! succeeded; filtering evaluates the predicate once per row and keeps the
//! verdicts so that re-shown rows need no re-evaluation.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tp_core::{
    ColumnKind, DataSourceAdapter, FilterIndex, IndexSpaceKind, ProjectionError,
    ProjectionSettings, ProxyIndex, RawIndex, Result,
};

use super::{IndexProjection, Strategy};
use crate::filter::{CompiledFilter, FilterEngine, FilterSpec};
use crate::index_space::IndexSpace;
use crate::sort::{compare_positions, SortEngine, SortKey};

pub struct MemoryProjection {
    adapter: Arc<dyn DataSourceAdapter>,
    space: IndexSpace,
    sorter: SortEngine,
    filter: FilterEngine,
    proxy2source: Vec<usize>,
    source2proxy: Vec<Option<ProxyIndex>>,
    /// Filter verdict per source position, hidden rows included
    passes: Option<Vec<bool>>,
    filter2proxy: Vec<ProxyIndex>,
    proxy2filter: Vec<Option<FilterIndex>>,
}

impl MemoryProjection {
    pub fn new(adapter: Arc<dyn DataSourceAdapter>, settings: &ProjectionSettings) -> Result<Self> {
        let space = IndexSpace::from_adapter(adapter.as_ref())?;
        let proxy2source = space.raw_to_source().to_vec();
        info!(
            "Projecting {} in memory ({} rows)",
            adapter.source_name(),
            space.source_len()
        );

        let mut projection = Self {
            adapter,
            space,
            sorter: SortEngine::new(settings.sort_stability),
            filter: FilterEngine::new(),
            proxy2source,
            source2proxy: Vec::new(),
            passes: None,
            filter2proxy: Vec::new(),
            proxy2filter: Vec::new(),
        };
        projection.reindex();
        Ok(projection)
    }

    /// Recompute every index derived from `proxy2source` and `passes`
    fn reindex(&mut self) {
        self.source2proxy = vec![None; self.space.source_len()];
        for (proxy, &source) in self.proxy2source.iter().enumerate() {
            self.source2proxy[source] = Some(proxy);
        }

        self.filter2proxy = match &self.passes {
            Some(passes) => (0..self.proxy2source.len())
                .filter(|&proxy| passes[self.proxy2source[proxy]])
                .collect(),
            None => (0..self.proxy2source.len()).collect(),
        };

        self.proxy2filter = vec![None; self.proxy2source.len()];
        for (filtered, &proxy) in self.filter2proxy.iter().enumerate() {
            self.proxy2filter[proxy] = Some(filtered);
        }
    }

    fn sorted_raw_order(&self, key: Option<SortKey>) -> Result<Vec<usize>> {
        let mut positions = self.space.raw_to_source().to_vec();
        if let Some(key) = key {
            self.sorter
                .sort_positions(&mut positions, key, self.adapter.as_ref(), &self.space)?;
        }
        Ok(positions)
    }

    /// Proxy order with `shown` inserted at their sorted positions
    ///
    /// Rows already in the order keep their relative order. Nothing is
    /// modified if a comparison fails.
    fn insert_sorted(&self, key: SortKey, kind: ColumnKind, shown: &[usize]) -> Result<Vec<usize>> {
        let mut order = self.proxy2source.clone();
        order.reserve(shown.len());

        for &source in shown {
            let mut failure = None;
            let at = order.partition_point(|&existing| {
                if failure.is_some() {
                    return false;
                }
                match compare_positions(self.adapter.as_ref(), &self.space, key, kind, existing, source) {
                    Ok(ordering) => ordering.then(existing.cmp(&source)) == Ordering::Less,
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
            order.insert(at, source);
        }
        Ok(order)
    }

    fn check_column(&self, key: Option<SortKey>) -> Result<()> {
        match key {
            Some(key) if key.column >= self.adapter.column_count() => {
                Err(ProjectionError::InvalidColumn(key.column))
            }
            _ => Ok(()),
        }
    }
}

impl IndexProjection for MemoryProjection {
    fn strategy(&self) -> Strategy {
        Strategy::Memory
    }

    fn adapter(&self) -> &dyn DataSourceAdapter {
        self.adapter.as_ref()
    }

    fn index_space(&self) -> &IndexSpace {
        &self.space
    }

    fn row_count(&mut self) -> Result<usize> {
        Ok(self.filter2proxy.len())
    }

    fn sort(&mut self, key: Option<SortKey>) -> Result<bool> {
        if self.sorter.is_current(key) {
            return Ok(false);
        }
        self.check_column(key)?;

        self.proxy2source = self.sorted_raw_order(key)?;
        self.sorter.record(key);
        self.reindex();
        Ok(true)
    }

    fn sort_key(&self) -> Option<SortKey> {
        self.sorter.active()
    }

    fn set_filter(&mut self, spec: Option<FilterSpec>) -> Result<bool> {
        if self.filter.is_current(spec.as_ref()) {
            return Ok(false);
        }

        self.passes = match &spec {
            Some(spec) => Some(FilterEngine::evaluate(spec, self.adapter.as_ref(), &self.space)?),
            None => None,
        };
        self.filter.record(spec);
        self.reindex();
        debug!("Filter space holds {} of {} rows", self.filter2proxy.len(), self.proxy2source.len());
        Ok(true)
    }

    fn filter_spec(&self) -> Option<&FilterSpec> {
        self.filter.active()
    }

    fn matching_sources(&mut self, spec: &FilterSpec) -> Result<Vec<usize>> {
        let compiled = CompiledFilter::compile(spec, &self.adapter.columns())?;
        let mut matching = Vec::new();
        for &proxy in &self.filter2proxy {
            let source = self.proxy2source[proxy];
            let id = self
                .space
                .id_at(source)
                .ok_or_else(|| ProjectionError::invalid_row(source, IndexSpaceKind::Source))?;
            if compiled.matches(id, &mut |col| self.adapter.cell_value(id, col))? {
                matching.push(source);
            }
        }
        Ok(matching)
    }

    fn hide(&mut self, raw: &[RawIndex]) -> Result<Vec<usize>> {
        let hidden = self.space.hide(raw);
        if !hidden.is_empty() {
            let space = &self.space;
            self.proxy2source.retain(|&source| !space.is_hidden(source));
            self.reindex();
        }
        Ok(hidden)
    }

    fn show(&mut self, sources: &[usize]) -> Result<Vec<usize>> {
        let mut candidates: Vec<usize> = sources
            .iter()
            .copied()
            .filter(|&s| self.space.is_hidden(s))
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let next = match self.sorter.active() {
            Some(key) if !candidates.is_empty() => {
                let kind = self.adapter.column_kind(key.column)?;
                Some(self.insert_sorted(key, kind, &candidates)?)
            }
            _ => None,
        };

        let shown = self.space.show(sources);
        if shown.is_empty() {
            return Ok(shown);
        }
        self.proxy2source = next.unwrap_or_else(|| self.space.raw_to_source().to_vec());
        self.reindex();
        Ok(shown)
    }

    fn filter_to_source(&mut self, filtered: FilterIndex) -> Result<Option<usize>> {
        Ok(self
            .filter2proxy
            .get(filtered)
            .map(|&proxy| self.proxy2source[proxy]))
    }

    fn source_to_filter(&mut self, source: usize) -> Result<Option<FilterIndex>> {
        Ok(self
            .source2proxy
            .get(source)
            .copied()
            .flatten()
            .and_then(|proxy| self.proxy2filter[proxy]))
    }

    fn proxy_order(&mut self) -> Result<Vec<usize>> {
        Ok(self.proxy2source.clone())
    }

    fn filter_order(&mut self) -> Result<Vec<usize>> {
        Ok(self
            .filter2proxy
            .iter()
            .map(|&proxy| self.proxy2source[proxy])
            .collect())
    }

    fn reload(&mut self) -> Result<()> {
        let mut space = IndexSpace::from_adapter(self.adapter.as_ref())?;
        space.hide_ids(&self.space.hidden_ids());

        let key = self.sorter.active().filter(|key| {
            let fits = key.column < self.adapter.column_count();
            if !fits {
                warn!("Dropping sort on column {} after reload", key.column);
            }
            fits
        });
        let mut proxy2source = space.raw_to_source().to_vec();
        if let Some(key) = key {
            self.sorter
                .sort_positions(&mut proxy2source, key, self.adapter.as_ref(), &space)?;
        }

        let (spec, passes) = match self.filter.active() {
            Some(spec) => match FilterEngine::evaluate(spec, self.adapter.as_ref(), &space) {
                Ok(passes) => (Some(spec.clone()), Some(passes)),
                Err(e) => {
                    warn!("Dropping filter after reload: {}", e);
                    (None, None)
                }
            },
            None => (None, None),
        };

        self.space = space;
        self.proxy2source = proxy2source;
        self.sorter.record(key);
        self.filter.record(spec);
        self.passes = passes;
        self.reindex();
        info!(
            "Reloaded {} ({} rows, {} hidden)",
            self.adapter.source_name(),
            self.space.source_len(),
            self.space.hidden_count()
        );
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        debug!("Detaching in-memory projection of {}", self.adapter.source_name());
        Ok(())
    }
}
