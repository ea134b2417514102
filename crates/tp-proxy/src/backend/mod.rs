//! Interchangeable index projection backends
//!
//! [`MemoryProjection`] keeps every index array in memory and evaluates sort
//! comparisons and filter predicates itself. [`QueryProjection`] pushes both
//! into the backing store and keeps only the hidden-row bookkeeping, reading
//! translations back from a mapping table.

pub mod memory;
pub mod query;

use std::fmt;
use std::sync::Arc;

use tp_core::{
    DataSourceAdapter, EventBus, FilterIndex, ProjectionSettings, QueryBackend, RawIndex, Result,
};

use crate::filter::FilterSpec;
use crate::index_space::IndexSpace;
use crate::sort::SortKey;

pub use memory::MemoryProjection;
pub use query::QueryProjection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Memory,
    Query,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Memory => write!(f, "memory"),
            Strategy::Query => write!(f, "query"),
        }
    }
}

/// A row store together with the strategy used to project it
#[derive(Clone)]
pub enum SourceHandle {
    Memory(Arc<dyn DataSourceAdapter>),
    Query(Arc<dyn QueryBackend>),
}

impl SourceHandle {
    pub fn strategy(&self) -> Strategy {
        match self {
            SourceHandle::Memory(_) => Strategy::Memory,
            SourceHandle::Query(_) => Strategy::Query,
        }
    }

    pub fn adapter(&self) -> &dyn DataSourceAdapter {
        match self {
            SourceHandle::Memory(adapter) => adapter.as_ref(),
            SourceHandle::Query(backend) => backend.as_adapter(),
        }
    }

    /// Build the backend for this handle
    pub fn open(
        self,
        settings: &ProjectionSettings,
        events: &EventBus,
    ) -> Result<Box<dyn IndexProjection>> {
        Ok(match self {
            SourceHandle::Memory(adapter) => Box::new(MemoryProjection::new(adapter, settings)?),
            SourceHandle::Query(backend) => {
                Box::new(QueryProjection::new(backend, settings, events.clone())?)
            }
        })
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceHandle")
            .field(&self.strategy())
            .field(&self.adapter().source_name())
            .finish()
    }
}

/// Source → raw → proxy → filter index chain over one row store
///
/// Rows are addressed by source position, their index in the adapter's id
/// listing. Operations that change the chain return whether anything
/// changed; a backend may defer the actual work until the next read.
pub trait IndexProjection: Send {
    fn strategy(&self) -> Strategy;

    fn adapter(&self) -> &dyn DataSourceAdapter;

    fn index_space(&self) -> &IndexSpace;

    /// Rows in filter space
    fn row_count(&mut self) -> Result<usize>;

    /// Apply `key`, or return to raw order with `None`
    fn sort(&mut self, key: Option<SortKey>) -> Result<bool>;

    fn sort_key(&self) -> Option<SortKey>;

    /// Install a visible-row filter, or remove it with `None`
    fn set_filter(&mut self, spec: Option<FilterSpec>) -> Result<bool>;

    fn filter_spec(&self) -> Option<&FilterSpec>;

    /// Source positions of filter-space rows matching `spec`, in filter order
    fn matching_sources(&mut self, spec: &FilterSpec) -> Result<Vec<usize>>;

    /// Hide rows by raw index; returns the source positions hidden
    fn hide(&mut self, raw: &[RawIndex]) -> Result<Vec<usize>>;

    /// Show hidden rows by source position; returns those shown
    fn show(&mut self, sources: &[usize]) -> Result<Vec<usize>>;

    fn show_all(&mut self) -> Result<Vec<usize>> {
        let space = self.index_space();
        let hidden: Vec<usize> = (0..space.source_len()).filter(|&s| space.is_hidden(s)).collect();
        self.show(&hidden)
    }

    fn filter_to_source(&mut self, filtered: FilterIndex) -> Result<Option<usize>>;

    fn source_to_filter(&mut self, source: usize) -> Result<Option<FilterIndex>>;

    /// Source positions in proxy order
    fn proxy_order(&mut self) -> Result<Vec<usize>>;

    /// Source positions in filter order
    fn filter_order(&mut self) -> Result<Vec<usize>>;

    /// Re-read the row listing after a structural change
    ///
    /// Hidden rows that still exist stay hidden. A sort or filter that no
    /// longer fits the schema is dropped.
    fn reload(&mut self) -> Result<()>;

    /// Release anything the backend keeps in the store
    fn detach(&mut self) -> Result<()>;
}
