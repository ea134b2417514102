//! The facade a table view talks to
//!
//! [`Projection`] owns one [`IndexProjection`] backend and the selection.
//! Rows are addressed in filter space unless stated otherwise. Every call
//! that changes the selection publishes at most one `SelectionChanged`;
//! calls that move rows publish `LayoutChanged` with the new row count.

use tracing::{debug, info, warn};

use tp_core::range;
use tp_core::{
    CellValue, EventBus, FilterIndex, IndexSpaceKind, LayoutChanged, ProjectionError,
    ProjectionSettings, RawIndex, Result, RowIdentityAmbiguous, SelectionChanged, SelectionRange,
    SortOrder, SourceAttached, SourceDetached, SourceRowId,
};

use crate::backend::{IndexProjection, SourceHandle, Strategy};
use crate::filter::FilterSpec;
use crate::identity::{resolve_row_identity, RowIdentity};
use crate::selection::{SelectionCommand, SelectionTracker, SpaceOrder};
use crate::sort::SortKey;

/// Result of toggling a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    /// The row that was toggled
    pub id: SourceRowId,
    /// Whether that row is selected now
    pub selected: bool,
    /// How the clicked row was identified
    pub identity: RowIdentity,
}

pub struct Projection {
    settings: ProjectionSettings,
    backend: Option<Box<dyn IndexProjection>>,
    selection: SelectionTracker,
    events: EventBus,
    last_ambiguity: Option<ProjectionError>,
}

impl Projection {
    pub fn new(settings: ProjectionSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            backend: None,
            selection: SelectionTracker::new(),
            events: EventBus::new(),
            last_ambiguity: None,
        })
    }

    pub fn settings(&self) -> &ProjectionSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_attached(&self) -> bool {
        self.backend.is_some()
    }

    pub fn strategy(&self) -> Option<Strategy> {
        self.backend.as_ref().map(|b| b.strategy())
    }

    /// The ambiguity recorded by the last `toggle_row`, if it had one
    pub fn last_ambiguity(&self) -> Option<&ProjectionError> {
        self.last_ambiguity.as_ref()
    }

    fn backend(&self) -> Result<&dyn IndexProjection> {
        match &self.backend {
            Some(backend) => Ok(backend.as_ref()),
            None => {
                warn!("No data source attached");
                Err(ProjectionError::EmptySource)
            }
        }
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn IndexProjection>> {
        match &mut self.backend {
            Some(backend) => Ok(backend),
            None => {
                warn!("No data source attached");
                Err(ProjectionError::EmptySource)
            }
        }
    }

    // --- lifecycle ---

    /// Attach a row store, replacing any attached one
    pub fn attach(&mut self, source: SourceHandle) -> Result<()> {
        if self.backend.is_some() {
            if let Err(e) = self.detach() {
                warn!("Detaching the previous source failed: {}", e);
            }
        }

        let source_name = source.adapter().source_name();
        let column_count = source.adapter().column_count();
        let strategy = source.strategy();

        let mut backend = source.open(&self.settings, &self.events)?;
        let row_count = backend.row_count()?;
        self.backend = Some(backend);
        self.last_ambiguity = None;

        info!(
            "Attached {} ({} strategy, {} rows, {} columns)",
            source_name, strategy, row_count, column_count
        );
        self.events.publish(SourceAttached {
            source_name,
            row_count,
            column_count,
        });
        Ok(())
    }

    /// Detach the row store, clearing the selection
    pub fn detach(&mut self) -> Result<()> {
        if self.backend.is_none() {
            debug!("Detach without an attached source");
            return Ok(());
        }
        let old = self.selection().unwrap_or_default();

        let Some(mut backend) = self.backend.take() else {
            return Ok(());
        };
        let source_name = backend.adapter().source_name();
        let result = backend.detach();
        drop(backend);

        if self.selection.clear() {
            self.events.publish(SelectionChanged { old, new: Vec::new() });
        }
        self.last_ambiguity = None;

        info!("Detached {}", source_name);
        self.events.publish(SourceDetached { source_name });
        result
    }

    /// Re-read the store after a structural change
    ///
    /// The selection is cleared whether or not the reload succeeds, since
    /// source positions may no longer name the same rows.
    pub fn reload(&mut self) -> Result<()> {
        let old = self.selection().unwrap_or_default();
        let reloaded = self.backend_mut()?.reload();
        if self.selection.clear() {
            self.events.publish(SelectionChanged { old, new: Vec::new() });
        }
        self.last_ambiguity = None;
        reloaded?;
        self.layout_changed()?;
        Ok(())
    }

    // --- table model ---

    /// Rows in filter space
    pub fn row_count(&mut self) -> Result<usize> {
        self.backend_mut()?.row_count()
    }

    /// Rows that are not hidden, filtered out or not
    pub fn raw_row_count(&self) -> Result<usize> {
        Ok(self.backend()?.index_space().raw_row_count())
    }

    pub fn column_count(&self) -> Result<usize> {
        Ok(self.backend()?.adapter().column_count())
    }

    pub fn header_name(&self, col: usize) -> Result<String> {
        self.backend()?.adapter().column_name(col)
    }

    pub fn data(&mut self, row: FilterIndex, col: usize) -> Result<CellValue> {
        let id = self.map_filter_to_source(row)?;
        self.backend()?.adapter().cell_value(id, col)
    }

    // --- sorting ---

    pub fn sort(&mut self, col: usize, order: SortOrder) -> Result<()> {
        self.apply_sort(Some(SortKey::new(col, order)))
    }

    /// Return to the store's natural row order
    pub fn clear_sort(&mut self) -> Result<()> {
        self.apply_sort(None)
    }

    pub fn sort_state(&self) -> Option<SortKey> {
        self.backend.as_ref().and_then(|b| b.sort_key())
    }

    fn apply_sort(&mut self, key: Option<SortKey>) -> Result<()> {
        if self.backend_mut()?.sort(key)? {
            self.layout_changed()?;
        }
        Ok(())
    }

    // --- filtering ---

    /// Filter by a predicate, or select its matches
    ///
    /// With `restrict` the matching rows become the filter space. Without
    /// it every row stays visible and the selection is replaced by the
    /// matching rows of the current filter space.
    pub fn set_filter(&mut self, predicate: &str, restrict: bool) -> Result<()> {
        let spec = FilterSpec::query(predicate);
        if restrict {
            return self.apply_filter(spec);
        }

        let sources = self.backend_mut()?.matching_sources(&spec)?;
        debug!("Predicate {:?} selects {} rows", predicate, sources.len());
        self.edit_selection_in(IndexSpaceKind::Source, |selection, _| {
            selection.select_sources(&sources)
        })?;
        Ok(())
    }

    pub fn apply_filter(&mut self, spec: FilterSpec) -> Result<()> {
        if self.backend_mut()?.set_filter(Some(spec))? {
            self.layout_changed()?;
        }
        Ok(())
    }

    pub fn clear_filter(&mut self) -> Result<()> {
        if self.backend_mut()?.set_filter(None)? {
            self.layout_changed()?;
        }
        Ok(())
    }

    pub fn filter_spec(&self) -> Option<FilterSpec> {
        self.backend.as_ref().and_then(|b| b.filter_spec().cloned())
    }

    /// Show only the selected rows, or every row again
    pub fn set_selected_only(&mut self, selected_only: bool) -> Result<()> {
        if selected_only {
            let ids = self.selected_ids()?;
            self.apply_filter(FilterSpec::picked(ids))
        } else {
            self.clear_filter()
        }
    }

    /// Show exactly the rows the current filter hides
    pub fn invert_filter(&mut self) -> Result<()> {
        let spec = self.filter_spec().unwrap_or_default().inverted();
        self.apply_filter(spec)
    }

    // --- hiding ---

    /// Hide rows by raw index; returns how many were hidden
    pub fn hide(&mut self, raw: &[RawIndex]) -> Result<usize> {
        let hidden = self.backend_mut()?.hide(raw)?;
        if !hidden.is_empty() {
            self.layout_changed()?;
        }
        Ok(hidden.len())
    }

    /// Show hidden rows by their position with nothing hidden
    pub fn show(&mut self, positions: &[usize]) -> Result<usize> {
        let shown = self.backend_mut()?.show(positions)?;
        if !shown.is_empty() {
            self.layout_changed()?;
        }
        Ok(shown.len())
    }

    pub fn show_all(&mut self) -> Result<usize> {
        let shown = self.backend_mut()?.show_all()?;
        if !shown.is_empty() {
            self.layout_changed()?;
        }
        Ok(shown.len())
    }

    // --- selection ---

    /// The selection in filter space
    pub fn selection(&mut self) -> Result<Vec<SelectionRange>> {
        self.selection_in(IndexSpaceKind::Filter)
    }

    pub fn selection_in(&mut self, space: IndexSpaceKind) -> Result<Vec<SelectionRange>> {
        let order = self.order(space)?;
        Ok(self.selection.get(&order))
    }

    pub fn set_selection(&mut self, ranges: &[SelectionRange]) -> Result<bool> {
        self.edit_selection(ranges, SelectionCommand::Replace)
    }

    /// Edit the selection with ranges, each interpreted in the space it names
    pub fn edit_selection(&mut self, ranges: &[SelectionRange], command: SelectionCommand) -> Result<bool> {
        let space = ranges.first().map_or(IndexSpaceKind::Filter, |r| r.space);
        if ranges.iter().all(|r| r.space == space) {
            return self.edit_selection_in(space, |selection, order| selection.apply(ranges, order, command));
        }

        let mut sources = Vec::new();
        for kind in [
            IndexSpaceKind::Source,
            IndexSpaceKind::Raw,
            IndexSpaceKind::Proxy,
            IndexSpaceKind::Filter,
        ] {
            let group: Vec<SelectionRange> = ranges.iter().filter(|r| r.space == kind).copied().collect();
            if !group.is_empty() {
                sources.extend(self.order(kind)?.ranges_to_source(&group));
            }
        }
        let sources = range::compress(&sources, IndexSpaceKind::Source);
        debug!("Edit of {} ranges across spaces covers {} source ranges", ranges.len(), sources.len());
        self.edit_selection_in(IndexSpaceKind::Source, |selection, order| {
            selection.apply(&sources, order, command)
        })
    }

    /// Flip the selection of one row
    ///
    /// In a store without a primary key the row is identified by its
    /// values; an ambiguous match toggles the lowest matching id and is
    /// recorded in [`Projection::last_ambiguity`].
    pub fn toggle_row(&mut self, row: FilterIndex) -> Result<ToggleOutcome> {
        let clicked = self.map_filter_to_source(row)?;
        let backend = self.backend()?;
        let identity = resolve_row_identity(
            backend.adapter(),
            clicked,
            self.settings.composite_key_columns,
        )?;
        let id = identity.id();
        let source = backend
            .index_space()
            .position_of(id)
            .ok_or_else(|| ProjectionError::unknown_id(id))?;

        let mut selected = false;
        self.edit_selection_in(IndexSpaceKind::Source, |selection, _| {
            selected = selection.toggle(source);
            true
        })?;

        self.last_ambiguity = identity.ambiguity();
        if let RowIdentity::Ambiguous {
            chosen,
            candidates,
            columns,
        } = &identity
        {
            self.events.publish(RowIdentityAmbiguous {
                chosen: *chosen,
                candidates: *candidates,
                columns: columns.clone(),
            });
        }

        Ok(ToggleOutcome {
            id,
            selected,
            identity,
        })
    }

    pub fn clear_selection(&mut self) -> Result<bool> {
        self.edit_selection_in(IndexSpaceKind::Source, |selection, _| selection.clear())
    }

    /// Select exactly the filter-space rows that are not selected
    pub fn invert_selection(&mut self) -> Result<bool> {
        self.edit_selection_in(IndexSpaceKind::Filter, |selection, order| selection.invert(order))
    }

    pub fn select_all(&mut self) -> Result<bool> {
        self.edit_selection_in(IndexSpaceKind::Filter, |selection, order| selection.select_all(order))
    }

    /// Ids of every selected row, visible or not, in source order
    pub fn selected_ids(&self) -> Result<Vec<SourceRowId>> {
        let space = self.backend()?.index_space();
        Ok(self
            .selection
            .source_positions()
            .into_iter()
            .filter_map(|source| space.id_at(source))
            .collect())
    }

    // --- index translation ---

    pub fn map_filter_to_source(&mut self, row: FilterIndex) -> Result<SourceRowId> {
        let backend = self.backend_mut()?;
        let source = backend.filter_to_source(row)?.ok_or_else(|| {
            warn!("Row {} is outside the filter space", row);
            ProjectionError::invalid_row(row, IndexSpaceKind::Filter)
        })?;
        backend
            .index_space()
            .id_at(source)
            .ok_or_else(|| ProjectionError::invalid_row(source, IndexSpaceKind::Source))
    }

    /// Filter index of a row; `None` if it is hidden or filtered out
    pub fn map_source_to_filter(&mut self, id: SourceRowId) -> Result<Option<FilterIndex>> {
        let backend = self.backend_mut()?;
        let source = backend.index_space().position_of(id).ok_or_else(|| {
            warn!("Unknown row id {}", id);
            ProjectionError::unknown_id(id)
        })?;
        backend.source_to_filter(source)
    }

    /// Row ids in proxy order
    pub fn proxy_order(&mut self) -> Result<Vec<SourceRowId>> {
        let order = self.order(IndexSpaceKind::Proxy)?;
        self.ids_of(&order)
    }

    /// Row ids in filter order
    pub fn filter_order(&mut self) -> Result<Vec<SourceRowId>> {
        let order = self.order(IndexSpaceKind::Filter)?;
        self.ids_of(&order)
    }

    fn ids_of(&self, order: &SpaceOrder) -> Result<Vec<SourceRowId>> {
        let space = self.backend()?.index_space();
        Ok((0..order.len())
            .filter_map(|position| order.to_source(position))
            .filter_map(|source| space.id_at(source))
            .collect())
    }

    fn order(&mut self, kind: IndexSpaceKind) -> Result<SpaceOrder> {
        let backend = self.backend_mut()?;
        let source_len = backend.index_space().source_len();
        let to_source = match kind {
            IndexSpaceKind::Source => (0..source_len).collect(),
            IndexSpaceKind::Raw => backend.index_space().raw_to_source().to_vec(),
            IndexSpaceKind::Proxy => backend.proxy_order()?,
            IndexSpaceKind::Filter => backend.filter_order()?,
        };
        Ok(SpaceOrder::new(kind, to_source, source_len))
    }

    /// Run a selection edit against `kind`, publishing one event on change
    fn edit_selection_in<F>(&mut self, kind: IndexSpaceKind, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut SelectionTracker, &SpaceOrder) -> bool,
    {
        let order = self.order(kind)?;
        let filter = if kind == IndexSpaceKind::Filter {
            order.clone()
        } else {
            self.order(IndexSpaceKind::Filter)?
        };

        let old = self.selection.get(&filter);
        let changed = edit(&mut self.selection, &order);
        if changed {
            let new = self.selection.get(&filter);
            self.events.publish(SelectionChanged { old, new });
        }
        Ok(changed)
    }

    fn layout_changed(&mut self) -> Result<usize> {
        let row_count = self.backend_mut()?.row_count()?;
        debug!("Layout changed, {} rows", row_count);
        self.events.publish(LayoutChanged { row_count });
        Ok(row_count)
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("settings", &self.settings)
            .field("strategy", &self.strategy())
            .field("selected", &self.selection.count())
            .finish()
    }
}
