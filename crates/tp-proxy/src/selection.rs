//! Selection tracking
//!
//! The selection is stored once, as normalised ranges over source positions,
//! so it survives sorting, filtering and hiding unchanged. It is translated
//! into the space a caller asks for through a [`SpaceOrder`] built from the
//! current projection state, never cached.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tp_core::range;
use tp_core::{IndexSpaceKind, SelectionRange};

/// The rows of one index space, as source positions in that space's order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceOrder {
    kind: IndexSpaceKind,
    to_source: Vec<usize>,
    from_source: Vec<Option<usize>>,
}

impl SpaceOrder {
    pub fn new(kind: IndexSpaceKind, to_source: Vec<usize>, source_len: usize) -> Self {
        let mut from_source = vec![None; source_len];
        for (position, &source) in to_source.iter().enumerate() {
            if let Some(slot) = from_source.get_mut(source) {
                *slot = Some(position);
            }
        }
        Self {
            kind,
            to_source,
            from_source,
        }
    }

    /// The source space itself
    pub fn source(source_len: usize) -> Self {
        Self::new(IndexSpaceKind::Source, (0..source_len).collect(), source_len)
    }

    pub fn kind(&self) -> IndexSpaceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.to_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_source.is_empty()
    }

    pub fn to_source(&self, position: usize) -> Option<usize> {
        self.to_source.get(position).copied()
    }

    pub fn from_source(&self, source: usize) -> Option<usize> {
        self.from_source.get(source).copied().flatten()
    }

    /// Source positions covered by ranges of this space, ascending
    ///
    /// Positions past the end of the space are dropped.
    pub fn ranges_to_source(&self, ranges: &[SelectionRange]) -> Vec<usize> {
        let mut sources = Vec::new();
        for range in range::normalize(ranges) {
            if range.space != self.kind {
                warn!(
                    "Treating {} range [{}, {}] as {} positions",
                    range.space, range.top, range.bottom, self.kind
                );
            }
            if range.bottom >= self.len() {
                warn!(
                    "Ignoring rows past {} of range [{}, {}] in {} space",
                    self.len(),
                    range.top,
                    range.bottom,
                    self.kind
                );
            }
            let bottom = range.bottom.min(self.len().saturating_sub(1));
            if range.top < self.len() {
                sources.extend(self.to_source[range.top..=bottom].iter().copied());
            }
        }
        sources.sort_unstable();
        sources.dedup();
        sources
    }
}

/// How an edit combines with the current selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCommand {
    #[default]
    Replace,
    Add,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionTracker {
    /// Normalised ranges in source space
    selected: Vec<SelectionRange>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical selection, in source space
    pub fn ranges(&self) -> &[SelectionRange] {
        &self.selected
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn count(&self) -> usize {
        range::count(&self.selected)
    }

    pub fn contains(&self, source: usize) -> bool {
        range::contains(&self.selected, source)
    }

    /// Selected source positions, ascending
    pub fn source_positions(&self) -> Vec<usize> {
        range::expand(&self.selected)
    }

    /// Edit with ranges given in `order`'s space; returns whether it changed
    pub fn apply(&mut self, ranges: &[SelectionRange], order: &SpaceOrder, command: SelectionCommand) -> bool {
        let sources = range::compress(&order.ranges_to_source(ranges), IndexSpaceKind::Source);
        let next = match command {
            SelectionCommand::Replace => sources,
            SelectionCommand::Add => range::union(&self.selected, &sources),
            SelectionCommand::Remove => range::subtract(&self.selected, &sources),
        };
        self.replace(next)
    }

    /// Flip one source position; returns whether it is now selected
    pub fn toggle(&mut self, source: usize) -> bool {
        let row = [SelectionRange::row(source, IndexSpaceKind::Source)];
        let selected = !self.contains(source);
        let next = if selected {
            range::union(&self.selected, &row)
        } else {
            range::subtract(&self.selected, &row)
        };
        self.replace(next);
        selected
    }

    pub fn clear(&mut self) -> bool {
        self.replace(Vec::new())
    }

    /// Select exactly the rows of `order` that are not selected now
    ///
    /// Rows outside `order`'s space end up deselected.
    pub fn invert(&mut self, order: &SpaceOrder) -> bool {
        let inverted: Vec<usize> = order
            .to_source
            .iter()
            .copied()
            .filter(|&source| !self.contains(source))
            .collect();
        self.replace(range::compress(&inverted, IndexSpaceKind::Source))
    }

    pub fn select_all(&mut self, order: &SpaceOrder) -> bool {
        self.replace(range::compress(&order.to_source, IndexSpaceKind::Source))
    }

    /// Replace the selection with source positions
    pub fn select_sources(&mut self, sources: &[usize]) -> bool {
        self.replace(range::compress(sources, IndexSpaceKind::Source))
    }

    /// The selection expressed in `order`'s space
    ///
    /// Selected rows missing from that space are left out.
    pub fn get(&self, order: &SpaceOrder) -> Vec<SelectionRange> {
        let positions: Vec<usize> = range::expand(&self.selected)
            .into_iter()
            .filter_map(|source| order.from_source(source))
            .collect();
        range::compress(&positions, order.kind)
    }

    fn replace(&mut self, next: Vec<SelectionRange>) -> bool {
        let next = range::normalize(&next);
        if next == self.selected {
            return false;
        }
        debug!(
            "Selection {} -> {} rows",
            range::count(&self.selected),
            range::count(&next)
        );
        self.selected = next;
        true
    }
}
