//! Source and raw index bookkeeping
//!
//! Source positions index the adapter's row listing. The raw space is the
//! subsequence of source positions that are not hidden, in source order, so
//! showing a row puts it back exactly where it was.

use ahash::AHashMap;
use tracing::{debug, warn};

use tp_core::{DataSourceAdapter, RawIndex, Result, SourceRowId};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpace {
    ids: Vec<SourceRowId>,
    positions: AHashMap<SourceRowId, usize>,
    raw2source: Vec<usize>,
    source2raw: Vec<Option<RawIndex>>,
}

impl IndexSpace {
    /// Space over the given row ids with nothing hidden
    pub fn new(ids: Vec<SourceRowId>) -> Self {
        let positions = ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
        let raw2source = (0..ids.len()).collect();
        let source2raw = (0..ids.len()).map(Some).collect();
        Self {
            ids,
            positions,
            raw2source,
            source2raw,
        }
    }

    pub fn from_adapter(adapter: &dyn DataSourceAdapter) -> Result<Self> {
        Ok(Self::new(adapter.row_ids()?))
    }

    /// Rows in the adapter, hidden ones included
    pub fn source_len(&self) -> usize {
        self.ids.len()
    }

    pub fn raw_row_count(&self) -> usize {
        self.raw2source.len()
    }

    pub fn hidden_count(&self) -> usize {
        self.ids.len() - self.raw2source.len()
    }

    pub fn source_of(&self, raw: RawIndex) -> Option<usize> {
        self.raw2source.get(raw).copied()
    }

    pub fn raw_of(&self, source: usize) -> Option<RawIndex> {
        self.source2raw.get(source).copied().flatten()
    }

    pub fn id_at(&self, source: usize) -> Option<SourceRowId> {
        self.ids.get(source).copied()
    }

    pub fn position_of(&self, id: SourceRowId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn is_hidden(&self, source: usize) -> bool {
        source < self.ids.len() && self.source2raw[source].is_none()
    }

    /// Source positions of the visible rows, in raw order
    pub fn raw_to_source(&self) -> &[usize] {
        &self.raw2source
    }

    pub fn ids(&self) -> &[SourceRowId] {
        &self.ids
    }

    pub fn hidden_ids(&self) -> Vec<SourceRowId> {
        self.source2raw
            .iter()
            .enumerate()
            .filter(|(_, raw)| raw.is_none())
            .map(|(pos, _)| self.ids[pos])
            .collect()
    }

    /// Hide rows by raw index
    ///
    /// Returns the source positions that were hidden, ascending. Indices out
    /// of range are skipped.
    pub fn hide(&mut self, raw_indices: &[RawIndex]) -> Vec<usize> {
        let mut hidden = Vec::with_capacity(raw_indices.len());
        for &raw in raw_indices {
            match self.raw2source.get(raw) {
                Some(&source) => {
                    if self.source2raw[source].take().is_some() {
                        hidden.push(source);
                    }
                }
                None => warn!("Ignoring hide of raw row {} (raw rows: {})", raw, self.raw2source.len()),
            }
        }
        if !hidden.is_empty() {
            self.compact();
            hidden.sort_unstable();
            debug!("Hid {} rows, {} remain visible", hidden.len(), self.raw2source.len());
        }
        hidden
    }

    /// Show hidden rows by source position
    ///
    /// Returns the source positions that became visible, ascending. Rows that
    /// are already visible or out of range are skipped.
    pub fn show(&mut self, source_positions: &[usize]) -> Vec<usize> {
        let mut shown = Vec::with_capacity(source_positions.len());
        for &source in source_positions {
            match self.source2raw.get_mut(source) {
                Some(raw) if raw.is_none() => {
                    // placeholder until compaction assigns the real index
                    *raw = Some(usize::MAX);
                    shown.push(source);
                }
                Some(_) => {}
                None => warn!("Ignoring show of source row {} (rows: {})", source, self.ids.len()),
            }
        }
        if !shown.is_empty() {
            self.compact();
            shown.sort_unstable();
            debug!("Showed {} rows, {} visible", shown.len(), self.raw2source.len());
        }
        shown
    }

    pub fn show_all(&mut self) -> Vec<usize> {
        let hidden: Vec<usize> = (0..self.ids.len()).filter(|&s| self.is_hidden(s)).collect();
        self.show(&hidden)
    }

    /// Hide rows by id, skipping unknown ids
    pub fn hide_ids(&mut self, ids: &[SourceRowId]) -> Vec<usize> {
        let raw: Vec<RawIndex> = ids
            .iter()
            .filter_map(|id| self.position_of(*id))
            .filter_map(|pos| self.raw_of(pos))
            .collect();
        self.hide(&raw)
    }

    /// Rebuild both directions from the visibility flags in `source2raw`
    fn compact(&mut self) {
        self.raw2source.clear();
        for (source, raw) in self.source2raw.iter_mut().enumerate() {
            if raw.is_some() {
                *raw = Some(self.raw2source.len());
                self.raw2source.push(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(n: i64) -> IndexSpace {
        IndexSpace::new((0..n).map(|i| SourceRowId(i * 10)).collect())
    }

    fn assert_inverse(space: &IndexSpace) {
        for raw in 0..space.raw_row_count() {
            let source = space.source_of(raw).unwrap();
            assert_eq!(space.raw_of(source), Some(raw));
        }
        assert_eq!(
            space.raw_row_count() + space.hidden_count(),
            space.source_len()
        );
    }

    #[test]
    fn test_hide_compacts_raw_space() {
        let mut space = space(6);
        let hidden = space.hide(&[4, 1, 1]);
        assert_eq!(hidden, vec![1, 4]);
        assert_eq!(space.raw_row_count(), 4);
        assert_eq!(space.raw_to_source(), &[0, 2, 3, 5]);
        assert_eq!(space.raw_of(1), None);
        assert_eq!(space.hidden_ids(), vec![SourceRowId(10), SourceRowId(40)]);
        assert_inverse(&space);
    }

    #[test]
    fn test_hide_then_show_restores_order() {
        let mut space = space(5);
        let before = space.raw_to_source().to_vec();

        let hidden = space.hide(&[0, 2]);
        assert_eq!(space.raw_row_count(), 3);
        let shown = space.show(&hidden);
        assert_eq!(shown, hidden);
        assert_eq!(space.raw_to_source(), before.as_slice());
        assert_inverse(&space);
    }

    #[test]
    fn test_redundant_and_invalid_indices_are_ignored() {
        let mut space = space(3);
        assert!(space.show(&[0, 1]).is_empty());
        assert!(space.hide(&[7]).is_empty());
        assert_eq!(space.hide(&[0]), vec![0]);
        // raw 0 is now source 1
        assert_eq!(space.hide(&[0]), vec![1]);
        assert!(space.show(&[9]).is_empty());
        assert_inverse(&space);
    }

    #[test]
    fn test_show_mixed_batch() {
        let mut space = space(5);
        space.hide(&[1, 3]);
        assert_eq!(space.show(&[3, 0, 3, 8, 1]), vec![1, 3]);
        assert_eq!(space.raw_to_source(), &[0, 1, 2, 3, 4]);
        assert_inverse(&space);
    }

    #[test]
    fn test_hide_everything() {
        let mut space = space(3);
        space.hide(&[0, 1, 2]);
        assert_eq!(space.raw_row_count(), 0);
        assert_eq!(space.source_of(0), None);
        assert_eq!(space.show_all(), vec![0, 1, 2]);
        assert_eq!(space.raw_row_count(), 3);
    }

    #[test]
    fn test_id_lookup() {
        let mut space = space(4);
        assert_eq!(space.position_of(SourceRowId(30)), Some(3));
        assert_eq!(space.position_of(SourceRowId(35)), None);
        assert_eq!(space.hide_ids(&[SourceRowId(20), SourceRowId(99)]), vec![2]);
        assert!(space.is_hidden(2));
        assert_eq!(space.id_at(2), Some(SourceRowId(20)));
    }
}
