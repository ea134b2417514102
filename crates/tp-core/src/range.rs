//! Selection ranges and the algebra over them
//!
//! A selection is kept as an ordered list of disjoint, non-adjacent closed
//! ranges. The free functions in this module accept arbitrary range lists and
//! always return lists in that normal form.

use serde::{Deserialize, Serialize};

use crate::index::IndexSpaceKind;

/// Closed interval `[top, bottom]` of row positions in one index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionRange {
    pub top: usize,
    pub bottom: usize,
    pub space: IndexSpaceKind,
}

impl SelectionRange {
    /// A range in filter space, the space a table view works in
    pub fn new(top: usize, bottom: usize) -> Self {
        Self::in_space(top, bottom, IndexSpaceKind::Filter)
    }

    /// A range in an explicit space; the bounds are swapped if reversed
    pub fn in_space(top: usize, bottom: usize, space: IndexSpaceKind) -> Self {
        Self {
            top: top.min(bottom),
            bottom: top.max(bottom),
            space,
        }
    }

    /// A single row
    pub fn row(row: usize, space: IndexSpaceKind) -> Self {
        Self::in_space(row, row, space)
    }

    /// Rows covered; saturates for a range spanning every `usize`
    pub fn len(&self) -> usize {
        (self.bottom - self.top).saturating_add(1)
    }

    /// A closed range always covers at least one row
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, row: usize) -> bool {
        self.top <= row && row <= self.bottom
    }

    /// The same bounds relabelled into another space
    pub fn with_space(self, space: IndexSpaceKind) -> Self {
        Self { space, ..self }
    }
}

/// Collapse row positions into the minimal list of ranges
///
/// Runs in O(n) for sorted input; unsorted input is sorted first.
pub fn compress(rows: &[usize], space: IndexSpaceKind) -> Vec<SelectionRange> {
    let sorted;
    let rows = if rows.windows(2).all(|w| w[0] < w[1]) {
        rows
    } else {
        let mut owned = rows.to_vec();
        owned.sort_unstable();
        owned.dedup();
        sorted = owned;
        &sorted[..]
    };

    let mut ranges = Vec::new();
    let mut iter = rows.iter().copied();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut top = first;
    let mut bottom = first;
    for row in iter {
        if row == bottom + 1 {
            bottom = row;
        } else {
            ranges.push(SelectionRange::in_space(top, bottom, space));
            top = row;
            bottom = row;
        }
    }
    ranges.push(SelectionRange::in_space(top, bottom, space));
    ranges
}

/// Enumerate every row position covered by the ranges, ascending and unique
pub fn expand(ranges: &[SelectionRange]) -> Vec<usize> {
    normalize(ranges)
        .iter()
        .flat_map(|range| range.top..=range.bottom)
        .collect()
}

/// Sort ranges and merge overlapping or adjacent ones
pub fn normalize(ranges: &[SelectionRange]) -> Vec<SelectionRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|range| (range.top, range.bottom));

    let mut merged: Vec<SelectionRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.top <= last.bottom.saturating_add(1) => {
                last.bottom = last.bottom.max(range.bottom);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Rows covered by either list
pub fn union(a: &[SelectionRange], b: &[SelectionRange]) -> Vec<SelectionRange> {
    let mut all = Vec::with_capacity(a.len() + b.len());
    all.extend_from_slice(a);
    all.extend_from_slice(b);
    normalize(&all)
}

/// Rows covered by `a` but not by `b`
pub fn subtract(a: &[SelectionRange], b: &[SelectionRange]) -> Vec<SelectionRange> {
    let a = normalize(a);
    let b = normalize(b);

    let mut out = Vec::with_capacity(a.len());
    let mut first = 0;
    for range in a {
        while first < b.len() && b[first].bottom < range.top {
            first += 1;
        }

        let mut top = range.top;
        let mut remaining = true;
        for cut in b[first..].iter().take_while(|cut| cut.top <= range.bottom) {
            if cut.top > top {
                out.push(SelectionRange::in_space(top, cut.top - 1, range.space));
            }
            if cut.bottom >= range.bottom {
                remaining = false;
                break;
            }
            top = top.max(cut.bottom + 1);
        }
        if remaining {
            out.push(SelectionRange::in_space(top, range.bottom, range.space));
        }
    }
    out
}

/// Rows of `[0, row_count - 1]` not covered by the ranges
pub fn complement(
    ranges: &[SelectionRange],
    row_count: usize,
    space: IndexSpaceKind,
) -> Vec<SelectionRange> {
    if row_count == 0 {
        return Vec::new();
    }
    let everything = [SelectionRange::in_space(0, row_count - 1, space)];
    subtract(&everything, ranges)
}

/// Drop the parts of the ranges at or beyond `row_count`
pub fn clamp(ranges: &[SelectionRange], row_count: usize) -> Vec<SelectionRange> {
    normalize(ranges)
        .into_iter()
        .filter(|range| range.top < row_count)
        .map(|range| SelectionRange {
            bottom: range.bottom.min(row_count - 1),
            ..range
        })
        .collect()
}

/// Membership test on a normalised list, by binary search
pub fn contains(ranges: &[SelectionRange], row: usize) -> bool {
    let idx = ranges.partition_point(|range| range.bottom < row);
    ranges.get(idx).is_some_and(|range| range.top <= row)
}

/// Number of rows covered by a normalised list
pub fn count(ranges: &[SelectionRange]) -> usize {
    ranges
        .iter()
        .map(SelectionRange::len)
        .fold(0, usize::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE: IndexSpaceKind = IndexSpaceKind::Source;

    fn r(top: usize, bottom: usize) -> SelectionRange {
        SelectionRange::in_space(top, bottom, SPACE)
    }

    #[test]
    fn test_compress_merges_adjacent_rows() {
        assert_eq!(compress(&[1, 2, 3, 7, 9, 10], SPACE), vec![r(1, 3), r(7, 7), r(9, 10)]);
        assert_eq!(compress(&[5, 1, 2, 2], SPACE), vec![r(1, 2), r(5, 5)]);
        assert!(compress(&[], SPACE).is_empty());
    }

    #[test]
    fn test_expand_inverts_compress() {
        let rows = vec![0, 1, 4, 5, 6, 11];
        assert_eq!(expand(&compress(&rows, SPACE)), rows);
        assert_eq!(expand(&[r(3, 4), r(1, 3)]), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_union_and_subtract() {
        assert_eq!(union(&[r(0, 2)], &[r(3, 5), r(8, 9)]), vec![r(0, 5), r(8, 9)]);
        assert_eq!(subtract(&[r(0, 9)], &[r(2, 3), r(5, 5)]), vec![r(0, 1), r(4, 4), r(6, 9)]);
        assert!(subtract(&[r(2, 4)], &[r(0, 10)]).is_empty());
        assert_eq!(subtract(&[r(0, 3), r(6, 9)], &[r(2, 7)]), vec![r(0, 1), r(8, 9)]);
    }

    #[test]
    fn test_complement() {
        assert_eq!(complement(&[r(1, 2)], 5, SPACE), vec![r(0, 0), r(3, 4)]);
        assert_eq!(complement(&[], 3, SPACE), vec![r(0, 2)]);
        assert!(complement(&[r(0, 2)], 3, SPACE).is_empty());
        assert!(complement(&[], 0, SPACE).is_empty());
    }

    #[test]
    fn test_contains_and_count() {
        let ranges = vec![r(1, 3), r(7, 7)];
        assert!(contains(&ranges, 1));
        assert!(contains(&ranges, 7));
        assert!(!contains(&ranges, 4));
        assert!(!contains(&ranges, 8));
        assert_eq!(count(&ranges), 4);
    }

    #[test]
    fn test_clamp_drops_rows_past_the_end() {
        assert_eq!(clamp(&[r(2, 8), r(10, 12)], 5), vec![r(2, 4)]);
    }

    #[test]
    fn test_reversed_bounds_are_swapped() {
        assert_eq!(SelectionRange::new(4, 1), SelectionRange::new(1, 4));
        assert_eq!(SelectionRange::new(1, 4).len(), 4);
    }

    #[test]
    fn test_len_at_the_limits() {
        assert_eq!(r(usize::MAX, usize::MAX).len(), 1);
        assert_eq!(r(1, usize::MAX).len(), usize::MAX);
        assert_eq!(r(0, usize::MAX).len(), usize::MAX);
        assert_eq!(count(&[r(0, 5), r(7, usize::MAX)]), usize::MAX);
        assert!(contains(&[r(0, usize::MAX)], usize::MAX));
    }
}
