//! Sorting of the proxy permutation
//!
//! The in-memory strategy permutes source positions with a comparator that
//! re-reads both cells from the adapter on every comparison. The query
//! strategy only records the active key and renders it as an `ORDER BY`
//! clause for the mapping table rebuild.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tp_core::{
    CellValue, ColumnKind, DataSourceAdapter, IndexSpaceKind, ProjectionError, QueryBackend,
    Result, SortOrder, SortStability,
};

use crate::index_space::IndexSpace;

/// Column and direction of the active sort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: usize,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(column: usize, order: SortOrder) -> Self {
        Self { column, order }
    }

    pub fn ascending(column: usize) -> Self {
        Self::new(column, SortOrder::Ascending)
    }

    pub fn descending(column: usize) -> Self {
        Self::new(column, SortOrder::Descending)
    }
}

/// Partition-exchange sort with the middle element as pivot
///
/// Not stable. A comparator error aborts the sort and is returned; the slice
/// is then left partially permuted, so callers sort a copy.
pub fn partition_sort<T, F>(items: &mut [T], compare: &mut F) -> Result<()>
where
    T: Copy,
    F: FnMut(T, T) -> Result<Ordering>,
{
    let mut items = items;
    while items.len() > 1 {
        let split = partition(items, compare)?;
        let (left, right) = std::mem::take(&mut items).split_at_mut(split);
        // recurse into the smaller half to bound stack depth
        if left.len() < right.len() {
            partition_sort(left, compare)?;
            items = right;
        } else {
            partition_sort(right, compare)?;
            items = left;
        }
    }
    Ok(())
}

/// Hoare partition; returns the length of the left half, in `1..len`
fn partition<T, F>(items: &mut [T], compare: &mut F) -> Result<usize>
where
    T: Copy,
    F: FnMut(T, T) -> Result<Ordering>,
{
    let last = items.len() - 1;
    let pivot = items[last / 2];
    let mut i = 0;
    let mut j = last;

    loop {
        while i < last && compare(items[i], pivot)? == Ordering::Less {
            i += 1;
        }
        while j > 0 && compare(items[j], pivot)? == Ordering::Greater {
            j -= 1;
        }
        if i >= j {
            // an inconsistent comparator must not stall the outer loop
            return Ok((j + 1).clamp(1, last));
        }
        items.swap(i, j);
        i += 1;
        j -= 1;
    }
}

/// Active sort state plus both sort strategies
#[derive(Debug, Clone)]
pub struct SortEngine {
    stability: SortStability,
    active: Option<SortKey>,
}

impl SortEngine {
    pub fn new(stability: SortStability) -> Self {
        Self {
            stability,
            active: None,
        }
    }

    pub fn stability(&self) -> SortStability {
        self.stability
    }

    pub fn active(&self) -> Option<SortKey> {
        self.active
    }

    /// Whether sorting by `key` would change nothing
    pub fn is_current(&self, key: Option<SortKey>) -> bool {
        self.active == key
    }

    pub fn record(&mut self, key: Option<SortKey>) {
        if self.active != key {
            debug!("Sort key {:?} -> {:?}", self.active, key);
        }
        self.active = key;
    }

    /// Sort source positions by `key`
    ///
    /// On error `positions` may be partially permuted and must be discarded.
    pub fn sort_positions(
        &self,
        positions: &mut [usize],
        key: SortKey,
        adapter: &dyn DataSourceAdapter,
        space: &IndexSpace,
    ) -> Result<()> {
        let kind = adapter.column_kind(key.column)?;
        let mut compare = |a: usize, b: usize| compare_positions(adapter, space, key, kind, a, b);

        match self.stability {
            SortStability::Unstable => partition_sort(positions, &mut compare),
            SortStability::Stable => {
                let mut failure = None;
                positions.sort_by(|&a, &b| {
                    if failure.is_some() {
                        return Ordering::Equal;
                    }
                    compare(a, b).unwrap_or_else(|e| {
                        failure = Some(e);
                        Ordering::Equal
                    })
                });
                failure.map_or(Ok(()), Err)
            }
        }
    }

    /// `ORDER BY` terms reproducing the active sort in SQL
    ///
    /// With no active sort rows keep their key order. Text columns sort
    /// case-insensitively first, matching the in-memory comparator.
    pub fn order_by_sql(&self, backend: &dyn QueryBackend) -> Result<String> {
        let key_sql = backend.key_column_sql();
        let Some(key) = self.active else {
            return Ok(format!("{} ASC", key_sql));
        };

        let column = backend.as_adapter().column(key.column)?;
        let name = backend.escape_identifier(&column.name);
        let direction = key.order.sql();

        let mut terms = Vec::with_capacity(3);
        if column.kind == ColumnKind::Text {
            terms.push(format!("{} COLLATE NOCASE {}", name, direction));
        }
        terms.push(format!("{} {}", name, direction));
        if self.stability == SortStability::Stable {
            terms.push(format!("{} ASC", key_sql));
        }
        Ok(terms.join(", "))
    }
}

/// Compare two rows, given by source position, under `key`
pub fn compare_positions(
    adapter: &dyn DataSourceAdapter,
    space: &IndexSpace,
    key: SortKey,
    kind: ColumnKind,
    a: usize,
    b: usize,
) -> Result<Ordering> {
    let left = read_cell(adapter, space, a, key.column)?;
    let right = read_cell(adapter, space, b, key.column)?;
    Ok(key.order.apply(left.compare_as(&right, kind)))
}

fn read_cell(
    adapter: &dyn DataSourceAdapter,
    space: &IndexSpace,
    position: usize,
    column: usize,
) -> Result<CellValue> {
    let id = space
        .id_at(position)
        .ok_or_else(|| ProjectionError::invalid_row(position, IndexSpaceKind::Source))?;
    adapter.cell_value(id, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scenario_memory, BrokenCells};
    use std::sync::Arc;
    use tp_core::SourceRowId;

    fn sort_numbers(values: &[i32]) -> Vec<i32> {
        let mut items = values.to_vec();
        partition_sort(&mut items, &mut |a: i32, b: i32| Ok(a.cmp(&b))).unwrap();
        items
    }

    #[test]
    fn test_partition_sort_matches_std_sort() {
        let inputs: Vec<Vec<i32>> = vec![
            vec![],
            vec![1],
            vec![2, 1],
            vec![5, 1, 4, 2, 3],
            vec![3, 3, 3, 3],
            vec![1, 2, 3, 4, 5, 6, 7],
            vec![7, 6, 5, 4, 3, 2, 1],
            vec![4, 1, 4, 1, 4, 1, 9, 0, 0, 2],
            (0..200).map(|i| (i * 37) % 101).collect(),
        ];
        for input in inputs {
            let mut expected = input.clone();
            expected.sort();
            assert_eq!(sort_numbers(&input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_partition_sort_propagates_errors() {
        let mut items = vec![3, 1, 2];
        let result = partition_sort(&mut items, &mut |_: i32, _: i32| {
            Err(ProjectionError::QueryFailed("boom".into()))
        });
        assert_eq!(result, Err(ProjectionError::QueryFailed("boom".into())));
    }

    #[test]
    fn test_sort_positions_descending() {
        let source = scenario_memory();
        let space = IndexSpace::from_adapter(source.as_ref()).unwrap();
        for stability in [SortStability::Unstable, SortStability::Stable] {
            let engine = SortEngine::new(stability);
            let mut positions = space.raw_to_source().to_vec();
            engine
                .sort_positions(&mut positions, SortKey::descending(1), source.as_ref(), &space)
                .unwrap();
            let ids: Vec<_> = positions.iter().map(|p| space.id_at(*p).unwrap()).collect();
            assert_eq!(
                ids,
                vec![SourceRowId(10), SourceRowId(30), SourceRowId(50), SourceRowId(40), SourceRowId(20)]
            );
        }
    }

    #[test]
    fn test_stable_sort_keeps_ties_in_source_order() {
        let source = scenario_memory();
        let space = IndexSpace::from_adapter(source.as_ref()).unwrap();
        let engine = SortEngine::new(SortStability::Stable);
        // column 3 is the group column: [b, a, b, a, b]
        let mut positions = space.raw_to_source().to_vec();
        engine
            .sort_positions(&mut positions, SortKey::ascending(3), source.as_ref(), &space)
            .unwrap();
        assert_eq!(positions, vec![1, 3, 0, 2, 4]);
    }

    #[test]
    fn test_sort_fails_on_cell_error() {
        let broken = Arc::new(BrokenCells::new(scenario_memory()));
        let space = IndexSpace::from_adapter(broken.as_ref()).unwrap();
        broken.fail(true);

        let engine = SortEngine::new(SortStability::Unstable);
        let mut positions = space.raw_to_source().to_vec();
        let result = engine.sort_positions(&mut positions, SortKey::ascending(1), broken.as_ref(), &space);
        assert!(matches!(result, Err(ProjectionError::QueryFailed(_))));
    }

    #[test]
    fn test_mixed_cells_in_numeric_column_sort_like_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.sqlite");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE mixed (id INTEGER PRIMARY KEY, value INTEGER);
             INSERT INTO mixed VALUES (1, 10), (2, '3a'), (3, 5), (4, 'b'), (5, 2.5), (6, NULL), (7, '7');",
        )
        .unwrap();
        drop(conn);
        let source = tp_data::SqliteSource::open(&path, "mixed").unwrap();
        let space = IndexSpace::from_adapter(&source).unwrap();

        let mut recorded = SortEngine::new(SortStability::Stable);
        recorded.record(Some(SortKey::ascending(1)));
        let sql = format!("SELECT id FROM mixed ORDER BY {}", recorded.order_by_sql(&source).unwrap());
        let expected: Vec<i64> = source
            .query_rows(&sql, &[])
            .unwrap()
            .iter()
            .filter_map(|r| r[0].as_i64())
            .collect();
        assert_eq!(expected, vec![6, 5, 3, 7, 1, 2, 4]);

        for stability in [SortStability::Unstable, SortStability::Stable] {
            let engine = SortEngine::new(stability);
            let mut positions = space.raw_to_source().to_vec();
            engine
                .sort_positions(&mut positions, SortKey::ascending(1), &source, &space)
                .unwrap();
            let ids: Vec<i64> = positions.iter().map(|p| space.id_at(*p).unwrap().get()).collect();
            assert_eq!(ids, expected, "{:?}", stability);
        }
    }

    #[test]
    fn test_invalid_column_is_rejected() {
        let source = scenario_memory();
        let space = IndexSpace::from_adapter(source.as_ref()).unwrap();
        let engine = SortEngine::new(SortStability::Unstable);
        let mut positions = space.raw_to_source().to_vec();
        assert_eq!(
            engine.sort_positions(&mut positions, SortKey::ascending(42), source.as_ref(), &space),
            Err(ProjectionError::InvalidColumn(42))
        );
    }
}
