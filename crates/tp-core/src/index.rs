//! Row identifiers and index-space vocabulary

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Position among all rows that are not hidden
pub type RawIndex = usize;

/// Position after the active sort is applied to the raw space
pub type ProxyIndex = usize;

/// Position among rows passing the active filter, in proxy order
pub type FilterIndex = usize;

/// Stable identifier of a row, assigned by the backing store
///
/// Either the value of the store's integer primary key or a store-assigned
/// physical row number. Never reused while the row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRowId(pub i64);

impl SourceRowId {
    /// Raw integer value
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for SourceRowId {
    fn from(value: i64) -> Self {
        SourceRowId(value)
    }
}

impl fmt::Display for SourceRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The successive index spaces a row passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexSpaceKind {
    /// Positions in the adapter's row listing, hidden rows included
    Source,
    /// Positions among rows that are not hidden
    Raw,
    /// Raw rows after sorting
    Proxy,
    /// Sorted rows passing the filter; what a table view renders
    Filter,
}

impl fmt::Display for IndexSpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexSpaceKind::Source => "source",
            IndexSpaceKind::Raw => "raw",
            IndexSpaceKind::Proxy => "proxy",
            IndexSpaceKind::Filter => "filter",
        };
        f.write_str(name)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// Orient an ascending comparison result
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }

    /// SQL keyword for this direction
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }

    /// The opposite direction
    pub fn reversed(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}
