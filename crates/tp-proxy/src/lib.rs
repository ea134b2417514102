//! Index projection over a tabular row store
//!
//! A [`Projection`] presents a row store through a chain of index spaces:
//! source positions, raw rows with hidden rows removed, proxy rows in sort
//! order and filter rows that pass the active filter. The chain is kept
//! either entirely in memory or in a mapping table inside the store.

pub mod backend;
pub mod filter;
pub mod identity;
pub mod index_space;
pub mod mapping;
pub mod predicate;
pub mod projection;
pub mod selection;
pub mod sort;

#[cfg(test)]
mod test_support;

pub use backend::{IndexProjection, MemoryProjection, QueryProjection, SourceHandle, Strategy};
pub use filter::{Combine, FilterSpec};
pub use identity::RowIdentity;
pub use index_space::IndexSpace;
pub use mapping::{MappingState, MappingTableManager};
pub use predicate::Predicate;
pub use projection::{Projection, ToggleOutcome};
pub use selection::{SelectionCommand, SelectionTracker, SpaceOrder};
pub use sort::SortKey;
