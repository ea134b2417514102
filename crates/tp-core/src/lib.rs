//! Core vocabulary for the tabular projection engine
//!
//! This crate provides the value model, index-space identifiers, selection
//! range algebra, the adapter traits data sources implement, and the event
//! bus the projection publishes its notifications on.

pub mod adapter;
pub mod error;
pub mod events;
pub mod index;
pub mod range;
pub mod settings;
pub mod value;

// Re-export commonly used types
pub use adapter::{ConnectionMode, DataSourceAdapter, QueryBackend};
pub use error::{ProjectionError, Result};
pub use events::{EventBus, Event, EventHandler};
pub use events::events::{
    LayoutChanged, MappingRebuilt, RowIdentityAmbiguous, SelectionChanged, SourceAttached,
    SourceDetached,
};
pub use index::{FilterIndex, IndexSpaceKind, ProxyIndex, RawIndex, SortOrder, SourceRowId};
pub use range::SelectionRange;
pub use settings::{ArtifactScope, MappingSettings, ProjectionSettings, SortStability};
pub use value::{CellValue, ColumnDescriptor, ColumnKind};
