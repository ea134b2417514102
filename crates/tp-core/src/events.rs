use std::sync::Arc;
use parking_lot::Mutex;
use ahash::AHashMap;

use crate::index::SourceRowId;
use crate::range::SelectionRange;

/// Notification bus owned by a projection
///
/// Handlers run synchronously on the publishing thread, in subscription
/// order. A handler must not publish or subscribe on the same bus.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<Mutex<AHashMap<std::any::TypeId, Vec<Box<dyn EventHandler>>>>>,
}

/// Event trait that all events must implement
pub trait Event: Send + Sync + 'static {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handler trait for event handlers
pub trait EventHandler: Send + Sync {
    fn handle(&mut self, event: &dyn Event);
}

/// Events published by the projection
pub mod events {
    use super::Event;
    use crate::index::SourceRowId;
    use crate::range::SelectionRange;

    /// The selection changed; both sides are in filter space
    #[derive(Debug, Clone, PartialEq)]
    pub struct SelectionChanged {
        pub old: Vec<SelectionRange>,
        pub new: Vec<SelectionRange>,
    }

    /// Row positions changed wholesale (sort, filter, hide/show, reload)
    #[derive(Debug, Clone, PartialEq)]
    pub struct LayoutChanged {
        pub row_count: usize,
    }

    /// A data source was attached
    #[derive(Debug, Clone, PartialEq)]
    pub struct SourceAttached {
        pub source_name: String,
        pub row_count: usize,
        pub column_count: usize,
    }

    /// The data source was detached
    #[derive(Debug, Clone, PartialEq)]
    pub struct SourceDetached {
        pub source_name: String,
    }

    /// A row without a primary key could not be told apart from others
    #[derive(Debug, Clone, PartialEq)]
    pub struct RowIdentityAmbiguous {
        pub chosen: SourceRowId,
        pub candidates: usize,
        pub columns: Vec<String>,
    }

    /// The query backend rebuilt its mapping table
    #[derive(Debug, Clone, PartialEq)]
    pub struct MappingRebuilt {
        pub table: String,
        pub proxy_rows: usize,
        pub filtered_rows: usize,
    }

    macro_rules! impl_event {
        ($($t:ty),*) => {
            $(
                impl Event for $t {
                    fn as_any(&self) -> &dyn std::any::Any {
                        self
                    }
                }
            )*
        }
    }

    impl_event!(
        SelectionChanged,
        LayoutChanged,
        SourceAttached,
        SourceDetached,
        RowIdentityAmbiguous,
        MappingRebuilt
    );
}

pub use events::{
    LayoutChanged, MappingRebuilt, RowIdentityAmbiguous, SelectionChanged, SourceAttached,
    SourceDetached,
};

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<E: Event>(&self, handler: Box<dyn EventHandler>) {
        let type_id = std::any::TypeId::of::<E>();
        let mut handlers = self.handlers.lock();
        handlers.entry(type_id).or_insert_with(Vec::new).push(handler);
    }

    /// Subscribe a closure that receives the concrete event type
    pub fn subscribe_fn<E, F>(&self, mut f: F)
    where
        E: Event,
        F: FnMut(&E) + Send + Sync + 'static,
    {
        self.subscribe::<E>(handler_from_fn(move |event: &dyn Event| {
            if let Some(event) = event.as_any().downcast_ref::<E>() {
                f(event);
            }
        }));
    }

    /// Publish an event
    pub fn publish<E: Event>(&self, event: E) {
        let type_id = std::any::TypeId::of::<E>();
        let mut handlers = self.handlers.lock();

        if let Some(event_handlers) = handlers.get_mut(&type_id) {
            for handler in event_handlers.iter_mut() {
                handler.handle(&event);
            }
        }
    }

    /// Number of handlers registered for an event type
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .lock()
            .get(&std::any::TypeId::of::<E>())
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.lock().len())
            .finish()
    }
}

/// Helper struct for creating event handlers from closures
pub struct ClosureEventHandler<F> {
    handler: F,
}

impl<F> EventHandler for ClosureEventHandler<F>
where
    F: FnMut(&dyn Event) + Send + Sync,
{
    fn handle(&mut self, event: &dyn Event) {
        (self.handler)(event);
    }
}

/// Create an event handler from a closure
pub fn handler_from_fn<F>(f: F) -> Box<dyn EventHandler>
where
    F: FnMut(&dyn Event) + Send + Sync + 'static,
{
    Box::new(ClosureEventHandler { handler: f })
}

/// Convenience for building a `SelectionChanged` from two range lists
pub fn selection_changed(old: Vec<SelectionRange>, new: Vec<SelectionRange>) -> SelectionChanged {
    SelectionChanged { old, new }
}

/// Convenience for building a `RowIdentityAmbiguous`
pub fn row_identity_ambiguous(
    chosen: SourceRowId,
    candidates: usize,
    columns: Vec<String>,
) -> RowIdentityAmbiguous {
    RowIdentityAmbiguous {
        chosen,
        candidates,
        columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_receive_only_their_event_type() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe_fn(move |event: &LayoutChanged| sink.lock().push(event.row_count));

        bus.publish(LayoutChanged { row_count: 3 });
        bus.publish(SourceDetached {
            source_name: "t".into(),
        });
        bus.publish(LayoutChanged { row_count: 5 });

        assert_eq!(*seen.lock(), vec![3, 5]);
        assert_eq!(bus.handler_count::<LayoutChanged>(), 1);
        assert_eq!(bus.handler_count::<SelectionChanged>(), 0);
    }

    #[test]
    fn test_cloned_bus_shares_handlers() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let sink = count.clone();
        bus.subscribe::<SelectionChanged>(handler_from_fn(move |_| *sink.lock() += 1));

        let other = bus.clone();
        other.publish(selection_changed(vec![], vec![SelectionRange::new(0, 1)]));
        assert_eq!(*count.lock(), 1);
    }
}
