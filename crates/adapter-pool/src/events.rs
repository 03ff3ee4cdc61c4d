//! Lifecycle event notification.
//!
//! The pool publishes four events: `acquire` before every acquisition
//! attempt, `release` before every release, `query` once per successfully
//! bound query, and `close` after the pool has drained and torn down its
//! connections. Delivery is synchronous with the triggering call.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::value::Value;

/// Kinds of lifecycle events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Emitted before each acquisition attempt.
    Acquire,
    /// Emitted before each release attempt.
    Release,
    /// Emitted once per query bound to a connection.
    Query,
    /// Emitted once the pool has been closed.
    Close,
}

impl EventKind {
    /// Event name as used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::Query => "query",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A connection is about to be acquired.
    Acquire,
    /// A connection is about to be released.
    Release,
    /// A query was bound to a connection.
    Query {
        /// Statement text.
        statement: String,
        /// Statement parameters.
        params: Vec<Value>,
    },
    /// The pool was closed.
    Close,
}

impl PoolEvent {
    /// The kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Acquire => EventKind::Acquire,
            Self::Release => EventKind::Release,
            Self::Query { .. } => EventKind::Query,
            Self::Close => EventKind::Close,
        }
    }
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    /// `None` listens to every kind.
    kind: Option<EventKind>,
    handler: Handler,
}

/// Registry of lifecycle listeners.
///
/// A listener that panics is logged and skipped; it never unwinds into the
/// pool operation that emitted the event.
pub struct EventNotifier {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Register a listener for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() < before
    }

    /// Number of listeners that would receive an event of `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.kind.is_none_or(|k| k == kind))
            .count()
    }

    /// Deliver an event to every matching listener.
    pub fn emit(&self, event: &PoolEvent) {
        let kind = event.kind();

        // Snapshot so listeners can (un)subscribe from inside a callback.
        let handlers: Vec<Handler> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind.is_none_or(|k| k == kind))
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(event = %kind, "event listener panicked");
            }
        }
    }

    fn insert(&self, kind: Option<EventKind>, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener { id, kind, handler });
        id
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(notifier: &EventNotifier) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.subscribe_all(move |event| sink.lock().push(event.kind()));
        seen
    }

    #[test]
    fn test_delivers_only_matching_kind() {
        let notifier = EventNotifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        notifier.subscribe(EventKind::Release, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(&PoolEvent::Acquire);
        notifier.emit(&PoolEvent::Release);
        notifier.emit(&PoolEvent::Close);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(EventKind::Release), 1);
        assert_eq!(notifier.listener_count(EventKind::Acquire), 0);
    }

    #[test]
    fn test_subscribe_all_preserves_order() {
        let notifier = EventNotifier::new();
        let seen = recorder(&notifier);

        notifier.emit(&PoolEvent::Acquire);
        notifier.emit(&PoolEvent::Query {
            statement: "SELECT 1".into(),
            params: vec![],
        });
        notifier.emit(&PoolEvent::Release);

        assert_eq!(
            *seen.lock(),
            vec![EventKind::Acquire, EventKind::Query, EventKind::Release]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = EventNotifier::new();
        let id = notifier.subscribe(EventKind::Close, |_| {});
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert_eq!(notifier.listener_count(EventKind::Close), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let notifier = EventNotifier::new();
        notifier.subscribe(EventKind::Acquire, |_| panic!("observer failure"));
        let seen = recorder(&notifier);

        notifier.emit(&PoolEvent::Acquire);
        notifier.emit(&PoolEvent::Acquire);

        assert_eq!(*seen.lock(), vec![EventKind::Acquire, EventKind::Acquire]);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let notifier = Arc::new(EventNotifier::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&notifier);
        let own_id = Arc::clone(&slot);
        let counter = Arc::clone(&hits);
        let id = notifier.subscribe(EventKind::Release, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let (Some(n), Some(id)) = (weak.upgrade(), *own_id.lock()) {
                n.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        notifier.emit(&PoolEvent::Release);
        notifier.emit(&PoolEvent::Release);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
