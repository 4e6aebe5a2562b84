//! Event Bus - Subscription Management
//!
//! Binds named engine events to handlers and guarantees every binding is
//! reversed exactly once.
//!
//! # Architecture
//!
//! ```text
//!                          EventBus
//!               ┌──────────────────────────────────────┐
//!               │ HashMap<EventName, Vec<(id, Handler)>>│
//!               │   - wrapped in Arc<RwLock<>>          │
//!               └───────────────┬──────────────────────┘
//!                               │ emit(event)
//!              ┌────────────────┼────────────────┐
//!              │                │                │
//!        chat_token        chat_done       model_loaded
//!       Subscription      Subscription     Subscription
//! ```
//!
//! A [`Subscription`] removes its handler when disposed or dropped. Disposal
//! is idempotent. A [`SubscriptionSet`] groups the subscriptions of one
//! component so they are released together.
//!
//! # Thread Safety
//!
//! Handlers are cloned out of the map before they run, so no lock is held
//! while a handler executes. A handler may subscribe or dispose without
//! deadlocking the bus.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::events::{EngineEvent, EventName};

/// Callback invoked for every event on a channel
pub type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Unique identifier of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type HandlerMap = HashMap<EventName, Vec<(SubscriptionId, Handler)>>;

/// In-process event channel to the external processes
///
/// Cheap to clone; clones share the same handler table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<HandlerMap>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// disposed or dropped.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.inner
            .write()
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::debug!(subscription = %id, event = %name, "Handler subscribed");

        Subscription {
            id,
            name,
            bus: Arc::downgrade(&self.inner),
            disposed: AtomicBool::new(false),
        }
    }

    /// Deliver an event to every handler registered for it
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event: &EngineEvent) -> usize {
        let name = event.name();
        // Snapshot handlers so none run under the lock
        let handlers: Vec<Handler> = self
            .inner
            .read()
            .get(&name)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(event = %name, "No handlers for event");
        }

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Number of handlers registered for an event
    #[must_use]
    pub fn handler_count(&self, name: EventName) -> usize {
        self.inner.read().get(&name).map_or(0, Vec::len)
    }

    /// Total number of registered handlers
    #[must_use]
    pub fn total_handlers(&self) -> usize {
        self.inner.read().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.total_handlers())
            .finish()
    }
}

fn unregister(map: &RwLock<HandlerMap>, name: EventName, id: SubscriptionId) -> bool {
    let mut map = map.write();
    let Some(entries) = map.get_mut(&name) else {
        return false;
    };
    let before = entries.len();
    entries.retain(|(entry_id, _)| *entry_id != id);
    let removed = entries.len() != before;
    if entries.is_empty() {
        map.remove(&name);
    }
    removed
}

/// Disposable handle for one registered handler
///
/// Disposing twice is a no-op. Dropping disposes.
pub struct Subscription {
    id: SubscriptionId,
    name: EventName,
    bus: Weak<RwLock<HandlerMap>>,
    disposed: AtomicBool,
}

impl Subscription {
    /// Registration identifier
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Event this subscription listens to
    #[must_use]
    pub fn event(&self) -> EventName {
        self.name
    }

    /// Whether the handler is still registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    /// Unregister the handler
    ///
    /// Returns `true` only on the call that actually removed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let removed = self
            .bus
            .upgrade()
            .is_some_and(|map| unregister(&map, self.name, self.id));
        tracing::debug!(subscription = %self.id, event = %self.name, "Handler disposed");
        removed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Subscriptions owned by one component, released together
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a subscription
    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Number of held subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the set holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dispose every held subscription and empty the set
    ///
    /// Returns how many handlers were removed. Safe to call repeatedly.
    pub fn dispose_all(&mut self) -> usize {
        self.subscriptions
            .drain(..)
            .filter(|subscription| subscription.dispose())
            .count()
    }
}

impl Extend<Subscription> for SubscriptionSet {
    fn extend<T: IntoIterator<Item = Subscription>>(&mut self, iter: T) {
        self.subscriptions.extend(iter);
    }
}
