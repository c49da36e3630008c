//! Counter change notifications
//!
//! Two delivery paths share one subscription interface:
//!
//! - [`LocalBus`]: fired synchronously by the writer right after a store
//!   write. Needed because native storage-change signals never fire in the
//!   context that performed the write.
//! - [`CrossContextBus`]: fed by a native change signal (a shared
//!   [`SharedMemory`](super::store::SharedMemory) or a
//!   [`FileChangeWatcher`](super::watcher::FileChangeWatcher)) when another
//!   context rewrites the shared store.
//!
//! Delivery is FIFO within a path. Nothing is guaranteed across paths.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::parse_stored_count;

// ============================================================================
// Event Types
// ============================================================================

/// Identity of one execution context (one tab, one process)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which path delivered an event. Used for routing and logging only,
/// never for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    SameContext,
    OtherContext,
}

/// "Counter changed" notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Namespaced storage key (see [`QuotaKey::storage_key`](super::types::QuotaKey::storage_key))
    pub key: String,
    pub value: u32,
    pub origin: EventOrigin,
    /// Whether `value` reached the shared store. Always `true` for
    /// cross-context events.
    pub persisted: bool,
}

/// Callback invoked for each matching event
pub type EventHandler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
pub type SubscriptionId = u64;

// ============================================================================
// Bus Trait
// ============================================================================

/// Keyed publish/subscribe
///
/// Subscribers only receive events for the key they registered.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, key: &str, handler: EventHandler) -> SubscriptionId;

    /// Returns `false` if the subscription was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

// ============================================================================
// Subscriber Registry
// ============================================================================

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    // Vec keeps registration order, so handlers run in the order they subscribed
    entries: Vec<(SubscriptionId, String, EventHandler)>,
}

impl Registry {
    fn insert(&mut self, key: &str, handler: EventHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push((id, key.to_string(), handler));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn handlers_for(&self, key: &str) -> Vec<EventHandler> {
        self.entries
            .iter()
            .filter(|(_, k, _)| k == key)
            .map(|(_, _, h)| Arc::clone(h))
            .collect()
    }
}

/// Shared by both buses. Handlers are cloned out and called with the
/// registry unlocked, so a handler may subscribe or unsubscribe.
#[derive(Default)]
struct Subscribers(Mutex<Registry>);

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, event: &SyncEvent) -> usize {
        let handlers = self.lock().handlers_for(&event.key);
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

// ============================================================================
// Same-Context Path
// ============================================================================

/// In-process signal fired by the writer after every store write
#[derive(Default)]
pub struct LocalBus {
    subscribers: Subscribers,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `value` to every subscriber of `key`, synchronously.
    /// `persisted` tells subscribers whether the write reached storage.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&self, key: &str, value: u32, persisted: bool) -> usize {
        let event = SyncEvent {
            key: key.to_string(),
            value,
            origin: EventOrigin::SameContext,
            persisted,
        };
        let delivered = self.subscribers.deliver(&event);
        log::debug!(
            "[quota:bus] local {} = {} -> {} subscriber(s)",
            key,
            value,
            delivered
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl EventBus for LocalBus {
    fn subscribe(&self, key: &str, handler: EventHandler) -> SubscriptionId {
        self.subscribers.lock().insert(key, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().remove(id)
    }
}

// ============================================================================
// Cross-Context Path
// ============================================================================

/// Receives native "storage changed" signals written by other contexts
///
/// The native layer hands over the raw string value exactly as stored;
/// this bus validates it with the same rules as a local read.
pub struct CrossContextBus {
    context: ContextId,
    subscribers: Subscribers,
}

impl CrossContextBus {
    pub fn new() -> Self {
        Self {
            context: ContextId::new(),
            subscribers: Subscribers::default(),
        }
    }

    /// The context this bus belongs to. Native sources skip delivery to the
    /// writer's own context.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Route a native change signal to subscribers of `key`.
    ///
    /// Removals (`None`) and values that do not parse as a count are dropped.
    pub fn dispatch(&self, key: &str, new_value: Option<&str>) -> usize {
        let Some(raw) = new_value else {
            log::debug!("[quota:bus] ignoring removal of {}", key);
            return 0;
        };
        let Some(value) = parse_stored_count(raw) else {
            log::debug!("[quota:bus] ignoring unparseable value {:?} for {}", raw, key);
            return 0;
        };

        let event = SyncEvent {
            key: key.to_string(),
            value,
            origin: EventOrigin::OtherContext,
            persisted: true,
        };
        let delivered = self.subscribers.deliver(&event);
        log::debug!(
            "[quota:bus] cross-context {} = {} -> {} subscriber(s)",
            key,
            value,
            delivered
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for CrossContextBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for CrossContextBus {
    fn subscribe(&self, key: &str, handler: EventHandler) -> SubscriptionId {
        self.subscribers.lock().insert(key, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().remove(id)
    }
}

// ============================================================================
// Tests
// ============================================================================
