//! Quota synchronizer
//!
//! Owns the in-memory "used" count for one quota and reconciles an
//! optimistic local value against the server's authoritative one.
//!
//! # State machine
//!
//! ```text
//!                initialize(exempt | no subject)
//!  Uninitialized ────────────────────────────────▶ Bypassed   (terminal)
//!        │
//!        │ initialize(subject)
//!        ▼
//!     Metered  ── increment_optimistic / rollback / update_from_server /
//!   (terminal)    sync_from_server / bus events
//! ```
//!
//! # Stale-response guard
//!
//! Every `sync_from_server` takes a logical ticket when it starts, and every
//! accepted authoritative value (from a sync or from `update_from_server`)
//! records the ticket it was accepted under. A sync that completes after a
//! higher ticket was accepted is discarded, so a slow early request never
//! clobbers a fresher value.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::bus::{EventBus, EventHandler, SubscriptionId, SyncEvent};
use super::provider::{QuotaError, QuotaSource};
use super::store::LocalCounterStore;
use super::types::{QuotaKey, QuotaView, ResourceKind, ServerValue, SyncOutcome};

// ============================================================================
// Constants
// ============================================================================

/// Default deadline for `sync_from_server`
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// State
// ============================================================================

#[derive(Debug)]
struct Metered {
    key: QuotaKey,
    storage_key: String,
    used: u32,
    limit: u32,
    pending: u32,
    next_ticket: u64,
    /// Ticket of the last accepted authoritative value
    accepted_ticket: Option<u64>,
    last_synced_at: Option<DateTime<Utc>>,
    /// Whether `used` matches what the store holds. While `false` the store
    /// is behind memory and must not be adopted as a fallback.
    persisted: bool,
}

impl Metered {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn is_superseded(&self, ticket: u64) -> bool {
        self.accepted_ticket.is_some_and(|accepted| accepted > ticket)
    }

    fn accept(&mut self, value: u32, ticket: u64) {
        self.used = value;
        self.pending = 0;
        self.accepted_ticket = Some(self.accepted_ticket.map_or(ticket, |t| t.max(ticket)));
        self.last_synced_at = Some(Utc::now());
    }
}

#[derive(Debug)]
enum SyncState {
    /// No value established yet; `used` reads as 0 for rendering only
    Uninitialized { limit: u32 },
    /// Exempt subject, or no subject identity: nothing is tracked
    Bypassed { limit: u32, exempt: bool },
    Metered(Metered),
}

type SharedState = Arc<Mutex<SyncState>>;

fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// QuotaSynchronizer
// ============================================================================

/// Optimistic local replica of one server-enforced counter
///
/// All operations except `sync_from_server` are synchronous and complete
/// before returning. None of them return errors: storage and network
/// failures are logged and absorbed.
pub struct QuotaSynchronizer {
    resource_kind: ResourceKind,
    store: LocalCounterStore,
    buses: Vec<Arc<dyn EventBus>>,
    state: SharedState,
    subscriptions: Mutex<Vec<(Arc<dyn EventBus>, SubscriptionId)>>,
    sync_timeout: Duration,
}

impl QuotaSynchronizer {
    /// Create an uninitialized synchronizer.
    ///
    /// It listens on the store's same-context bus; add cross-context buses
    /// with [`with_bus`](Self::with_bus).
    pub fn new(resource_kind: ResourceKind, limit: u32, store: LocalCounterStore) -> Self {
        let local: Arc<dyn EventBus> = store.local_bus().clone();
        Self {
            resource_kind,
            store,
            buses: vec![local],
            state: Arc::new(Mutex::new(SyncState::Uninitialized { limit })),
            subscriptions: Mutex::new(Vec::new()),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// Also apply notifications arriving on `bus` (typically a
    /// [`CrossContextBus`](super::bus::CrossContextBus)).
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.buses.push(bus);
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn resource_kind(&self) -> &ResourceKind {
        &self.resource_kind
    }

    /// The tracked quota, once initialized with a subject
    pub fn key(&self) -> Option<QuotaKey> {
        match &*lock(&self.state) {
            SyncState::Metered(m) => Some(m.key.clone()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    /// Establish the starting value.
    ///
    /// Exempt subjects and missing identities short-circuit to a permanent
    /// `used = 0`. Otherwise the last stored value (if any) is adopted for
    /// instant display; a later sync corrects staleness. Initialization is
    /// terminal: further calls are ignored.
    pub fn initialize(&self, subject: Option<&str>, is_exempt: bool, limit: u32) -> QuotaView {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, SyncState::Uninitialized { .. }) {
                log::debug!("[quota:sync] initialize ignored: already initialized");
                drop(state);
                return self.view();
            }

            let subject = subject.map(str::trim).filter(|s| !s.is_empty());
            match subject {
                Some(subject) if !is_exempt => {
                    let key = QuotaKey::new(subject, self.resource_kind.clone());
                    let storage_key = key.storage_key();
                    let stored = self.store.read(&key);
                    match stored {
                        Some(value) => log::info!(
                            "[quota:sync] {} initialized from local store: {}",
                            key,
                            value
                        ),
                        None => log::info!("[quota:sync] {} initialized with no stored value", key),
                    }

                    self.subscribe_all(&storage_key);
                    *state = SyncState::Metered(Metered {
                        key,
                        storage_key,
                        used: stored.unwrap_or(0),
                        limit,
                        pending: 0,
                        next_ticket: 0,
                        accepted_ticket: None,
                        last_synced_at: None,
                        persisted: true,
                    });
                }
                _ => {
                    log::info!(
                        "[quota:sync] {} quota bypassed (exempt: {}, subject: {})",
                        self.resource_kind,
                        is_exempt,
                        subject.is_some()
                    );
                    *state = SyncState::Bypassed {
                        limit,
                        exempt: is_exempt,
                    };
                }
            }
        }
        self.view()
    }

    fn subscribe_all(&self, storage_key: &str) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for bus in &self.buses {
            let id = bus.subscribe(storage_key, event_handler(Arc::downgrade(&self.state)));
            subscriptions.push((Arc::clone(bus), id));
        }
    }

    // ------------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------------

    /// Charge one action before it is sent, clamped to the limit.
    pub fn increment_optimistic(&self) {
        let (key, value) = {
            let mut state = lock(&self.state);
            let SyncState::Metered(m) = &mut *state else {
                return;
            };
            let previous = m.used;
            m.used = m.used.saturating_add(1).min(m.limit);
            m.pending = m.pending.saturating_add(1);
            log::debug!(
                "[quota:sync] {} optimistic increment: {} -> {} (pending {})",
                m.key,
                previous,
                m.used,
                m.pending
            );
            (m.key.clone(), m.used)
        };
        self.persist(&key, value);
    }

    /// Undo one optimistic charge after the action failed for a reason
    /// other than quota exhaustion.
    pub fn rollback(&self) {
        let (key, value) = {
            let mut state = lock(&self.state);
            let SyncState::Metered(m) = &mut *state else {
                return;
            };
            let previous = m.used;
            m.used = m.used.saturating_sub(1);
            m.pending = m.pending.saturating_sub(1);
            log::debug!(
                "[quota:sync] {} rollback: {} -> {} (pending {})",
                m.key,
                previous,
                m.used,
                m.pending
            );
            (m.key.clone(), m.used)
        };
        self.persist(&key, value);
    }

    // ------------------------------------------------------------------------
    // Authoritative values
    // ------------------------------------------------------------------------

    /// Overwrite with a server-reported count.
    ///
    /// The server always wins, even when lower than the optimistic value.
    /// Missing, negative, or non-numeric values are rejected and logged.
    /// Returns whether the value was accepted.
    pub fn update_from_server(&self, value: impl Into<ServerValue>) -> bool {
        let value = value.into();
        let (key, count) = {
            let mut state = lock(&self.state);
            let SyncState::Metered(m) = &mut *state else {
                return false;
            };
            let Some(count) = value.as_count() else {
                log::warn!(
                    "[quota:sync] {} rejected invalid server value: {}",
                    m.key,
                    value
                );
                return false;
            };
            let ticket = m.take_ticket();
            log::info!(
                "[quota:sync] {} updated from server: {} -> {}",
                m.key,
                m.used,
                count
            );
            m.accept(count, ticket);
            (m.key.clone(), count)
        };
        self.persist(&key, count);
        true
    }

    /// Fetch the authoritative count and reconcile.
    ///
    /// `fetch` is bounded by the configured timeout. A failed or timed-out
    /// fetch falls back to the last locally stored value; a result that was
    /// overtaken by a later accepted value is discarded.
    pub async fn sync_from_server<F, Fut>(&self, fetch: F) -> SyncOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ServerValue, QuotaError>>,
    {
        let (key, ticket) = {
            let mut state = lock(&self.state);
            let SyncState::Metered(m) = &mut *state else {
                return SyncOutcome::Skipped;
            };
            (m.key.clone(), m.take_ticket())
        };

        let result = match tokio::time::timeout(self.sync_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(QuotaError::Timeout(
                u64::try_from(self.sync_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match result {
            Ok(value) => self.accept_synced(&key, ticket, value),
            Err(e) => {
                log::warn!("[quota:sync] {} sync failed, using local value: {}", key, e);
                self.fall_back(&key)
            }
        }
    }

    fn accept_synced(&self, key: &QuotaKey, ticket: u64, value: ServerValue) -> SyncOutcome {
        let Some(count) = value.as_count() else {
            log::warn!(
                "[quota:sync] {} rejected invalid server value: {}",
                key,
                value
            );
            return SyncOutcome::Rejected;
        };

        {
            let mut state = lock(&self.state);
            let SyncState::Metered(m) = &mut *state else {
                return SyncOutcome::Skipped;
            };
            if m.is_superseded(ticket) {
                log::warn!(
                    "[quota:sync] {} discarded stale server value {} (ticket {} < {:?})",
                    key,
                    count,
                    ticket,
                    m.accepted_ticket
                );
                return SyncOutcome::Stale;
            }
            log::info!("[quota:sync] {} synced from server: {}", key, count);
            m.accept(count, ticket);
        }
        self.persist(key, count);
        SyncOutcome::Accepted(count)
    }

    /// Write through to the store and record whether it stuck.
    fn persist(&self, key: &QuotaKey, value: u32) {
        let persisted = self.store.write(key, value);
        if let SyncState::Metered(m) = &mut *lock(&self.state) {
            if m.used == value {
                m.persisted = persisted;
            }
        }
    }

    fn fall_back(&self, key: &QuotaKey) -> SyncOutcome {
        let stored = self.store.read(key);
        let mut state = lock(&self.state);
        let SyncState::Metered(m) = &mut *state else {
            return SyncOutcome::Skipped;
        };
        match stored {
            Some(value) if m.persisted => {
                m.used = value;
                SyncOutcome::FellBack(Some(value))
            }
            Some(value) => {
                log::warn!(
                    "[quota:sync] {} store holds {} but memory has unpersisted {}; keeping memory",
                    key,
                    value,
                    m.used
                );
                SyncOutcome::FellBack(None)
            }
            None => SyncOutcome::FellBack(None),
        }
    }

    /// [`sync_from_server`](Self::sync_from_server) against a [`QuotaSource`]
    pub async fn sync_with(&self, source: &dyn QuotaSource) -> SyncOutcome {
        let Some(key) = self.key() else {
            return SyncOutcome::Skipped;
        };
        log::debug!("[quota:sync] {} syncing via {}", key, source.source_id());
        self.sync_from_server(|| source.fetch_used(&key)).await
    }

    /// Fire-and-forget sync on the tokio runtime
    pub fn spawn_sync(self: &Arc<Self>, source: Arc<dyn QuotaSource>) -> JoinHandle<SyncOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.sync_with(source.as_ref()).await })
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    pub fn view(&self) -> QuotaView {
        match &*lock(&self.state) {
            SyncState::Uninitialized { limit } => QuotaView::new(0, *limit),
            SyncState::Bypassed { limit, exempt } => QuotaView {
                is_initialized: true,
                is_exempt: *exempt,
                ..QuotaView::new(0, *limit)
            },
            SyncState::Metered(m) => QuotaView {
                pending: m.pending,
                is_initialized: true,
                last_synced_at: m.last_synced_at,
                ..QuotaView::new(m.used, m.limit)
            },
        }
    }

    pub fn used(&self) -> u32 {
        self.view().used
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(*lock(&self.state), SyncState::Uninitialized { .. })
    }

    /// Soft local check: only ever `true` for an initialized, metered quota
    /// at or over its limit. The server enforces the real limit regardless.
    pub fn is_exhausted(&self) -> bool {
        match &*lock(&self.state) {
            SyncState::Metered(m) => m.used >= m.limit,
            _ => false,
        }
    }
}

impl Drop for QuotaSynchronizer {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (bus, id) in subscriptions.drain(..) {
            bus.unsubscribe(id);
        }
    }
}

/// Bus handler: adopt the broadcast value as-is, whether higher or lower,
/// along with whether it reached the store.
fn event_handler(state: Weak<Mutex<SyncState>>) -> EventHandler {
    Arc::new(move |event: &SyncEvent| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if let SyncState::Metered(m) = &mut *state {
            if m.storage_key != event.key {
                return;
            }
            m.persisted = event.persisted;
            if m.used != event.value {
                log::debug!(
                    "[quota:sync] {} event ({:?}): {} -> {}",
                    m.key,
                    event.origin,
                    m.used,
                    event.value
                );
                m.used = event.value;
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
