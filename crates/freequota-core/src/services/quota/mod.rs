//! Free-plan quota tracking
//!
//! Keeps a locally displayed "used" count for a server-enforced limit. The
//! count is charged optimistically before each metered action, reconciled
//! against the server's authoritative value afterwards, and kept consistent
//! across every instance observing the same quota.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ QuotaSynchronizer                                       │
//! │   - initialize()                                        │
//! │   - increment_optimistic() / rollback()                 │
//! │   - update_from_server() / sync_from_server()           │
//! └─────────────────────────────────────────────────────────┘
//!      │ write            ▲ events             │ fetch
//!      ▼                  │                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────┐
//! │LocalCounterStore │ │ LocalBus         │ │trait         │
//! │  read() / write()│─▶ (same context)   │ │ QuotaSource  │
//! └──────────────────┘ │ CrossContextBus  │ └──────────────┘
//!      │               │ (other contexts) │        │
//!      ▼               └──────────────────┘        ▼
//! ┌──────────────────┐          ▲          ┌──────────────┐
//! │trait             │          │          │HttpQuotaSrc. │
//! │ KeyValueStorage  │──────────┘          │ usage/consume│
//! │ Memory │ File    │ change signal       └──────────────┘
//! └──────────────────┘ (SharedMemory, FileChangeWatcher)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use freequota_core::services::quota::{
//!     run_metered, HttpQuotaSource, LocalCounterStore, QuotaSynchronizer, ResourceKind,
//! };
//!
//! let store = LocalCounterStore::in_memory();
//! let sync = QuotaSynchronizer::new(ResourceKind::AiChat, 5, store);
//! sync.initialize(Some("42"), false, 5);
//!
//! let source = HttpQuotaSource::new("http://localhost:5000").with_token(Some(token));
//! sync.sync_with(&source).await;
//!
//! let key = sync.key().unwrap();
//! let outcome = run_metered(&sync, Some(&source), || source.consume(&key, "Where to eat?")).await;
//! ```

pub mod action;
pub mod bus;
pub mod http;
pub mod provider;
pub mod store;
pub mod sync;
pub mod types;
pub mod watcher;

// Re-export main types
pub use types::{
    parse_stored_count, QuotaKey, QuotaView, ResourceKind, ServerValue, SyncOutcome,
    DEFAULT_LIMIT, STORAGE_KEY_PREFIX,
};

// Re-export source trait and error
pub use provider::{QuotaError, QuotaSource};

pub use action::{run_metered, ActionResponse, CountReport, MeteredOutcome};
pub use bus::{
    ContextId, CrossContextBus, EventBus, EventHandler, EventOrigin, LocalBus, SubscriptionId,
    SyncEvent,
};
pub use http::{ChatReply, HttpQuotaSource};
pub use store::{FileStorage, KeyValueStorage, LocalCounterStore, MemoryStorage, SharedMemory};
pub use sync::{QuotaSynchronizer, DEFAULT_SYNC_TIMEOUT};
pub use watcher::FileChangeWatcher;
