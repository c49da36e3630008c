//! Services module

pub mod quota;

pub use quota::{
    run_metered, FileChangeWatcher, FileStorage, HttpQuotaSource, LocalCounterStore,
    MeteredOutcome, QuotaError, QuotaKey, QuotaSource, QuotaSynchronizer, QuotaView,
    ResourceKind, SyncOutcome,
};
