//! # freequota-core
//!
//! Free-plan quota synchronization engine, shared by the CLI and any other
//! consumer.
//!
//! This crate provides:
//! - Local counter storage and change notification (`services::quota`)
//! - The optimistic quota synchronizer (`services::quota::sync`)
//! - An HTTP client for the usage and consume endpoints
//! - Client configuration (`config` module)
//! - Unified error handling (`error` module)

pub mod config;
pub mod error;
pub mod services;

pub use config::ClientConfig;
pub use error::{Error, Result};

// Re-export commonly used types from services
pub use services::{
    run_metered, FileChangeWatcher, FileStorage, HttpQuotaSource, LocalCounterStore,
    MeteredOutcome, QuotaError, QuotaKey, QuotaSource, QuotaSynchronizer, QuotaView,
    ResourceKind, SyncOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
