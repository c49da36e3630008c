//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod counter;
pub mod remote;
pub mod status;
pub mod watch;

use std::sync::Arc;

use freequota_core::services::quota::{
    CrossContextBus, FileStorage, HttpQuotaSource, LocalBus, LocalCounterStore,
    QuotaSynchronizer,
};
use freequota_core::{ClientConfig, ResourceKind};

use crate::output::OutputFormat;

/// Shared context for all commands
pub struct Context {
    pub config: ClientConfig,
    pub format: OutputFormat,
    pub quiet: bool,
    pub subject: Option<String>,
    pub kind: ResourceKind,
    pub limit: u32,
    pub exempt: bool,
    pub storage: Arc<FileStorage>,
    pub cross_bus: Arc<CrossContextBus>,
}

impl Context {
    pub fn new(
        config: ClientConfig,
        format: OutputFormat,
        quiet: bool,
        subject: Option<String>,
        kind: ResourceKind,
        limit: Option<u32>,
        exempt: bool,
    ) -> Self {
        log::debug!("Using store file {}", config.store_path.display());
        let storage = Arc::new(FileStorage::new(config.store_path.clone()));
        Self {
            limit: limit.unwrap_or(config.default_limit),
            config,
            format,
            quiet,
            subject,
            kind,
            exempt,
            storage,
            cross_bus: Arc::new(CrossContextBus::new()),
        }
    }

    /// Initialized synchronizer over the store file
    pub fn synchronizer(&self) -> QuotaSynchronizer {
        let store = LocalCounterStore::new(self.storage.clone(), Arc::new(LocalBus::new()));
        let sync = QuotaSynchronizer::new(self.kind.clone(), self.limit, store)
            .with_bus(self.cross_bus.clone())
            .with_sync_timeout(self.config.sync_timeout);
        sync.initialize(self.subject.as_deref(), self.exempt, self.limit);
        sync
    }

    pub fn source(&self) -> HttpQuotaSource {
        HttpQuotaSource::from_config(&self.config)
    }

    /// Subject label for messages
    pub fn subject_label(&self) -> &str {
        self.subject.as_deref().unwrap_or("<none>")
    }
}
