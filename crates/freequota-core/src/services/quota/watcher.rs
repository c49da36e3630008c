//! Native change signal for [`FileStorage`]
//!
//! Watches the store file's directory and turns rewrites made by other
//! processes into [`CrossContextBus`] dispatches, so a running synchronizer
//! converges without polling.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Error, Result};

use super::bus::CrossContextBus;
use super::store::FileStorage;

struct WatchState {
    storage: Arc<FileStorage>,
    bus: Arc<CrossContextBus>,
    snapshot: Mutex<HashMap<String, String>>,
}

impl WatchState {
    /// Reload the document and dispatch every key whose value changed
    /// since the previous reload. Returns the number of keys dispatched.
    fn refresh(&self) -> usize {
        let current = match self.storage.load() {
            Ok(map) => map,
            Err(e) => {
                log::warn!("[quota:watch] Failed to reload store: {}", e);
                return 0;
            }
        };

        let changed: Vec<(String, String)> = {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = current
                .iter()
                .filter(|(k, v)| snapshot.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            *snapshot = current;
            changed
        };

        let mut dispatched = 0;
        for (key, value) in changed {
            if self.storage.is_own_write(&key, &value) {
                continue;
            }
            self.storage.forget_own_write(&key);
            log::debug!("[quota:watch] {} changed on disk -> {}", key, value);
            self.bus.dispatch(&key, Some(&value));
            dispatched += 1;
        }
        dispatched
    }
}

/// Filesystem watcher feeding a [`CrossContextBus`]
///
/// Stops watching when dropped.
pub struct FileChangeWatcher {
    state: Arc<WatchState>,
    _watcher: RecommendedWatcher,
}

impl FileChangeWatcher {
    /// Start watching `storage`'s file.
    ///
    /// The current contents become the baseline; only later changes are
    /// dispatched.
    pub fn start(storage: Arc<FileStorage>, bus: Arc<CrossContextBus>) -> Result<Self> {
        let path = storage.path().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| Error::config(format!("Store path has no file name: {}", path.display())))?
            .to_os_string();
        std::fs::create_dir_all(&dir)?;

        let state = Arc::new(WatchState {
            snapshot: Mutex::new(storage.load()?),
            storage,
            bus,
        });

        let handler_state = Arc::clone(&state);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let touches_store = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if touches_store && (event.kind.is_modify() || event.kind.is_create()) {
                    handler_state.refresh();
                }
            }
            Err(e) => log::warn!("[quota:watch] Watch error: {}", e),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        log::info!("[quota:watch] Watching {}", path.display());
        Ok(Self {
            state,
            _watcher: watcher,
        })
    }

    /// Re-read the file now instead of waiting for a filesystem event.
    pub fn refresh(&self) -> usize {
        self.state.refresh()
    }
}
