//! Local counter storage
//!
//! A string-keyed, string-valued persistence boundary ([`KeyValueStorage`])
//! with two backends, and [`LocalCounterStore`], which reads and writes one
//! integer per [`QuotaKey`] on top of it.
//!
//! Storage failures never reach callers of `LocalCounterStore`: a failed read
//! is "absent", a failed write is logged and the engine keeps running from
//! memory.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Error, Result};

use super::bus::{ContextId, CrossContextBus, LocalBus};
use super::types::{parse_stored_count, QuotaKey};

// ============================================================================
// Storage Trait
// ============================================================================

/// Browser-local-storage style key-value store
pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite `key` unconditionally
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-Memory Backend
// ============================================================================

#[derive(Default)]
struct SharedInner {
    items: HashMap<String, String>,
    contexts: Vec<(ContextId, Weak<CrossContextBus>)>,
    fail_writes: bool,
}

/// In-process store shared by several simulated contexts
///
/// Mirrors browser semantics: a write made through one context's handle
/// raises a change signal in every *other* attached context, never in the
/// writer's own.
#[derive(Default)]
pub struct SharedMemory {
    inner: Mutex<SharedInner>,
}

impl SharedMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle for a context with no cross-context listener
    pub fn handle(self: &Arc<Self>) -> MemoryStorage {
        MemoryStorage {
            shared: Arc::clone(self),
            context: ContextId::new(),
        }
    }

    /// Handle for the context owning `bus`; writes by other handles are
    /// dispatched into it.
    pub fn attach(self: &Arc<Self>, bus: &Arc<CrossContextBus>) -> MemoryStorage {
        let context = bus.context_id();
        lock(&self.inner)
            .contexts
            .push((context, Arc::downgrade(bus)));
        MemoryStorage {
            shared: Arc::clone(self),
            context,
        }
    }

    /// Make every subsequent write fail, as a full or disabled store would
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.inner).fail_writes = fail;
    }

    /// Write raw bytes without raising any change signal (simulates corruption)
    pub fn put_raw(&self, key: &str, value: &str) {
        lock(&self.inner)
            .items
            .insert(key.to_string(), value.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        lock(&self.inner).items.get(key).cloned()
    }
}

/// One context's view of a [`SharedMemory`]
#[derive(Clone)]
pub struct MemoryStorage {
    shared: Arc<SharedMemory>,
    context: ContextId,
}

impl MemoryStorage {
    /// Standalone store not shared with any other context
    pub fn isolated() -> Self {
        SharedMemory::new().handle()
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.shared.inner).items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let listeners: Vec<Arc<CrossContextBus>> = {
            let mut inner = lock(&self.shared.inner);
            if inner.fail_writes {
                return Err(Error::storage("QuotaExceededError: storage is full"));
            }
            inner.items.insert(key.to_string(), value.to_string());
            inner.contexts.retain(|(_, bus)| bus.strong_count() > 0);
            inner
                .contexts
                .iter()
                .filter(|(context, _)| *context != self.context)
                .filter_map(|(_, bus)| bus.upgrade())
                .collect()
        };

        for bus in listeners {
            bus.dispatch(key, Some(value));
        }
        Ok(())
    }
}

// ============================================================================
// File Backend
// ============================================================================

/// JSON object file shared between OS processes
///
/// Every write rewrites the whole file through a uniquely named temp file +
/// rename, so a reader never sees a half-written document. Two processes
/// writing different keys at the same instant can still lose one update.
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
    /// Last value this process wrote per key, so the watcher can tell its
    /// own writes from foreign ones.
    own_writes: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            own_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document. A missing file is an empty store; a corrupt
    /// file is an empty store too, with a warning.
    pub fn load(&self) -> Result<HashMap<String, String>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(HashMap::new());
        }

        match serde_json::from_str::<HashMap<String, String>>(&text) {
            Ok(map) => Ok(map),
            Err(e) => {
                log::warn!(
                    "[quota:store] Ignoring corrupt store file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(HashMap::new())
            }
        }
    }

    /// Whether `value` for `key` is what this process itself last wrote
    pub fn is_own_write(&self, key: &str, value: &str) -> bool {
        lock(&self.own_writes).get(key).map(String::as_str) == Some(value)
    }

    /// Drop the own-write marker for `key` once a foreign value replaced it
    pub fn forget_own_write(&self, key: &str) {
        lock(&self.own_writes).remove(key);
    }

    fn write_document(&self, map: &HashMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // Each write gets its own temp file; other processes write here too
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(map)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        // Record before the rename so the watcher can never observe our own
        // value without the marker in place.
        lock(&self.own_writes).insert(key.to_string(), value.to_string());
        self.write_document(&map)
    }
}

// ============================================================================
// LocalCounterStore
// ============================================================================

/// Integer-per-quota view of a [`KeyValueStorage`] that also fires the
/// same-context notification after every write
#[derive(Clone)]
pub struct LocalCounterStore {
    storage: Arc<dyn KeyValueStorage>,
    local_bus: Arc<LocalBus>,
}

impl LocalCounterStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, local_bus: Arc<LocalBus>) -> Self {
        Self { storage, local_bus }
    }

    /// Store over an isolated in-memory backend with its own bus
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::isolated()), Arc::new(LocalBus::new()))
    }

    pub fn local_bus(&self) -> &Arc<LocalBus> {
        &self.local_bus
    }

    /// Last persisted count, or `None` if never recorded, unreadable, or corrupt.
    ///
    /// `None` is deliberately distinct from `Some(0)`.
    pub fn read(&self, key: &QuotaKey) -> Option<u32> {
        let storage_key = key.storage_key();
        match self.storage.get_item(&storage_key) {
            Ok(Some(raw)) => {
                let parsed = parse_stored_count(&raw);
                if parsed.is_none() {
                    log::warn!(
                        "[quota:store] Treating corrupt value {:?} for {} as absent",
                        raw,
                        storage_key
                    );
                }
                parsed
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("[quota:store] Error reading {}: {}", storage_key, e);
                None
            }
        }
    }

    /// Persist `value` and notify same-context subscribers.
    ///
    /// Returns whether the value reached storage. Subscribers are notified
    /// either way so that instances in this context still converge when the
    /// store is unavailable.
    pub fn write(&self, key: &QuotaKey, value: u32) -> bool {
        let storage_key = key.storage_key();
        let persisted = match self.storage.set_item(&storage_key, &value.to_string()) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "[quota:store] Error writing {} = {} (continuing in memory): {}",
                    storage_key,
                    value,
                    e
                );
                false
            }
        };
        self.local_bus.publish(&storage_key, value, persisted);
        persisted
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quota::bus::{EventBus, EventOrigin, SyncEvent};
    use crate::services::quota::types::ResourceKind;

    fn key() -> QuotaKey {
        QuotaKey::new("42", ResourceKind::AiChat)
    }

    #[test]
    fn test_read_missing_is_absent_not_zero() {
        let store = LocalCounterStore::in_memory();
        assert_eq!(store.read(&key()), None);

        store.write(&key(), 0);
        assert_eq!(store.read(&key()), Some(0));
    }

    #[test]
    fn test_write_overwrites() {
        let store = LocalCounterStore::in_memory();
        store.write(&key(), 3);
        store.write(&key(), 1);
        assert_eq!(store.read(&key()), Some(1));
    }

    #[test]
    fn test_corrupt_value_reads_as_absent() {
        let shared = SharedMemory::new();
        let store = LocalCounterStore::new(Arc::new(shared.handle()), Arc::new(LocalBus::new()));
        shared.put_raw(&key().storage_key(), "3x");
        assert_eq!(store.read(&key()), None);
    }

    #[test]
    fn test_write_failure_is_swallowed_and_still_notifies() {
        let shared = SharedMemory::new();
        let local_bus = Arc::new(LocalBus::new());
        let store = LocalCounterStore::new(Arc::new(shared.handle()), Arc::clone(&local_bus));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        local_bus.subscribe(
            &key().storage_key(),
            Arc::new(move |e: &SyncEvent| sink.lock().unwrap().push((e.value, e.persisted))),
        );

        assert!(store.write(&key(), 1));
        shared.set_fail_writes(true);
        assert!(!store.write(&key(), 2));
        assert_eq!(store.read(&key()), Some(1));
        assert_eq!(*seen.lock().unwrap(), vec![(1, true), (2, false)]);
    }

    #[test]
    fn test_shared_memory_signals_other_contexts_only() {
        let shared = SharedMemory::new();
        let bus_a = Arc::new(CrossContextBus::new());
        let bus_b = Arc::new(CrossContextBus::new());
        let tab_a = shared.attach(&bus_a);
        let _tab_b = shared.attach(&bus_b);

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let sink_a = Arc::clone(&seen_a);
        let sink_b = Arc::clone(&seen_b);
        bus_a.subscribe("k", Arc::new(move |e: &SyncEvent| sink_a.lock().unwrap().push(e.clone())));
        bus_b.subscribe("k", Arc::new(move |e: &SyncEvent| sink_b.lock().unwrap().push(e.clone())));

        tab_a.set_item("k", "1").unwrap();

        assert!(seen_a.lock().unwrap().is_empty());
        let seen_b = seen_b.lock().unwrap();
        assert_eq!(seen_b.len(), 1);
        assert_eq!(seen_b[0].value, 1);
        assert_eq!(seen_b[0].origin, EventOrigin::OtherContext);
    }

    #[test]
    fn test_dropped_context_is_pruned() {
        let shared = SharedMemory::new();
        let writer = shared.handle();
        {
            let bus = Arc::new(CrossContextBus::new());
            let _tab = shared.attach(&bus);
        }
        writer.set_item("k", "1").unwrap();
        assert!(lock(&shared.inner).contexts.is_empty());
    }

    #[test]
    fn test_file_storage_roundtrip_and_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("quota.json"));

        assert_eq!(storage.get_item("k").unwrap(), None);
        storage.set_item("k", "4").unwrap();
        storage.set_item("other", "1").unwrap();

        let reopened = FileStorage::new(storage.path().to_path_buf());
        assert_eq!(reopened.get_item("k").unwrap(), Some("4".to_string()));
        assert_eq!(reopened.get_item("other").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_file_storage_corrupt_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::new(path);
        assert!(storage.load().unwrap().is_empty());
        storage.set_item("k", "1").unwrap();
        assert_eq!(storage.get_item("k").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_file_storage_concurrent_writers_never_fail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quota.json");

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let storage = FileStorage::new(path.clone());
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|i| storage.set_item("k", &format!("{}", writer * 1000 + i)).is_err())
                        .count()
                })
            })
            .collect();
        let failed: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(failed, 0);

        let value = FileStorage::new(path.clone()).get_item("k").unwrap().unwrap();
        assert!(value.parse::<u32>().unwrap() % 1000 == 199);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_file_storage_tracks_own_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("quota.json"));

        storage.set_item("k", "2").unwrap();
        assert!(storage.is_own_write("k", "2"));
        assert!(!storage.is_own_write("k", "3"));

        storage.forget_own_write("k");
        assert!(!storage.is_own_write("k", "2"));
    }
}
