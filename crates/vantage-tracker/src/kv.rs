use fs2::FileExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage contents unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// String key-value storage with the semantics of browser local/session storage.
///
/// Implementations use interior mutability so one store can be shared by several
/// components of the same page.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Wraps a backing store and keeps working when it fails.
///
/// Writes that the backing store refuses land in a page-lifetime memory store, and that key
/// is then served from memory even while the backing store still reads its older value.
/// Once the backing store accepts a write for the key again the memory copy is discarded.
/// This wrapper never returns an error.
pub struct ResilientStore {
    backing: Arc<dyn KeyValueStore>,
    fallback: MemoryStore,
    shadowed: Mutex<BTreeSet<String>>,
    degraded: AtomicBool,
}

impl ResilientStore {
    pub fn new(backing: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backing,
            fallback: MemoryStore::new(),
            shadowed: Mutex::new(BTreeSet::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn shadowed(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.shadowed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_shadowed(&self, key: &str) -> bool {
        self.shadowed().contains(key)
    }

    fn shadow(&self, key: &str) {
        self.shadowed().insert(key.to_string());
    }

    fn unshadow(&self, key: &str) {
        self.shadowed().remove(key);
    }

    fn note_failure(&self, operation: &'static str, key: &str, err: &KvError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                event = "storage_fallback",
                operation,
                key,
                error = %err,
            );
        }
    }
}

impl KeyValueStore for ResilientStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        if self.is_shadowed(key) {
            return self.fallback.get(key);
        }
        match self.backing.get(key) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.note_failure("get", key, &err);
                self.fallback.get(key)
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        match self.backing.set(key, value) {
            Ok(()) => {
                self.unshadow(key);
                self.fallback.remove(key)
            }
            Err(err) => {
                self.note_failure("set", key, &err);
                self.shadow(key);
                self.fallback.set(key, value)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        match self.backing.remove(key) {
            Ok(()) => self.unshadow(key),
            Err(err) => {
                self.note_failure("remove", key, &err);
                self.shadow(key);
            }
        }
        self.fallback.remove(key)
    }
}

/// Durable store persisted as a JSON object on disk.
///
/// Every write takes an exclusive advisory lock on a sibling `.lock` file and re-reads the
/// file before applying the change, so several processes can share one file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Ok(Self { path, lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>, KvError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn update<F>(&self, apply: F) -> Result<(), KvError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let result = self.read_entries().and_then(|mut entries| {
            apply(&mut entries);
            self.write_entries(&entries)
        });

        let _ = lock_file.unlock();
        result
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), KvError> {
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);
        let encoded = serde_json::to_vec_pretty(entries)?;

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backing store that fails every call, or only writes once its quota is full.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub(crate) inner: MemoryStore,
        pub(crate) failing: AtomicBool,
        pub(crate) quota_full: AtomicBool,
    }

    impl FlakyStore {
        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::Relaxed);
        }

        pub(crate) fn set_quota_full(&self, full: bool) {
            self.quota_full.store(full, Ordering::Relaxed);
        }

        fn check(&self) -> Result<(), KvError> {
            if self.failing.load(Ordering::Relaxed) {
                Err(KvError::Unavailable("disabled".to_string()))
            } else {
                Ok(())
            }
        }

        fn check_write(&self, key: &str) -> Result<(), KvError> {
            self.check()?;
            if self.quota_full.load(Ordering::Relaxed) {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
            Ok(())
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.check()?;
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
            self.check_write(key)?;
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), KvError> {
            self.check_write(key)?;
            self.inner.remove(key)
        }
    }

    #[test]
    fn memory_store_round_trips_and_removes() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").expect("get"), None);
        store.set("k", "v").expect("set");
        assert_eq!(store.get("k").expect("get").as_deref(), Some("v"));
        store.remove("k").expect("remove");
        assert!(store.is_empty());
    }

    #[test]
    fn resilient_store_serves_writes_while_backing_fails() {
        let backing = Arc::new(FlakyStore::default());
        backing.set_failing(true);
        let store = ResilientStore::new(backing.clone());

        store.set("k", "v").expect("never fails");
        assert!(store.is_degraded());
        assert_eq!(store.get("k").expect("never fails").as_deref(), Some("v"));

        backing.set_failing(false);
        assert_eq!(backing.inner.get("k").expect("get"), None);
        store.set("k", "w").expect("never fails");
        assert_eq!(backing.inner.get("k").expect("get").as_deref(), Some("w"));
        assert_eq!(store.get("k").expect("never fails").as_deref(), Some("w"));
    }

    #[test]
    fn refused_write_wins_over_stale_backing_value() {
        let backing = Arc::new(FlakyStore::default());
        let store = ResilientStore::new(backing.clone());
        store.set("k", "old").expect("set");

        backing.set_quota_full(true);
        store.set("k", "new").expect("never fails");
        assert_eq!(backing.inner.get("k").expect("get").as_deref(), Some("old"));
        assert_eq!(store.get("k").expect("never fails").as_deref(), Some("new"));

        store.remove("k").expect("never fails");
        assert_eq!(store.get("k").expect("never fails"), None);

        backing.set_quota_full(false);
        store.set("k", "latest").expect("set");
        backing.inner.set("k", "external").expect("set");
        assert_eq!(
            store.get("k").expect("never fails").as_deref(),
            Some("external")
        );
    }

    #[test]
    fn resilient_store_reads_cleared_backing_as_missing() {
        let backing = Arc::new(MemoryStore::new());
        let store = ResilientStore::new(backing.clone());
        store.set("k", "v").expect("set");
        backing.clear();
        assert_eq!(store.get("k").expect("get"), None);
        assert!(!store.is_degraded());
    }

    #[test]
    fn file_store_persists_across_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("durable.json");

        let first = FileStore::open(&path).expect("open");
        first.set("vantage_client_id", "abc").expect("set");
        first.set("other", "1").expect("set");
        first.remove("other").expect("remove");

        let second = FileStore::open(&path).expect("reopen");
        assert_eq!(
            second.get("vantage_client_id").expect("get").as_deref(),
            Some("abc")
        );
        assert_eq!(second.get("other").expect("get"), None);
    }

    #[test]
    fn file_store_reports_corrupt_contents() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        fs::write(file.path(), "not json").expect("write");
        let store = FileStore::open(file.path()).expect("open");
        assert!(matches!(store.get("k"), Err(KvError::Corrupt(_))));
    }
}
