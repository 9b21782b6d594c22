//! Shared key/value store visible to every process of the same user session.
//!
//! There is no compare-and-swap here. Reads and writes race, and callers
//! are expected to live with lost updates.

use crate::channel::{Envelope, FOREIGN, Inbox};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const CHANGE_CAPACITY: usize = 64;

/// Errors from the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store is unavailable")]
    Unavailable,
    #[error("shared store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A key changed in another process. `value` is `None` when the key was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<String>,
}

/// Origin-scoped key/value store with change notification.
pub trait LockStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clear(&self, key: &str) -> Result<(), StoreError>;
    /// Changes made through other handles (other processes).
    fn subscribe(&self) -> Inbox<StoreChange>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryShared {
    values: Mutex<HashMap<String, String>>,
    available: AtomicBool,
    tx: broadcast::Sender<Envelope<StoreChange>>,
}

/// In-memory store. Each `attach()`ed handle plays one process.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<MemoryShared>,
    id: Uuid,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            shared: Arc::new(MemoryShared {
                values: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                tx,
            }),
            id: Uuid::new_v4(),
        }
    }

    /// A new handle on the same backing map, with its own identity.
    pub fn attach(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            id: Uuid::new_v4(),
        }
    }

    /// Simulate restrictive storage: every operation fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn notify(&self, key: &str, value: Option<String>) {
        let _ = self.shared.tx.send(Envelope {
            origin: self.id,
            payload: StoreChange {
                key: key.to_string(),
                value,
            },
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(lock(&self.shared.values).get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.shared.values).insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let removed = lock(&self.shared.values).remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> Inbox<StoreChange> {
        Inbox::new(self.shared.tx.subscribe(), self.id)
    }
}

/// Store backed by one JSON file per key in a directory shared by all
/// processes of the session. Change notification is by polling.
pub struct FileStore {
    dir: PathBuf,
    id: Uuid,
    poll_interval: Duration,
    tx: broadcast::Sender<Envelope<StoreChange>>,
    /// Last value this process wrote per key, so the poller can skip echoes.
    own: Arc<Mutex<HashMap<String, Option<String>>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        debug!(dir = %dir.display(), "Opened file store");
        Ok(Self {
            dir,
            id: Uuid::new_v4(),
            poll_interval,
            tx,
            own: Arc::new(Mutex::new(HashMap::new())),
            poller: Mutex::new(None),
        })
    }

    /// Default session-scoped location: the runtime dir, else the temp dir.
    pub fn default_dir() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("singlebell")
            .join("store")
    }

    /// Location for state that must end with the login session. Only the
    /// runtime dir qualifies: the temp dir survives logging out.
    pub fn session_dir() -> Option<PathBuf> {
        session_dir_in(dirs::runtime_dir())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    fn remember(&self, key: &str, value: Option<String>) {
        lock(&self.own).insert(file_stem(key), value);
    }

    fn ensure_poller(&self) {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; file store changes will not be observed");
            return;
        };
        let dir = self.dir.clone();
        let own = Arc::clone(&self.own);
        let tx = self.tx.clone();
        let interval = self.poll_interval;
        *poller = Some(runtime.spawn(poll_changes(dir, own, tx, interval)));
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.poller).take() {
            handle.abort();
        }
    }
}

impl LockStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_stem(key), self.id.simple()));
        // Remember before the rename lands so the poller never sees our own write as foreign.
        self.remember(key, Some(value.to_string()));
        fs::write(&tmp, value).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        self.remember(key, None);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn subscribe(&self) -> Inbox<StoreChange> {
        self.ensure_poller();
        Inbox::new(self.tx.subscribe(), self.id)
    }
}

fn session_dir_in(runtime_dir: Option<PathBuf>) -> Option<PathBuf> {
    runtime_dir.map(|dir| dir.join("singlebell").join("session"))
}

fn file_stem(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

fn snapshot(dir: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return values;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(content) = fs::read_to_string(&path) {
            values.insert(stem.to_string(), content);
        }
    }
    values
}

async fn poll_changes(
    dir: PathBuf,
    own: Arc<Mutex<HashMap<String, Option<String>>>>,
    tx: broadcast::Sender<Envelope<StoreChange>>,
    interval: Duration,
) {
    let mut last = snapshot(&dir);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let current = snapshot(&dir);

        let mut keys: Vec<&String> = current.keys().chain(last.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let value = current.get(key).cloned();
            if value.as_ref() == last.get(key) {
                continue;
            }
            if lock(&own).get(key) == Some(&value) {
                trace!(%key, "Skipping own store write");
                continue;
            }
            let _ = tx.send(Envelope {
                origin: FOREIGN,
                payload: StoreChange {
                    key: key.clone(),
                    value,
                },
            });
        }

        last = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_read_write_clear() {
        let store = MemoryStore::new();
        assert_eq!(store.read("k").unwrap(), None);
        store.write("k", "v").unwrap();
        assert_eq!(store.read("k").unwrap(), Some("v".to_string()));
        store.clear("k").unwrap();
        assert_eq!(store.read("k").unwrap(), None);
    }

    #[test]
    fn test_memory_store_handles_share_values() {
        let a = MemoryStore::new();
        let b = a.attach();
        a.write("k", "from-a").unwrap();
        assert_eq!(b.read("k").unwrap(), Some("from-a".to_string()));
    }

    #[test]
    fn test_session_dir_needs_runtime_dir() {
        assert_eq!(session_dir_in(None), None);
        assert_eq!(
            session_dir_in(Some(PathBuf::from("/run/user/1000"))),
            Some(PathBuf::from("/run/user/1000/singlebell/session"))
        );
    }

    #[test]
    fn test_memory_store_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.read("k"), Err(StoreError::Unavailable)));
        assert!(matches!(store.write("k", "v"), Err(StoreError::Unavailable)));
    }

    #[tokio::test]
    async fn test_memory_store_notifies_other_handles_only() {
        let a = MemoryStore::new();
        let b = a.attach();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.write("k", "1").unwrap();
        b.write("k", "2").unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(StoreChange {
                key: "k".into(),
                value: Some("1".into())
            })
        );
        assert_eq!(
            a_events.recv().await,
            Some(StoreChange {
                key: "k".into(),
                value: Some("2".into())
            })
        );
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), Duration::from_millis(50)).unwrap();
        store.write("singlebell.lock", "{}").unwrap();
        assert_eq!(store.read("singlebell.lock").unwrap(), Some("{}".to_string()));
        store.clear("singlebell.lock").unwrap();
        assert_eq!(store.read("singlebell.lock").unwrap(), None);
        // Clearing a missing key is fine.
        store.clear("singlebell.lock").unwrap();
    }

    #[tokio::test]
    async fn test_file_store_reports_foreign_writes_not_own() {
        let dir = tempdir().unwrap();
        let a = FileStore::open(dir.path(), Duration::from_millis(20)).unwrap();
        let b = FileStore::open(dir.path(), Duration::from_millis(20)).unwrap();
        let mut a_events = a.subscribe();

        // Let the poller take its baseline snapshot.
        tokio::time::sleep(Duration::from_millis(60)).await;

        a.write("lease", "mine").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        b.write("lease", "theirs").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), a_events.recv())
            .await
            .expect("change not observed");
        assert_eq!(
            change,
            Some(StoreChange {
                key: "lease".into(),
                value: Some("theirs".into())
            })
        );
    }
}
