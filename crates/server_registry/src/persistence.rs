//! Optional durability for registry entries.
//!
//! The registry is correct without persistence; its state is rebuilt from
//! registrations and heartbeats. When durability across restarts is wanted,
//! entries are written through to an [`EntryPersistence`] backend and loaded
//! back at startup.

use crate::error::{StorageError, StorageResult};
use crate::store::RegistryStore;
use crate::types::ServerEntry;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Key-value style persistence interface for server entries.
#[async_trait]
pub trait EntryPersistence: Send + Sync + std::fmt::Debug {
    /// Saves or replaces an entry.
    async fn save(&self, id: &str, entry: &ServerEntry) -> StorageResult<()>;

    /// Loads a single entry.
    async fn load(&self, id: &str) -> StorageResult<Option<ServerEntry>>;

    /// Deletes an entry. Deleting a missing entry is not an error.
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// Loads every stored entry, skipping unreadable ones.
    async fn load_all(&self) -> StorageResult<Vec<ServerEntry>>;
}

/// Process-local persistence, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: DashMap<String, ServerEntry>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EntryPersistence for MemoryPersistence {
    async fn save(&self, id: &str, entry: &ServerEntry) -> StorageResult<()> {
        self.entries.insert(id.to_string(), entry.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> StorageResult<Option<ServerEntry>> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> StorageResult<Vec<ServerEntry>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }
}

// ============================================================================
// Write-through
// ============================================================================

/// Mirrors store entries into a persistence backend.
///
/// Writes for the same id are serialized, and each write persists whatever
/// the store holds at that moment rather than the snapshot that triggered
/// it. A save that is still in flight when the entry is removed is therefore
/// followed by a delete, never the other way round.
#[derive(Debug)]
pub struct WriteThrough {
    backend: Arc<dyn EntryPersistence>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WriteThrough {
    pub fn new(backend: Arc<dyn EntryPersistence>) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn EntryPersistence> {
        &self.backend
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Brings the persisted copy of `id` in line with the store.
    ///
    /// A live entry is saved; a missing or expired one is deleted.
    pub async fn sync(&self, store: &RegistryStore, id: &str) -> StorageResult<()> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            let now = store.now();
            match store.get(id).filter(|e| !e.is_expired(store.policy(), now)) {
                Some(entry) => self.backend.save(id, &entry).await,
                None => self.backend.delete(id).await,
            }
        };

        drop(lock);
        // Nobody else holds the lock once the map owns the only reference.
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// One JSON file per entry in a directory, written atomically via rename.
#[derive(Debug)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

const ENTRY_EXTENSION: &str = "server.json";

impl JsonFilePersistence {
    /// Opens (and creates if needed) the storage directory.
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        tokio_fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreate(dir.clone(), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> StorageResult<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !safe {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.{ENTRY_EXTENSION}")))
    }

    async fn read_entry(path: &Path) -> StorageResult<ServerEntry> {
        let contents = tokio_fs::read_to_string(path)
            .await
            .map_err(|e| StorageError::FileRead(path.to_path_buf(), e))?;
        serde_json::from_str(&contents)
            .map_err(|e| StorageError::Deserialization(path.to_path_buf(), e))
    }
}

#[async_trait]
impl EntryPersistence for JsonFilePersistence {
    #[instrument(skip(self, entry))]
    async fn save(&self, id: &str, entry: &ServerEntry) -> StorageResult<()> {
        let path = self.entry_path(id)?;
        // Each write gets its own temp file so overlapping saves never share one.
        let temp_path = self
            .dir
            .join(format!("{id}.{}.tmp", Uuid::new_v4().simple()));

        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| StorageError::Serialization(id.to_string(), e))?;

        tokio_fs::write(&temp_path, json)
            .await
            .map_err(|e| StorageError::FileWrite(temp_path.clone(), e))?;

        if let Err(e) = tokio_fs::rename(&temp_path, &path).await {
            let _ = tokio_fs::remove_file(&temp_path).await;
            return Err(StorageError::FileRename(temp_path, path, e));
        }

        debug!("Saved server entry: {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, id: &str) -> StorageResult<Option<ServerEntry>> {
        let path = self.entry_path(id)?;
        if !tokio_fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_entry(&path).await.map(Some)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.entry_path(id)?;
        match tokio_fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted server entry: {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::FileDelete(path, e)),
        }
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> StorageResult<Vec<ServerEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio_fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::DirectoryRead(self.dir.clone(), e))?;

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::DirectoryRead(self.dir.clone(), e))?
        {
            let path = item.path();
            let is_entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&format!(".{ENTRY_EXTENSION}")));
            if !is_entry {
                continue;
            }

            match Self::read_entry(&path).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!("Skipping unreadable server entry {}: {}", path.display(), e);
                }
            }
        }

        info!("Loaded {} persisted server entries from {}", entries.len(), self.dir.display());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, StalenessPolicy};
    use crate::types::{Capacity, Registration, ServerAddress, ServerMetadata, ServerStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(id: &str) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            address: ServerAddress::new("127.0.0.1", 7777),
            capacity: Capacity::new(1, 8),
            status: ServerStatus::Online,
            metadata: ServerMetadata::default(),
            performance: None,
            last_heartbeat_at: 1_000,
            registered_at: 500,
        }
    }

    #[tokio::test]
    async fn test_memory_persistence() {
        let store = MemoryPersistence::new();
        store.save("a", &entry("a")).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), Some(entry("a")));

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::open(dir.path().join("servers")).await.unwrap();

        store.save("srv-1", &entry("srv-1")).await.unwrap();
        assert_eq!(store.load("srv-1").await.unwrap(), Some(entry("srv-1")));
        assert_eq!(store.load("srv-2").await.unwrap(), None);

        store.delete("srv-1").await.unwrap();
        store.delete("srv-1").await.unwrap();
        assert_eq!(store.load("srv-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_load_all_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::open(dir.path()).await.unwrap();

        store.save("srv-1", &entry("srv-1")).await.unwrap();
        store.save("srv-2", &entry("srv-2")).await.unwrap();
        tokio_fs::write(dir.path().join("broken.server.json"), "{not json")
            .await
            .unwrap();
        tokio_fs::write(dir.path().join("notes.txt"), "ignore me")
            .await
            .unwrap();

        let mut ids: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["srv-1", "srv-2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_json_file_concurrent_saves_of_one_id() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFilePersistence::open(dir.path()).await.unwrap());

        let handles: Vec<_> = (0..32u32)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut e = entry("srv-1");
                    e.capacity.current = n;
                    store.save("srv-1", &e).await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let saved = store.load("srv-1").await.unwrap().unwrap();
        assert!(saved.capacity.current < 32);

        let mut names = Vec::new();
        let mut listing = tokio_fs::read_dir(dir.path()).await.unwrap();
        while let Some(item) = listing.next_entry().await.unwrap() {
            names.push(item.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["srv-1.server.json".to_string()]);
    }

    #[tokio::test]
    async fn test_write_through_follows_the_store() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = RegistryStore::new(clock.clone(), StalenessPolicy::default());
        let backend = Arc::new(MemoryPersistence::new());
        let write_through = WriteThrough::new(backend.clone());

        registry.upsert(Registration {
            id: "srv-1".to_string(),
            address: ServerAddress::new("127.0.0.1", 7777),
            max_capacity: 8,
            metadata: ServerMetadata::default(),
            last_heartbeat_at: None,
        });
        write_through.sync(&registry, "srv-1").await.unwrap();
        assert_eq!(backend.load("srv-1").await.unwrap().unwrap().capacity.max, 8);

        // Expired entries are dropped even before the sweeper removes them.
        clock.advance(Duration::from_secs(301));
        write_through.sync(&registry, "srv-1").await.unwrap();
        assert!(backend.is_empty());

        registry.remove("srv-1");
        write_through.sync(&registry, "srv-1").await.unwrap();
        assert!(backend.is_empty());
        assert!(write_through.locks.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_rejects_path_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::open(dir.path()).await.unwrap();

        let result = store.save("../escape", &entry("x")).await;
        assert!(matches!(result, Err(StorageError::InvalidId(_))));
    }
}
