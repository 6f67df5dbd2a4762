use std::fs::{remove_file, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{from_str as deserialize_state, to_string as serialize_state};

use crate::sync::error::{unknown, SyncResult};
use crate::sync::model::Snapshot;

use super::PendingBatch;

/// What survives a restart: confirmed documents and the writes the store has not acknowledged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedCache {
    #[serde(default)]
    pub documents: Vec<Snapshot>,
    #[serde(default)]
    pub pending_batches: Vec<PendingBatch>,
    #[serde(default)]
    pub next_sequence: u64,
}

/// Storage backend for the offline cache.
///
/// `save` is called after every change with the complete state, outside the cache lock. Errors
/// are logged and otherwise ignored; the in-memory cache stays authoritative.
pub trait CachePersistence: Send + Sync {
    fn load(&self) -> SyncResult<Option<PersistedCache>>;

    fn save(&self, state: &PersistedCache) -> SyncResult<()>;

    fn clear(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Keeps the persisted state in memory; lets tests simulate a restart by handing the same
/// instance to a second service.
#[derive(Clone, Default)]
pub struct InMemoryCachePersistence {
    state: Arc<Mutex<Option<PersistedCache>>>,
}

impl InMemoryCachePersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CachePersistence for InMemoryCachePersistence {
    fn load(&self) -> SyncResult<Option<PersistedCache>> {
        Ok(self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }

    fn save(&self, state: &PersistedCache) -> SyncResult<()> {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Stores the cache as one JSON document on disk.
#[derive(Clone)]
pub struct JsonFilePersistence {
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for JsonFilePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFilePersistence").field("path", &self.path).finish()
    }
}

impl JsonFilePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CachePersistence for JsonFilePersistence {
    fn load(&self) -> SyncResult<Option<PersistedCache>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&*self.path)
            .map_err(|err| unknown(format!("Failed to open cache persistence file: {err}")))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)
            .map_err(|err| unknown(format!("Failed to read cache persistence file: {err}")))?;

        if buffer.is_empty() {
            return Ok(None);
        }

        let state = deserialize_state(&buffer)
            .map_err(|err| unknown(format!("Failed to parse cache persistence payload: {err}")))?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedCache) -> SyncResult<()> {
        let serialized = serialize_state(state)
            .map_err(|err| unknown(format!("Failed to serialize offline cache: {err}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| unknown(format!("Failed to create persistence directory: {err}")))?;
        }
        let mut file = File::create(&*self.path)
            .map_err(|err| unknown(format!("Failed to create cache persistence file: {err}")))?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| unknown(format!("Failed to write cache persistence file: {err}")))?;
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        if self.path.exists() {
            remove_file(&*self.path)
                .map_err(|err| unknown(format!("Failed to remove cache persistence file: {err}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::{Address, SequencedWrite, Version, WriteOp};
    use chrono::Utc;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("propstore-cache-test-{}-{}.json", name, std::process::id()));
        path
    }

    fn sample() -> PersistedCache {
        let address = Address::parse("props/p1").unwrap();
        let data = json!({"name": "Sword"}).as_object().cloned().unwrap();
        PersistedCache {
            documents: vec![Snapshot::new(address.clone(), Some(data.clone()), Version::new("rev-2"), Utc::now())],
            pending_batches: vec![PendingBatch {
                writes: vec![SequencedWrite::new(4, WriteOp::set(address, data))],
                preconditions: Vec::new(),
            }],
            next_sequence: 5,
        }
    }

    #[test]
    fn file_persistence_survives_reopen() {
        let path = temp_path("reopen");
        let persistence = JsonFilePersistence::new(&path);
        persistence.save(&sample()).unwrap();

        let reopened = JsonFilePersistence::new(&path);
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.pending_batches, sample().pending_batches);
        assert_eq!(loaded.documents[0].get("name"), Some(&json!("Sword")));
        assert_eq!(loaded.next_sequence, 5);

        reopened.clear().unwrap();
        assert!(reopened.load().unwrap().is_none());
    }

    #[test]
    fn missing_file_loads_nothing() {
        let persistence = JsonFilePersistence::new(temp_path("missing"));
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFilePersistence::new(&path).load().unwrap_err();
        assert_eq!(err.code_str(), "sync/unknown");
        let _ = std::fs::remove_file(path);
    }
}
