//! Key-value backends for the metadata store.
//!
//! Two implementations share one trait: `MemoryKv` for tests and
//! single-process deployments, and `RedbKv` for persistence. All writes are
//! synchronous (write txn + commit); `set_new` is the atomic
//! create-if-absent primitive the registration paths rely on.

use dataclay_common::{Error, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Storage abstraction for metadata records.
pub trait KvStore: Send + Sync {
    /// Set a new key, failing with `AlreadyExists` if present.
    fn set_new(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Set a key unconditionally.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Get a key, failing with `DoesNotExist` on miss.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Get and delete a key atomically, failing with `DoesNotExist` on miss.
    fn get_del(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete a key (missing keys are not an error).
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`.
    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Probe availability, retrying until `timeout` elapses.
    fn is_ready(&self, timeout: Option<Duration>, pause: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.ping() {
                return true;
            }
            match timeout {
                Some(t) if start.elapsed() >= t => return false,
                None => return false,
                _ => std::thread::sleep(pause),
            }
        }
    }

    /// One availability probe.
    fn ping(&self) -> bool {
        true
    }
}

/// In-memory kv store.
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn set_new(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::DoesNotExist(key.to_string()))
    }

    fn get_del(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .remove(key)
            .ok_or_else(|| Error::DoesNotExist(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Persistent kv store backed by redb.
pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::KvStore(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| Error::KvStore(e.to_string()))?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(|e| Error::KvStore(e.to_string()))?;
        {
            let _t = write_txn
                .open_table(KV_TABLE)
                .map_err(|e| Error::KvStore(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::KvStore(e.to_string()))?;

        Ok(Self { db })
    }

    fn kv_err(e: impl std::fmt::Display) -> Error {
        Error::KvStore(e.to_string())
    }
}

impl KvStore for RedbKv {
    fn set_new(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Self::kv_err)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
            // Read and compare, then drop the guard before mutating
            let exists = table.get(key).map_err(Self::kv_err)?.is_some();
            if exists {
                return Err(Error::AlreadyExists(key.to_string()));
            }
            table.insert(key, value).map_err(Self::kv_err)?;
        }
        write_txn.commit().map_err(Self::kv_err)?;
        Ok(())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Self::kv_err)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
            table.insert(key, value).map_err(Self::kv_err)?;
        }
        write_txn.commit().map_err(Self::kv_err)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let read_txn = self.db.begin_read().map_err(Self::kv_err)?;
        let table = read_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
        match table.get(key).map_err(Self::kv_err)? {
            Some(val) => Ok(val.value().to_vec()),
            None => Err(Error::DoesNotExist(key.to_string())),
        }
    }

    fn get_del(&self, key: &str) -> Result<Vec<u8>> {
        let write_txn = self.db.begin_write().map_err(Self::kv_err)?;
        let value = {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
            let value = table
                .get(key)
                .map_err(Self::kv_err)?
                .map(|v| v.value().to_vec());
            match value {
                Some(v) => {
                    table.remove(key).map_err(Self::kv_err)?;
                    v
                }
                None => return Err(Error::DoesNotExist(key.to_string())),
            }
        };
        write_txn.commit().map_err(Self::kv_err)?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Self::kv_err)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
            table.remove(key).map_err(Self::kv_err)?;
        }
        write_txn.commit().map_err(Self::kv_err)?;
        Ok(())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(Self::kv_err)?;
        let table = read_txn.open_table(KV_TABLE).map_err(Self::kv_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(Self::kv_err)? {
            let entry = entry.map_err(Self::kv_err)?;
            let k = entry.0.value().to_string();
            if k.starts_with(prefix) {
                result.push((k, entry.1.value().to_vec()));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn KvStore) {
        store.set_new("/object/a", b"one").unwrap();
        let err = store.set_new("/object/a", b"two").unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(store.get("/object/a").unwrap(), b"one");
        assert!(store.get("/object/missing").unwrap_err().is_not_found());

        store.set("/object/a", b"two").unwrap();
        assert_eq!(store.get("/object/a").unwrap(), b"two");

        store.set_new("/object/b", b"three").unwrap();
        store.set_new("/alias/ds/x", b"four").unwrap();
        let objects = store.get_prefix("/object/").unwrap();
        assert_eq!(objects.len(), 2);

        let val = store.get_del("/object/b").unwrap();
        assert_eq!(val, b"three");
        assert!(store.get("/object/b").unwrap_err().is_not_found());

        store.delete("/object/b").unwrap(); // idempotent
    }

    #[test]
    fn test_memory_kv() {
        exercise_store(&MemoryKv::new());
    }

    #[test]
    fn test_redb_kv() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbKv::open(dir.path().join("meta.redb")).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_redb_kv_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let store = RedbKv::open(&path).unwrap();
            store.set_new("/dataset/ds", b"payload").unwrap();
        }
        let store = RedbKv::open(&path).unwrap();
        assert_eq!(store.get("/dataset/ds").unwrap(), b"payload");
    }
}
