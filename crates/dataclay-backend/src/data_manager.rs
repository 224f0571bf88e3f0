//! The data manager: load/unload state machine and eviction policy.
//!
//! Every object whose master copy lives on this backend moves between
//! `loaded` (fields in memory, present in `loaded_objects`) and `unloaded`
//! (fields serialized at `{storage_path}/{object_id}`). Load and unload of
//! one object are serialized by its write lock; different objects proceed
//! fully in parallel. Loads wait for the lock without bound, unloads are
//! opportunistic: eviction gives up on a contended lock and retries on the
//! next pass, except at shutdown where `force` waits.

use crate::lock_registry::LockRegistry;
use crate::memory::MemoryGauge;
use crate::object::{PersistentObject, SerializedObject};
use crate::sessions::SessionReferenceTracker;
use crate::storage::ObjectStorage;
use dataclay_common::{BackendConfig, Error, ObjectId, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct DataManager {
    config: BackendConfig,
    storage: Arc<dyn ObjectStorage>,
    locks: Arc<LockRegistry>,
    memory: Arc<dyn MemoryGauge>,
    /// Objects currently materialized in memory. Insertion order is
    /// preserved: objects loaded earliest are evicted first, a heuristic
    /// for keeping dependents in memory longer than their dependencies.
    loaded_objects: Mutex<IndexMap<ObjectId, Arc<PersistentObject>>>,
    /// Serializes the background memory check against flush_all.
    maintenance: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl DataManager {
    pub fn new(
        config: BackendConfig,
        storage: Arc<dyn ObjectStorage>,
        locks: Arc<LockRegistry>,
        memory: Arc<dyn MemoryGauge>,
    ) -> Self {
        Self {
            config,
            storage,
            locks,
            memory,
            loaded_objects: Mutex::new(IndexMap::new()),
            maintenance: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Register a freshly materialized object (make-persistent path).
    pub fn track_loaded(&self, object: Arc<PersistentObject>) {
        self.loaded_objects.lock().insert(object.id(), object);
    }

    /// Snapshot of the loaded set in insertion order.
    #[must_use]
    pub fn loaded_ids(&self) -> Vec<ObjectId> {
        self.loaded_objects.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded_objects.lock().len()
    }

    /// Bring an object's fields into memory.
    ///
    /// Waits for the object's write lock without bound, then double-checks:
    /// another task may have completed the load while this one waited. Any
    /// storage failure leaves the object untouched.
    pub async fn load_object(&self, object: &Arc<PersistentObject>) -> Result<()> {
        if object.is_loaded() {
            return Ok(());
        }
        let lock = self.locks.get_lock(object.id());
        let _guard = lock.write().await;
        if object.is_loaded() {
            return Ok(());
        }

        debug!(object_id = %object.id(), "loading object from storage");
        let bytes = self.storage.load(object.id())?;
        let stored: SerializedObject = bincode::deserialize(&bytes)
            .map_err(|e| Error::object_storage(object.id(), e.to_string()))?;

        // The snapshot's embedded metadata may be stale; the metadata
        // service is authoritative, so only the fields are taken
        object.put_fields(stored.fields);
        object.set_loaded(true);
        self.loaded_objects.lock().insert(object.id(), object.clone());
        Ok(())
    }

    /// Serialize an object's fields to storage and release the memory.
    ///
    /// With `force` the lock is awaited without bound; otherwise a `timeout`
    /// of zero means a single try and a contended lock makes this a silent
    /// no-op (the next eviction pass retries). A storage write failure
    /// propagates and the object stays loaded with its fields intact.
    pub async fn unload_object(
        &self,
        object_id: ObjectId,
        timeout: Duration,
        force: bool,
    ) -> Result<()> {
        let object = self.loaded_objects.lock().get(&object_id).cloned();
        let Some(object) = object else {
            return Ok(());
        };

        let lock = self.locks.get_lock(object_id);
        let _guard = if force {
            lock.write().await
        } else if timeout.is_zero() {
            match lock.try_write() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(%object_id, "lock contended, deferring unload");
                    return Ok(());
                }
            }
        } else {
            match tokio::time::timeout(timeout, lock.write()).await {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(%object_id, "lock wait timed out, deferring unload");
                    return Ok(());
                }
            }
        };

        if !object.is_loaded() {
            return Ok(());
        }

        debug!(%object_id, "unloading object to storage");
        let snapshot = SerializedObject {
            metadata: object.metadata(),
            fields: object.snapshot_fields()?,
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| Error::object_storage(object_id, e.to_string()))?;
        self.storage.store(object_id, &bytes)?;

        object.clear_fields();
        object.set_loaded(false);
        self.loaded_objects.lock().shift_remove(&object_id);
        Ok(())
    }

    /// Forget an object entirely: drop it from the loaded set and remove
    /// its on-disk snapshot (moves and version consolidation).
    pub fn discard(&self, object_id: ObjectId) -> Result<()> {
        self.loaded_objects.lock().shift_remove(&object_id);
        self.storage.delete(object_id)
    }

    /// One eviction pass. Objects in `floor` (session-referenced) are never
    /// touched; everything else is unloaded oldest-first with non-blocking
    /// lock attempts until usage drops under the low watermark.
    pub async fn check_memory(&self, floor: &HashSet<ObjectId>) {
        let Ok(_guard) = self.maintenance.try_lock() else {
            debug!("maintenance in progress, skipping memory check");
            return;
        };

        let mut used = self.memory.used_fraction();
        if used < self.config.memory_high_fraction {
            return;
        }
        info!(used, "memory over high watermark, starting eviction");

        for object_id in self.loaded_ids() {
            if used <= self.config.memory_low_fraction {
                return;
            }
            if floor.contains(&object_id) {
                continue;
            }
            if let Err(e) = self.unload_object(object_id, Duration::ZERO, false).await {
                warn!(%object_id, error = %e, "eviction unload failed");
            }
            used = self.memory.used_fraction();
        }

        if used > self.config.memory_low_fraction {
            warn!(used, "eviction exhausted loaded set above low watermark");
        }
    }

    /// Unload every loaded object (shutdown path). Waits for an in-flight
    /// memory check first, bounded by `max_wait_for_memory_check`.
    pub async fn flush_all(&self, timeout: Duration, force: bool) {
        let _guard = match tokio::time::timeout(
            self.config.max_wait_for_memory_check,
            self.maintenance.lock(),
        )
        .await
        {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("memory check still running, flushing anyway");
                None
            }
        };

        info!(loaded = self.loaded_count(), "flushing all loaded objects");
        for object_id in self.loaded_ids() {
            if let Err(e) = self.unload_object(object_id, timeout, force).await {
                warn!(%object_id, error = %e, "flush failed for object");
            }
        }
    }

    /// Spawn the periodic memory monitor. The floor for each pass is the
    /// tracker's session-referenced set, so eviction never takes an object
    /// out from under a live session.
    pub fn start_memory_monitor(self: &Arc<Self>, tracker: Arc<SessionReferenceTracker>) {
        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(manager.config.memory_check_interval) => {
                        let floor = tracker.collect_retained_references(&[]);
                        manager.check_memory(&floor).await;
                    }
                }
            }
        });
        *self.monitor.lock() = Some(handle);
    }

    /// Stop the memory monitor and wait for it to exit.
    pub async fn stop_memory_monitor(&self) {
        self.shutdown.notify_waiters();
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
