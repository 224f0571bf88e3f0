//! Per-object lock registry.
//!
//! Hands out a stable lock for any object id, created exactly once even
//! under concurrent first access. Entries are never pruned: callers may
//! hold a lock across an await point long after the object itself has been
//! evicted, and referential uniqueness must survive that.

use dataclay_common::ObjectId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of per-object reader/writer locks.
///
/// Load and unload of the same object take the write half; read paths that
/// only need to keep an eviction at bay take the read half.
#[derive(Default)]
pub struct LockRegistry {
    locks: RwLock<HashMap<ObjectId, Arc<tokio::sync::RwLock<()>>>>,
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `object_id`, creating it on first use.
    pub fn get_lock(&self, object_id: ObjectId) -> Arc<tokio::sync::RwLock<()>> {
        if let Some(lock) = self.locks.read().get(&object_id) {
            return lock.clone();
        }
        // Re-check under the write guard: another task may have created the
        // entry while we were upgrading
        let mut locks = self.locks.write();
        locks
            .entry(object_id)
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone()
    }

    /// Number of locks handed out so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_get_lock_returns_same_instance() {
        let registry = Arc::new(LockRegistry::new());
        let object_id = ObjectId::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get_lock(object_id) }));
        }

        let first = registry.get_lock(object_id);
        for handle in handles {
            let lock = handle.await.unwrap();
            assert!(Arc::ptr_eq(&first, &lock));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_objects_get_distinct_locks() {
        let registry = LockRegistry::new();
        let a = registry.get_lock(ObjectId::new());
        let b = registry.get_lock(ObjectId::new());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }
}
