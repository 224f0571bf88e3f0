//! The backend runtime.
//!
//! Composes the data manager, session reference tracker, lock registry,
//! method registry and metadata service into the operational surface one
//! backend process exposes: make-persistent, active method calls,
//! attribute access, versioning, moves/replicas and shutdown.

use crate::data_manager::DataManager;
use crate::lock_registry::LockRegistry;
use crate::memory::MemoryGauge;
use crate::methods::MethodRegistry;
use crate::object::{PersistentObject, SerializedObject};
use crate::sessions::SessionReferenceTracker;
use crate::storage::ObjectStorage;
use async_trait::async_trait;
use dataclay_common::value::referenced_objects;
use dataclay_common::{
    BackendConfig, BackendId, DataclayId, Error, Language, ObjectFields, ObjectId, Result,
    SessionId, Value,
};
use dataclay_metadata::{Backend, MetadataService, ObjectMetadata, Session};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Receiving end of an object transfer. Implemented by backend connections
/// (and by `BackendRuntime` itself for in-process transfers).
#[async_trait]
pub trait ObjectReceiver: Send + Sync {
    async fn register_objects(
        &self,
        objects: Vec<SerializedObject>,
        make_replica: bool,
    ) -> Result<()>;
}

pub struct BackendRuntime {
    backend_id: BackendId,
    config: BackendConfig,
    metadata: Arc<MetadataService>,
    data_manager: Arc<DataManager>,
    tracker: Arc<SessionReferenceTracker>,
    locks: Arc<LockRegistry>,
    methods: Arc<MethodRegistry>,
    /// Every object known to this backend, loaded or not. Skeletons are
    /// re-created from metadata on first access after a restart.
    objects: Mutex<HashMap<ObjectId, Arc<PersistentObject>>>,
}

impl BackendRuntime {
    pub fn new(
        backend_id: BackendId,
        config: BackendConfig,
        metadata: Arc<MetadataService>,
        storage: Arc<dyn ObjectStorage>,
        memory: Arc<dyn MemoryGauge>,
    ) -> Self {
        let locks = Arc::new(LockRegistry::new());
        let data_manager = Arc::new(DataManager::new(
            config.clone(),
            storage,
            locks.clone(),
            memory,
        ));
        Self {
            backend_id,
            config,
            metadata,
            data_manager,
            tracker: Arc::new(SessionReferenceTracker::new()),
            locks,
            methods: Arc::new(MethodRegistry::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    #[must_use]
    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    #[must_use]
    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.data_manager
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<SessionReferenceTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataService> {
        &self.metadata
    }

    /// Start the background memory monitor.
    pub fn start(self: &Arc<Self>) {
        self.data_manager.start_memory_monitor(self.tracker.clone());
    }

    /// Register this backend in the directory, retrying transient metadata
    /// connectivity failures with backoff (startup races the kv store).
    pub async fn autoregister(
        &self,
        host: &str,
        port: u16,
        dataclay_id: DataclayId,
    ) -> Result<()> {
        let backend = Backend {
            id: self.backend_id,
            host: host.to_string(),
            port,
            dataclay_id,
            language: Language::Rust,
        };
        let mut pause = Duration::from_millis(500);
        let mut attempts = 0;
        loop {
            match self.metadata.register_backend(&backend).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < 5 => {
                    warn!(error = %e, "backend registration failed, retrying");
                    tokio::time::sleep(pause).await;
                    pause *= 2;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Graceful shutdown: stop the monitor, flush every loaded object to
    /// disk and deregister from the directory.
    pub async fn stop(&self) -> Result<()> {
        info!(backend_id = %self.backend_id, "stopping backend");
        self.data_manager.stop_memory_monitor().await;
        self.data_manager
            .flush_all(self.config.unload_timeout, true)
            .await;
        self.metadata.delete_backend(self.backend_id).await
    }

    async fn resolve_session(&self, session_id: SessionId) -> Result<Session> {
        let session = self.metadata.get_session(session_id).await?;
        if !session.is_active || session.expires_at <= SystemTime::now() {
            return Err(Error::SessionNotActive(session_id));
        }
        Ok(session)
    }

    /// The local instance for an object id. Objects whose master copy lives
    /// elsewhere produce `ObjectWithWrongBackend` carrying fresh location
    /// data, which clients use to revalidate a stale hint.
    pub async fn get_local_object(&self, object_id: ObjectId) -> Result<Arc<PersistentObject>> {
        if let Some(object) = self.objects.lock().get(&object_id) {
            return Ok(object.clone());
        }

        let md = self.metadata.get_object_md_by_id(object_id).await?;
        if md.master_backend_id != self.backend_id
            && !md.replica_backend_ids.contains(&self.backend_id)
        {
            return Err(Error::ObjectWithWrongBackend {
                object_id,
                master_backend_id: md.master_backend_id,
                replica_backend_ids: md.replica_backend_ids.into_iter().collect(),
            });
        }

        // Known from metadata but not in memory: a skeleton whose state is
        // on local disk (process restarted since the object was stored)
        let object = Arc::new(PersistentObject::new_unloaded(md));
        let mut objects = self.objects.lock();
        Ok(objects.entry(object_id).or_insert(object).clone())
    }

    /// Run `f` against a loaded object while holding its read lock, so the
    /// eviction sweep cannot serialize the fields mid-operation.
    async fn with_loaded<T>(
        &self,
        object: &Arc<PersistentObject>,
        f: impl Fn(&Arc<PersistentObject>) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.get_lock(object.id());
        loop {
            self.data_manager.load_object(object).await?;
            let guard = lock.read().await;
            if object.is_loaded() {
                return f(object);
            }
            // Evicted between the load and the read acquire; go again
            drop(guard);
        }
    }

    // ---- Operational surface ----

    /// Materialize a serialized object graph on this backend and register
    /// every object in the metadata service.
    pub async fn make_persistent(
        &self,
        session_id: SessionId,
        serialized: Vec<SerializedObject>,
    ) -> Result<()> {
        let session = self.resolve_session(session_id).await?;
        for mut incoming in serialized {
            incoming.metadata.master_backend_id = self.backend_id;
            if incoming.metadata.dataset_name.is_empty() {
                incoming.metadata.dataset_name = session.dataset_name.clone();
            }

            self.metadata.register_object(&incoming.metadata).await?;
            debug!(object_id = %incoming.metadata.id, class = %incoming.metadata.class_name,
                "object made persistent");

            let object = Arc::new(PersistentObject::new_loaded(
                incoming.metadata,
                incoming.fields,
            ));
            self.tracker
                .add_session_reference(object.id(), session_id, session.expires_at);
            self.objects.lock().insert(object.id(), object.clone());
            self.data_manager.track_loaded(object);
        }
        Ok(())
    }

    /// Execute a registered method where the data lives.
    pub async fn call_active_method(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let session = self.resolve_session(session_id).await?;
        let object = self.get_local_object(object_id).await?;
        self.tracker
            .add_session_reference(object_id, session_id, session.expires_at);

        let class_name = object.class_name();
        self.with_loaded(&object, |object| {
            object.with_fields_mut(|fields| self.methods.call(&class_name, method, fields, &args))
        })
        .await
    }

    /// Read one attribute, loading the object first if it was evicted.
    pub async fn get_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
    ) -> Result<Value> {
        let session = self.resolve_session(session_id).await?;
        let object = self.get_local_object(object_id).await?;
        self.tracker
            .add_session_reference(object_id, session_id, session.expires_at);
        self.with_loaded(&object, |object| object.get_field(name)).await
    }

    pub async fn set_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let session = self.resolve_session(session_id).await?;
        let object = self.get_local_object(object_id).await?;
        if object.is_read_only() {
            return Err(Error::ObjectReadOnly(object_id));
        }
        self.tracker
            .add_session_reference(object_id, session_id, session.expires_at);
        self.with_loaded(&object, |object| object.set_field(name, value.clone()))
            .await
    }

    pub async fn delete_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
    ) -> Result<()> {
        let session = self.resolve_session(session_id).await?;
        let object = self.get_local_object(object_id).await?;
        if object.is_read_only() {
            return Err(Error::ObjectReadOnly(object_id));
        }
        self.tracker
            .add_session_reference(object_id, session_id, session.expires_at);
        self.with_loaded(&object, |object| object.delete_field(name)).await
    }

    /// Full field snapshot of one object.
    pub async fn get_object_properties(&self, object_id: ObjectId) -> Result<ObjectFields> {
        let object = self.get_local_object(object_id).await?;
        self.with_loaded(&object, |object| object.snapshot_fields()).await
    }

    /// Replace an object's fields wholesale.
    pub async fn update_object_properties(
        &self,
        object_id: ObjectId,
        fields: ObjectFields,
    ) -> Result<()> {
        let object = self.get_local_object(object_id).await?;
        if object.is_read_only() {
            return Err(Error::ObjectReadOnly(object_id));
        }
        self.with_loaded(&object, |object| {
            object.put_fields(fields.clone());
            Ok(())
        })
        .await
    }

    /// Create a version: an independently mutable copy that records its
    /// lineage back to the root original.
    pub async fn new_object_version(&self, object_id: ObjectId) -> Result<ObjectMetadata> {
        let object = self.get_local_object(object_id).await?;
        let fields = self.with_loaded(&object, |object| object.snapshot_fields()).await?;
        let md = object.metadata();

        let mut version_md = ObjectMetadata::new(
            ObjectId::new(),
            md.dataset_name.clone(),
            md.class_name.clone(),
            self.backend_id,
        );
        version_md.original_object_id = Some(md.original_object_id.unwrap_or(md.id));
        self.metadata.register_object(&version_md).await?;

        let version = Arc::new(PersistentObject::new_loaded(version_md.clone(), fields));
        self.objects.lock().insert(version.id(), version.clone());
        self.data_manager.track_loaded(version);

        object.update_metadata(|md| md.versions_object_ids.push(version_md.id));
        self.metadata.upsert_object(&object.metadata()).await?;
        info!(original = %object_id, version = %version_md.id, "created object version");
        Ok(version_md)
    }

    /// Fold a version's state back into its original and delete the version.
    pub async fn consolidate_object_version(&self, version_id: ObjectId) -> Result<()> {
        let version = self.get_local_object(version_id).await?;
        let version_md = version.metadata();
        let original_id = version_md
            .original_object_id
            .ok_or(Error::ObjectIsNotVersion(version_id))?;

        let fields = self.with_loaded(&version, |v| v.snapshot_fields()).await?;
        let original = self.get_local_object(original_id).await?;
        self.with_loaded(&original, |original| {
            original.put_fields(fields.clone());
            Ok(())
        })
        .await?;

        original.update_metadata(|md| md.versions_object_ids.retain(|id| *id != version_id));
        self.metadata.upsert_object(&original.metadata()).await?;

        self.metadata.delete_object(version_id).await?;
        self.objects.lock().remove(&version_id);
        self.data_manager.discard(version_id)?;
        info!(original = %original_id, version = %version_id, "consolidated version");
        Ok(())
    }

    /// Receiving side of a transfer: materialize incoming objects either as
    /// replicas or as newly owned masters.
    pub async fn accept_objects(
        &self,
        objects: Vec<SerializedObject>,
        make_replica: bool,
    ) -> Result<()> {
        for incoming in objects {
            let object_id = incoming.metadata.id;
            let lock = self.locks.get_lock(object_id);
            let _guard = lock.write().await;

            let mut md = incoming.metadata;
            if make_replica {
                md.replica_backend_ids.insert(self.backend_id);
            } else {
                md.replica_backend_ids.remove(&self.backend_id);
                md.master_backend_id = self.backend_id;
            }
            self.metadata.upsert_object(&md).await?;

            let object = Arc::new(PersistentObject::new_loaded(md, incoming.fields));
            self.objects.lock().insert(object_id, object.clone());
            self.data_manager.track_loaded(object);
            debug!(%object_id, make_replica, "accepted object");
        }
        Ok(())
    }

    /// Ship objects to another backend, optionally following references.
    /// A plain send is a move: the local copy is dropped and the receiver
    /// becomes the master. With `make_replica` the local copy stays.
    pub async fn send_objects(
        &self,
        object_ids: &[ObjectId],
        receiver: &dyn ObjectReceiver,
        make_replica: bool,
        recursive: bool,
    ) -> Result<()> {
        let mut batch = Vec::new();
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut pending: Vec<ObjectId> = object_ids.to_vec();

        while let Some(object_id) = pending.pop() {
            if !visited.insert(object_id) {
                continue;
            }
            let object = match self.get_local_object(object_id).await {
                Ok(object) => object,
                // Referenced objects living elsewhere are not ours to ship
                Err(Error::ObjectWithWrongBackend { .. }) if recursive => continue,
                Err(e) => return Err(e),
            };
            let fields = self.with_loaded(&object, |o| o.snapshot_fields()).await?;
            if recursive {
                pending.extend(referenced_objects(&fields));
            }
            batch.push(SerializedObject {
                metadata: object.metadata(),
                fields,
            });
        }

        let moved: Vec<ObjectId> = batch.iter().map(|s| s.metadata.id).collect();
        receiver.register_objects(batch, make_replica).await?;

        if !make_replica {
            for object_id in moved {
                let object = self.objects.lock().remove(&object_id);
                if let Some(object) = object {
                    object.set_local(false);
                }
                self.data_manager.discard(object_id)?;
            }
        }
        Ok(())
    }

    /// Drain every master object off this backend, spreading them over the
    /// given receivers round-robin.
    pub async fn move_all_objects(
        &self,
        receivers: &HashMap<BackendId, Arc<dyn ObjectReceiver>>,
    ) -> Result<()> {
        let targets: Vec<&Arc<dyn ObjectReceiver>> = receivers
            .iter()
            .filter(|(id, _)| **id != self.backend_id)
            .map(|(_, r)| r)
            .collect();
        if targets.is_empty() {
            return Err(Error::NoOtherBackendsAvailable);
        }

        let all = self.metadata.get_all_objects().await?;
        let mine: Vec<ObjectId> = all
            .values()
            .filter(|md| md.master_backend_id == self.backend_id)
            .map(|md| md.id)
            .collect();
        info!(count = mine.len(), "draining objects to other backends");

        for (i, object_id) in mine.iter().enumerate() {
            let receiver = targets[i % targets.len()];
            self.send_objects(&[*object_id], receiver.as_ref(), false, false)
                .await?;
        }
        Ok(())
    }

    /// Flush every loaded object to disk.
    pub async fn flush_all(&self) {
        self.data_manager
            .flush_all(self.config.unload_timeout, true)
            .await;
    }

    /// Close a session both in the registry and in the local tracker.
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        self.metadata.close_session(session_id).await?;
        self.tracker.close_session(session_id);
        Ok(())
    }
}

#[async_trait]
impl ObjectReceiver for BackendRuntime {
    async fn register_objects(
        &self,
        objects: Vec<SerializedObject>,
        make_replica: bool,
    ) -> Result<()> {
        self.accept_objects(objects, make_replica).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskStorage;
    use dataclay_metadata::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStorage {
        inner: DiskStorage,
        loads: AtomicUsize,
    }

    impl ObjectStorage for CountingStorage {
        fn store(&self, object_id: ObjectId, bytes: &[u8]) -> Result<()> {
            self.inner.store(object_id, bytes)
        }

        fn load(&self, object_id: ObjectId) -> Result<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(object_id)
        }

        fn delete(&self, object_id: ObjectId) -> Result<()> {
            self.inner.delete(object_id)
        }
    }

    struct IdleGauge;

    impl MemoryGauge for IdleGauge {
        fn used_fraction(&self) -> f64 {
            0.0
        }
    }

    struct Fixture {
        runtime: Arc<BackendRuntime>,
        storage: Arc<CountingStorage>,
        session_id: SessionId,
        _dir: tempfile::TempDir,
    }

    async fn fixture_on(metadata: Arc<MetadataService>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(CountingStorage {
            inner: DiskStorage::open(dir.path()).unwrap(),
            loads: AtomicUsize::new(0),
        });
        let runtime = Arc::new(BackendRuntime::new(
            BackendId::new(),
            BackendConfig::default(),
            metadata.clone(),
            storage.clone(),
            Arc::new(IdleGauge),
        ));
        let session = metadata.new_session("alice", "pw", "ds").await.unwrap();
        Fixture {
            runtime,
            storage,
            session_id: session.id,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(MemoryKv::new()),
            Default::default(),
        ));
        metadata.new_account("alice", "pw").await.unwrap();
        metadata.new_dataset("alice", "pw", "ds").await.unwrap();
        fixture_on(metadata).await
    }

    fn person(age: i64) -> SerializedObject {
        let mut fields = ObjectFields::new();
        fields.insert("age".to_string(), Value::Int(age));
        SerializedObject {
            metadata: ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new()),
            fields,
        }
    }

    #[tokio::test]
    async fn test_make_persistent_unload_read_flush() {
        let fx = fixture().await;
        let serialized = person(24);
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();
        assert_eq!(fx.runtime.data_manager().loaded_count(), 1);

        fx.runtime
            .data_manager()
            .unload_object(object_id, Duration::ZERO, false)
            .await
            .unwrap();
        assert_eq!(fx.storage.loads.load(Ordering::SeqCst), 0);

        let age = fx
            .runtime
            .get_object_attribute(fx.session_id, object_id, "age")
            .await
            .unwrap();
        assert_eq!(age, Value::Int(24));
        assert_eq!(fx.storage.loads.load(Ordering::SeqCst), 1);

        // A second read finds the object already loaded
        fx.runtime
            .get_object_attribute(fx.session_id, object_id, "age")
            .await
            .unwrap();
        assert_eq!(fx.storage.loads.load(Ordering::SeqCst), 1);

        fx.runtime.flush_all().await;
        assert_eq!(fx.runtime.data_manager().loaded_count(), 0);
    }

    #[tokio::test]
    async fn test_active_method_runs_where_data_lives() {
        let fx = fixture().await;
        fx.runtime.methods().register("Person", "birthday", |fields, _| {
            let age = fields.get("age").and_then(Value::as_int).unwrap_or(0);
            fields.insert("age".to_string(), Value::Int(age + 1));
            Ok(Value::Int(age + 1))
        });

        let serialized = person(24);
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();

        let result = fx
            .runtime
            .call_active_method(fx.session_id, object_id, "birthday", vec![])
            .await
            .unwrap();
        assert_eq!(result, Value::Int(25));

        let err = fx
            .runtime
            .call_active_method(fx.session_id, object_id, "retire", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wrong_backend_reports_fresh_location() {
        let fx = fixture().await;
        let foreign_backend = BackendId::new();
        let md = ObjectMetadata::new(ObjectId::new(), "ds", "Person", foreign_backend);
        fx.runtime.metadata().register_object(&md).await.unwrap();

        let err = fx
            .runtime
            .get_object_attribute(fx.session_id, md.id, "age")
            .await
            .unwrap_err();
        match err {
            Error::ObjectWithWrongBackend {
                master_backend_id, ..
            } => assert_eq!(master_backend_id, foreign_backend),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_move_objects_between_backends() {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(MemoryKv::new()),
            Default::default(),
        ));
        metadata.new_account("alice", "pw").await.unwrap();
        metadata.new_dataset("alice", "pw", "ds").await.unwrap();
        let src = fixture_on(metadata.clone()).await;
        let dst = fixture_on(metadata.clone()).await;

        let serialized = person(24);
        let object_id = serialized.metadata.id;
        src.runtime
            .make_persistent(src.session_id, vec![serialized])
            .await
            .unwrap();

        src.runtime
            .send_objects(&[object_id], dst.runtime.as_ref(), false, false)
            .await
            .unwrap();

        let md = metadata.get_object_md_by_id(object_id).await.unwrap();
        assert_eq!(md.master_backend_id, dst.runtime.backend_id());

        // Source now redirects; destination serves the read
        let err = src
            .runtime
            .get_object_attribute(src.session_id, object_id, "age")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectWithWrongBackend { .. }));
        let age = dst
            .runtime
            .get_object_attribute(dst.session_id, object_id, "age")
            .await
            .unwrap();
        assert_eq!(age, Value::Int(24));
    }

    #[tokio::test]
    async fn test_replica_keeps_local_copy() {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(MemoryKv::new()),
            Default::default(),
        ));
        metadata.new_account("alice", "pw").await.unwrap();
        metadata.new_dataset("alice", "pw", "ds").await.unwrap();
        let src = fixture_on(metadata.clone()).await;
        let dst = fixture_on(metadata.clone()).await;

        let serialized = person(24);
        let object_id = serialized.metadata.id;
        src.runtime
            .make_persistent(src.session_id, vec![serialized])
            .await
            .unwrap();
        src.runtime
            .send_objects(&[object_id], dst.runtime.as_ref(), true, false)
            .await
            .unwrap();

        let md = metadata.get_object_md_by_id(object_id).await.unwrap();
        assert_eq!(md.master_backend_id, src.runtime.backend_id());
        assert!(md.replica_backend_ids.contains(&dst.runtime.backend_id()));

        // Both copies answer reads
        for fx in [&src, &dst] {
            let age = fx
                .runtime
                .get_object_attribute(fx.session_id, object_id, "age")
                .await
                .unwrap();
            assert_eq!(age, Value::Int(24));
        }
    }

    #[tokio::test]
    async fn test_recursive_send_follows_references() {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(MemoryKv::new()),
            Default::default(),
        ));
        metadata.new_account("alice", "pw").await.unwrap();
        metadata.new_dataset("alice", "pw", "ds").await.unwrap();
        let src = fixture_on(metadata.clone()).await;
        let dst = fixture_on(metadata.clone()).await;

        let friend = person(30);
        let friend_id = friend.metadata.id;
        let mut root = person(24);
        let root_id = root.metadata.id;
        root.fields.insert(
            "friend".to_string(),
            Value::Ref {
                object_id: friend_id,
                class_name: "Person".to_string(),
            },
        );
        src.runtime
            .make_persistent(src.session_id, vec![root, friend])
            .await
            .unwrap();

        src.runtime
            .send_objects(&[root_id], dst.runtime.as_ref(), false, true)
            .await
            .unwrap();

        for id in [root_id, friend_id] {
            let md = metadata.get_object_md_by_id(id).await.unwrap();
            assert_eq!(md.master_backend_id, dst.runtime.backend_id());
        }
    }

    #[tokio::test]
    async fn test_version_lifecycle() {
        let fx = fixture().await;
        let serialized = person(24);
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();

        let version_md = fx.runtime.new_object_version(object_id).await.unwrap();
        assert_eq!(version_md.original_object_id, Some(object_id));

        fx.runtime
            .set_object_attribute(fx.session_id, version_md.id, "age", Value::Int(99))
            .await
            .unwrap();
        // Original untouched until consolidation
        let age = fx
            .runtime
            .get_object_attribute(fx.session_id, object_id, "age")
            .await
            .unwrap();
        assert_eq!(age, Value::Int(24));

        fx.runtime
            .consolidate_object_version(version_md.id)
            .await
            .unwrap();
        let age = fx
            .runtime
            .get_object_attribute(fx.session_id, object_id, "age")
            .await
            .unwrap();
        assert_eq!(age, Value::Int(99));
        assert!(fx
            .runtime
            .metadata()
            .get_object_md_by_id(version_md.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_consolidate_rejects_non_version() {
        let fx = fixture().await;
        let serialized = person(24);
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();
        let err = fx
            .runtime
            .consolidate_object_version(object_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectIsNotVersion(_)));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let fx = fixture().await;
        let mut serialized = person(24);
        serialized.metadata.is_read_only = true;
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();

        let err = fx
            .runtime
            .set_object_attribute(fx.session_id, object_id, "age", Value::Int(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectReadOnly(_)));
    }

    #[tokio::test]
    async fn test_closed_session_is_rejected() {
        let fx = fixture().await;
        let serialized = person(24);
        let object_id = serialized.metadata.id;
        fx.runtime
            .make_persistent(fx.session_id, vec![serialized])
            .await
            .unwrap();

        fx.runtime.close_session(fx.session_id).await.unwrap();
        let err = fx
            .runtime
            .get_object_attribute(fx.session_id, object_id, "age")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotActive(_)));
    }

    #[tokio::test]
    async fn test_move_all_requires_other_backends() {
        let fx = fixture().await;
        let err = fx
            .runtime
            .move_all_objects(&HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoOtherBackendsAvailable));
    }

    #[tokio::test]
    async fn test_move_all_drains_backend() {
        let metadata = Arc::new(MetadataService::new(
            Arc::new(MemoryKv::new()),
            Default::default(),
        ));
        metadata.new_account("alice", "pw").await.unwrap();
        metadata.new_dataset("alice", "pw", "ds").await.unwrap();
        let src = fixture_on(metadata.clone()).await;
        let dst = fixture_on(metadata.clone()).await;

        let objects: Vec<SerializedObject> = (0..3i64).map(person).collect();
        src.runtime
            .make_persistent(src.session_id, objects)
            .await
            .unwrap();

        let mut receivers: HashMap<BackendId, Arc<dyn ObjectReceiver>> = HashMap::new();
        receivers.insert(dst.runtime.backend_id(), dst.runtime.clone());
        src.runtime.move_all_objects(&receivers).await.unwrap();

        let all = metadata.get_all_objects().await.unwrap();
        for md in all.values() {
            assert_eq!(md.master_backend_id, dst.runtime.backend_id());
        }
    }
}
