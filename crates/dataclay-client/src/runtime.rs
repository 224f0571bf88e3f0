//! The client runtime.
//!
//! Holds the session, tracks not-yet-persistent objects, and routes calls
//! to owning backends. Location hints are cached beliefs: when a backend
//! answers with a redirection error the hint is replaced with the fresh
//! location it carries and the call is retried once.

use crate::connection::{BackendConnection, Connector};
use crate::object::ClientObject;
use crate::pool::BackendPool;
use dataclay_backend::SerializedObject;
use dataclay_common::value::referenced_objects;
use dataclay_common::{
    BackendId, ClientConfig, Error, ObjectFields, ObjectId, Result, SessionId, Value,
};
use dataclay_metadata::{MetadataService, ObjectMetadata, Session};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ClientRuntime {
    metadata: Arc<MetadataService>,
    pool: Arc<BackendPool>,
    session: Mutex<Option<Session>>,
    /// Objects created locally and not yet made persistent.
    local_objects: Mutex<HashMap<ObjectId, Arc<ClientObject>>>,
    /// Cached belief about each object's master backend; may be stale.
    hints: Mutex<HashMap<ObjectId, BackendId>>,
}

impl ClientRuntime {
    pub fn new(
        config: ClientConfig,
        metadata: Arc<MetadataService>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let pool = Arc::new(BackendPool::new(config, metadata.clone(), connector));
        Self {
            metadata,
            pool,
            session: Mutex::new(None),
            local_objects: Mutex::new(HashMap::new()),
            hints: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Open a session; all subsequent calls run under it.
    pub async fn start_session(
        &self,
        username: &str,
        password: &str,
        dataset_name: &str,
    ) -> Result<SessionId> {
        let session = self
            .metadata
            .new_session(username, password, dataset_name)
            .await?;
        let session_id = session.id;
        *self.session.lock() = Some(session);
        info!(%session_id, username, "session started");
        Ok(session_id)
    }

    pub async fn close_session(&self) -> Result<()> {
        let session = self.session.lock().take();
        match session {
            Some(session) => self.metadata.close_session(session.id).await,
            None => Ok(()),
        }
    }

    fn current_session(&self) -> Result<Session> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("no session started"))
    }

    /// Create a local object; it stays client-side until made persistent.
    pub fn new_object(&self, class_name: impl Into<String>, fields: ObjectFields) -> Arc<ClientObject> {
        let object = Arc::new(ClientObject::new(class_name, fields));
        self.local_objects.lock().insert(object.id(), object.clone());
        object
    }

    /// Make an object graph persistent. Walks references from the root
    /// through local objects with a visited set (cycles are fine), ships
    /// the batch to one backend and registers every object there.
    pub async fn make_persistent(
        &self,
        root: &Arc<ClientObject>,
        alias: Option<&str>,
        backend_id: Option<BackendId>,
    ) -> Result<()> {
        let session = self.current_session()?;
        let connection = match backend_id {
            Some(id) => self.pool.get(id).await?,
            None => self.pool.any().await?,
        };
        let target = connection.backend_id();

        let mut batch = Vec::new();
        let mut visited: HashSet<ObjectId> = HashSet::new();
        let mut pending = vec![root.id()];
        while let Some(object_id) = pending.pop() {
            if !visited.insert(object_id) {
                continue;
            }
            let object = self.local_objects.lock().get(&object_id).cloned();
            // Already-persistent referents stay where they are
            let Some(object) = object else { continue };

            let fields = object.fields();
            pending.extend(referenced_objects(&fields));

            let mut md = ObjectMetadata::new(
                object_id,
                session.dataset_name.clone(),
                object.class_name(),
                target,
            );
            if object_id == root.id() {
                md.alias = alias.map(str::to_string);
            }
            batch.push(SerializedObject {
                metadata: md,
                fields,
            });
        }

        debug!(count = batch.len(), backend_id = %target, "making object graph persistent");
        connection.make_persistent(session.id, batch).await?;

        let mut local = self.local_objects.lock();
        let mut hints = self.hints.lock();
        for object_id in &visited {
            if local.remove(object_id).is_some() {
                hints.insert(*object_id, target);
            }
        }
        Ok(())
    }

    /// Resolve an alias within the session's dataset.
    pub async fn get_object_md_by_alias(&self, alias: &str) -> Result<ObjectMetadata> {
        let session = self.current_session()?;
        let md = self
            .metadata
            .get_object_md_by_alias(alias, &session.dataset_name)
            .await?;
        self.hints.lock().insert(md.id, md.master_backend_id);
        Ok(md)
    }

    async fn owner(&self, object_id: ObjectId) -> Result<Arc<dyn BackendConnection>> {
        let hint = self.hints.lock().get(&object_id).copied();
        let backend_id = match hint {
            Some(id) => id,
            None => {
                let md = self.metadata.get_object_md_by_id(object_id).await?;
                self.hints.lock().insert(object_id, md.master_backend_id);
                md.master_backend_id
            }
        };
        self.pool.get(backend_id).await
    }

    /// Follow a redirection error to the object's current master.
    async fn reroute(
        &self,
        object_id: ObjectId,
        err: Error,
    ) -> Result<Arc<dyn BackendConnection>> {
        let Error::ObjectWithWrongBackend {
            master_backend_id, ..
        } = err
        else {
            return Err(err);
        };
        debug!(%object_id, new_master = %master_backend_id, "stale hint, rerouting");
        self.hints.lock().insert(object_id, master_backend_id);
        self.pool.get(master_backend_id).await
    }

    pub async fn call_active_method(
        &self,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let session = self.current_session()?;
        let connection = self.owner(object_id).await?;
        match connection
            .call_active_method(session.id, object_id, method, args.clone())
            .await
        {
            Err(e @ Error::ObjectWithWrongBackend { .. }) => {
                let connection = self.reroute(object_id, e).await?;
                connection
                    .call_active_method(session.id, object_id, method, args)
                    .await
            }
            other => other,
        }
    }

    pub async fn get_attribute(&self, object_id: ObjectId, name: &str) -> Result<Value> {
        let session = self.current_session()?;
        let connection = self.owner(object_id).await?;
        match connection
            .get_object_attribute(session.id, object_id, name)
            .await
        {
            Err(e @ Error::ObjectWithWrongBackend { .. }) => {
                let connection = self.reroute(object_id, e).await?;
                connection
                    .get_object_attribute(session.id, object_id, name)
                    .await
            }
            other => other,
        }
    }

    pub async fn set_attribute(
        &self,
        object_id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let session = self.current_session()?;
        let connection = self.owner(object_id).await?;
        match connection
            .set_object_attribute(session.id, object_id, name, value.clone())
            .await
        {
            Err(e @ Error::ObjectWithWrongBackend { .. }) => {
                let connection = self.reroute(object_id, e).await?;
                connection
                    .set_object_attribute(session.id, object_id, name, value)
                    .await
            }
            other => other,
        }
    }

    pub async fn get_object_properties(&self, object_id: ObjectId) -> Result<ObjectFields> {
        let connection = self.owner(object_id).await?;
        match connection.get_object_properties(object_id).await {
            Err(e @ Error::ObjectWithWrongBackend { .. }) => {
                let connection = self.reroute(object_id, e).await?;
                connection.get_object_properties(object_id).await
            }
            other => other,
        }
    }

    pub async fn update_object_properties(
        &self,
        object_id: ObjectId,
        fields: ObjectFields,
    ) -> Result<()> {
        let connection = self.owner(object_id).await?;
        match connection
            .update_object_properties(object_id, fields.clone())
            .await
        {
            Err(e @ Error::ObjectWithWrongBackend { .. }) => {
                let connection = self.reroute(object_id, e).await?;
                connection.update_object_properties(object_id, fields).await
            }
            other => other,
        }
    }

    /// Stop the pool's refresh task and close the session.
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.stop().await;
        self.close_session().await
    }
}
