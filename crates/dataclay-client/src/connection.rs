//! Backend connections.
//!
//! The wire transport is pluggable; this module defines the call surface a
//! connection must offer and an in-process implementation that wraps a
//! `BackendRuntime` directly (embedded deployments and tests).

use async_trait::async_trait;
use dataclay_backend::{BackendRuntime, SerializedObject};
use dataclay_common::{BackendId, Error, ObjectFields, ObjectId, Result, SessionId, Value};
use dataclay_metadata::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One connection to one backend process.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn backend_id(&self) -> BackendId;

    /// Probe liveness within `timeout`.
    async fn is_ready(&self, timeout: Duration) -> bool;

    async fn make_persistent(
        &self,
        session_id: SessionId,
        objects: Vec<SerializedObject>,
    ) -> Result<()>;

    async fn call_active_method(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value>;

    async fn get_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
    ) -> Result<Value>;

    async fn set_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<()>;

    async fn get_object_properties(&self, object_id: ObjectId) -> Result<ObjectFields>;

    async fn update_object_properties(
        &self,
        object_id: ObjectId,
        fields: ObjectFields,
    ) -> Result<()>;

    async fn flush_all(&self) -> Result<()>;
}

/// Direct in-process connection to a backend runtime.
pub struct LocalBackendConnection {
    runtime: Arc<BackendRuntime>,
}

impl LocalBackendConnection {
    #[must_use]
    pub fn new(runtime: Arc<BackendRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl BackendConnection for LocalBackendConnection {
    fn backend_id(&self) -> BackendId {
        self.runtime.backend_id()
    }

    async fn is_ready(&self, _timeout: Duration) -> bool {
        true
    }

    async fn make_persistent(
        &self,
        session_id: SessionId,
        objects: Vec<SerializedObject>,
    ) -> Result<()> {
        self.runtime.make_persistent(session_id, objects).await
    }

    async fn call_active_method(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.runtime
            .call_active_method(session_id, object_id, method, args)
            .await
    }

    async fn get_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
    ) -> Result<Value> {
        self.runtime
            .get_object_attribute(session_id, object_id, name)
            .await
    }

    async fn set_object_attribute(
        &self,
        session_id: SessionId,
        object_id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.runtime
            .set_object_attribute(session_id, object_id, name, value)
            .await
    }

    async fn get_object_properties(&self, object_id: ObjectId) -> Result<ObjectFields> {
        self.runtime.get_object_properties(object_id).await
    }

    async fn update_object_properties(
        &self,
        object_id: ObjectId,
        fields: ObjectFields,
    ) -> Result<()> {
        self.runtime.update_object_properties(object_id, fields).await
    }

    async fn flush_all(&self) -> Result<()> {
        self.runtime.flush_all().await;
        Ok(())
    }
}

/// Builds connections from backend directory records.
pub trait Connector: Send + Sync {
    fn connect(&self, backend: &Backend) -> Result<Arc<dyn BackendConnection>>;
}

/// Connector for embedded deployments: resolves directory records against
/// runtimes living in this process.
#[derive(Default)]
pub struct LocalConnector {
    runtimes: parking_lot::RwLock<HashMap<BackendId, Arc<BackendRuntime>>>,
}

impl LocalConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_runtime(&self, runtime: Arc<BackendRuntime>) {
        self.runtimes.write().insert(runtime.backend_id(), runtime);
    }
}

impl Connector for LocalConnector {
    fn connect(&self, backend: &Backend) -> Result<Arc<dyn BackendConnection>> {
        let runtimes = self.runtimes.read();
        let runtime = runtimes
            .get(&backend.id)
            .ok_or_else(|| Error::ConnectionFailed(format!("no runtime for backend {}", backend.id)))?;
        Ok(Arc::new(LocalBackendConnection::new(runtime.clone())))
    }
}
