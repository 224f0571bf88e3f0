//! Backend connection pool.
//!
//! Caches one connection per backend, refreshed from the directory on a
//! timer and on demand. A cache miss triggers a hard refresh before the
//! lookup is declared failed, which is how clients pick up backends that
//! registered after the pool was built.

use crate::connection::{BackendConnection, Connector};
use dashmap::DashMap;
use dataclay_common::{BackendId, ClientConfig, Error, Result};
use dataclay_metadata::MetadataService;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct BackendPool {
    config: ClientConfig,
    metadata: Arc<MetadataService>,
    connector: Arc<dyn Connector>,
    connections: DashMap<BackendId, Arc<dyn BackendConnection>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl BackendPool {
    pub fn new(
        config: ClientConfig,
        metadata: Arc<MetadataService>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            metadata,
            connector,
            connections: DashMap::new(),
            refresher: Mutex::new(None),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Reconcile the pool against the backend directory. With `force` the
    /// directory itself is re-read from the kv store.
    pub async fn update(&self, force: bool) -> Result<()> {
        let backends = self.metadata.get_all_backends(force).await?;

        for backend in backends.values() {
            if self.connections.contains_key(&backend.id) {
                continue;
            }
            let connection = match self.connector.connect(backend) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(backend_id = %backend.id, error = %e, "cannot connect to backend");
                    continue;
                }
            };
            if !connection.is_ready(self.config.ready_timeout).await {
                warn!(backend_id = %backend.id, "backend not ready, skipping");
                continue;
            }
            debug!(backend_id = %backend.id, "backend connection added");
            self.connections.insert(backend.id, connection);
        }

        // Drop connections to backends that left the directory
        self.connections.retain(|id, _| backends.contains_key(id));
        Ok(())
    }

    /// Connection for a specific backend; a miss triggers a hard refresh.
    pub async fn get(&self, backend_id: BackendId) -> Result<Arc<dyn BackendConnection>> {
        if let Some(connection) = self.connections.get(&backend_id) {
            return Ok(connection.clone());
        }
        self.update(true).await?;
        self.connections
            .get(&backend_id)
            .map(|c| c.clone())
            .ok_or(Error::BackendDoesNotExist(backend_id))
    }

    /// Any connected backend, chosen at random (object placement).
    pub async fn any(&self) -> Result<Arc<dyn BackendConnection>> {
        if self.connections.is_empty() {
            self.update(true).await?;
        }
        let connections: Vec<Arc<dyn BackendConnection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        if connections.is_empty() {
            return Err(Error::NoOtherBackendsAvailable);
        }
        let index = rand::thread_rng().gen_range(0..connections.len());
        Ok(connections[index].clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Spawn the periodic refresh task.
    pub fn start_refresh(self: &Arc<Self>) {
        let pool = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(pool.config.backend_refresh_interval) => {
                        if let Err(e) = pool.update(true).await {
                            warn!(error = %e, "backend pool refresh failed");
                        }
                    }
                }
            }
        });
        *self.refresher.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.refresher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
