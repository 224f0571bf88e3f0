//! The metadata service API.
//!
//! All registration paths go through the kv store's `set_new` primitive, so
//! conflicts cannot race into a false negative. Alias deletion holds a
//! per-object lock across the alias removal and the metadata update so a
//! racing reader never observes a half-deleted state.

use crate::kv::KvStore;
use crate::records::{Account, Alias, Backend, Dataclay, Dataset, KvRecord, ObjectMetadata, Session};
use dataclay_common::{BackendId, DataclayId, Error, MetadataConfig, ObjectId, Result, SessionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Metadata service over a kv store.
pub struct MetadataService {
    kv: Arc<dyn KvStore>,
    config: MetadataConfig,
    /// Cached view of the backend directory, refreshed on force reads.
    backends_cache: RwLock<HashMap<BackendId, Backend>>,
    /// Per-object locks guarding alias create/delete against racing readers.
    object_locks: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
    /// Per-account locks serializing dataset-list updates.
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataService {
    pub fn new(kv: Arc<dyn KvStore>, config: MetadataConfig) -> Self {
        Self {
            kv,
            config,
            backends_cache: RwLock::new(HashMap::new()),
            object_locks: Mutex::new(HashMap::new()),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the kv store to come up.
    pub fn is_ready(&self, timeout: Option<Duration>) -> bool {
        self.kv.is_ready(timeout, self.config.ready_pause)
    }

    fn put_new<T: KvRecord>(&self, record: &T) -> Result<()> {
        self.kv.set_new(&record.key(), &record.to_bytes()?)
    }

    fn put<T: KvRecord>(&self, record: &T) -> Result<()> {
        self.kv.set(&record.key(), &record.to_bytes()?)
    }

    fn fetch<T: KvRecord>(&self, key: &str) -> Result<T> {
        T::from_bytes(&self.kv.get(key)?)
    }

    fn object_lock(&self, object_id: ObjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.object_locks.lock();
        locks
            .entry(object_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn account_lock(&self, username: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.account_locks.lock();
        locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ---- Accounts ----

    /// Create an admin account together with its first dataset.
    pub async fn new_superuser(
        &self,
        username: &str,
        password: &str,
        dataset_name: &str,
    ) -> Result<()> {
        debug!(username, dataset_name, "creating superuser");
        let mut account = Account::new(username, password, "ADMIN");
        let dataset = Dataset {
            name: dataset_name.to_string(),
            owner: username.to_string(),
            is_public: false,
        };
        account.datasets.push(dataset_name.to_string());

        // Order matters: the dataset create checks name uniqueness first
        self.put_new(&dataset)?;
        self.put_new(&account)?;
        info!(username, dataset_name, "new superuser");
        Ok(())
    }

    /// Register a new account. The username must be unique.
    pub async fn new_account(&self, username: &str, password: &str) -> Result<()> {
        debug!(username, "creating account");
        let account = Account::new(username, password, "NORMAL");
        self.put_new(&account)?;
        info!(username, "new account");
        Ok(())
    }

    async fn get_account(&self, username: &str) -> Result<Account> {
        self.fetch(&format!("{}{}", Account::PREFIX, username))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::AccountDoesNotExist(username.to_string()),
                other => other,
            })
    }

    // ---- Datasets ----

    /// Validate credentials and create a dataset owned by the account.
    pub async fn new_dataset(
        &self,
        username: &str,
        password: &str,
        dataset_name: &str,
    ) -> Result<()> {
        debug!(username, dataset_name, "creating dataset");
        let lock = self.account_lock(username);
        let _guard = lock.lock().await;

        // The dataset create is the uniqueness check; the account update follows
        let mut account = self.get_account(username).await?;
        if !account.verify(password, None) {
            return Err(Error::AccountInvalidCredentials(username.to_string()));
        }

        let dataset = Dataset {
            name: dataset_name.to_string(),
            owner: username.to_string(),
            is_public: false,
        };
        self.put_new(&dataset)?;
        account.datasets.push(dataset_name.to_string());
        self.put(&account)?;
        info!(username, dataset_name, "new dataset");
        Ok(())
    }

    /// Grant another account access to a dataset owned by the caller.
    pub async fn add_account_to_dataset(
        &self,
        username: &str,
        password: &str,
        dataset_name: &str,
        account_name: &str,
    ) -> Result<()> {
        let operating = self.get_account(username).await?;
        if !operating.verify(password, None) {
            return Err(Error::AccountInvalidCredentials(username.to_string()));
        }

        let dataset: Dataset = self
            .fetch(&format!("{}{}", Dataset::PREFIX, dataset_name))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::DatasetDoesNotExist(dataset_name.to_string()),
                other => other,
            })?;
        if dataset.owner != username {
            return Err(Error::DatasetNotAccessible {
                dataset_name: dataset_name.to_string(),
                username: username.to_string(),
            });
        }

        let lock = self.account_lock(account_name);
        let _guard = lock.lock().await;
        let mut account = self.get_account(account_name).await?;
        if !account.datasets.contains(&dataset_name.to_string()) {
            account.datasets.push(dataset_name.to_string());
            self.put(&account)?;
        }
        info!(dataset_name, account_name, "granted dataset access");
        Ok(())
    }

    // ---- Sessions ----

    /// Validate credentials and dataset access, then create a session.
    pub async fn new_session(
        &self,
        username: &str,
        password: &str,
        dataset_name: &str,
    ) -> Result<Session> {
        debug!(username, dataset_name, "creating session");
        let account = self.get_account(username).await?;
        if !account.verify(password, None) {
            return Err(Error::AccountInvalidCredentials(username.to_string()));
        }

        let dataset: Dataset = self
            .fetch(&format!("{}{}", Dataset::PREFIX, dataset_name))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::DatasetDoesNotExist(dataset_name.to_string()),
                other => other,
            })?;
        if !dataset.is_public && !account.datasets.contains(&dataset_name.to_string()) {
            return Err(Error::DatasetNotAccessible {
                dataset_name: dataset_name.to_string(),
                username: username.to_string(),
            });
        }

        let session = Session::new(username, dataset_name, self.config.session_ttl);
        self.put_new(&session)?;
        info!(session_id = %session.id, username, "new session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Session> {
        self.fetch(&format!("{}{}", Session::PREFIX, session_id))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::SessionDoesNotExist(session_id),
                other => other,
            })
    }

    /// Mark a session closed. The session record stays (expired) so late
    /// readers get `SessionNotActive` rather than a confusing not-found.
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        let mut session = self.get_session(session_id).await?;
        session.is_active = false;
        session.expires_at = SystemTime::now();
        self.put(&session)?;
        info!(%session_id, "session closed");
        Ok(())
    }

    // ---- Dataclay instances ----

    pub async fn new_dataclay(
        &self,
        dataclay_id: DataclayId,
        host: &str,
        port: u16,
        is_this: bool,
    ) -> Result<()> {
        let dataclay = Dataclay {
            id: dataclay_id,
            host: host.to_string(),
            port,
            is_this,
        };
        self.put_new(&dataclay)?;
        info!(%dataclay_id, host, port, "registered dataclay instance");
        Ok(())
    }

    /// The record describing this deployment, stored under `/dataclay/this`.
    pub async fn get_own_dataclay(&self) -> Result<Dataclay> {
        self.fetch(&format!("{}this", Dataclay::PREFIX))
    }

    pub async fn get_dataclay(&self, dataclay_id: DataclayId) -> Result<Dataclay> {
        self.fetch(&format!("{}{}", Dataclay::PREFIX, dataclay_id))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::DataclayDoesNotExist(dataclay_id),
                other => other,
            })
    }

    // ---- Backends ----

    /// Register a backend node (autoregistration at process startup).
    pub async fn register_backend(&self, backend: &Backend) -> Result<()> {
        debug!(backend_id = %backend.id, host = %backend.host, "registering backend");
        self.put_new(backend)?;
        self.backends_cache.write().insert(backend.id, backend.clone());
        info!(backend_id = %backend.id, "registered backend");
        Ok(())
    }

    /// Remove a backend (graceful shutdown only; no crash detection).
    pub async fn delete_backend(&self, backend_id: BackendId) -> Result<()> {
        self.kv
            .delete(&format!("{}{}", Backend::PREFIX, backend_id))?;
        self.backends_cache.write().remove(&backend_id);
        info!(%backend_id, "deleted backend");
        Ok(())
    }

    /// All registered backends. With `force` the kv store is re-read and the
    /// cache replaced; otherwise a warm cache is served as-is.
    pub async fn get_all_backends(&self, force: bool) -> Result<HashMap<BackendId, Backend>> {
        if !force {
            let cache = self.backends_cache.read();
            if !cache.is_empty() {
                return Ok(cache.clone());
            }
        }

        let mut backends = HashMap::new();
        for (_, bytes) in self.kv.get_prefix(Backend::PREFIX)? {
            let backend = Backend::from_bytes(&bytes)?;
            backends.insert(backend.id, backend);
        }
        *self.backends_cache.write() = backends.clone();
        Ok(backends)
    }

    pub async fn get_backend(&self, backend_id: BackendId) -> Result<Backend> {
        self.fetch(&format!("{}{}", Backend::PREFIX, backend_id))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::BackendDoesNotExist(backend_id),
                other => other,
            })
    }

    // ---- Objects ----

    /// Register a freshly persisted object. The object record is created
    /// before its alias so an alias is never visible without its target; if
    /// the alias turns out to be taken, the object record is rolled back.
    pub async fn register_object(&self, object_md: &ObjectMetadata) -> Result<()> {
        debug!(object_id = %object_md.id, class = %object_md.class_name, "registering object");
        if object_md.alias.is_some() && object_md.is_version() {
            return Err(Error::VersionCannotBeAliased(object_md.id));
        }

        self.put_new(object_md).map_err(|e| match e {
            Error::AlreadyExists(_) => Error::ObjectAlreadyRegistered(object_md.id),
            other => other,
        })?;

        if let Some(alias_name) = &object_md.alias {
            let alias = Alias {
                name: alias_name.clone(),
                dataset_name: object_md.dataset_name.clone(),
                object_id: object_md.id,
            };
            if let Err(e) = self.put_new(&alias) {
                self.kv.delete(&object_md.key())?;
                return Err(match e {
                    Error::AlreadyExists(_) => Error::AliasAlreadyExists {
                        alias_name: alias_name.clone(),
                        dataset_name: object_md.dataset_name.clone(),
                    },
                    other => other,
                });
            }
        }
        Ok(())
    }

    /// Create or replace an object record.
    pub async fn upsert_object(&self, object_md: &ObjectMetadata) -> Result<()> {
        self.put(object_md)
    }

    pub async fn get_object_md_by_id(&self, object_id: ObjectId) -> Result<ObjectMetadata> {
        self.fetch(&format!("{}{}", ObjectMetadata::PREFIX, object_id))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::ObjectNotFound(object_id),
                other => other,
            })
    }

    pub async fn get_object_md_by_alias(
        &self,
        alias_name: &str,
        dataset_name: &str,
    ) -> Result<ObjectMetadata> {
        let alias: Alias = self
            .fetch(&Alias::key_for(dataset_name, alias_name))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::AliasDoesNotExist {
                    alias_name: alias_name.to_string(),
                    dataset_name: dataset_name.to_string(),
                },
                other => other,
            })?;
        self.get_object_md_by_id(alias.object_id).await
    }

    pub async fn get_all_objects(&self) -> Result<HashMap<ObjectId, ObjectMetadata>> {
        let mut objects = HashMap::new();
        for (_, bytes) in self.kv.get_prefix(ObjectMetadata::PREFIX)? {
            let md = ObjectMetadata::from_bytes(&bytes)?;
            objects.insert(md.id, md);
        }
        Ok(objects)
    }

    pub async fn delete_object(&self, object_id: ObjectId) -> Result<()> {
        self.kv
            .delete(&format!("{}{}", ObjectMetadata::PREFIX, object_id))
    }

    // ---- Aliases ----

    /// Bind an alias to an already-registered object.
    pub async fn new_alias(
        &self,
        alias_name: &str,
        dataset_name: &str,
        object_id: ObjectId,
    ) -> Result<()> {
        let lock = self.object_lock(object_id);
        let _guard = lock.lock().await;

        let mut object_md = self.get_object_md_by_id(object_id).await?;
        if object_md.is_version() {
            return Err(Error::VersionCannotBeAliased(object_id));
        }

        let alias = Alias {
            name: alias_name.to_string(),
            dataset_name: dataset_name.to_string(),
            object_id,
        };
        self.put_new(&alias).map_err(|e| match e {
            Error::AlreadyExists(_) => Error::AliasAlreadyExists {
                alias_name: alias_name.to_string(),
                dataset_name: dataset_name.to_string(),
            },
            other => other,
        })?;

        object_md.alias = Some(alias_name.to_string());
        self.put(&object_md)?;
        info!(alias_name, dataset_name, %object_id, "new alias");
        Ok(())
    }

    pub async fn get_all_aliases(&self, dataset_name: Option<&str>) -> Result<Vec<Alias>> {
        let prefix = match dataset_name {
            Some(ds) => format!("{}{}/", Alias::PREFIX, ds),
            None => Alias::PREFIX.to_string(),
        };
        let mut aliases = Vec::new();
        for (_, bytes) in self.kv.get_prefix(&prefix)? {
            aliases.push(Alias::from_bytes(&bytes)?);
        }
        Ok(aliases)
    }

    /// Remove an alias and clear the alias field on the target's metadata.
    /// Both steps happen under the target's per-object lock.
    pub async fn delete_alias(&self, alias_name: &str, dataset_name: &str) -> Result<()> {
        let alias: Alias = self
            .fetch(&Alias::key_for(dataset_name, alias_name))
            .map_err(|e| match e {
                Error::DoesNotExist(_) => Error::AliasDoesNotExist {
                    alias_name: alias_name.to_string(),
                    dataset_name: dataset_name.to_string(),
                },
                other => other,
            })?;

        let lock = self.object_lock(alias.object_id);
        let _guard = lock.lock().await;

        self.kv.delete(&Alias::key_for(dataset_name, alias_name))?;
        if let Ok(mut object_md) = self.get_object_md_by_id(alias.object_id).await {
            object_md.alias = None;
            self.put(&object_md)?;
        }
        info!(alias_name, dataset_name, "deleted alias");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use dataclay_common::Language;

    fn service() -> MetadataService {
        MetadataService::new(Arc::new(MemoryKv::new()), MetadataConfig::default())
    }

    #[tokio::test]
    async fn test_account_and_session_lifecycle() {
        let md = service();
        md.new_account("alice", "pw").await.unwrap();
        md.new_dataset("alice", "pw", "ds").await.unwrap();

        let session = md.new_session("alice", "pw", "ds").await.unwrap();
        assert!(session.is_active);
        assert_eq!(session.dataset_name, "ds");

        md.close_session(session.id).await.unwrap();
        let closed = md.get_session(session.id).await.unwrap();
        assert!(!closed.is_active);
    }

    #[tokio::test]
    async fn test_session_rejects_bad_credentials() {
        let md = service();
        md.new_account("alice", "pw").await.unwrap();
        md.new_dataset("alice", "pw", "ds").await.unwrap();

        let err = md.new_session("alice", "wrong", "ds").await.unwrap_err();
        assert!(matches!(err, Error::AccountInvalidCredentials(_)));

        md.new_account("bob", "pw2").await.unwrap();
        let err = md.new_session("bob", "pw2", "ds").await.unwrap_err();
        assert!(matches!(err, Error::DatasetNotAccessible { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_account_conflicts() {
        let md = service();
        md.new_account("alice", "pw").await.unwrap();
        let err = md.new_account("alice", "other").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_register_object_with_alias_rollback() {
        let md = service();
        let backend_id = BackendId::new();

        let mut a = ObjectMetadata::new(ObjectId::new(), "ds", "Person", backend_id);
        a.alias = Some("people".to_string());
        md.register_object(&a).await.unwrap();

        // Same alias on a different object: the object record must roll back
        let mut b = ObjectMetadata::new(ObjectId::new(), "ds", "Person", backend_id);
        b.alias = Some("people".to_string());
        let err = md.register_object(&b).await.unwrap_err();
        assert!(matches!(err, Error::AliasAlreadyExists { .. }));
        assert!(
            md.get_object_md_by_id(b.id).await.unwrap_err().is_not_found(),
            "object record must not survive a failed alias registration"
        );

        let found = md.get_object_md_by_alias("people", "ds").await.unwrap();
        assert_eq!(found.id, a.id);
    }

    #[tokio::test]
    async fn test_delete_alias_clears_metadata() {
        let md = service();
        let mut a = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        a.alias = Some("people".to_string());
        md.register_object(&a).await.unwrap();

        md.delete_alias("people", "ds").await.unwrap();
        let err = md.get_object_md_by_alias("people", "ds").await.unwrap_err();
        assert!(matches!(err, Error::AliasDoesNotExist { .. }));
        let cleared = md.get_object_md_by_id(a.id).await.unwrap();
        assert_eq!(cleared.alias, None);
    }

    #[tokio::test]
    async fn test_version_cannot_be_aliased() {
        let md = service();
        let original = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        md.register_object(&original).await.unwrap();

        let mut version = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        version.original_object_id = Some(original.id);
        md.register_object(&version).await.unwrap();

        let err = md.new_alias("v1", "ds", version.id).await.unwrap_err();
        assert!(matches!(err, Error::VersionCannotBeAliased(_)));
    }

    #[tokio::test]
    async fn test_backend_directory_cache() {
        let md = service();
        let backend = Backend {
            id: BackendId::new(),
            host: "127.0.0.1".into(),
            port: 6867,
            dataclay_id: DataclayId::new(),
            language: Language::Rust,
        };
        md.register_backend(&backend).await.unwrap();

        let cached = md.get_all_backends(false).await.unwrap();
        assert_eq!(cached.len(), 1);

        md.delete_backend(backend.id).await.unwrap();
        // Cache was invalidated on delete; a force read agrees
        let fresh = md.get_all_backends(true).await.unwrap();
        assert!(fresh.is_empty());
    }
}
