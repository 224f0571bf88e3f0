//! Record types stored in the metadata kv store.
//!
//! Each record maps to one key under a stable namespace prefix:
//! `/account/{username}`, `/dataset/{name}`, `/session/{id}`,
//! `/backend/{id}`, `/dataclay/{id}`, `/object/{id}` and
//! `/alias/{dataset}/{name}`. Values are bincode blobs.

use dataclay_common::{BackendId, DataclayId, Language, ObjectId, Result, SessionId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

/// A value that knows its own kv key.
pub trait KvRecord: Serialize + for<'de> Deserialize<'de> {
    /// Namespace prefix, ending in '/'
    const PREFIX: &'static str;

    /// Full key for this record
    fn key(&self) -> String;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A registered dataClay deployment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataclay {
    pub id: DataclayId,
    pub host: String,
    pub port: u16,
    /// True for the record describing this deployment itself, stored under
    /// the well-known key `/dataclay/this`.
    pub is_this: bool,
}

impl KvRecord for Dataclay {
    const PREFIX: &'static str = "/dataclay/";

    fn key(&self) -> String {
        if self.is_this {
            format!("{}this", Self::PREFIX)
        } else {
            format!("{}{}", Self::PREFIX, self.id)
        }
    }
}

/// A live backend node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub host: String,
    pub port: u16,
    pub dataclay_id: DataclayId,
    pub language: Language,
}

impl KvRecord for Backend {
    const PREFIX: &'static str = "/backend/";

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.id)
    }
}

/// Object metadata: the authoritative record of where an object lives.
///
/// `master_backend_id` is non-null once the object is registered. A record
/// with `original_object_id` set is a version and must not be aliased until
/// consolidated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub id: ObjectId,
    pub dataset_name: String,
    pub class_name: String,
    pub master_backend_id: BackendId,
    pub replica_backend_ids: HashSet<BackendId>,
    pub is_read_only: bool,
    pub alias: Option<String>,
    pub original_object_id: Option<ObjectId>,
    pub versions_object_ids: Vec<ObjectId>,
}

impl ObjectMetadata {
    pub fn new(
        id: ObjectId,
        dataset_name: impl Into<String>,
        class_name: impl Into<String>,
        master_backend_id: BackendId,
    ) -> Self {
        Self {
            id,
            dataset_name: dataset_name.into(),
            class_name: class_name.into(),
            master_backend_id,
            replica_backend_ids: HashSet::new(),
            is_read_only: false,
            alias: None,
            original_object_id: None,
            versions_object_ids: Vec::new(),
        }
    }

    /// True if this record describes a version derived from another object.
    #[must_use]
    pub fn is_version(&self) -> bool {
        self.original_object_id.is_some()
    }
}

impl KvRecord for ObjectMetadata {
    const PREFIX: &'static str = "/object/";

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.id)
    }
}

/// Alias: human-readable name bound to one object within one dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub dataset_name: String,
    pub object_id: ObjectId,
}

impl Alias {
    #[must_use]
    pub fn key_for(dataset_name: &str, name: &str) -> String {
        format!("{}{}/{}", Self::PREFIX, dataset_name, name)
    }
}

impl KvRecord for Alias {
    const PREFIX: &'static str = "/alias/";

    fn key(&self) -> String {
        Self::key_for(&self.dataset_name, &self.name)
    }
}

/// A client session binding a user to a default dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub dataset_name: String,
    pub is_active: bool,
    /// Expiry instant; sessions without explicit control get a default
    /// horizon from configuration.
    pub expires_at: SystemTime,
}

impl Session {
    pub fn new(username: impl Into<String>, dataset_name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            id: SessionId::new(),
            username: username.into(),
            dataset_name: dataset_name.into(),
            is_active: true,
            expires_at: SystemTime::now() + ttl,
        }
    }
}

impl KvRecord for Session {
    const PREFIX: &'static str = "/session/";

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.id)
    }
}

/// A user account. The password is stored as a salted sha-256 hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub salt: String,
    pub hashed_password: String,
    pub role: String,
    pub datasets: Vec<String>,
}

impl Account {
    pub fn new(username: impl Into<String>, password: &str, role: impl Into<String>) -> Self {
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);
        let hashed_password = Self::hash(&salt, password);
        Self {
            username: username.into(),
            salt,
            hashed_password,
            role: role.into(),
            datasets: Vec::new(),
        }
    }

    fn hash(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check the password, and optionally the role.
    #[must_use]
    pub fn verify(&self, password: &str, role: Option<&str>) -> bool {
        if Self::hash(&self.salt, password) != self.hashed_password {
            return false;
        }
        match role {
            Some(r) => self.role == r,
            None => true,
        }
    }
}

impl KvRecord for Account {
    const PREFIX: &'static str = "/account/";

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.username)
    }
}

/// A dataset: the namespace aliases and objects live in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub owner: String,
    pub is_public: bool,
}

impl KvRecord for Dataset {
    const PREFIX: &'static str = "/dataset/";

    fn key(&self) -> String {
        format!("{}{}", Self::PREFIX, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_verify() {
        let account = Account::new("alice", "s3cret", "NORMAL");
        assert!(account.verify("s3cret", None));
        assert!(account.verify("s3cret", Some("NORMAL")));
        assert!(!account.verify("s3cret", Some("ADMIN")));
        assert!(!account.verify("wrong", None));
    }

    #[test]
    fn test_account_salts_differ() {
        let a = Account::new("alice", "pw", "NORMAL");
        let b = Account::new("bob", "pw", "NORMAL");
        assert_ne!(a.hashed_password, b.hashed_password);
    }

    #[test]
    fn test_record_keys() {
        let alias = Alias {
            name: "ages".into(),
            dataset_name: "testdata".into(),
            object_id: ObjectId::new(),
        };
        assert_eq!(alias.key(), "/alias/testdata/ages");

        let md = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        assert!(md.key().starts_with("/object/"));
        assert!(!md.is_version());
    }

    #[test]
    fn test_record_bytes_roundtrip() {
        let md = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        let bytes = md.to_bytes().unwrap();
        let back = ObjectMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(back.id, md.id);
        assert_eq!(back.class_name, "Person");
    }
}
