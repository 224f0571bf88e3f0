//! Error types for dataClay-rs
//!
//! This module defines the common error type used throughout the system.
//! The variants fall into four families: not-found, conflict, storage and
//! credential errors. Not-found and conflict errors are surfaced to the
//! caller and never retried; storage errors leave in-memory state untouched
//! so the caller can retry; lock contention in the eviction path is not an
//! error at all (it is logged and deferred to the next pass).

use crate::types::{BackendId, DataclayId, ObjectId, SessionId};
use thiserror::Error;

/// Common result type for dataClay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dataClay
#[derive(Debug, Error)]
pub enum Error {
    // Kv generic
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("key does not exist: {0}")]
    DoesNotExist(String),

    // Objects
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("object already registered: {0}")]
    ObjectAlreadyRegistered(ObjectId),

    #[error("object is not registered: {0}")]
    ObjectNotRegistered(ObjectId),

    #[error("object storage error for {object_id}: {reason}")]
    ObjectStorage { object_id: ObjectId, reason: String },

    #[error("object {object_id} is owned by backend {master_backend_id}")]
    ObjectWithWrongBackend {
        object_id: ObjectId,
        master_backend_id: BackendId,
        replica_backend_ids: Vec<BackendId>,
    },

    #[error("object {0} is not a version")]
    ObjectIsNotVersion(ObjectId),

    #[error("object {0} has no attribute '{1}'")]
    AttributeNotFound(ObjectId, String),

    #[error("object {0} is read-only")]
    ObjectReadOnly(ObjectId),

    #[error("no method '{method}' registered for class '{class_name}'")]
    MethodNotFound { class_name: String, method: String },

    // Aliases
    #[error("alias {dataset_name}/{alias_name} does not exist")]
    AliasDoesNotExist {
        alias_name: String,
        dataset_name: String,
    },

    #[error("alias {dataset_name}/{alias_name} already exists")]
    AliasAlreadyExists {
        alias_name: String,
        dataset_name: String,
    },

    #[error("object {0} is a version and cannot be aliased")]
    VersionCannotBeAliased(ObjectId),

    // Accounts / datasets
    #[error("account {0} does not exist")]
    AccountDoesNotExist(String),

    #[error("account {0}: invalid credentials")]
    AccountInvalidCredentials(String),

    #[error("dataset {0} does not exist")]
    DatasetDoesNotExist(String),

    #[error("dataset {dataset_name} is not accessible by {username}")]
    DatasetNotAccessible {
        dataset_name: String,
        username: String,
    },

    // Sessions
    #[error("session {0} does not exist")]
    SessionDoesNotExist(SessionId),

    #[error("session {0} is not active")]
    SessionNotActive(SessionId),

    // Backends / dataclay instances
    #[error("backend {0} does not exist")]
    BackendDoesNotExist(BackendId),

    #[error("no other backends available")]
    NoOtherBackendsAvailable,

    #[error("dataclay {0} does not exist")]
    DataclayDoesNotExist(DataclayId),

    // Kv / network plumbing
    #[error("kv store error: {0}")]
    KvStore(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an object storage error
    pub fn object_storage(object_id: ObjectId, reason: impl Into<String>) -> Self {
        Self::ObjectStorage {
            object_id,
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DoesNotExist(_)
                | Self::ObjectNotFound(_)
                | Self::ObjectNotRegistered(_)
                | Self::AliasDoesNotExist { .. }
                | Self::AccountDoesNotExist(_)
                | Self::DatasetDoesNotExist(_)
                | Self::SessionDoesNotExist(_)
                | Self::BackendDoesNotExist(_)
                | Self::DataclayDoesNotExist(_)
                | Self::AttributeNotFound(..)
        )
    }

    /// Check if this is a conflict (already-exists) error
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists(_)
                | Self::ObjectAlreadyRegistered(_)
                | Self::AliasAlreadyExists { .. }
        )
    }

    /// Check if this is a retryable (transient connectivity) error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::ObjectNotFound(ObjectId::new()).is_not_found());
        assert!(Error::DoesNotExist("/object/x".into()).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }

    #[test]
    fn test_error_conflict() {
        assert!(Error::AlreadyExists("/alias/ds/name".into()).is_conflict());
        assert!(
            Error::AliasAlreadyExists {
                alias_name: "a".into(),
                dataset_name: "ds".into()
            }
            .is_conflict()
        );
        assert!(!Error::ObjectNotFound(ObjectId::new()).is_conflict());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::AccountInvalidCredentials("bob".into()).is_retryable());
    }
}
