//! Live persistent objects.
//!
//! A `PersistentObject` is the in-process representation of one stored
//! object: metadata plus, while loaded, its field map. The fields slot is
//! `None` when the object has been evicted to disk; the loaded flag mirrors
//! it and is what the rest of the system checks.

use dataclay_common::{Error, ObjectFields, ObjectId, Result, Value};
use dataclay_metadata::ObjectMetadata;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Wire and disk form of an object: metadata plus persisted fields.
///
/// When a snapshot is read back from disk its embedded metadata is
/// discarded; the metadata service holds the authoritative copy and the
/// blob's copy may be stale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializedObject {
    pub metadata: ObjectMetadata,
    pub fields: ObjectFields,
}

/// One object materialized on this backend.
pub struct PersistentObject {
    id: ObjectId,
    metadata: RwLock<ObjectMetadata>,
    fields: RwLock<Option<ObjectFields>>,
    is_loaded: AtomicBool,
    is_local: AtomicBool,
}

impl PersistentObject {
    /// A freshly materialized object with its fields in memory.
    #[must_use]
    pub fn new_loaded(metadata: ObjectMetadata, fields: ObjectFields) -> Self {
        Self {
            id: metadata.id,
            metadata: RwLock::new(metadata),
            fields: RwLock::new(Some(fields)),
            is_loaded: AtomicBool::new(true),
            is_local: AtomicBool::new(true),
        }
    }

    /// A skeleton for an object whose state lives on disk.
    #[must_use]
    pub fn new_unloaded(metadata: ObjectMetadata) -> Self {
        Self {
            id: metadata.id,
            metadata: RwLock::new(metadata),
            fields: RwLock::new(None),
            is_loaded: AtomicBool::new(false),
            is_local: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn class_name(&self) -> String {
        self.metadata.read().class_name.clone()
    }

    #[must_use]
    pub fn metadata(&self) -> ObjectMetadata {
        self.metadata.read().clone()
    }

    pub fn update_metadata(&self, f: impl FnOnce(&mut ObjectMetadata)) {
        f(&mut self.metadata.write());
    }

    pub fn replace_metadata(&self, metadata: ObjectMetadata) {
        *self.metadata.write() = metadata;
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.is_loaded.store(loaded, Ordering::Release);
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.is_local.load(Ordering::Acquire)
    }

    pub fn set_local(&self, local: bool) {
        self.is_local.store(local, Ordering::Release);
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.metadata.read().is_read_only
    }

    /// Install deserialized fields (load path).
    pub fn put_fields(&self, fields: ObjectFields) {
        *self.fields.write() = Some(fields);
    }

    /// Drop the in-memory field map (unload path).
    pub fn clear_fields(&self) {
        *self.fields.write() = None;
    }

    /// Copy of the persisted fields; fails if the object is not loaded.
    pub fn snapshot_fields(&self) -> Result<ObjectFields> {
        self.fields
            .read()
            .clone()
            .ok_or_else(|| Error::internal(format!("object {} has no fields in memory", self.id)))
    }

    pub fn get_field(&self, name: &str) -> Result<Value> {
        let fields = self.fields.read();
        let fields = fields
            .as_ref()
            .ok_or_else(|| Error::internal(format!("object {} has no fields in memory", self.id)))?;
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AttributeNotFound(self.id, name.to_string()))
    }

    pub fn set_field(&self, name: &str, value: Value) -> Result<()> {
        let mut fields = self.fields.write();
        let fields = fields
            .as_mut()
            .ok_or_else(|| Error::internal(format!("object {} has no fields in memory", self.id)))?;
        fields.insert(name.to_string(), value);
        Ok(())
    }

    pub fn delete_field(&self, name: &str) -> Result<()> {
        let mut fields = self.fields.write();
        let fields = fields
            .as_mut()
            .ok_or_else(|| Error::internal(format!("object {} has no fields in memory", self.id)))?;
        fields
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::AttributeNotFound(self.id, name.to_string()))
    }

    /// Run `f` with mutable access to the field map.
    pub fn with_fields_mut<T>(&self, f: impl FnOnce(&mut ObjectFields) -> Result<T>) -> Result<T> {
        let mut fields = self.fields.write();
        let fields = fields
            .as_mut()
            .ok_or_else(|| Error::internal(format!("object {} has no fields in memory", self.id)))?;
        f(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataclay_common::BackendId;

    fn person(age: i64) -> PersistentObject {
        let md = ObjectMetadata::new(ObjectId::new(), "ds", "Person", BackendId::new());
        let mut fields = ObjectFields::new();
        fields.insert("age".to_string(), Value::from(age));
        PersistentObject::new_loaded(md, fields)
    }

    #[test]
    fn test_field_access() {
        let obj = person(24);
        assert_eq!(obj.get_field("age").unwrap(), Value::Int(24));
        assert!(matches!(
            obj.get_field("name").unwrap_err(),
            Error::AttributeNotFound(..)
        ));

        obj.set_field("age", Value::Int(25)).unwrap();
        assert_eq!(obj.get_field("age").unwrap(), Value::Int(25));

        obj.delete_field("age").unwrap();
        assert!(obj.get_field("age").is_err());
    }

    #[test]
    fn test_clear_fields_marks_nothing_but_fields() {
        let obj = person(24);
        assert!(obj.is_loaded());
        obj.clear_fields();
        obj.set_loaded(false);
        assert!(!obj.is_loaded());
        assert!(obj.snapshot_fields().is_err());
        assert!(obj.is_local());
    }

    #[test]
    fn test_serialized_object_roundtrip() {
        let obj = person(24);
        let serialized = SerializedObject {
            metadata: obj.metadata(),
            fields: obj.snapshot_fields().unwrap(),
        };
        let bytes = bincode::serialize(&serialized).unwrap();
        let back: SerializedObject = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.metadata.id, obj.id());
        assert_eq!(back.fields.get("age"), Some(&Value::Int(24)));
    }
}
