//! Client-side object handles.
//!
//! A `ClientObject` is a not-yet-persistent object under construction: an
//! id assigned up front, a class name and a mutable field map. References
//! between client objects are ordinary `Value::Ref` fields, which is what
//! the make-persistent graph walk follows.

use dataclay_common::{ObjectFields, ObjectId, Value};
use parking_lot::Mutex;

pub struct ClientObject {
    id: ObjectId,
    class_name: String,
    fields: Mutex<ObjectFields>,
}

impl ClientObject {
    #[must_use]
    pub fn new(class_name: impl Into<String>, fields: ObjectFields) -> Self {
        Self {
            id: ObjectId::new(),
            class_name: class_name.into(),
            fields: Mutex::new(fields),
        }
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.fields.lock().insert(name.into(), value);
    }

    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    #[must_use]
    pub fn fields(&self) -> ObjectFields {
        self.fields.lock().clone()
    }

    /// A reference to this object, for use as a field of another object.
    #[must_use]
    pub fn reference(&self) -> Value {
        Value::Ref {
            object_id: self.id,
            class_name: self.class_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_carries_identity() {
        let object = ClientObject::new("Person", ObjectFields::new());
        match object.reference() {
            Value::Ref {
                object_id,
                class_name,
            } => {
                assert_eq!(object_id, object.id());
                assert_eq!(class_name, "Person");
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
