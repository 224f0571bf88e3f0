//! Value model for persistent object state.
//!
//! A persistent object's state is a field-name → value map. References to
//! other managed objects are never inlined: they serialize as a
//! `Value::Ref` carrying the target's id and class, which is what makes
//! recursive graph shipping and cycle breaking possible (the decode side
//! resolves refs against an in-flight object map, creating a proxy when the
//! target has not arrived yet).

use crate::types::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field map of a persistent object. BTreeMap keeps encoding deterministic.
pub type ObjectFields = BTreeMap<String, Value>;

/// A single field value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to another managed object: (id, class name). Serialized in
    /// place of the target's state.
    Ref {
        object_id: ObjectId,
        class_name: String,
    },
}

impl Value {
    /// Object ids directly referenced by this value (not transitive).
    pub fn collect_refs(&self, out: &mut Vec<ObjectId>) {
        match self {
            Value::Ref { object_id, .. } => out.push(*object_id),
            Value::List(items) => {
                for v in items {
                    v.collect_refs(out);
                }
            }
            Value::Map(entries) => {
                for v in entries.values() {
                    v.collect_refs(out);
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Object ids referenced anywhere in a field map.
#[must_use]
pub fn referenced_objects(fields: &ObjectFields) -> Vec<ObjectId> {
    let mut out = Vec::new();
    for v in fields.values() {
        v.collect_refs(&mut out);
    }
    out
}
