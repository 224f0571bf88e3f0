//! Active method registry.
//!
//! Backends execute methods where the data lives. Method bodies are
//! registered per (class, method) pair and run against the object's field
//! map; registration happens at process startup, before any call arrives.

use dataclay_common::{Error, ObjectFields, Result, Value};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A method body: mutable access to the object's fields plus call arguments.
pub type MethodFn = Box<dyn Fn(&mut ObjectFields, &[Value]) -> Result<Value> + Send + Sync>;

/// Registry of active methods keyed by (class name, method name).
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<(String, String), MethodFn>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        class_name: impl Into<String>,
        method: impl Into<String>,
        body: impl Fn(&mut ObjectFields, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.methods
            .write()
            .insert((class_name.into(), method.into()), Box::new(body));
    }

    /// Run a registered method against `fields`.
    pub fn call(
        &self,
        class_name: &str,
        method: &str,
        fields: &mut ObjectFields,
        args: &[Value],
    ) -> Result<Value> {
        let methods = self.methods.read();
        let body = methods
            .get(&(class_name.to_string(), method.to_string()))
            .ok_or_else(|| Error::MethodNotFound {
                class_name: class_name.to_string(),
                method: method.to_string(),
            })?;
        body(fields, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_registered_method() {
        let registry = MethodRegistry::new();
        registry.register("Person", "birthday", |fields, _args| {
            let age = fields.get("age").and_then(Value::as_int).unwrap_or(0);
            fields.insert("age".to_string(), Value::Int(age + 1));
            Ok(Value::Int(age + 1))
        });

        let mut fields = ObjectFields::new();
        fields.insert("age".to_string(), Value::Int(24));
        let result = registry.call("Person", "birthday", &mut fields, &[]).unwrap();
        assert_eq!(result, Value::Int(25));
        assert_eq!(fields.get("age"), Some(&Value::Int(25)));
    }

    #[test]
    fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let mut fields = ObjectFields::new();
        let err = registry
            .call("Person", "missing", &mut fields, &[])
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound { .. }));
    }
}
