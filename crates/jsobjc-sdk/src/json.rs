//! Structural copies of plain data.
//!
//! Values that cross an isolate boundary are copied through
//! `serde_json::Value`, so only plain data survives: primitives, arrays and
//! ordinary objects. Functions, host objects and cycles are rejected.

use rustc_hash::FxHashSet;
use serde_json::{Map, Number, Value};

use crate::error::JsError;
use crate::object::{JsObject, ObjectKind};
use crate::value::JsValue;

/// Errors raised when a value cannot be structurally copied
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloneError {
    /// A function or host object was found
    #[error("{0} could not be cloned.")]
    Uncloneable(String),

    /// The value graph contains a cycle
    #[error("Converting circular structure to a structured copy")]
    Circular,
}

impl From<CloneError> for JsError {
    fn from(e: CloneError) -> Self {
        JsError::new("DataCloneError", e.to_string())
    }
}

/// Copy a value into JSON form
pub fn to_json(value: &JsValue) -> Result<Value, CloneError> {
    let mut visiting = FxHashSet::default();
    encode(value, &mut visiting)
}

fn encode(value: &JsValue, visiting: &mut FxHashSet<usize>) -> Result<Value, CloneError> {
    Ok(match value {
        JsValue::Undefined | JsValue::Null => Value::Null,
        JsValue::Bool(b) => Value::Bool(*b),
        JsValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        JsValue::BigInt(b) => {
            return Err(CloneError::Uncloneable(format!("{}n", b)));
        }
        JsValue::String(s) => Value::String(s.to_string()),
        JsValue::Object(obj) => {
            if !visiting.insert(obj.id()) {
                return Err(CloneError::Circular);
            }
            let encoded = encode_object(obj, visiting);
            visiting.remove(&obj.id());
            encoded?
        }
    })
}

fn encode_object(obj: &JsObject, visiting: &mut FxHashSet<usize>) -> Result<Value, CloneError> {
    match obj.kind() {
        ObjectKind::Array(_) => {
            let elements = obj.array_elements().unwrap_or_default();
            let encoded = elements
                .iter()
                .map(|v| encode(v, visiting))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(encoded))
        }
        ObjectKind::Ordinary | ObjectKind::Error => {
            let mut map = Map::new();
            for key in obj.keys() {
                let v = obj.get(&key);
                if v.is_undefined() {
                    continue;
                }
                map.insert(key.to_string(), encode(&v, visiting)?);
            }
            Ok(Value::Object(map))
        }
        _ => Err(CloneError::Uncloneable(obj.display_string())),
    }
}

/// Materialize JSON as a fresh scripting value
pub fn from_json(value: &Value) -> JsValue {
    match value {
        Value::Null => JsValue::Null,
        Value::Bool(b) => JsValue::Bool(*b),
        Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => JsValue::from(s.as_str()),
        Value::Array(items) => {
            JsValue::Object(JsObject::array(items.iter().map(from_json).collect()))
        }
        Value::Object(map) => {
            let obj = JsObject::new();
            for (k, v) in map {
                obj.set(k, from_json(v));
            }
            JsValue::Object(obj)
        }
    }
}

/// Deep-copy a value through JSON
pub fn structured_clone(value: &JsValue) -> Result<JsValue, CloneError> {
    to_json(value).map(|json| from_json(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clone_is_deep_equal_not_identical() {
        let inner = JsObject::array(vec![JsValue::from(1), JsValue::from("two")]);
        let obj = JsObject::new();
        obj.set("items", JsValue::from(inner));
        obj.set("flag", JsValue::from(true));
        let original = JsValue::from(obj);

        let copy = structured_clone(&original).unwrap();
        assert!(copy.deep_equals(&original));
        assert!(!copy.strict_equals(&original));
    }

    #[test]
    fn test_key_order_survives() {
        let obj = JsObject::new();
        obj.set("z", JsValue::from(1));
        obj.set("a", JsValue::from(2));
        let json = to_json(&JsValue::from(obj)).unwrap();
        assert_eq!(json.to_string(), r#"{"z":1.0,"a":2.0}"#);
    }

    #[test]
    fn test_functions_are_rejected() {
        let f = JsValue::from(JsObject::function("f", |_, _| Ok(JsValue::Undefined)));
        let err = to_json(&f).unwrap_err();
        assert!(matches!(err, CloneError::Uncloneable(_)));
        let js: JsError = err.into();
        assert_eq!(js.name(), "DataCloneError");
    }

    #[test]
    fn test_cycles_are_rejected() {
        let obj = JsObject::new();
        obj.set("self", JsValue::from(obj.clone()));
        assert!(matches!(to_json(&JsValue::from(obj.clone())), Err(CloneError::Circular)));
        obj.delete("self");
    }

    #[test]
    fn test_shared_subobjects_are_not_cycles() {
        let shared = JsValue::from(JsObject::new());
        let arr = JsValue::from(JsObject::array(vec![shared.clone(), shared]));
        assert!(to_json(&arr).is_ok());
    }
}
