//! Scripting values
//!
//! `JsValue` is the dynamically typed value the bridge consumes and
//! produces. Primitives are stored inline; objects are shared handles whose
//! equality is identity.

use std::rc::Rc;

use crate::object::{JsObject, ObjectKind};

/// Largest integer a double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

// ============================================================================
// JsValue
// ============================================================================

/// A scripting value.
#[derive(Clone, Debug, Default)]
pub enum JsValue {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// A boolean
    Bool(bool),
    /// A number (IEEE double)
    Number(f64),
    /// A bigint, limited to the range the bridge needs for 64-bit integers
    BigInt(i128),
    /// An immutable string
    String(Rc<str>),
    /// A reference to an object
    Object(JsObject),
}

impl JsValue {
    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        JsValue::String(Rc::from(s.as_ref()))
    }

    /// Check for `undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    /// Check for `null`
    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    /// Check for `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Null | JsValue::Undefined)
    }

    /// Get the number if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the boolean if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the string slice if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the object if this is an object
    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            JsValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Check whether this value can be called
    pub fn is_function(&self) -> bool {
        self.as_object().is_some_and(|o| o.is_function())
    }

    /// The `typeof` string of this value
    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::BigInt(_) => "bigint",
            JsValue::String(_) => "string",
            JsValue::Object(o) if o.is_function() => "function",
            JsValue::Object(_) => "object",
        }
    }

    /// ToBoolean
    pub fn to_boolean(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::BigInt(b) => *b != 0,
            JsValue::String(s) => !s.is_empty(),
            JsValue::Object(_) => true,
        }
    }

    /// ToNumber for primitives; objects convert to NaN.
    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(n) => *n,
            JsValue::BigInt(b) => *b as f64,
            JsValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            JsValue::Object(_) => f64::NAN,
        }
    }

    /// ToString, as used when a value is named in an error message
    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) => number_to_string(*n),
            JsValue::BigInt(b) => b.to_string(),
            JsValue::String(s) => s.to_string(),
            JsValue::Object(o) => o.display_string(),
        }
    }

    /// Strict equality (`===`): primitives by value, objects by identity
    pub fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::BigInt(a), JsValue::BigInt(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Structural equality over plain data: arrays and ordinary objects are
    /// compared element by element, everything else falls back to `===`.
    pub fn deep_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Object(a), JsValue::Object(b)) => {
                if a.ptr_eq(b) {
                    return true;
                }
                match (a.kind(), b.kind()) {
                    (ObjectKind::Array(_), ObjectKind::Array(_)) => {
                        let left = a.array_elements().unwrap_or_default();
                        let right = b.array_elements().unwrap_or_default();
                        left.len() == right.len()
                            && left.iter().zip(right.iter()).all(|(l, r)| l.deep_equals(r))
                    }
                    (ObjectKind::Ordinary, ObjectKind::Ordinary) => {
                        let keys = a.keys();
                        keys.len() == b.keys().len()
                            && keys
                                .iter()
                                .all(|k| b.has(k) && a.get(k).deep_equals(&b.get(k)))
                    }
                    _ => false,
                }
            }
            _ => self.strict_equals(other),
        }
    }
}

/// `==` is strict equality, so objects compare by identity
impl PartialEq for JsValue {
    fn eq(&self, other: &JsValue) -> bool {
        self.strict_equals(other)
    }
}

/// Format a number the way scripting ToString does for common values
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<i32> for JsValue {
    fn from(n: i32) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<u32> for JsValue {
    fn from(n: u32) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::string(s)
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(Rc::from(s))
    }
}

impl From<JsObject> for JsValue {
    fn from(o: JsObject) -> Self {
        JsValue::Object(o)
    }
}
