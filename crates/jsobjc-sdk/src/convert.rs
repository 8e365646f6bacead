//! Conversions between Rust values and scripting values.
//!
//! Implement `FromJs` to let a Rust type be extracted from an argument and
//! `IntoJs` to let it be returned to script.
//!
//! # Example
//!
//! ```ignore
//! use jsobjc_sdk::{FromJs, IntoJs, JsValue};
//!
//! let n = f64::from_js(&JsValue::from(3))?;
//! let v = "hello".to_string().into_js();
//! ```

use std::rc::Rc;

use crate::error::{JsError, JsResult};
use crate::object::JsObject;
use crate::value::JsValue;

/// Extract a Rust value from a scripting value.
pub trait FromJs: Sized {
    /// Convert, failing with a `TypeError` on mismatch
    fn from_js(value: &JsValue) -> JsResult<Self>;
}

/// Turn a Rust value into a scripting value.
pub trait IntoJs {
    /// Convert into a scripting value
    fn into_js(self) -> JsValue;
}

fn mismatch(expected: &str, got: &JsValue) -> JsError {
    JsError::type_error(format!(
        "Type mismatch: expected {}, got {}",
        expected,
        got.type_of()
    ))
}

// ============================================================================
// Primitive Type Implementations
// ============================================================================

impl FromJs for f64 {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        match value {
            JsValue::Number(n) => Ok(*n),
            JsValue::BigInt(b) => Ok(*b as f64),
            other => Err(mismatch("number", other)),
        }
    }
}

impl IntoJs for f64 {
    fn into_js(self) -> JsValue {
        JsValue::Number(self)
    }
}

impl FromJs for i32 {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        let n = f64::from_js(value)?;
        if n.fract() != 0.0 || n < i32::MIN as f64 || n > i32::MAX as f64 {
            return Err(JsError::range_error(format!("{} is not an int32", n)));
        }
        Ok(n as i32)
    }
}

impl IntoJs for i32 {
    fn into_js(self) -> JsValue {
        JsValue::Number(self as f64)
    }
}

impl FromJs for i64 {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        match value {
            JsValue::BigInt(b) => i64::try_from(*b)
                .map_err(|_| JsError::range_error(format!("{} is out of int64 range", b))),
            other => {
                let n = f64::from_js(other)?;
                if n.fract() != 0.0 {
                    return Err(JsError::range_error(format!("{} is not an integer", n)));
                }
                Ok(n as i64)
            }
        }
    }
}

impl IntoJs for i64 {
    fn into_js(self) -> JsValue {
        if (self as f64).abs() <= crate::value::MAX_SAFE_INTEGER {
            JsValue::Number(self as f64)
        } else {
            JsValue::BigInt(self as i128)
        }
    }
}

impl IntoJs for usize {
    fn into_js(self) -> JsValue {
        (self as i64).into_js()
    }
}

impl FromJs for bool {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        value.as_bool().ok_or_else(|| mismatch("boolean", value))
    }
}

impl IntoJs for bool {
    fn into_js(self) -> JsValue {
        JsValue::Bool(self)
    }
}

impl FromJs for String {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("string", value))
    }
}

impl IntoJs for String {
    fn into_js(self) -> JsValue {
        JsValue::String(Rc::from(self))
    }
}

impl IntoJs for &str {
    fn into_js(self) -> JsValue {
        JsValue::string(self)
    }
}

impl IntoJs for () {
    fn into_js(self) -> JsValue {
        JsValue::Undefined
    }
}

impl FromJs for JsValue {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        Ok(value.clone())
    }
}

impl IntoJs for JsValue {
    fn into_js(self) -> JsValue {
        self
    }
}

impl FromJs for JsObject {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        value
            .as_object()
            .cloned()
            .ok_or_else(|| mismatch("object", value))
    }
}

impl IntoJs for JsObject {
    fn into_js(self) -> JsValue {
        JsValue::Object(self)
    }
}

// ============================================================================
// Composite Implementations
// ============================================================================

impl<T: FromJs> FromJs for Option<T> {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        if value.is_nullish() {
            Ok(None)
        } else {
            T::from_js(value).map(Some)
        }
    }
}

impl<T: IntoJs> IntoJs for Option<T> {
    fn into_js(self) -> JsValue {
        match self {
            Some(v) => v.into_js(),
            None => JsValue::Null,
        }
    }
}

impl<T: FromJs> FromJs for Vec<T> {
    fn from_js(value: &JsValue) -> JsResult<Self> {
        let elements = value
            .as_object()
            .and_then(|o| o.array_elements())
            .ok_or_else(|| mismatch("array", value))?;
        elements.iter().map(T::from_js).collect()
    }
}

impl<T: IntoJs> IntoJs for Vec<T> {
    fn into_js(self) -> JsValue {
        JsValue::Object(JsObject::array(
            self.into_iter().map(IntoJs::into_js).collect(),
        ))
    }
}
