//! JsObjC SDK - the scripting value space
//!
//! This crate provides the value model the bridge marshals to and from:
//! primitive values, objects with insertion-ordered properties, arrays,
//! callable functions, binary buffers and host objects that wrap
//! native-side state.
//!
//! Objects are reference counted and compared by identity, which is what
//! the bridge relies on when it hands the same wrapper back for the same
//! native handle.
//!
//! # Example
//!
//! ```ignore
//! use jsobjc_sdk::{JsObject, JsValue};
//!
//! let point = JsObject::new();
//! point.set("x", JsValue::from(1.0));
//! point.set("y", JsValue::from(2.0));
//! assert_eq!(point.keys().len(), 2);
//! ```

#![warn(missing_docs)]

pub mod convert;
pub mod error;
pub mod json;
pub mod object;
pub mod value;

pub use convert::{FromJs, IntoJs};
pub use error::{JsError, JsResult};
pub use object::{
    ArrayBuffer, HostObject, JsFunction, JsObject, ObjectKind, PropertySlot, TypedArray,
    TypedArrayKind, WeakJsObject,
};
pub use value::JsValue;
