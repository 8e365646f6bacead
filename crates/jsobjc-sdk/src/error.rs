//! Thrown scripting values

use std::fmt;

use crate::object::JsObject;
use crate::value::JsValue;

/// Result type for operations that may throw into script
pub type JsResult<T> = Result<T, JsError>;

/// A thrown scripting value.
///
/// Most throws carry an error object with `name`, `message` and usually a
/// `stack` property, but any value can be thrown.
#[derive(Clone, Debug)]
pub struct JsError {
    thrown: JsValue,
}

impl JsError {
    /// Throw an arbitrary value
    pub fn from_value(thrown: JsValue) -> Self {
        Self { thrown }
    }

    /// Throw a new error object with the given name and message
    pub fn new(name: &str, message: impl AsRef<str>) -> Self {
        Self::from_value(JsValue::Object(JsObject::error(name, message.as_ref())))
    }

    /// Throw an `Error`
    pub fn error(message: impl AsRef<str>) -> Self {
        Self::new("Error", message)
    }

    /// Throw a `TypeError`
    pub fn type_error(message: impl AsRef<str>) -> Self {
        Self::new("TypeError", message)
    }

    /// Throw a `RangeError`
    pub fn range_error(message: impl AsRef<str>) -> Self {
        Self::new("RangeError", message)
    }

    /// The thrown value
    pub fn value(&self) -> &JsValue {
        &self.thrown
    }

    /// Consume into the thrown value
    pub fn into_value(self) -> JsValue {
        self.thrown
    }

    fn error_object(&self) -> Option<&JsObject> {
        self.thrown.as_object().filter(|o| o.is_error() || o.has("message"))
    }

    /// The error's `name`, or `"Error"` for non-error throws
    pub fn name(&self) -> String {
        match self.error_object() {
            Some(obj) if obj.has("name") => obj.get("name").to_js_string(),
            _ => "Error".to_string(),
        }
    }

    /// The error's `message`, or the ToString of a non-error throw
    pub fn message(&self) -> String {
        match self.error_object() {
            Some(obj) => obj.get("message").to_js_string(),
            None => self.thrown.to_js_string(),
        }
    }

    /// The error's `stack`, if one was attached
    pub fn stack(&self) -> Option<String> {
        self.error_object()
            .and_then(|obj| obj.get("stack").as_str().map(str::to_string))
    }

    /// Attach a stack string; has no effect for non-object throws
    pub fn with_stack(self, stack: impl AsRef<str>) -> Self {
        if let Some(obj) = self.thrown.as_object() {
            obj.set("stack", JsValue::from(stack.as_ref()));
        }
        self
    }

    /// Attach an extra property to the thrown error object
    pub fn with_property(self, key: &str, value: JsValue) -> Self {
        if let Some(obj) = self.thrown.as_object() {
            obj.set(key, value);
        }
        self
    }
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_object() {
            Some(_) => write!(f, "{}: {}", self.name(), self.message()),
            None => write!(f, "Uncaught {}", self.thrown.to_js_string()),
        }
    }
}

impl std::error::Error for JsError {}

impl From<String> for JsError {
    fn from(s: String) -> Self {
        JsError::error(s)
    }
}

impl From<&str> for JsError {
    fn from(s: &str) -> Self {
        JsError::error(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fields() {
        let err = JsError::type_error("bad value").with_stack("f@[native code]");
        assert_eq!(err.name(), "TypeError");
        assert_eq!(err.message(), "bad value");
        assert_eq!(err.stack().as_deref(), Some("f@[native code]"));
        assert_eq!(err.to_string(), "TypeError: bad value");
    }

    #[test]
    fn test_non_error_throw() {
        let err = JsError::from_value(JsValue::from(42));
        assert_eq!(err.name(), "Error");
        assert_eq!(err.message(), "42");
        assert!(err.stack().is_none());
        assert_eq!(err.to_string(), "Uncaught 42");
    }
}
