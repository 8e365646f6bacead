//! Exception bridge
//!
//! Bridge errors and native exceptions become thrown script errors with a
//! `stack`; script errors unwinding through native frames travel as native
//! exceptions and come out unchanged on the other side.

use jsobjc_sdk::{JsError, JsValue};

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::objc::NativeException;

impl From<NativeException> for BridgeError {
    fn from(e: NativeException) -> Self {
        match e.script_error {
            Some(script) => BridgeError::Script(script),
            None => BridgeError::NativeException {
                name: e.name,
                reason: e.reason,
            },
        }
    }
}

/// Callback invoked for errors no script caller can catch
pub type UncaughtHandler = dyn Fn(&JsError);

impl Bridge {
    /// Convert a bridge error into the value thrown into script
    pub fn to_js_error(&self, error: BridgeError) -> JsError {
        let stack = self
            .call_stack
            .take_captured()
            .or_else(|| self.call_stack.render());
        let thrown = match error {
            BridgeError::Script(e) => return e,
            BridgeError::NativeException { name, reason } => JsError::new(&name, reason),
            BridgeError::NativeError {
                domain,
                code,
                description,
            } => JsError::new("MarshalError", &description)
                .with_property("domain", JsValue::string(domain))
                .with_property("code", JsValue::Number(code as f64)),
            other => JsError::new(&other.error_name(), other.to_string()),
        };
        match stack {
            Some(stack) => thrown.with_stack(stack),
            None => thrown,
        }
    }

    /// A native exception as a script error. Script errors carried through
    /// native frames come back as they were thrown.
    pub fn native_exception_to_js(&self, e: NativeException) -> JsError {
        self.to_js_error(BridgeError::from(e))
    }

    /// A bridge error raised inside a native callback, as the exception the
    /// native caller sees
    pub(crate) fn to_native_exception(&self, error: BridgeError) -> NativeException {
        match error {
            BridgeError::NativeException { name, reason } => NativeException::new(name, reason),
            BridgeError::Script(e) => NativeException::from_script(e),
            other => NativeException::from_script(self.to_js_error(other)),
        }
    }

    /// Install the handler for errors that escape to the top level
    pub fn set_uncaught_handler(&self, handler: impl Fn(&JsError) + 'static) {
        *self.uncaught.borrow_mut() = Some(Box::new(handler));
    }

    /// Deliver an error that has no script caller to catch it
    pub fn report_uncaught(&self, error: JsError) {
        tracing::warn!(error = %error, "uncaught script error");
        // The handler may call back into the bridge
        let handler = self.uncaught.borrow_mut().take();
        match &handler {
            Some(handler) => handler(&error),
            None => tracing::error!(error = %error, "no uncaught error handler installed"),
        }
        let mut slot = self.uncaught.borrow_mut();
        if slot.is_none() {
            *slot = handler;
        }
    }
}
