//! Unmanaged return boxes

use std::cell::Cell;
use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Ownership;
use crate::objc::Id;

/// An object returned without an ownership decision. Script picks one by
/// taking the value exactly once.
#[derive(Debug)]
pub struct Unmanaged {
    handle: Id,
    taken: Cell<bool>,
}

impl HostObject for Unmanaged {
    fn class_name(&self) -> &str {
        "Unmanaged"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Bridge {
    pub(crate) fn unmanaged_value(&self, handle: Id) -> JsValue {
        JsValue::Object(JsObject::host(Rc::new(Unmanaged {
            handle,
            taken: Cell::new(false),
        })))
    }

    /// `takeRetainedValue()` adopts the +1 the callee returned;
    /// `takeUnretainedValue()` adds a retain of its own
    pub(crate) fn unmanaged_method(&self, unmanaged: &Unmanaged, name: &str) -> Option<BridgeResult<JsValue>> {
        let ownership = match name {
            "takeRetainedValue" => Ownership::Retained,
            "takeUnretainedValue" => Ownership::Unretained,
            _ => return None,
        };
        if unmanaged.taken.replace(true) {
            return Some(Err(BridgeError::Type(
                "Unmanaged value has already been consumed".to_string(),
            )));
        }
        Some(self.wrap(unmanaged.handle, ownership, None))
    }
}
