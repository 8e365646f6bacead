//! `interop.Pointer` and raw memory helpers

use std::cell::Cell;
use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue, ObjectKind};

use super::Reference;
use crate::bridge::Bridge;
use crate::encoding::size_of;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::{ClassWrapper, ObjcWrapper};
use crate::marshal::string::read_c_string;
use crate::marshal::StructValue;
use crate::memory::{alloc_raw, free_raw};

/// An untyped native address
#[derive(Debug)]
pub struct Pointer {
    address: usize,
    adopted: Cell<bool>,
}

impl Pointer {
    /// The address
    pub fn address(&self) -> usize {
        self.address
    }

    /// Whether the memory is freed when this value is finalized
    pub fn is_adopted(&self) -> bool {
        self.adopted.get()
    }
}

impl HostObject for Pointer {
    fn class_name(&self) -> &str {
        "Pointer"
    }

    fn display(&self) -> String {
        format!("<Pointer: {:#x}>", self.address)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Drop for Pointer {
    fn drop(&mut self) {
        if self.adopted.get() && self.address != 0 {
            // SAFETY: adopted pointers come from alloc_raw and are freed once
            unsafe { free_raw(self.address as *mut u8) }
        }
    }
}

fn address_argument(value: &JsValue) -> BridgeResult<usize> {
    match value {
        JsValue::Number(n) if n.is_finite() && *n >= 0.0 => Ok(*n as usize),
        JsValue::BigInt(i) if *i >= 0 => Ok(*i as usize),
        JsValue::String(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => usize::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            };
            parsed.ok_or_else(|| BridgeError::Type(format!("Invalid address \"{}\"", s)))
        }
        other => Err(BridgeError::Type(format!(
            "{} is not a valid address",
            other.to_js_string()
        ))),
    }
}

fn pointer_of(value: &JsValue) -> Option<Rc<Pointer>> {
    value.as_object()?.host_data::<Pointer>()
}

impl Bridge {
    /// The pointer value for `address`. Identity is stable per address
    /// while the value is alive.
    pub fn pointer_value(&self, address: usize) -> JsValue {
        if let Some(existing) = self.pointers.borrow().get(&address).and_then(|w| w.upgrade()) {
            return JsValue::Object(existing);
        }
        let object = JsObject::host(Rc::new(Pointer {
            address,
            adopted: Cell::new(false),
        }));
        self.pointers.borrow_mut().insert(address, object.downgrade());
        JsValue::Object(object)
    }

    /// `new Pointer(address)`
    pub fn new_pointer(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let address = match args.first() {
            None | Some(JsValue::Undefined) => 0,
            Some(v) => address_argument(v)?,
        };
        Ok(self.pointer_value(address))
    }

    /// Methods of a pointer value
    pub(crate) fn pointer_method(&self, pointer: &Pointer, name: &str, args: &[JsValue]) -> Option<BridgeResult<JsValue>> {
        let offset = || -> BridgeResult<usize> {
            match args.first() {
                Some(v) => address_argument(v),
                None => Ok(0),
            }
        };
        Some(match name {
            "add" => offset().map(|n| self.pointer_value(pointer.address.wrapping_add(n))),
            "subtract" => offset().map(|n| self.pointer_value(pointer.address.wrapping_sub(n))),
            "toString" => Ok(JsValue::string(pointer.display())),
            "toHexString" => Ok(JsValue::string(format!("{:#x}", pointer.address))),
            "toDecimalString" => Ok(JsValue::string(pointer.address.to_string())),
            "toNumber" => Ok(JsValue::Number(pointer.address as f64)),
            _ => return None,
        })
    }

    /// `interop.alloc(size)`: zeroed memory the caller frees with
    /// `interop.free` or hands to `interop.adopt`
    pub fn alloc(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let size = match args.first() {
            Some(JsValue::Number(n)) if *n >= 0.0 => *n as usize,
            Some(other) => {
                return Err(BridgeError::Type(format!(
                    "{} is not a valid allocation size",
                    other.to_js_string()
                )))
            }
            None => return Err(BridgeError::argument_count(0, 1)),
        };
        let ptr = alloc_raw(size)?;
        Ok(self.pointer_value(ptr as usize))
    }

    /// `interop.free(ptr)`
    pub fn free(&self, args: &[JsValue]) -> BridgeResult<()> {
        let pointer = args.first().and_then(pointer_of).ok_or_else(|| {
            BridgeError::Type(format!(
                "{} is not a Pointer",
                args.first().map(JsValue::to_js_string).unwrap_or_default()
            ))
        })?;
        pointer.adopted.set(false);
        // SAFETY: free is only valid for memory from interop.alloc; that is
        // the caller's contract
        unsafe { free_raw(pointer.address as *mut u8) };
        Ok(())
    }

    /// `interop.adopt(ptr)`: free the memory when the pointer value goes away
    pub fn adopt(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let value = args.first().cloned().unwrap_or_default();
        let pointer = pointer_of(&value)
            .ok_or_else(|| BridgeError::Type(format!("{} is not a Pointer", value.to_js_string())))?;
        pointer.adopted.set(true);
        Ok(value)
    }

    /// `interop.handleof(value)`: the native address behind a value
    pub fn handleof(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let value = args.first().cloned().unwrap_or_default();
        let not_native = || BridgeError::Type(format!("{} has no native handle", value.to_js_string()));
        let object = match &value {
            JsValue::Null => return Ok(JsValue::Null),
            JsValue::Object(o) => o,
            _ => return Err(not_native()),
        };
        if pointer_of(&value).is_some() {
            return Ok(value.clone());
        }
        if let Some(reference) = object.host_data::<Reference>() {
            let address = self.bind_reference(&reference, None)?;
            return Ok(self.pointer_value(address));
        }
        if let Some(wrapper) = object.host_data::<ObjcWrapper>() {
            return Ok(self.pointer_value(wrapper.handle()));
        }
        if let Some(class) = object.host_data::<ClassWrapper>() {
            return Ok(self.pointer_value(self.runtime().class_object(class.class())));
        }
        if let Some(sv) = object.host_data::<StructValue>() {
            return Ok(self.pointer_value(sv.as_ptr() as usize));
        }
        match object.kind() {
            ObjectKind::TypedArray(array) => Ok(self.pointer_value(array.as_mut_ptr() as usize)),
            ObjectKind::ArrayBuffer(buffer) => Ok(self.pointer_value(buffer.as_mut_ptr() as usize)),
            _ => Err(not_native()),
        }
    }

    /// `interop.sizeof(type)`
    pub fn sizeof(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let value = args.first().cloned().unwrap_or_default();
        if let Some(ty) = self.type_argument(&value) {
            return Ok(JsValue::from(size_of(&ty, self.abi()) as f64));
        }
        let object = value.as_object();
        if let Some(reference) = object.and_then(|o| o.host_data::<Reference>()) {
            if let Some(ty) = reference.ty() {
                return Ok(JsValue::from(size_of(&ty, self.abi()) as f64));
            }
        }
        if let Some(sv) = object.and_then(|o| o.host_data::<StructValue>()) {
            return Ok(JsValue::from(sv.layout().size as f64));
        }
        let pointer_sized = object.is_some_and(|o| {
            o.host_data::<Pointer>().is_some()
                || o.host_data::<ObjcWrapper>().is_some()
                || o.host_data::<Reference>().is_some()
        });
        if pointer_sized {
            return Ok(JsValue::from(self.abi().pointer_size() as f64));
        }
        Err(BridgeError::Type(format!(
            "{} is not a native type",
            value.to_js_string()
        )))
    }

    /// `interop.bufferFromData(data)`: an ArrayBuffer sharing an NSData's
    /// bytes. Writes through either side are seen by the other.
    pub fn buffer_from_data(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let value = args.first().cloned().unwrap_or_default();
        let buffer = value
            .as_object()
            .and_then(|o| o.host_data::<ObjcWrapper>())
            .and_then(|wrapper| self.runtime().data_buffer(wrapper.handle()))
            .ok_or_else(|| BridgeError::Type(format!("{} is not an NSData", value.to_js_string())))?;
        Ok(JsValue::Object(JsObject::array_buffer(buffer)))
    }

    /// `interop.stringFromCString(ptr[, length])`
    pub fn string_from_cstring(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let value = args.first().cloned().unwrap_or_default();
        let address = match &value {
            JsValue::Null | JsValue::Undefined => 0,
            JsValue::Object(o) => {
                if let Some(pointer) = o.host_data::<Pointer>() {
                    pointer.address
                } else if let Some(reference) = o.host_data::<Reference>() {
                    self.bind_reference(&reference, None)?
                } else {
                    return Err(BridgeError::Type(format!(
                        "{} is not a Pointer or Reference",
                        value.to_js_string()
                    )));
                }
            }
            other => {
                return Err(BridgeError::Type(format!(
                    "{} is not a Pointer or Reference",
                    other.to_js_string()
                )))
            }
        };
        if address == 0 {
            return Ok(JsValue::Null);
        }
        let length = match args.get(1) {
            Some(JsValue::Number(n)) if *n >= 0.0 => Some(*n as usize),
            _ => None,
        };
        // SAFETY: the caller vouches for the address and length
        Ok(JsValue::string(unsafe { read_c_string(address as *const u8, length) }))
    }
}
