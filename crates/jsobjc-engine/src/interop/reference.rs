//! `interop.Reference`
//!
//! A reference moves through three states: unbound, holding a script
//! value, and bound to a native address. Binding happens the first time
//! native code needs the address; from then on `.value` reads memory.

use std::cell::RefCell;
use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue};

use super::Pointer;
use crate::bridge::Bridge;
use crate::encoding::{size_of, IntWidth, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::{ObjcWrapper, Ownership};
use crate::marshal::{MarshalScope, StructValue};
use crate::memory::NativeAllocation;
use crate::objc::Id;

enum RefState {
    Unbound,
    Value(JsValue),
    Address {
        address: usize,
        /// Storage owned by the reference; empty when aliasing
        owned: Vec<NativeAllocation>,
        /// Bytes indexing may reach; `None` for memory the bridge does
        /// not own
        capacity: Option<usize>,
        /// Keeps an aliased pointer value alive
        _keepalive: Option<JsValue>,
    },
}

/// A boxed native memory location, optionally typed
pub struct Reference {
    ty: RefCell<Option<TypeDescriptor>>,
    state: RefCell<RefState>,
    /// Last object read through an `id`-typed reference
    cached_object: RefCell<Option<(Id, JsValue)>>,
}

impl Reference {
    fn new(ty: Option<TypeDescriptor>, state: RefState) -> Self {
        Self {
            ty: RefCell::new(ty),
            state: RefCell::new(state),
            cached_object: RefCell::new(None),
        }
    }

    /// The reference's type, if it has one
    pub fn ty(&self) -> Option<TypeDescriptor> {
        self.ty.borrow().clone()
    }

    /// The bound address, or zero
    pub fn address(&self) -> usize {
        match &*self.state.borrow() {
            RefState::Address { address, .. } => *address,
            _ => 0,
        }
    }

    /// Whether the reference has a native address
    pub fn is_bound(&self) -> bool {
        matches!(&*self.state.borrow(), RefState::Address { .. })
    }

    fn capacity(&self) -> Option<usize> {
        match &*self.state.borrow() {
            RefState::Address { capacity, .. } => *capacity,
            _ => None,
        }
    }
}

impl HostObject for Reference {
    fn class_name(&self) -> &str {
        "Reference"
    }

    fn display(&self) -> String {
        format!("<Reference: {:#x}>", self.address())
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

/// Type assumed for a value-holding reference that never got one
fn infer_type(value: &JsValue) -> TypeDescriptor {
    match value {
        JsValue::Bool(_) => TypeDescriptor::Bool,
        JsValue::Number(_) => TypeDescriptor::Double,
        JsValue::BigInt(_) => TypeDescriptor::int(IntWidth::W64, true),
        JsValue::String(_) => TypeDescriptor::CString,
        JsValue::Object(o) => {
            if let Some(sv) = o.host_data::<StructValue>() {
                TypeDescriptor::Struct(sv.layout().clone())
            } else if o.host_data::<ObjcWrapper>().is_some() || o.is_array() || o.is_ordinary() {
                TypeDescriptor::id()
            } else {
                TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void))
            }
        }
        JsValue::Undefined | JsValue::Null => TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void)),
    }
}

impl Bridge {
    /// `new Reference(...)`:
    ///
    /// - `()` is unbound and untyped
    /// - `(type)` is unbound and typed
    /// - `(value)` holds a value
    /// - `(type, pointer)` aliases the pointer's memory without owning it
    /// - `(type, value)` holds a typed value
    pub fn new_reference(&self, args: &[JsValue]) -> BridgeResult<JsValue> {
        let reference = match args {
            [] => Reference::new(None, RefState::Unbound),
            [single] => match self.type_argument(single) {
                Some(ty) => Reference::new(Some(ty), RefState::Unbound),
                None => Reference::new(None, RefState::Value(single.clone())),
            },
            [ty, init] => {
                let ty = self.type_argument(ty).ok_or_else(|| {
                    BridgeError::Type(format!("{} is not a native type", ty.to_js_string()))
                })?;
                let object = init.as_object();
                let state = if let Some(pointer) = object.and_then(|o| o.host_data::<Pointer>()) {
                    RefState::Address {
                        address: pointer.address(),
                        owned: Vec::new(),
                        capacity: None,
                        _keepalive: Some(init.clone()),
                    }
                } else if let Some(inner) = object.and_then(|o| o.host_data::<Reference>()) {
                    RefState::Address {
                        address: self.bind_reference(&inner, Some(&ty))?,
                        owned: Vec::new(),
                        capacity: inner.capacity(),
                        _keepalive: Some(init.clone()),
                    }
                } else {
                    RefState::Value(init.clone())
                };
                Reference::new(Some(ty), state)
            }
            _ => {
                return Err(BridgeError::ArgumentCount {
                    actual: args.len(),
                    expected: "0..2".to_string(),
                })
            }
        };
        Ok(JsValue::Object(JsObject::host(Rc::new(reference))))
    }

    /// A typed, non-owning reference to `address`
    pub(crate) fn reference_at(&self, address: usize, ty: TypeDescriptor) -> JsValue {
        let reference = Reference::new(
            Some(ty),
            RefState::Address {
                address,
                owned: Vec::new(),
                capacity: None,
                _keepalive: None,
            },
        );
        JsValue::Object(JsObject::host(Rc::new(reference)))
    }

    /// The address of a reference, allocating and initializing storage the
    /// first time. `hint` types an untyped reference.
    pub(crate) fn bind_reference(&self, reference: &Reference, hint: Option<&TypeDescriptor>) -> BridgeResult<usize> {
        if let RefState::Address { address, .. } = &*reference.state.borrow() {
            return Ok(*address);
        }
        let current = std::mem::replace(&mut *reference.state.borrow_mut(), RefState::Unbound);
        let ty = reference.ty().or_else(|| match (hint, &current) {
            (Some(hint), _) if !matches!(hint, TypeDescriptor::Void) => Some(hint.clone()),
            (_, RefState::Value(v)) => Some(infer_type(v)),
            _ => None,
        });
        let Some(ty) = ty else {
            *reference.state.borrow_mut() = current;
            return Err(BridgeError::Type(
                "Cannot bind a Reference with neither a type nor a value".to_string(),
            ));
        };
        let capacity = size_of(&ty, self.abi()).max(1);
        let storage = NativeAllocation::zeroed(capacity)?;
        let address = storage.as_ptr() as usize;
        let mut owned = vec![storage];
        if let RefState::Value(value) = &current {
            let mut scope = MarshalScope::new();
            let written = self.to_native(value, &ty, address as *mut u8, &mut scope);
            owned.extend(scope.finish());
            if let Err(e) = written {
                *reference.state.borrow_mut() = current;
                return Err(e);
            }
        }
        *reference.ty.borrow_mut() = Some(ty);
        *reference.state.borrow_mut() = RefState::Address {
            address,
            owned,
            capacity: Some(capacity),
            _keepalive: None,
        };
        Ok(address)
    }

    fn read_element(&self, reference: &Reference, ty: &TypeDescriptor, address: usize) -> BridgeResult<JsValue> {
        if let TypeDescriptor::Id(_) = ty {
            // SAFETY: the reference points at an object slot
            let handle = unsafe { std::ptr::read_unaligned(address as *const Id) };
            if let Some((cached, value)) = &*reference.cached_object.borrow() {
                if *cached == handle {
                    return Ok(value.clone());
                }
            }
            let value = self.from_native(address as *const u8, ty, Ownership::Unretained)?;
            *reference.cached_object.borrow_mut() = Some((handle, value.clone()));
            return Ok(value);
        }
        self.from_native(address as *const u8, ty, Ownership::Unretained)
    }

    /// `ref.value`
    pub fn reference_value(&self, reference: &Reference) -> BridgeResult<JsValue> {
        let address = match &*reference.state.borrow() {
            RefState::Unbound => return Ok(JsValue::Undefined),
            RefState::Value(v) => return Ok(v.clone()),
            RefState::Address { address, .. } => *address,
        };
        match reference.ty() {
            Some(ty) => self.read_element(reference, &ty, address),
            None => Ok(self.pointer_value(address)),
        }
    }

    /// `ref.value = v`. Writes memory once bound.
    pub fn set_reference_value(&self, reference: &Reference, value: &JsValue) -> BridgeResult<()> {
        let address = match &*reference.state.borrow() {
            RefState::Address { address, .. } => Some(*address),
            _ => None,
        };
        match (address, reference.ty()) {
            (Some(address), Some(ty)) => self.write_through(reference, &ty, address, value),
            (Some(_), None) => Err(BridgeError::Type(
                "Cannot assign through an untyped Reference".to_string(),
            )),
            (None, _) => {
                *reference.state.borrow_mut() = RefState::Value(value.clone());
                Ok(())
            }
        }
    }

    fn write_through(&self, reference: &Reference, ty: &TypeDescriptor, address: usize, value: &JsValue) -> BridgeResult<()> {
        let mut scope = MarshalScope::new();
        let written = self.to_native(value, ty, address as *mut u8, &mut scope);
        let allocations = scope.finish();
        if let RefState::Address { owned, .. } = &mut *reference.state.borrow_mut() {
            owned.extend(allocations);
        }
        reference.cached_object.borrow_mut().take();
        written
    }

    fn element_address(&self, reference: &Reference, index: usize) -> BridgeResult<(TypeDescriptor, usize)> {
        let ty = reference.ty().ok_or_else(|| {
            BridgeError::Type("Cannot index an untyped Reference".to_string())
        })?;
        let base = self.bind_reference(reference, None)?;
        let element = size_of(&ty, self.abi());
        if let Some(capacity) = reference.capacity() {
            let end = index.checked_add(1).and_then(|n| n.checked_mul(element));
            if end.map_or(true, |end| end > capacity) {
                return Err(BridgeError::Type(format!(
                    "Index {} is out of bounds of a Reference holding {} element(s)",
                    index,
                    capacity / element.max(1)
                )));
            }
        }
        Ok((ty, base + index * element))
    }

    /// `ref[i]`
    pub fn reference_index(&self, reference: &Reference, index: usize) -> BridgeResult<JsValue> {
        let (ty, address) = self.element_address(reference, index)?;
        if index == 0 {
            return self.read_element(reference, &ty, address);
        }
        self.from_native(address as *const u8, &ty, Ownership::Unretained)
    }

    /// `ref[i] = v`
    pub fn set_reference_index(&self, reference: &Reference, index: usize, value: &JsValue) -> BridgeResult<()> {
        let (ty, address) = self.element_address(reference, index)?;
        self.write_through(reference, &ty, address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;

    fn reference(value: &JsValue) -> Rc<Reference> {
        value.as_object().unwrap().host_data::<Reference>().unwrap()
    }

    #[test]
    fn test_empty_reference_is_undefined_then_holds_value() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let value = bridge.new_reference(&[]).unwrap();
        let r = reference(&value);
        assert_eq!(bridge.reference_value(&r).unwrap(), JsValue::Undefined);
        bridge.set_reference_value(&r, &JsValue::from(5)).unwrap();
        assert_eq!(bridge.reference_value(&r).unwrap(), JsValue::Number(5.0));
        assert_eq!(value.to_js_string(), "<Reference: 0x0>");
    }

    #[test]
    fn test_binding_copies_value_and_reads_memory() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let int32 = bridge.interop_types().get("int32");
        let value = bridge.new_reference(&[int32, JsValue::from(7)]).unwrap();
        let r = reference(&value);
        let address = bridge.bind_reference(&r, None).unwrap();
        unsafe { *(address as *mut i32) = 510 };
        assert_eq!(bridge.reference_value(&r).unwrap(), JsValue::Number(510.0));
        bridge.set_reference_value(&r, &JsValue::from(-1)).unwrap();
        assert_eq!(unsafe { *(address as *const i32) }, -1);
    }

    #[test]
    fn test_untyped_value_reference_infers_double() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let r = reference(&bridge.new_reference(&[JsValue::from(2.5)]).unwrap());
        let address = bridge.bind_reference(&r, None).unwrap();
        assert_eq!(unsafe { *(address as *const f64) }, 2.5);
    }

    #[test]
    fn test_indexed_access() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let int16 = bridge.interop_types().get("int16");
        let block = bridge.alloc(&[JsValue::from(8)]).unwrap();
        let r = reference(&bridge.new_reference(&[int16, block.clone()]).unwrap());
        bridge.set_reference_index(&r, 2, &JsValue::from(300)).unwrap();
        assert_eq!(bridge.reference_index(&r, 2).unwrap(), JsValue::Number(300.0));
        assert_eq!(bridge.reference_index(&r, 1).unwrap(), JsValue::Number(0.0));
        bridge.free(&[block]).unwrap();
    }

    #[test]
    fn test_owned_storage_rejects_out_of_bounds_index() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let int32 = bridge.interop_types().get("int32");
        let r = reference(&bridge.new_reference(&[int32, JsValue::from(1)]).unwrap());

        bridge.set_reference_index(&r, 0, &JsValue::from(4)).unwrap();
        assert_eq!(bridge.reference_index(&r, 0).unwrap(), JsValue::Number(4.0));

        let err = bridge.set_reference_index(&r, 1 << 28, &JsValue::from(7)).unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
        assert!(err.to_string().contains("out of bounds"), "{err}");
        let err = bridge.reference_index(&r, 1).unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
        let err = bridge.reference_index(&r, usize::MAX).unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
    }

    #[test]
    fn test_alias_of_owned_reference_keeps_its_bounds() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let int32 = bridge.interop_types().get("int32");
        let owner = bridge.new_reference(&[int32.clone(), JsValue::from(9)]).unwrap();
        let alias = reference(&bridge.new_reference(&[int32, owner]).unwrap());
        assert_eq!(bridge.reference_index(&alias, 0).unwrap(), JsValue::Number(9.0));
        assert!(bridge.reference_index(&alias, 1).is_err());
    }

    #[test]
    fn test_extra_constructor_arguments_are_rejected() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let int32 = bridge.interop_types().get("int32");
        let err = bridge
            .new_reference(&[int32, JsValue::from(1), JsValue::from(2)])
            .unwrap_err();
        assert_eq!(err.error_name(), "ArgumentCountError");
        assert_eq!(err.to_string(), "Actual arguments count: \"3\". Expected: \"0..2\".");
    }

    #[test]
    fn test_unbound_untyped_cannot_bind() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let r = reference(&bridge.new_reference(&[]).unwrap());
        let err = bridge.bind_reference(&r, None).unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
    }
}
