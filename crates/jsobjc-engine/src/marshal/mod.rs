//! Value marshalling
//!
//! [`Bridge::to_native`] writes a script value into native storage laid out
//! for a [`TypeDescriptor`]; [`Bridge::from_native`] reads it back. Anything
//! a call needs to outlive the marshalling step (C strings, temporary array
//! copies, storage bound to references) is owned by a [`MarshalScope`]
//! that lives exactly as long as the call.

pub(crate) mod buffer;
pub(crate) mod numeric;
pub(crate) mod string;
pub(crate) mod structs;

use jsobjc_sdk::{JsObject, JsValue, ObjectKind, TypedArray};

pub use structs::{StructType, StructValue};

use crate::bridge::Bridge;
use crate::encoding::{size_of, IntWidth, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::interop::{Pointer, Reference};
use crate::lifetime::{ClassWrapper, ObjcWrapper, Ownership, ProtocolWrapper};
use crate::memory::NativeAllocation;
use crate::objc::{Id, NumberValue, Sel, NIL};

/// A value as it appears in error messages
pub(crate) fn describe(value: &JsValue) -> String {
    match value {
        JsValue::String(s) => format!("\"{}\"", s),
        other => other.to_js_string(),
    }
}

fn cannot_marshal(value: &JsValue, ty: &TypeDescriptor) -> BridgeError {
    BridgeError::Marshal(format!(
        "Cannot marshal {} to native type \"{}\"",
        describe(value),
        ty
    ))
}

/// Copy-back of a temporary array buffer into the view it stands for
struct Writeback {
    target: TypedArray,
    temp: *const u8,
    bytes: usize,
}

/// Resources that must outlive one native call
#[derive(Default)]
pub struct MarshalScope {
    allocations: Vec<NativeAllocation>,
    writebacks: Vec<Writeback>,
    keepalive: Vec<JsValue>,
}

impl MarshalScope {
    /// An empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroed storage freed when the scope ends
    pub fn allocate(&mut self, size: usize) -> BridgeResult<*mut u8> {
        let allocation = NativeAllocation::zeroed(size)?;
        let ptr = allocation.as_ptr();
        self.allocations.push(allocation);
        Ok(ptr)
    }

    /// Keep a script value (and the memory it owns) alive for the call
    pub fn keep(&mut self, value: JsValue) {
        self.keepalive.push(value);
    }

    fn write_back(&mut self, target: TypedArray, temp: *const u8, bytes: usize) {
        self.writebacks.push(Writeback { target, temp, bytes });
    }

    /// Apply pending copy-backs. Returns the allocations, which the caller
    /// drops or hands to something that outlives the call.
    pub fn finish(self) -> Vec<NativeAllocation> {
        for wb in &self.writebacks {
            // SAFETY: temp points into one of self.allocations, which is
            // still alive here, and holds at least `bytes` bytes
            let bytes = unsafe { std::slice::from_raw_parts(wb.temp, wb.bytes) };
            let n = wb.bytes.min(wb.target.byte_length());
            wb.target.buffer().write(wb.target.byte_offset(), &bytes[..n]);
        }
        self.allocations
    }
}

fn host<T: 'static>(object: &JsObject) -> Option<std::rc::Rc<T>> {
    object.host_data::<T>()
}

impl Bridge {
    /// Write `value` into `dest`, which holds storage for `ty`
    pub(crate) fn to_native(
        &self,
        value: &JsValue,
        ty: &TypeDescriptor,
        dest: *mut u8,
        scope: &mut MarshalScope,
    ) -> BridgeResult<()> {
        let strict = self.options().strict_integers;
        // SAFETY (all writes below): `dest` holds at least size_of(ty) bytes
        match ty {
            TypeDescriptor::Void => Ok(()),
            TypeDescriptor::Bool => {
                let b = match value {
                    JsValue::Bool(b) => *b,
                    JsValue::Number(n) => *n != 0.0,
                    JsValue::BigInt(i) => *i != 0,
                    JsValue::Undefined | JsValue::Null => false,
                    _ => return Err(cannot_marshal(value, ty)),
                };
                unsafe { std::ptr::write_unaligned(dest, u8::from(b)) };
                Ok(())
            }
            TypeDescriptor::Int { width, signed } => {
                let bits = numeric::integer_bits(value, *width, *signed, strict)?;
                unsafe { numeric::write_int(dest, bits, *width) };
                Ok(())
            }
            TypeDescriptor::Float => {
                let f = numeric::float_value(value, ty)? as f32;
                unsafe { std::ptr::write_unaligned(dest as *mut f32, f) };
                Ok(())
            }
            TypeDescriptor::Double => {
                let d = numeric::float_value(value, ty)?;
                unsafe { std::ptr::write_unaligned(dest as *mut f64, d) };
                Ok(())
            }
            TypeDescriptor::CString => {
                let ptr = self.c_string_argument(value, ty, scope)?;
                unsafe { std::ptr::write_unaligned(dest as *mut usize, ptr as usize) };
                Ok(())
            }
            TypeDescriptor::Selector => {
                let sel = match value {
                    JsValue::Undefined | JsValue::Null => Sel::NULL,
                    JsValue::String(s) => self.runtime().sel(s),
                    _ => return Err(cannot_marshal(value, ty)),
                };
                unsafe { std::ptr::write_unaligned(dest as *mut usize, sel.as_raw()) };
                Ok(())
            }
            TypeDescriptor::Class | TypeDescriptor::Protocol | TypeDescriptor::Id(_) => {
                let id = self.object_id(value, ty, scope)?;
                unsafe { std::ptr::write_unaligned(dest as *mut Id, id) };
                Ok(())
            }
            TypeDescriptor::Block(signature) => {
                let id = match value {
                    JsValue::Undefined | JsValue::Null => NIL,
                    JsValue::Object(o) if o.is_function() => {
                        let block = self.make_block(o, signature.clone())?;
                        self.runtime().autorelease(block)
                    }
                    JsValue::Object(o) => match host::<ObjcWrapper>(o) {
                        Some(w) => w.handle(),
                        None => return Err(cannot_marshal(value, ty)),
                    },
                    _ => return Err(cannot_marshal(value, ty)),
                };
                unsafe { std::ptr::write_unaligned(dest as *mut Id, id) };
                Ok(())
            }
            TypeDescriptor::FunctionPointer(signature) => {
                let address = match value {
                    JsValue::Undefined | JsValue::Null => 0,
                    JsValue::Object(o) if o.is_function() => self.make_function_pointer(o, signature.clone())?,
                    JsValue::Object(o) => match host::<Pointer>(o) {
                        Some(p) => p.address(),
                        None => return Err(cannot_marshal(value, ty)),
                    },
                    _ => return Err(cannot_marshal(value, ty)),
                };
                unsafe { std::ptr::write_unaligned(dest as *mut usize, address) };
                Ok(())
            }
            TypeDescriptor::Pointer(inner) => {
                let address = self.pointer_argument(value, inner, 0, scope)?;
                unsafe { std::ptr::write_unaligned(dest as *mut usize, address) };
                Ok(())
            }
            TypeDescriptor::Struct(layout) => self.write_struct(value, layout, dest, scope),
            TypeDescriptor::ConstantArray(element, count) => {
                self.write_inline_array(value, element, *count, dest, scope)
            }
            TypeDescriptor::IncompleteArray(_) | TypeDescriptor::Opaque(_) => Err(BridgeError::Metadata(
                format!("Type \"{}\" cannot be passed by value", ty),
            )),
        }
    }

    /// Write a call parameter. Arrays decay to pointers to their first
    /// element; a constant-size array needs room for `count` elements.
    pub(crate) fn write_param(
        &self,
        value: &JsValue,
        ty: &TypeDescriptor,
        dest: *mut u8,
        scope: &mut MarshalScope,
    ) -> BridgeResult<()> {
        let address = match ty {
            TypeDescriptor::ConstantArray(element, count) => {
                self.pointer_argument(value, element, *count, scope)?
            }
            TypeDescriptor::IncompleteArray(element) => self.pointer_argument(value, element, 0, scope)?,
            _ => return self.to_native(value, ty, dest, scope),
        };
        // SAFETY: parameter slots hold at least a pointer
        unsafe { std::ptr::write_unaligned(dest as *mut usize, address) };
        Ok(())
    }

    /// Marshal a value passed where a pointer to `inner` is expected.
    /// `min_elements` is non-zero for fixed-size array parameters.
    pub(crate) fn pointer_argument(
        &self,
        value: &JsValue,
        inner: &TypeDescriptor,
        min_elements: usize,
        scope: &mut MarshalScope,
    ) -> BridgeResult<usize> {
        let pointer_ty = || TypeDescriptor::Pointer(Box::new(inner.clone()));
        let object = match value {
            JsValue::Undefined | JsValue::Null => return Ok(0),
            JsValue::String(s) if matches!(inner, TypeDescriptor::Int { .. } | TypeDescriptor::Void) => {
                return Ok(string::c_string(scope, s)? as usize);
            }
            JsValue::Object(o) => o,
            _ => return Err(cannot_marshal(value, &pointer_ty())),
        };
        if let Some(pointer) = host::<Pointer>(object) {
            return Ok(pointer.address());
        }
        if let Some(reference) = host::<Reference>(object) {
            scope.keep(value.clone());
            return self.bind_reference(&reference, Some(inner));
        }
        if let Some(sv) = host::<StructValue>(object) {
            scope.keep(value.clone());
            return Ok(sv.as_ptr() as usize);
        }
        if let Some(wrapper) = host::<ObjcWrapper>(object) {
            if matches!(inner, TypeDescriptor::Void) {
                return Ok(wrapper.handle());
            }
        }
        match object.kind() {
            ObjectKind::TypedArray(array) => {
                scope.keep(value.clone());
                buffer::typed_array_argument(array, size_of(inner, self.abi()), min_elements, scope)
            }
            ObjectKind::ArrayBuffer(buf) => {
                scope.keep(value.clone());
                Ok(buf.as_mut_ptr() as usize)
            }
            ObjectKind::Array(_) => {
                let elements = object.array_elements().unwrap_or_default();
                let element_size = size_of(inner, self.abi()).max(1);
                let count = elements.len().max(min_elements);
                let base = scope.allocate(element_size * count)?;
                for (i, element) in elements.iter().enumerate() {
                    // SAFETY: base holds `count` elements
                    self.to_native(element, inner, unsafe { base.add(i * element_size) }, scope)?;
                }
                Ok(base as usize)
            }
            _ => Err(cannot_marshal(value, &pointer_ty())),
        }
    }

    fn c_string_argument(
        &self,
        value: &JsValue,
        ty: &TypeDescriptor,
        scope: &mut MarshalScope,
    ) -> BridgeResult<*mut u8> {
        match value {
            JsValue::Undefined | JsValue::Null => Ok(std::ptr::null_mut()),
            JsValue::String(s) => string::c_string(scope, s),
            JsValue::Object(_) => self
                .pointer_argument(value, &TypeDescriptor::int(IntWidth::W8, true), 0, scope)
                .map(|address| address as *mut u8),
            _ => Err(cannot_marshal(value, ty)),
        }
    }

    fn write_inline_array(
        &self,
        value: &JsValue,
        element: &TypeDescriptor,
        count: usize,
        dest: *mut u8,
        scope: &mut MarshalScope,
    ) -> BridgeResult<()> {
        let element_size = size_of(element, self.abi());
        let values: Vec<JsValue> = match value {
            JsValue::Object(o) => match o.kind() {
                ObjectKind::Array(_) => o.array_elements().unwrap_or_default(),
                ObjectKind::TypedArray(t) => (0..t.len()).map(|i| t.get(i)).collect(),
                _ => return Err(cannot_marshal(value, &TypeDescriptor::ConstantArray(Box::new(element.clone()), count))),
            },
            JsValue::Undefined | JsValue::Null => Vec::new(),
            _ => return Err(cannot_marshal(value, &TypeDescriptor::ConstantArray(Box::new(element.clone()), count))),
        };
        for (i, v) in values.iter().take(count).enumerate() {
            // SAFETY: dest holds `count` elements
            self.to_native(v, element, unsafe { dest.add(i * element_size) }, scope)?;
        }
        Ok(())
    }

    /// A script value as an object handle. New objects created for
    /// primitives, arrays and plain objects are autoreleased.
    pub(crate) fn object_id(
        &self,
        value: &JsValue,
        ty: &TypeDescriptor,
        scope: &mut MarshalScope,
    ) -> BridgeResult<Id> {
        let runtime = self.runtime();
        let created = match value {
            JsValue::Undefined | JsValue::Null => return Ok(NIL),
            JsValue::Bool(b) => runtime.new_number(NumberValue::Bool(*b)),
            JsValue::Number(n) => {
                let number = if n.fract() == 0.0 && n.abs() < 9.2e18 {
                    NumberValue::Int(*n as i64)
                } else {
                    NumberValue::Double(*n)
                };
                runtime.new_number(number)
            }
            JsValue::BigInt(i) => {
                let number = match (i64::try_from(*i), u64::try_from(*i)) {
                    (Ok(signed), _) => NumberValue::Int(signed),
                    (Err(_), Ok(unsigned)) => NumberValue::UInt(unsigned),
                    // Wider than 64 bits: keep the low 64 like any integer cast
                    _ => NumberValue::Int(*i as i64),
                };
                runtime.new_number(number)
            }
            JsValue::String(s) => runtime.new_string(s),
            JsValue::Object(o) => {
                if let Some(w) = host::<ObjcWrapper>(o) {
                    return Ok(w.handle());
                }
                if let Some(c) = host::<ClassWrapper>(o) {
                    return Ok(runtime.class_object(c.class()));
                }
                if let Some(p) = host::<ProtocolWrapper>(o) {
                    return Ok(runtime.protocol_object(p.name()));
                }
                match o.kind() {
                    ObjectKind::Function(_) => self.make_block(o, None)?,
                    ObjectKind::Array(_) => {
                        let mut items = Vec::new();
                        for element in o.array_elements().unwrap_or_default() {
                            items.push(self.object_id(&element, ty, scope)?);
                        }
                        runtime.new_array(items)
                    }
                    ObjectKind::Ordinary => {
                        let mut entries = Vec::new();
                        for key in o.keys() {
                            let k = runtime.autorelease(runtime.new_string(&key));
                            let v = self.object_id(&o.get(&key), ty, scope)?;
                            entries.push((k, v));
                        }
                        runtime.new_dictionary(entries)
                    }
                    _ => return Err(cannot_marshal(value, ty)),
                }
            }
        };
        Ok(runtime.autorelease(created))
    }

    /// Read a value of type `ty` from `src`
    pub(crate) fn from_native(&self, src: *const u8, ty: &TypeDescriptor, ownership: Ownership) -> BridgeResult<JsValue> {
        // SAFETY (all reads below): `src` holds a value of type `ty`
        let word = || unsafe { std::ptr::read_unaligned(src as *const usize) };
        Ok(match ty {
            TypeDescriptor::Void => JsValue::Undefined,
            TypeDescriptor::Bool => JsValue::Bool(unsafe { std::ptr::read_unaligned(src) } != 0),
            TypeDescriptor::Int { width, signed } => {
                numeric::integer_value(unsafe { numeric::read_int(src, *width, *signed) })
            }
            TypeDescriptor::Float => JsValue::Number(f64::from(unsafe { std::ptr::read_unaligned(src as *const f32) })),
            TypeDescriptor::Double => JsValue::Number(unsafe { std::ptr::read_unaligned(src as *const f64) }),
            TypeDescriptor::CString => {
                let ptr = word() as *const u8;
                if ptr.is_null() {
                    JsValue::Null
                } else {
                    // SAFETY: non-null `*` values are NUL-terminated
                    JsValue::string(unsafe { string::read_c_string(ptr, None) })
                }
            }
            TypeDescriptor::Selector => match self.runtime().sel_name(Sel::from_raw(word())) {
                Some(name) => JsValue::string(&*name),
                None => JsValue::Null,
            },
            TypeDescriptor::Id(object_type) => self.wrap(word(), ownership, Some(object_type))?,
            TypeDescriptor::Class | TypeDescriptor::Protocol | TypeDescriptor::Block(_) => {
                self.wrap(word(), ownership, None)?
            }
            TypeDescriptor::FunctionPointer(signature) => match word() {
                0 => JsValue::Null,
                address => self.function_pointer_value(address, signature.clone()),
            },
            TypeDescriptor::Pointer(inner) => match word() {
                0 => JsValue::Null,
                address => match **inner {
                    TypeDescriptor::Void | TypeDescriptor::Opaque(_) => self.pointer_value(address),
                    _ => self.reference_at(address, (**inner).clone()),
                },
            },
            TypeDescriptor::IncompleteArray(inner) => match word() {
                0 => JsValue::Null,
                address => self.reference_at(address, (**inner).clone()),
            },
            TypeDescriptor::Opaque(_) => self.pointer_value(src as usize),
            TypeDescriptor::Struct(layout) => self.struct_from_native(src, layout)?,
            TypeDescriptor::ConstantArray(element, count) => {
                let element_size = size_of(element, self.abi());
                let mut elements = Vec::with_capacity(*count);
                for i in 0..*count {
                    // SAFETY: the array holds `count` elements
                    elements.push(self.from_native(unsafe { src.add(i * element_size) }, element, Ownership::Unretained)?);
                }
                JsValue::Object(JsObject::array(elements))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::encoding::IntWidth;

    fn bridge() -> std::rc::Rc<Bridge> {
        Bridge::new(BridgeOptions::default()).unwrap()
    }

    fn roundtrip(bridge: &Bridge, value: JsValue, ty: TypeDescriptor) -> JsValue {
        let mut scope = MarshalScope::new();
        let mut slot = [0u64; 4];
        let dest = slot.as_mut_ptr() as *mut u8;
        bridge.to_native(&value, &ty, dest, &mut scope).unwrap();
        let back = bridge.from_native(dest, &ty, Ownership::Unretained).unwrap();
        drop(scope.finish());
        back
    }

    #[test]
    fn test_primitive_roundtrips() {
        let bridge = bridge();
        assert_eq!(roundtrip(&bridge, JsValue::Bool(true), TypeDescriptor::Bool), JsValue::Bool(true));
        assert_eq!(
            roundtrip(&bridge, JsValue::Number(-7.0), TypeDescriptor::int(IntWidth::W16, true)),
            JsValue::Number(-7.0)
        );
        assert_eq!(roundtrip(&bridge, JsValue::Number(0.5), TypeDescriptor::Float), JsValue::Number(0.5));
        assert_eq!(roundtrip(&bridge, JsValue::Number(1e300), TypeDescriptor::Double), JsValue::Number(1e300));
        assert_eq!(roundtrip(&bridge, JsValue::from("héllo"), TypeDescriptor::CString), JsValue::from("héllo"));
        assert_eq!(roundtrip(&bridge, JsValue::Null, TypeDescriptor::CString), JsValue::Null);
        assert_eq!(roundtrip(&bridge, JsValue::from("count"), TypeDescriptor::Selector), JsValue::from("count"));
    }

    #[test]
    fn test_strings_and_numbers_box_as_objects() {
        let bridge = bridge();
        bridge.runtime().push_autorelease_pool();
        assert_eq!(roundtrip(&bridge, JsValue::from("boxed"), TypeDescriptor::id()), JsValue::from("boxed"));
        assert_eq!(roundtrip(&bridge, JsValue::Number(3.0), TypeDescriptor::id()), JsValue::Number(3.0));
        assert_eq!(roundtrip(&bridge, JsValue::Null, TypeDescriptor::id()), JsValue::Null);
        bridge.runtime().pop_autorelease_pool().unwrap();
    }

    #[test]
    fn test_unsigned_bigint_boxes_without_sign_loss() {
        let bridge = bridge();
        bridge.runtime().push_autorelease_pool();
        let mut scope = MarshalScope::new();
        let big = u64::MAX as i128 - 1;
        let id = bridge.object_id(&JsValue::BigInt(big), &TypeDescriptor::id(), &mut scope).unwrap();
        assert_eq!(bridge.runtime().number_value(id), Some(NumberValue::UInt(u64::MAX - 1)));
        assert_eq!(roundtrip(&bridge, JsValue::BigInt(big), TypeDescriptor::id()), JsValue::BigInt(big));
        let id = bridge.object_id(&JsValue::BigInt(-5), &TypeDescriptor::id(), &mut scope).unwrap();
        assert_eq!(bridge.runtime().number_value(id), Some(NumberValue::Int(-5)));
        drop(scope.finish());
        bridge.runtime().pop_autorelease_pool().unwrap();
    }

    #[test]
    fn test_mismatch_names_value_and_type() {
        let bridge = bridge();
        let mut scope = MarshalScope::new();
        let mut slot = [0u64; 1];
        let err = bridge
            .to_native(&JsValue::from("x"), &TypeDescriptor::Double, slot.as_mut_ptr() as *mut u8, &mut scope)
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot marshal \"x\" to native type \"d\"");
    }
}
