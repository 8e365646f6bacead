//! Struct values
//!
//! A struct crossing into script is copied into bridge-owned storage and
//! exposed field by field. Reading a nested struct field yields a view into
//! the parent's storage, so `rect.origin.x = 1` writes through.

use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue, ObjectKind};

use super::{describe, MarshalScope};
use crate::bridge::Bridge;
use crate::encoding::{StructLayout, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Ownership;
use crate::memory::NativeAllocation;

/// Constructor value of a struct type
#[derive(Debug)]
pub struct StructType {
    layout: Rc<StructLayout>,
}

impl StructType {
    /// The struct's layout
    pub fn layout(&self) -> &Rc<StructLayout> {
        &self.layout
    }
}

impl HostObject for StructType {
    fn class_name(&self) -> &str {
        "Function"
    }

    fn display(&self) -> String {
        format!("function {}() {{ [native code] }}", self.layout.name)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

/// A struct value, owning its storage or viewing into a parent's
pub struct StructValue {
    layout: Rc<StructLayout>,
    ptr: *mut u8,
    _storage: Option<NativeAllocation>,
    _parent: Option<JsObject>,
}

impl StructValue {
    /// The struct's layout
    pub fn layout(&self) -> &Rc<StructLayout> {
        &self.layout
    }

    /// Address of the struct's bytes
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Copy of the struct's bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: ptr is valid for layout.size bytes while self is alive
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size) }.to_vec()
    }
}

impl HostObject for StructValue {
    fn class_name(&self) -> &str {
        &self.layout.name
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Bridge {
    /// The constructor value of a struct type. Identity is stable per name.
    pub fn struct_type_value(&self, layout: Rc<StructLayout>) -> JsObject {
        if let Some(existing) = self.struct_types.borrow().get(&layout.name) {
            return existing.clone();
        }
        let name = layout.name.clone();
        let object = JsObject::host(Rc::new(StructType { layout }));
        self.struct_types.borrow_mut().insert(name, object.clone());
        object
    }

    fn owned_struct(&self, layout: Rc<StructLayout>, storage: NativeAllocation) -> JsValue {
        let ptr = storage.as_ptr();
        JsValue::Object(JsObject::host(Rc::new(StructValue {
            layout,
            ptr,
            _storage: Some(storage),
            _parent: None,
        })))
    }

    /// `new CGPoint(init)`: zero-filled, then initialized from a struct
    /// value of the same type or from whichever fields a plain object has
    pub fn construct_struct(&self, layout: &Rc<StructLayout>, args: &[JsValue]) -> BridgeResult<JsValue> {
        let storage = NativeAllocation::zeroed(layout.size)?;
        let mut scope = MarshalScope::new();
        match args.first() {
            None | Some(JsValue::Undefined) | Some(JsValue::Null) => {}
            Some(init) => self.fill_struct(init, layout, storage.as_ptr(), &mut scope, true)?,
        }
        drop(scope.finish());
        Ok(self.owned_struct(layout.clone(), storage))
    }

    /// Copy a native struct into a new owned value
    pub(crate) fn struct_from_native(&self, src: *const u8, layout: &Rc<StructLayout>) -> BridgeResult<JsValue> {
        let storage = NativeAllocation::zeroed(layout.size)?;
        // SAFETY: src holds layout.size bytes
        unsafe { std::ptr::copy_nonoverlapping(src, storage.as_ptr(), layout.size) };
        Ok(self.owned_struct(layout.clone(), storage))
    }

    /// Write a struct by value. Every field must be present unless the
    /// aggregate is a union.
    pub(crate) fn write_struct(
        &self,
        value: &JsValue,
        layout: &Rc<StructLayout>,
        dest: *mut u8,
        scope: &mut MarshalScope,
    ) -> BridgeResult<()> {
        self.fill_struct(value, layout, dest, scope, layout.is_union)
    }

    fn fill_struct(
        &self,
        value: &JsValue,
        layout: &Rc<StructLayout>,
        dest: *mut u8,
        scope: &mut MarshalScope,
        partial: bool,
    ) -> BridgeResult<()> {
        let object = match value {
            JsValue::Object(o) => o,
            other => {
                return Err(BridgeError::Metadata(format!(
                    "Cannot marshal {} to struct {}",
                    describe(other),
                    layout.name
                )))
            }
        };
        if let Some(sv) = object.host_data::<StructValue>() {
            if sv.layout.name != layout.name || sv.layout.size != layout.size {
                return Err(BridgeError::Metadata(format!(
                    "Cannot marshal struct {} to struct {}",
                    sv.layout.name, layout.name
                )));
            }
            // SAFETY: both sides hold layout.size bytes
            unsafe { std::ptr::copy(sv.as_ptr(), dest, layout.size) };
            return Ok(());
        }
        if !matches!(object.kind(), ObjectKind::Ordinary) {
            return Err(BridgeError::Metadata(format!(
                "Cannot marshal {} to struct {}",
                describe(value),
                layout.name
            )));
        }
        for field in &layout.fields {
            if !object.has(&field.name) {
                if partial {
                    continue;
                }
                return Err(BridgeError::Metadata(format!(
                    "Missing field \"{}\" for struct {}",
                    field.name, layout.name
                )));
            }
            let field_value = object.get(&field.name);
            // SAFETY: field offsets lie within the struct
            let field_dest = unsafe { dest.add(field.offset) };
            match &field.ty {
                TypeDescriptor::Struct(inner) => {
                    self.fill_struct(&field_value, inner, field_dest, scope, partial || inner.is_union)?
                }
                ty => self.to_native(&field_value, ty, field_dest, scope)?,
            }
        }
        Ok(())
    }

    /// Read field `name` of a struct value. Nested structs alias the
    /// parent's storage. Returns `None` for unknown fields.
    pub(crate) fn struct_field(&self, owner: &JsObject, sv: &StructValue, name: &str) -> Option<BridgeResult<JsValue>> {
        let field = sv.layout.field(name)?;
        // SAFETY: field offsets lie within the struct
        let ptr = unsafe { sv.ptr.add(field.offset) };
        Some(match &field.ty {
            TypeDescriptor::Struct(inner) => Ok(JsValue::Object(JsObject::host(Rc::new(StructValue {
                layout: inner.clone(),
                ptr,
                _storage: None,
                _parent: Some(owner.clone()),
            })))),
            ty => self.from_native(ptr, ty, Ownership::Unretained),
        })
    }

    /// Assign field `name` of a struct value
    pub(crate) fn set_struct_field(&self, sv: &StructValue, name: &str, value: &JsValue) -> BridgeResult<()> {
        let field = sv.layout.field(name).ok_or_else(|| {
            BridgeError::Type(format!("Struct {} has no field \"{}\"", sv.layout.name, name))
        })?;
        // SAFETY: field offsets lie within the struct
        let ptr = unsafe { sv.ptr.add(field.offset) };
        let mut scope = MarshalScope::new();
        match &field.ty {
            TypeDescriptor::Struct(inner) => self.fill_struct(value, inner, ptr, &mut scope, false)?,
            ty => self.to_native(value, ty, ptr, &mut scope)?,
        }
        // Temporaries such as C strings cannot outlive the assignment
        self.defer_allocations(scope.finish());
        Ok(())
    }

    /// Byte-wise equality of two values as `layout`
    pub fn struct_equals(&self, layout: &Rc<StructLayout>, a: &JsValue, b: &JsValue) -> BridgeResult<bool> {
        let mut scope = MarshalScope::new();
        let left = NativeAllocation::zeroed(layout.size)?;
        let right = NativeAllocation::zeroed(layout.size)?;
        self.write_struct(a, layout, left.as_ptr(), &mut scope)?;
        self.write_struct(b, layout, right.as_ptr(), &mut scope)?;
        // SAFETY: both blocks hold layout.size bytes
        let equal = unsafe {
            std::slice::from_raw_parts(left.as_ptr(), layout.size)
                == std::slice::from_raw_parts(right.as_ptr(), layout.size)
        };
        drop(scope.finish());
        Ok(equal)
    }
}
