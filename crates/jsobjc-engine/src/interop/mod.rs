//! The `interop` surface: native types, references, pointers, unmanaged
//! boxes and raw memory helpers.

mod pointer;
mod reference;
mod unmanaged;

use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue};

pub use pointer::Pointer;
pub use reference::Reference;
pub use unmanaged::Unmanaged;

use crate::bridge::Bridge;
use crate::encoding::{IntWidth, ObjectType, TypeDescriptor};
use crate::lifetime::{ClassWrapper, ProtocolWrapper};
use crate::marshal::StructType;

/// A primitive type object from `interop.types`
#[derive(Debug)]
pub struct InteropType {
    name: &'static str,
    ty: TypeDescriptor,
}

impl InteropType {
    /// The described type
    pub fn ty(&self) -> &TypeDescriptor {
        &self.ty
    }
}

impl HostObject for InteropType {
    fn class_name(&self) -> &str {
        self.name
    }

    fn display(&self) -> String {
        format!("<{} type>", self.name)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

/// The constructible members of `interop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropConstructor {
    /// `new Reference(...)`
    Reference,
    /// `new Pointer(...)`
    Pointer,
    /// `new Invocation(...)`
    Invocation,
}

impl HostObject for InteropConstructor {
    fn class_name(&self) -> &str {
        "Function"
    }

    fn display(&self) -> String {
        let name = match self {
            InteropConstructor::Reference => "Reference",
            InteropConstructor::Pointer => "Pointer",
            InteropConstructor::Invocation => "Invocation",
        };
        format!("function {}() {{ [native code] }}", name)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

fn primitive_types() -> Vec<(&'static str, TypeDescriptor)> {
    let int = TypeDescriptor::int;
    vec![
        ("void", TypeDescriptor::Void),
        ("bool", TypeDescriptor::Bool),
        ("int8", int(IntWidth::W8, true)),
        ("uint8", int(IntWidth::W8, false)),
        ("int16", int(IntWidth::W16, true)),
        ("uint16", int(IntWidth::W16, false)),
        ("int32", int(IntWidth::W32, true)),
        ("uint32", int(IntWidth::W32, false)),
        ("int64", int(IntWidth::W64, true)),
        ("uint64", int(IntWidth::W64, false)),
        ("float", TypeDescriptor::Float),
        ("double", TypeDescriptor::Double),
        ("UTF8CString", TypeDescriptor::CString),
        ("unichar", int(IntWidth::W16, false)),
        ("id", TypeDescriptor::id()),
        ("protocol", TypeDescriptor::Protocol),
        ("class", TypeDescriptor::Class),
        ("selector", TypeDescriptor::Selector),
        ("pointer", TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void))),
    ]
}

impl Bridge {
    /// `interop.types`
    pub fn interop_types(&self) -> JsObject {
        self.types_object
            .get_or_init(|| {
                let types = JsObject::new();
                for (name, ty) in primitive_types() {
                    types.set(name, JsValue::Object(JsObject::host(Rc::new(InteropType { name, ty }))));
                }
                types
            })
            .clone()
    }

    /// The native type a script value names: a type object, a struct
    /// constructor, a class or a protocol
    pub fn type_argument(&self, value: &JsValue) -> Option<TypeDescriptor> {
        let object = value.as_object()?;
        if let Some(t) = object.host_data::<InteropType>() {
            return Some(t.ty.clone());
        }
        if let Some(s) = object.host_data::<StructType>() {
            return Some(TypeDescriptor::Struct(s.layout().clone()));
        }
        if let Some(c) = object.host_data::<ClassWrapper>() {
            return Some(TypeDescriptor::Id(ObjectType {
                class: Some(c.name().clone()),
                protocols: Vec::new(),
            }));
        }
        if let Some(p) = object.host_data::<ProtocolWrapper>() {
            return Some(TypeDescriptor::Id(ObjectType {
                class: None,
                protocols: vec![p.name().clone()],
            }));
        }
        None
    }

    /// The `interop` object exposed to script
    pub fn interop_object(&self) -> JsObject {
        let interop = JsObject::new();
        interop.set("types", JsValue::Object(self.interop_types()));
        interop.set("Reference", JsValue::Object(JsObject::host(Rc::new(InteropConstructor::Reference))));
        interop.set("Pointer", JsValue::Object(JsObject::host(Rc::new(InteropConstructor::Pointer))));
        interop.set(
            "Invocation",
            JsValue::Object(JsObject::host(Rc::new(InteropConstructor::Invocation))),
        );
        interop.set("alloc", self.script_function("alloc", |b, _, args| b.alloc(args)));
        interop.set(
            "free",
            self.script_function("free", |b, _, args| b.free(args).map(|_| JsValue::Undefined)),
        );
        interop.set("adopt", self.script_function("adopt", |b, _, args| b.adopt(args)));
        interop.set("handleof", self.script_function("handleof", |b, _, args| b.handleof(args)));
        interop.set("sizeof", self.script_function("sizeof", |b, _, args| b.sizeof(args)));
        interop.set(
            "bufferFromData",
            self.script_function("bufferFromData", |b, _, args| b.buffer_from_data(args)),
        );
        interop.set(
            "stringFromCString",
            self.script_function("stringFromCString", |b, _, args| b.string_from_cstring(args)),
        );
        interop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;

    #[test]
    fn test_types_object_is_shared() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let a = bridge.interop_types().get("int32");
        let b = bridge.interop_object().get("types").as_object().unwrap().get("int32");
        assert_eq!(a, b);
        assert_eq!(bridge.type_argument(&a), Some(TypeDescriptor::int(IntWidth::W32, true)));
        assert_eq!(bridge.type_argument(&JsValue::from(1)), None);
    }

    #[test]
    fn test_interop_functions_throw_script_errors() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let interop = bridge.interop_object();
        let free = interop.get("free");
        let err = free.as_object().unwrap().call(&JsValue::Undefined, &[JsValue::from(1)]).unwrap_err();
        assert_eq!(err.name(), "TypeError");
        assert!(err.stack().is_some());
    }
}
