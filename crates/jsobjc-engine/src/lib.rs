//! JsObjC bridge core
//!
//! This crate connects the scripting value space of `jsobjc-sdk` to an
//! Objective-C shaped object runtime:
//! - Type encodings and struct layouts
//! - Argument classification and call frames per ABI
//! - Marshalling between script values and native memory
//! - Method invocation, overload resolution and callbacks
//! - Wrapper identity and reference-count ownership
//! - Script subclasses and swizzling
//! - The `interop` surface (references, pointers, raw memory)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod bridge;
pub mod class_builder;
pub mod encoding;
pub mod error;
pub mod exception;
pub mod interop;
pub mod invoke;
pub mod lifetime;
pub mod marshal;
pub mod memory;
pub mod metadata;
pub mod objc;

pub use bridge::{Bridge, BridgeOptions, NativeClassDef};
pub use class_builder::PrototypeWrapper;
pub use encoding::{Abi, Signature, StructLayout, TypeDescriptor};
pub use error::{BridgeError, BridgeResult};
pub use interop::{InteropConstructor, Pointer, Reference, Unmanaged};
pub use invoke::Invocation;
pub use lifetime::{ClassWrapper, ObjcWrapper, Ownership, ProtocolWrapper};
pub use marshal::{StructType, StructValue};
pub use metadata::{
    ClassMeta, FunctionMeta, MethodFlags, MethodKind, MethodMeta, PropertyMeta, ProtocolMeta,
    StructMeta,
};
pub use objc::{ClassId, Id, NativeCall, NativeException, NativeRuntime, NIL};
