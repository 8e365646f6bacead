//! Objective-C shaped object runtime
//!
//! The bridge never talks to a system runtime directly. Everything it needs
//! from one (object table, class registration, messaging, reference counts,
//! blocks) goes through [`NativeRuntime`], and the built-in Foundation
//! classes are installed on top of it by [`foundation`].

pub(crate) mod foundation;
mod runtime;
mod selector;

pub use runtime::{
    ClassId, Id, Imp, MethodEntry, NativeCall, NativeException, NativeRuntime, NumberValue,
    BLOCK_CLASS, NIL, ROOT_CLASS,
};
pub use selector::{Sel, SelectorTable};
