//! Invocation engine
//!
//! A call goes through the same steps whatever the entry point: pick the
//! call layout, check the arity, marshal each argument into a fresh
//! [`CallFrame`], dispatch, then read the return slot back. Frames and the
//! storage marshalled into them belong to one call only, so a callback that
//! re-enters the bridge mid-call builds its own.

mod callback;
mod invocation;
mod overload;
mod stack;

use std::rc::Rc;

use jsobjc_sdk::JsValue;

pub use invocation::Invocation;
pub use stack::CallStack;

use crate::abi::{CallFrame, CallLayout};
use crate::bridge::Bridge;
use crate::encoding::{IntWidth, Signature, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::interop::{Pointer, Reference};
use crate::lifetime::{ClassWrapper, ObjcWrapper, Ownership};
use crate::marshal::{MarshalScope, StructValue};
use crate::memory::NativeAllocation;
use crate::metadata::{MethodFlags, MethodKind, MethodMeta};
use crate::objc::{ClassId, Id, MethodEntry, Sel, NIL};

/// Where a call is dispatched to
pub(crate) enum Target {
    /// Dynamic message send
    Message { receiver: Id, sel: Sel },
    /// Message send starting at the superclass of `class`
    Super { receiver: Id, class: ClassId, sel: Sel },
    /// A captured implementation called as a method
    Entry { entry: MethodEntry, receiver: Id, sel: Sel },
    /// A block literal
    Block { block: Id, entry: MethodEntry },
    /// A C function or function pointer
    Function { entry: MethodEntry },
}

/// A finished call whose frame can still be read
pub(crate) struct Performed {
    frame: CallFrame,
    _allocations: Vec<NativeAllocation>,
}

impl Performed {
    /// The return slot read as an object handle
    pub(crate) fn returned_handle(&self) -> Id {
        self.frame.read_return()
    }
}

/// Argument type for a variadic extra argument
fn promoted_type(value: &JsValue, c_strings: bool) -> TypeDescriptor {
    let long_long = TypeDescriptor::int(IntWidth::W64, true);
    match value {
        JsValue::Bool(_) | JsValue::BigInt(_) => long_long,
        JsValue::Number(n) if n.fract() == 0.0 => long_long,
        JsValue::Number(_) => TypeDescriptor::Double,
        JsValue::String(_) if c_strings => TypeDescriptor::CString,
        JsValue::String(_) => TypeDescriptor::id(),
        JsValue::Undefined | JsValue::Null => TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void)),
        JsValue::Object(o) => {
            if let Some(sv) = o.host_data::<StructValue>() {
                TypeDescriptor::Struct(sv.layout().clone())
            } else if o.host_data::<Pointer>().is_some() || o.host_data::<Reference>().is_some() {
                TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void))
            } else if o.is_function() {
                TypeDescriptor::Block(None)
            } else {
                TypeDescriptor::id()
            }
        }
    }
}

/// Flags for a call made from inside an implementation (`super` calls and
/// captured implementations). An initializer called that way hands its
/// result back to the outer initializer, which owns the +1.
fn call_through_flags(meta: &MethodMeta) -> MethodFlags {
    if meta.is_initializer() {
        meta.flags - MethodFlags::RETURNS_RETAINED
    } else {
        meta.flags
    }
}

/// Whether the last explicit parameter is an `NSError **` the bridge may
/// supply itself
fn error_slot(layout: &CallLayout, flags: MethodFlags) -> bool {
    let fixed = layout.explicit_arg_count();
    flags.contains(MethodFlags::HAS_ERROR_OUT_PARAM)
        && fixed > 0
        && layout
            .explicit_slot(fixed - 1)
            .is_some_and(|slot| slot.ty.is_object_out_pointer())
}

impl Bridge {
    fn variadic_layout(&self, base: &CallLayout, extra: &[JsValue], c_strings: bool) -> Rc<CallLayout> {
        let mut signature = Signature::clone(base.signature());
        signature
            .params
            .extend(extra.iter().map(|v| promoted_type(v, c_strings)));
        Rc::new(CallLayout::new(Rc::new(signature), base.implicit_args(), self.abi()))
    }

    /// Marshal `args`, dispatch to `target` and keep the frame for the
    /// return value
    pub(crate) fn perform(
        &self,
        target: &Target,
        layout: Rc<CallLayout>,
        flags: MethodFlags,
        args: &[JsValue],
    ) -> BridgeResult<Performed> {
        let fixed = layout.explicit_arg_count();
        let has_error_slot = error_slot(&layout, flags);
        let supply_error = has_error_slot && args.len() + 1 == fixed;
        let variadic = flags.contains(MethodFlags::VARIADIC);

        let layout = if variadic && args.len() > fixed {
            let c_strings = matches!(target, Target::Function { .. });
            self.variadic_layout(&layout, &args[fixed..], c_strings)
        } else if args.len() == fixed || supply_error {
            layout
        } else {
            let expected = if has_error_slot {
                format!("{}..{}", fixed - 1, fixed)
            } else if variadic {
                format!("{}+", fixed)
            } else {
                fixed.to_string()
            };
            return Err(BridgeError::ArgumentCount {
                actual: args.len(),
                expected,
            });
        };

        let implicit = layout.implicit_args();
        let frame = CallFrame::new(layout.clone());
        match target {
            Target::Message { receiver, sel }
            | Target::Super { receiver, sel, .. }
            | Target::Entry { receiver, sel, .. } => {
                frame.write_arg(0, *receiver);
                frame.write_arg(1, sel.as_raw());
            }
            Target::Block { block, .. } => frame.write_arg(0, *block),
            Target::Function { .. } => {}
        }

        let mut scope = MarshalScope::new();
        for (i, arg) in args.iter().enumerate() {
            let ty = &layout.slots()[implicit + i].ty;
            self.write_param(arg, ty, frame.explicit_arg_ptr(i), &mut scope)?;
        }
        let error_out = if supply_error {
            let slot = scope.allocate(self.abi().pointer_size())?;
            frame.write_arg(implicit + fixed - 1, slot as usize);
            Some(slot as *const Id)
        } else {
            None
        };

        let runtime = self.runtime();
        let dispatched = match target {
            Target::Message { receiver, sel } => runtime.msg_send(*receiver, *sel, &frame),
            Target::Super { receiver, class, sel } => runtime.msg_send_super(*receiver, *class, *sel, &frame),
            Target::Entry { entry, receiver, sel } => {
                if runtime.is_live(*receiver) {
                    runtime.call_entry(entry, *receiver, *sel, &frame)
                } else {
                    frame.clear_return();
                    Ok(())
                }
            }
            Target::Block { block, entry } => runtime.call_entry(entry, *block, Sel::NULL, &frame),
            Target::Function { entry } => runtime.call_entry(entry, NIL, Sel::NULL, &frame),
        };
        let allocations = scope.finish();
        dispatched?;

        if let Some(slot) = error_out {
            // SAFETY: the slot is one of `allocations`, still alive here
            let error: Id = unsafe { std::ptr::read_unaligned(slot) };
            if error != NIL {
                let (domain, code, description) = runtime
                    .error_info(error)
                    .unwrap_or_else(|| (String::new(), 0, "Unknown native error".to_string()));
                return Err(BridgeError::NativeError {
                    domain,
                    code,
                    description,
                });
            }
        }
        Ok(Performed {
            frame,
            _allocations: allocations,
        })
    }

    /// Read the return value of a finished call
    pub(crate) fn return_value(&self, performed: &Performed, flags: MethodFlags) -> BridgeResult<JsValue> {
        let frame = &performed.frame;
        let ty = frame.layout().return_type();
        if flags.contains(MethodFlags::RETURNS_UNMANAGED) && ty.is_object() {
            return Ok(match performed.returned_handle() {
                NIL => JsValue::Null,
                handle => self.unmanaged_value(handle),
            });
        }
        let ownership = if flags.contains(MethodFlags::RETURNS_RETAINED) {
            Ownership::Retained
        } else {
            Ownership::Unretained
        };
        self.from_native(frame.return_ptr(), ty, ownership)
    }

    /// Layout of a method declaration
    pub(crate) fn method_layout(&self, meta: &MethodMeta) -> BridgeResult<Rc<CallLayout>> {
        self.layout(&meta.encoding, 2)
    }

    /// Finish an `init`-family call on `receiver`.
    ///
    /// The initializer consumed the receiver's +1 and returned a +1 object.
    /// When it returned the receiver itself the existing wrapper (if any)
    /// stays paired; when it returned a different object the old wrapper is
    /// detached and the result wrapped instead.
    fn finish_initializer(&self, this: Option<&JsValue>, receiver: Id, performed: &Performed) -> BridgeResult<JsValue> {
        let result = performed.returned_handle();
        let wrapper = this
            .and_then(|v| v.as_object())
            .and_then(|o| o.host_data::<ObjcWrapper>())
            .filter(|w| w.handle() == receiver);
        if result == receiver {
            if let (Some(this), Some(wrapper)) = (this, &wrapper) {
                if !self.runtime().is_live(receiver) {
                    wrapper.detach();
                    self.objects.forget(receiver);
                    return Ok(JsValue::Null);
                }
                return Ok(this.clone());
            }
            return self.wrap(result, Ownership::Retained, None);
        }
        if let Some(wrapper) = wrapper {
            wrapper.detach();
            self.objects.forget(receiver);
        }
        self.wrap(result, Ownership::Retained, None)
    }

    /// Call a declared method on `receiver`. `this` is the script value the
    /// call was made through.
    pub(crate) fn invoke_method(
        &self,
        this: &JsValue,
        receiver: Id,
        meta: &MethodMeta,
        args: &[JsValue],
    ) -> BridgeResult<JsValue> {
        self.in_frame(&meta.selector, || {
            let sel = self.runtime().sel(&meta.selector);
            let layout = self.method_layout(meta)?;
            let performed = self.perform(&Target::Message { receiver, sel }, layout, meta.flags, args)?;
            if meta.is_initializer() {
                return self.finish_initializer(Some(this), receiver, &performed);
            }
            self.return_value(&performed, meta.flags)
        })
    }

    /// The class whose metadata describes instances of `class`: the class
    /// itself or its nearest declared ancestor
    pub(crate) fn metadata_class_name(&self, class: ClassId) -> Rc<str> {
        let runtime = self.runtime();
        let registry = self.registry.borrow();
        let mut current = Some(class);
        while let Some(c) = current {
            let name = runtime.class_name(c);
            if registry.find_class(&name).is_some() {
                return name;
            }
            current = runtime.superclass(c);
        }
        runtime.class_name(class)
    }

    /// Call the native method script calls `name` on `this`, a wrapper or a
    /// class value
    pub fn call_method(&self, this: &JsValue, name: &str, args: &[JsValue]) -> BridgeResult<JsValue> {
        let object = this
            .as_object()
            .ok_or_else(|| BridgeError::Type(format!("Cannot read property \"{}\" of {}", name, this.to_js_string())))?;
        let (receiver, class, protocols, kind) = if let Some(wrapper) = object.host_data::<ObjcWrapper>() {
            (
                wrapper.handle(),
                wrapper.class(),
                wrapper.protocols().to_vec(),
                MethodKind::Instance,
            )
        } else if let Some(class) = object.host_data::<ClassWrapper>() {
            (
                self.runtime().class_object(class.class()),
                class.class(),
                Vec::new(),
                MethodKind::Class,
            )
        } else {
            return Err(BridgeError::Type(format!(
                "{} is not a native object",
                this.to_js_string()
            )));
        };
        let class_name = self.metadata_class_name(class);
        let candidates = self
            .registry
            .borrow()
            .lookup_methods(&class_name, &protocols, name, kind);
        if candidates.is_empty() {
            return Err(BridgeError::Type(format!(
                "{}.{} is not a function",
                class_name, name
            )));
        }
        let resolved = self.resolve_overload(&candidates, args, "method", name, false)?;
        self.invoke_method(this, receiver, &resolved.meta, &resolved.args)
    }

    /// Call a C function declared with [`Bridge::define_function`]
    pub fn call_function(&self, name: &str, args: &[JsValue]) -> BridgeResult<JsValue> {
        self.in_frame(name, || {
            let meta = self
                .registry
                .borrow()
                .find_function(name)
                .cloned()
                .ok_or_else(|| BridgeError::Metadata(format!("Function \"{}\" is not declared", name)))?;
            let entry = self
                .runtime()
                .function(name)
                .ok_or_else(|| BridgeError::Metadata(format!("Function \"{}\" is not available", name)))?;
            let layout = self.layout(&meta.encoding, 0)?;
            let performed = self.perform(&Target::Function { entry }, layout, meta.flags, args)?;
            self.return_value(&performed, meta.flags)
        })
    }

    /// `new Class(...)`: allocate, then run the initializer the arguments
    /// select, either by the key set of a single plain object or by position
    pub fn construct(&self, class: &ClassWrapper, args: &[JsValue]) -> BridgeResult<JsValue> {
        self.in_frame(class.name(), || {
            let class_name = self.metadata_class_name(class.class());
            let initializers = self.registry.borrow().initializers(&class_name, &[]);
            let resolved = self.resolve_overload(&initializers, args, "initializer", "constructor", true)?;
            let runtime = self.runtime();
            let class_object = runtime.class_object(class.class());
            let handle: Id = runtime
                .send(class_object, "alloc", |_| {})?
                .map_or(NIL, |frame| frame.read_return());
            let sel = runtime.sel(&resolved.meta.selector);
            let layout = self.method_layout(&resolved.meta)?;
            let performed = match self.perform(
                &Target::Message { receiver: handle, sel },
                layout,
                resolved.meta.flags,
                &resolved.args,
            ) {
                Ok(performed) => performed,
                Err(e) => {
                    if let Err(release) = runtime.release(handle) {
                        tracing::warn!(error = %release, "exception releasing unconstructed instance");
                    }
                    return Err(e);
                }
            };
            self.finish_initializer(None, handle, &performed)
        })
    }

    /// Call the implementation of `sel` above `class` with `this` as the
    /// receiver
    pub(crate) fn invoke_super(
        &self,
        receiver: Id,
        class: ClassId,
        meta: &MethodMeta,
        args: &[JsValue],
    ) -> BridgeResult<JsValue> {
        self.in_frame(&meta.selector, || {
            let sel = self.runtime().sel(&meta.selector);
            let layout = self.method_layout(meta)?;
            let performed = self.perform(&Target::Super { receiver, class, sel }, layout, meta.flags, args)?;
            self.return_value(&performed, call_through_flags(meta))
        })
    }

    /// Call a captured implementation with `this` as the receiver
    pub(crate) fn call_implementation(
        &self,
        entry: &MethodEntry,
        meta: &MethodMeta,
        this: &JsValue,
        args: &[JsValue],
    ) -> BridgeResult<JsValue> {
        self.in_frame(&meta.selector, || {
            let receiver = self.handle_of(this).unwrap_or(NIL);
            let sel = self.runtime().sel(&meta.selector);
            let layout = self.method_layout(meta)?;
            let target = Target::Entry {
                entry: entry.clone(),
                receiver,
                sel,
            };
            let performed = self.perform(&target, layout, meta.flags, args)?;
            self.return_value(&performed, call_through_flags(meta))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::metadata::FunctionMeta;
    use crate::objc::NativeCall;

    fn bridge() -> Rc<Bridge> {
        Bridge::new(BridgeOptions::default()).unwrap()
    }

    #[test]
    fn test_promotion_of_variadic_arguments() {
        assert_eq!(promoted_type(&JsValue::from(3), true), TypeDescriptor::int(IntWidth::W64, true));
        assert_eq!(promoted_type(&JsValue::Bool(true), true), TypeDescriptor::int(IntWidth::W64, true));
        assert_eq!(promoted_type(&JsValue::from(0.5), true), TypeDescriptor::Double);
        assert_eq!(promoted_type(&JsValue::from("s"), true), TypeDescriptor::CString);
        assert_eq!(promoted_type(&JsValue::from("s"), false), TypeDescriptor::id());
    }

    #[test]
    fn test_function_arity_is_checked() {
        let bridge = bridge();
        bridge
            .define_function(FunctionMeta::new("add", "iii"), |call: &NativeCall<'_>| {
                call.set_return(call.arg::<i32>(0) + call.arg::<i32>(1));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            bridge.call_function("add", &[JsValue::from(2), JsValue::from(40)]).unwrap(),
            JsValue::Number(42.0)
        );
        let err = bridge.call_function("add", &[JsValue::from(2)]).unwrap_err();
        assert_eq!(err.to_string(), "Actual arguments count: \"1\". Expected: \"2\".");
    }

    #[test]
    fn test_variadic_function_reads_promoted_arguments() {
        let bridge = bridge();
        bridge
            .define_function(
                FunctionMeta::new("sum", "qi").with_flags(MethodFlags::VARIADIC),
                |call: &NativeCall<'_>| {
                    let count = call.arg::<i32>(0) as usize;
                    let total: i64 = (0..count).map(|i| call.arg::<i64>(1 + i)).sum();
                    call.set_return(total);
                    Ok(())
                },
            )
            .unwrap();
        let result = bridge
            .call_function("sum", &[JsValue::from(3), JsValue::from(1), JsValue::from(2), JsValue::Bool(true)])
            .unwrap();
        assert_eq!(result, JsValue::Number(4.0));
    }

    #[test]
    fn test_messages_to_nil_return_zero() {
        let bridge = bridge();
        let meta = MethodMeta::instance("hash", "Q@:");
        let value = bridge.invoke_method(&JsValue::Null, NIL, &meta, &[]).unwrap();
        assert_eq!(value, JsValue::Number(0.0));
    }
}
