//! Native to script re-entry
//!
//! Script functions handed to native code become blocks, function pointers
//! or method implementations. Each one is a trampoline: it unmarshals the
//! native arguments, calls the function and marshals its result into the
//! caller's return slot. Native blocks and function pointers coming the
//! other way become callable script functions.

use std::rc::{Rc, Weak};

use jsobjc_sdk::{JsObject, JsValue};

use super::Target;
use crate::abi::{decayed, CallLayout};
use crate::bridge::Bridge;
use crate::encoding::{Signature, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Ownership;
use crate::marshal::MarshalScope;
use crate::metadata::MethodFlags;
use crate::objc::{ClassId, Id, MethodEntry, NativeCall, NativeException};

/// Domain of the errors written into `NSError **` slots by script
/// implementations
pub(crate) const SCRIPT_ERROR_DOMAIN: &str = "JSErrorDomain";

/// Owns the +1 a script function holds on a native block
struct BlockOwner {
    handle: Id,
    bridge: Weak<Bridge>,
}

impl Drop for BlockOwner {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            if let Err(e) = bridge.runtime().release(self.handle) {
                tracing::warn!(block = self.handle, error = %e, "exception releasing block");
            }
        }
    }
}

impl Bridge {
    /// An implementation that calls `function`.
    ///
    /// `class` is the class the implementation is installed on, so `super`
    /// calls made from it start above that class. `error_out` marks a last
    /// parameter of type `NSError **` that receives thrown errors.
    pub(crate) fn script_entry(
        &self,
        function: &JsObject,
        layout: Rc<CallLayout>,
        class: Option<ClassId>,
        error_out: bool,
    ) -> MethodEntry {
        let weak = self.weak();
        let function = function.clone();
        MethodEntry::new(layout, move |call: &NativeCall<'_>| {
            let Some(bridge) = weak.upgrade() else {
                call.frame().clear_return();
                return Ok(());
            };
            bridge.run_callback(&function, call, class, error_out)
        })
    }

    /// Like [`script_entry`](Self::script_entry), but the entry does not keep
    /// `function` alive. Once it is gone calls return zero.
    fn weak_script_entry(&self, function: &JsObject, layout: Rc<CallLayout>) -> MethodEntry {
        let weak = self.weak();
        let function = function.downgrade();
        MethodEntry::new(layout, move |call: &NativeCall<'_>| {
            let (Some(bridge), Some(function)) = (weak.upgrade(), function.upgrade()) else {
                call.frame().clear_return();
                return Ok(());
            };
            bridge.run_callback(&function, call, None, false)
        })
    }

    fn run_callback(
        &self,
        function: &JsObject,
        call: &NativeCall<'_>,
        class: Option<ClassId>,
        error_out: bool,
    ) -> Result<(), NativeException> {
        let outcome = self.callback_arguments(call).and_then(|(this, args)| {
            if let Some(class) = class {
                self.call_stack.push_implementation(class);
            }
            let called = function.call(&this, &args);
            if class.is_some() {
                self.call_stack.pop_implementation();
            }
            let value = called.map_err(BridgeError::Script)?;
            self.write_callback_return(&value, call)
        });
        match outcome {
            Ok(()) => Ok(()),
            Err(error) => self.callback_failed(error, call, error_out),
        }
    }

    fn callback_arguments(&self, call: &NativeCall<'_>) -> BridgeResult<(JsValue, Vec<JsValue>)> {
        let layout = call.frame().layout();
        let this = if layout.implicit_args() >= 2 {
            self.wrap(call.receiver(), Ownership::Unretained, None)?
        } else {
            JsValue::Undefined
        };
        let mut args = Vec::with_capacity(layout.explicit_arg_count());
        for i in 0..layout.explicit_arg_count() {
            let ty = match layout.explicit_slot(i) {
                Some(slot) => decayed(&slot.ty),
                None => break,
            };
            args.push(self.from_native(call.arg_ptr(i), &ty, Ownership::Unretained)?);
        }
        Ok((this, args))
    }

    fn write_callback_return(&self, value: &JsValue, call: &NativeCall<'_>) -> BridgeResult<()> {
        let ty = call.frame().layout().return_type();
        if matches!(ty, TypeDescriptor::Void) {
            return Ok(());
        }
        let mut scope = MarshalScope::new();
        self.to_native(value, ty, call.return_ptr(), &mut scope)?;
        // C strings and copies returned to native code outlive this call
        self.defer_allocations(scope.finish());
        Ok(())
    }

    fn callback_failed(&self, error: BridgeError, call: &NativeCall<'_>, error_out: bool) -> Result<(), NativeException> {
        let frame = call.frame();
        let count = frame.layout().explicit_arg_count();
        if error_out && count > 0 {
            let slot: *mut Id = call.arg(count - 1);
            if !slot.is_null() {
                let thrown = self.to_js_error(error);
                let runtime = self.runtime();
                let ns_error = runtime.autorelease(runtime.new_error(SCRIPT_ERROR_DOMAIN, 1, &thrown.message()));
                // SAFETY: the caller passed storage for an object pointer
                unsafe { std::ptr::write_unaligned(slot, ns_error) };
                frame.clear_return();
                return Ok(());
            }
        }
        if self.call_stack.depth() == 0 {
            // No script caller below this native frame
            self.report_uncaught(self.to_js_error(error));
            frame.clear_return();
            return Ok(());
        }
        Err(self.to_native_exception(error))
    }

    /// A heap block (+1) that calls `function`. Without a signature the
    /// block takes no arguments and returns nothing.
    pub(crate) fn make_block(&self, function: &JsObject, signature: Option<Rc<Signature>>) -> BridgeResult<Id> {
        let signature = signature.unwrap_or_else(|| {
            Rc::new(Signature {
                ret: TypeDescriptor::Void,
                params: vec![TypeDescriptor::Block(None)],
            })
        });
        let layout = self.signature_layout(signature, 1);
        let entry = self.script_entry(function, layout, None, false);
        let block = self.runtime().create_block(entry);
        self.script_blocks.borrow_mut().insert(block, function.downgrade());
        Ok(block)
    }

    /// The address of a trampoline that calls `function`. One address per
    /// live function; the trampoline holds the function weakly.
    pub(crate) fn make_function_pointer(&self, function: &JsObject, signature: Option<Rc<Signature>>) -> BridgeResult<usize> {
        self.sweep_function_pointers();
        if let Some((_, address)) = self.function_pointers.borrow().get(&function.id()) {
            return Ok(*address);
        }
        let signature = signature.unwrap_or_else(|| {
            Rc::new(Signature {
                ret: TypeDescriptor::Void,
                params: Vec::new(),
            })
        });
        let layout = self.signature_layout(signature, 0);
        let entry = self.weak_script_entry(function, layout);
        let address = self.runtime().register_function_pointer(entry);
        self.function_pointers
            .borrow_mut()
            .insert(function.id(), (function.downgrade(), address));
        Ok(address)
    }

    /// Unregister trampolines whose function has been dropped. Object ids
    /// are reused, so this runs before every lookup.
    fn sweep_function_pointers(&self) {
        let runtime = self.runtime();
        self.function_pointers.borrow_mut().retain(|_, (function, address)| {
            let live = function.upgrade().is_some();
            if !live {
                tracing::trace!(address = *address, "function pointer target dropped");
                runtime.unregister_function_pointer(*address);
            }
            live
        });
    }

    /// A native block as a script function. Blocks made from script
    /// functions come back as the original function.
    pub(crate) fn block_function(&self, handle: Id, ownership: Ownership) -> BridgeResult<JsValue> {
        let runtime = self.runtime();
        let original = self.script_blocks.borrow().get(&handle).and_then(|w| w.upgrade());
        if let Some(function) = original {
            if ownership == Ownership::Retained {
                runtime.release(handle)?;
            }
            return Ok(JsValue::Object(function));
        }
        if ownership == Ownership::Unretained {
            runtime.retain(handle);
        }
        let owner = BlockOwner {
            handle,
            bridge: self.weak(),
        };
        let weak = self.weak();
        let arity = runtime
            .block_entry(handle)
            .map_or(0, |entry| entry.layout.explicit_arg_count());
        let function = JsObject::function("block", move |_, args| {
            let Some(bridge) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            bridge.call_block(owner.handle, args).map_err(|e| bridge.to_js_error(e))
        });
        function.set("length", JsValue::from(arity as f64));
        Ok(JsValue::Object(function))
    }

    fn call_block(&self, handle: Id, args: &[JsValue]) -> BridgeResult<JsValue> {
        self.in_frame("block", || {
            let entry = self
                .runtime()
                .block_entry(handle)
                .ok_or_else(|| BridgeError::Type(format!("Block {:#x} has been deallocated", handle)))?;
            let layout = entry.layout.clone();
            let performed = self.perform(&Target::Block { block: handle, entry }, layout, MethodFlags::empty(), args)?;
            self.return_value(&performed, MethodFlags::empty())
        })
    }

    /// A native function pointer as a script function. `signature`
    /// overrides the layout registered with the pointer.
    pub(crate) fn function_pointer_value(&self, address: usize, signature: Option<Rc<Signature>>) -> JsValue {
        let weak = self.weak();
        let function = JsObject::function("functionPointer", move |_, args| {
            let Some(bridge) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            bridge
                .call_function_pointer(address, signature.clone(), args)
                .map_err(|e| bridge.to_js_error(e))
        });
        JsValue::Object(function)
    }

    fn call_function_pointer(&self, address: usize, signature: Option<Rc<Signature>>, args: &[JsValue]) -> BridgeResult<JsValue> {
        self.in_frame("functionPointer", || {
            let entry = self
                .runtime()
                .function_pointer(address)
                .ok_or_else(|| BridgeError::Type(format!("{:#x} is not a callable function pointer", address)))?;
            let layout = match signature {
                Some(signature) => self.signature_layout(signature, 0),
                None => entry.layout.clone(),
            };
            let performed = self.perform(&Target::Function { entry }, layout, MethodFlags::empty(), args)?;
            self.return_value(&performed, MethodFlags::empty())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::metadata::FunctionMeta;

    #[test]
    fn test_block_round_trips_to_original_function() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let function = JsObject::function("f", |_, _| Ok(JsValue::Undefined));
        let block = bridge.make_block(&function, None).unwrap();
        let back = bridge.wrap(block, Ownership::Retained, None).unwrap();
        assert!(back.as_object().unwrap().ptr_eq(&function));
    }

    #[test]
    fn test_native_calls_script_block() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let function = JsObject::function("f", move |_, args| {
            sink.borrow_mut().push(args[0].clone());
            Ok(JsValue::from(args[0].to_number() * 2.0))
        });
        let signature = bridge.signature("i@?i").unwrap();
        let block = bridge.make_block(&function, Some(signature)).unwrap();
        let frame = bridge
            .runtime()
            .invoke_block(block, |frame| frame.write_arg(1, 21i32))
            .unwrap()
            .unwrap();
        assert_eq!(frame.read_return::<i32>(), 42);
        assert_eq!(*seen.borrow(), vec![JsValue::Number(21.0)]);
        bridge.runtime().release(block).unwrap();
    }

    #[test]
    fn test_native_function_pointer_is_callable() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let layout = bridge.layout("ii", 0).unwrap();
        let entry = MethodEntry::new(layout, |call: &NativeCall<'_>| {
            call.set_return(call.arg::<i32>(0) + 1);
            Ok(())
        });
        let address = bridge.runtime().register_function_pointer(entry);
        let function = bridge.function_pointer_value(address, None);
        let result = function.as_object().unwrap().call(&JsValue::Undefined, &[JsValue::from(9)]).unwrap();
        assert_eq!(result, JsValue::Number(10.0));
    }

    #[test]
    fn test_function_pointer_does_not_outlive_its_function() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let signature = bridge.signature("ii").unwrap();
        let function = JsObject::function("f", |_, args| Ok(JsValue::from(args[0].to_number() + 1.0)));
        let address = bridge.make_function_pointer(&function, Some(signature.clone())).unwrap();
        assert_eq!(bridge.make_function_pointer(&function, Some(signature.clone())).unwrap(), address);
        let call = |address| {
            bridge
                .runtime()
                .call_function_pointer(address, |frame| frame.write_arg(0, 4i32))
                .unwrap()
                .map(|frame| frame.read_return::<i32>())
        };
        assert_eq!(call(address), Some(5));

        drop(function);
        assert_eq!(call(address), Some(0));

        let other = JsObject::function("g", |_, _| Ok(JsValue::from(7)));
        let next = bridge.make_function_pointer(&other, Some(signature)).unwrap();
        assert_ne!(next, address);
        assert!(bridge.runtime().function_pointer(address).is_none());
        assert_eq!(bridge.function_pointers.borrow().len(), 1);
        assert_eq!(call(next), Some(7));
    }

    #[test]
    fn test_uncaught_callback_error_is_reported() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let reported = Rc::new(RefCell::new(Vec::new()));
        let sink = reported.clone();
        bridge.set_uncaught_handler(move |e| sink.borrow_mut().push(e.message()));
        let function = JsObject::function("f", |_, _| Err(jsobjc_sdk::JsError::error("boom")));
        let block = bridge.make_block(&function, None).unwrap();
        let frame = bridge.runtime().invoke_block(block, |_| {});
        assert!(frame.is_ok());
        assert_eq!(*reported.borrow(), vec!["boom".to_string()]);
        bridge.runtime().release(block).unwrap();
    }

    #[test]
    fn test_error_out_parameter_receives_script_errors() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let function = JsObject::function("f", |_, _| Err(jsobjc_sdk::JsError::error("no luck")));
        let layout = bridge.layout("B^@", 0).unwrap();
        let entry = bridge.script_entry(&function, layout, None, true);
        bridge.runtime().register_function("tryThing", entry);
        bridge.declare_function(FunctionMeta::new("tryThing", "B^@").with_flags(MethodFlags::HAS_ERROR_OUT_PARAM));
        let err = bridge.call_function("tryThing", &[]).unwrap_err();
        match err {
            BridgeError::NativeError { domain, code, description } => {
                assert_eq!(domain, SCRIPT_ERROR_DOMAIN);
                assert_eq!(code, 1);
                assert_eq!(description, "no luck");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
