//! Native fixture classes shared by the integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use jsobjc_engine::metadata::StructMeta;
use jsobjc_engine::{
    Bridge, BridgeOptions, FunctionMeta, Id, MethodFlags, MethodMeta, NativeCall, NativeClassDef,
    NativeException, PropertyMeta,
};
use jsobjc_sdk::{JsObject, JsValue};

/// A bridge with the fixtures installed, plus the log native code writes to
pub struct Fixture {
    pub bridge: Rc<Bridge>,
    pub log: Rc<RefCell<String>>,
}

impl Fixture {
    pub fn global(&self, name: &str) -> JsValue {
        self.bridge
            .global(name)
            .unwrap_or_else(|| panic!("no global {name}"))
    }

    pub fn interop(&self, name: &str) -> JsValue {
        let interop = self.global("interop");
        self.bridge.get(&interop, name).unwrap()
    }

    pub fn type_object(&self, name: &str) -> JsValue {
        self.bridge.interop_types().get(name)
    }

    pub fn log(&self) -> String {
        self.log.borrow().clone()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(BridgeOptions::default())
}

pub fn fixture_with(options: BridgeOptions) -> Fixture {
    let bridge = Bridge::new(options).unwrap();
    let log = Rc::new(RefCell::new(String::new()));
    define_alloc_log(&bridge, &log);
    define_primitives(&bridge);
    define_constructors(&bridge);
    define_calculator(&bridge);
    define_functions(&bridge);
    Fixture { bridge, log }
}

/// A plain JS object from key/value pairs
pub fn object(entries: &[(&str, JsValue)]) -> JsValue {
    let object = JsObject::new();
    for (key, value) in entries {
        object.set(key, value.clone());
    }
    JsValue::Object(object)
}

/// A JS function from a closure
pub fn function(
    name: &str,
    f: impl Fn(&JsValue, &[JsValue]) -> jsobjc_sdk::JsResult<JsValue> + 'static,
) -> JsValue {
    JsValue::Object(JsObject::function(name, f))
}

fn define_alloc_log(bridge: &Bridge, log: &Rc<RefCell<String>>) {
    let on_init = log.clone();
    let on_dealloc = log.clone();
    bridge
        .define_class(
            NativeClassDef::new("TNSAllocLog")
                .superclass("NSObject")
                .method(MethodMeta::instance("init", "@@:"), move |call: &NativeCall<'_>| {
                    on_init.borrow_mut().push_str("TNSAllocLog init");
                    call.set_return(call.receiver());
                    Ok(())
                })
                .method(MethodMeta::instance("dealloc", "v@:"), move |call: &NativeCall<'_>| {
                    on_dealloc.borrow_mut().push_str("TNSAllocLog dealloc");
                    let runtime = call.runtime();
                    if let Some(class) = runtime.class_named("TNSAllocLog") {
                        runtime.send_super(call.receiver(), class, "dealloc", |_| {})?;
                    }
                    Ok(())
                }),
        )
        .unwrap();
}

macro_rules! echo {
    ($t:ty) => {
        |call: &NativeCall<'_>| -> Result<(), NativeException> {
            call.set_return(call.arg::<$t>(0));
            Ok(())
        }
    };
}

fn define_primitives(bridge: &Bridge) {
    let class = |selector: &str, encoding: &str| MethodMeta::class(selector, encoding);
    bridge
        .define_class(
            NativeClassDef::new("TNSPrimitives")
                .superclass("NSObject")
                .method(class("methodWithChar:", "c#:c"), echo!(i8))
                .method(class("methodWithUChar:", "C#:C"), echo!(u8))
                .method(class("methodWithShort:", "s#:s"), echo!(i16))
                .method(class("methodWithUShort:", "S#:S"), echo!(u16))
                .method(class("methodWithInt:", "i#:i"), echo!(i32))
                .method(class("methodWithUInt:", "I#:I"), echo!(u32))
                .method(class("methodWithLongLong:", "q#:q"), echo!(i64))
                .method(class("methodWithULongLong:", "Q#:Q"), echo!(u64))
                .method(class("methodWithFloat:", "f#:f"), echo!(f32))
                .method(class("methodWithDouble:", "d#:d"), echo!(f64))
                .method(class("methodWithBool:", "B#:B"), echo!(u8))
                .method(class("methodWithCString:", "r*#:r*"), echo!(usize))
                .method(class("lengthOfString:", "Q#:@"), |call: &NativeCall<'_>| {
                    let length = call.arg_string(0).map_or(0, |s| s.encode_utf16().count());
                    call.set_return(length as u64);
                    Ok(())
                }),
        )
        .unwrap();
}

fn store_xy(call: &NativeCall<'_>, x: i32, y: i32) {
    let runtime = call.runtime();
    runtime.set_ivar(call.receiver(), "x", x as u32 as u64);
    runtime.set_ivar(call.receiver(), "y", y as u32 as u64);
    call.set_return(call.receiver());
}

fn define_constructors(bridge: &Bridge) {
    let x = PropertyMeta::new("x", "i").readonly();
    let y = PropertyMeta::new("y", "i").readonly();
    let ivar = |name: &'static str| {
        move |call: &NativeCall<'_>| -> Result<(), NativeException> {
            call.set_return(call.runtime().ivar(call.receiver(), name) as u32 as i32);
            Ok(())
        }
    };
    bridge
        .define_class(
            NativeClassDef::new("TNSPoint2D")
                .superclass("NSObject")
                .method(MethodMeta::instance("initWithX:andY:", "@@:ii"), |call: &NativeCall<'_>| {
                    store_xy(call, call.arg(0), call.arg(1));
                    Ok(())
                })
                .method(MethodMeta::instance("initWithValue:", "@@:i"), |call: &NativeCall<'_>| {
                    let v: i32 = call.arg(0);
                    store_xy(call, v, v);
                    Ok(())
                })
                .method(MethodMeta::instance("initWithNumber:", "@@:i"), |call: &NativeCall<'_>| {
                    let v: i32 = call.arg(0);
                    store_xy(call, v, v);
                    Ok(())
                })
                .method(MethodMeta::instance("initWithString:", "@@:@"), |call: &NativeCall<'_>| {
                    let length = call.arg_string(0).map_or(0, |s| s.len()) as i32;
                    store_xy(call, length, 0);
                    Ok(())
                })
                .property(x.clone())
                .property(y.clone())
                .implementation(x.getter_method(), ivar("x"))
                .implementation(y.getter_method(), ivar("y")),
        )
        .unwrap();

    // Two spellings with the same key set
    bridge
        .define_class(
            NativeClassDef::new("TNSAmbiguous")
                .superclass("NSObject")
                .method(MethodMeta::instance("initWithName:", "@@:@"), |call: &NativeCall<'_>| {
                    call.set_return(call.receiver());
                    Ok(())
                })
                .method(MethodMeta::instance("initName:", "@@:@"), |call: &NativeCall<'_>| {
                    call.set_return(call.receiver());
                    Ok(())
                }),
        )
        .unwrap();
}

fn define_calculator(bridge: &Bridge) {
    let scale = PropertyMeta::new("scale", "i");
    bridge
        .define_class(
            NativeClassDef::new("TNSCalculator")
                .superclass("NSObject")
                .method(MethodMeta::instance("doubled:", "i@:i"), |call: &NativeCall<'_>| {
                    call.set_return(call.arg::<i32>(0) * 2);
                    Ok(())
                })
                .method(MethodMeta::instance("callDoubled:", "i@:i"), |call: &NativeCall<'_>| {
                    let value: i32 = call.arg(0);
                    let frame = call
                        .runtime()
                        .send(call.receiver(), "doubled:", |f| f.write_arg(2, value))?;
                    call.set_return(frame.map_or(0, |f| f.read_return::<i32>()));
                    Ok(())
                })
                .property(scale.clone())
                .implementation(scale.getter_method(), |call: &NativeCall<'_>| {
                    call.set_return(call.runtime().ivar(call.receiver(), "scale") as u32 as i32);
                    Ok(())
                })
                .implementation(scale.setter_method().unwrap(), |call: &NativeCall<'_>| {
                    call.runtime()
                        .set_ivar(call.receiver(), "scale", call.arg::<i32>(0) as u32 as u64);
                    Ok(())
                }),
        )
        .unwrap();
}

fn define_functions(bridge: &Bridge) {
    bridge.define_struct(StructMeta::new("TNSVector", &[("x", "d"), ("y", "d")]));
    bridge
        .define_function(FunctionMeta::new("TNSVectorLength", "d{TNSVector}"), |call: &NativeCall<'_>| {
            let [x, y] = call.arg::<[f64; 2]>(0);
            call.set_return(x.hypot(y));
            Ok(())
        })
        .unwrap();
    bridge
        .define_function(FunctionMeta::new("TNSWriteInt", "v^ii"), |call: &NativeCall<'_>| {
            let target = call.arg::<*mut i32>(0);
            if !target.is_null() {
                // SAFETY: the caller passed storage for an int
                unsafe { std::ptr::write_unaligned(target, call.arg::<i32>(1)) };
            }
            Ok(())
        })
        .unwrap();
    bridge
        .define_function(
            FunctionMeta::new("TNSCreateObject", "@").with_flags(MethodFlags::RETURNS_UNMANAGED),
            |call: &NativeCall<'_>| {
                let runtime = call.runtime();
                let handle = runtime
                    .class_named("NSObject")
                    .map_or(jsobjc_engine::NIL, |class| runtime.alloc_instance(class));
                call.set_return(handle);
                Ok(())
            },
        )
        .unwrap();
    bridge
        .define_function(
            FunctionMeta::new("TNSFail", "Bi^@").with_flags(MethodFlags::HAS_ERROR_OUT_PARAM),
            |call: &NativeCall<'_>| {
                let code: i32 = call.arg(0);
                let slot = call.arg::<*mut Id>(1);
                if code != 0 && !slot.is_null() {
                    let runtime = call.runtime();
                    let error = runtime.autorelease(runtime.new_error("TNSErrorDomain", i64::from(code), "It failed"));
                    // SAFETY: the caller passed an `NSError **` slot
                    unsafe { std::ptr::write_unaligned(slot, error) };
                }
                call.set_return(u8::from(code == 0));
                Ok(())
            },
        )
        .unwrap();
}
