//! Built-in Foundation subset
//!
//! Implementations and metadata for the classes every runtime starts with.
//! Installed once by [`Bridge::new`](crate::bridge::Bridge::new).

use crate::bridge::{Bridge, NativeClassDef};
use crate::error::BridgeResult;
use crate::metadata::{MethodMeta, PropertyMeta};

use super::{Id, NativeCall, NativeException, NativeRuntime, NumberValue, NIL, ROOT_CLASS};

type NativeResult = Result<(), NativeException>;

fn return_string(call: &NativeCall<'_>, text: &str) {
    let runtime = call.runtime();
    call.set_return(runtime.autorelease(runtime.new_string(text)));
}

fn alloc(call: &NativeCall<'_>) -> NativeResult {
    let runtime = call.runtime();
    let handle = runtime
        .class_from_object(call.receiver())
        .map_or(NIL, |class| runtime.alloc_instance(class));
    call.set_return(handle);
    Ok(())
}

fn new(call: &NativeCall<'_>) -> NativeResult {
    let runtime = call.runtime();
    let Some(class) = runtime.class_from_object(call.receiver()) else {
        call.set_return(NIL);
        return Ok(());
    };
    let handle = runtime.alloc_instance(class);
    let initialized: Id = runtime
        .send(handle, "init", |_| {})?
        .map_or(NIL, |frame| frame.read_return());
    call.set_return(initialized);
    Ok(())
}

fn description(runtime: &NativeRuntime, handle: Id) -> String {
    if let Some(text) = runtime.string_value(handle) {
        return text;
    }
    if let Some(number) = runtime.number_value(handle) {
        return match number {
            NumberValue::Bool(b) => u8::from(b).to_string(),
            NumberValue::Int(i) => i.to_string(),
            NumberValue::UInt(u) => u.to_string(),
            NumberValue::Double(d) => d.to_string(),
        };
    }
    if let Some((domain, code, text)) = runtime.error_info(handle) {
        return format!("Error Domain={} Code={} \"{}\"", domain, code, text);
    }
    let class = runtime
        .class_of(handle)
        .or_else(|| runtime.class_from_object(handle))
        .map(|c| runtime.class_name(c));
    match (class, runtime.class_from_object(handle)) {
        (Some(name), Some(_)) => name.to_string(),
        (Some(name), None) => format!("<{}: {:#x}>", name, handle),
        (None, _) => "(null)".to_string(),
    }
}

fn object_class() -> NativeClassDef {
    NativeClassDef::new(ROOT_CLASS)
        .method(MethodMeta::class("alloc", "@#:"), alloc)
        .method(MethodMeta::class("new", "@#:"), new)
        .method(MethodMeta::class("class", "#@:"), |call: &NativeCall<'_>| {
            call.set_return(call.receiver());
            Ok(())
        })
        .method(MethodMeta::instance("init", "@@:"), |call: &NativeCall<'_>| {
            call.set_return(call.receiver());
            Ok(())
        })
        .method(MethodMeta::instance("retain", "@@:"), |call: &NativeCall<'_>| {
            call.set_return(call.runtime().retain(call.receiver()));
            Ok(())
        })
        .method(MethodMeta::instance("release", "v@:"), |call: &NativeCall<'_>| {
            call.runtime().release(call.receiver())
        })
        .method(MethodMeta::instance("autorelease", "@@:"), |call: &NativeCall<'_>| {
            call.set_return(call.runtime().autorelease(call.receiver()));
            Ok(())
        })
        .method(MethodMeta::instance("retainCount", "Q@:"), |call: &NativeCall<'_>| {
            call.set_return(call.runtime().retain_count(call.receiver()) as u64);
            Ok(())
        })
        .method(MethodMeta::instance("dealloc", "v@:"), |call: &NativeCall<'_>| {
            call.runtime().destroy(call.receiver())
        })
        .method(MethodMeta::instance("class", "#@:"), |call: &NativeCall<'_>| {
            let runtime = call.runtime();
            let class = runtime.class_of(call.receiver()).map_or(NIL, |c| runtime.class_object(c));
            call.set_return(class);
            Ok(())
        })
        .method(MethodMeta::instance("description", "@@:"), |call: &NativeCall<'_>| {
            return_string(call, &description(call.runtime(), call.receiver()));
            Ok(())
        })
        .method(
            MethodMeta::instance("respondsToSelector:", "B@::"),
            |call: &NativeCall<'_>| {
                let sel = super::Sel::from_raw(call.arg::<usize>(0));
                let responds = !sel.is_null() && call.runtime().lookup(call.receiver(), sel).is_some();
                call.set_return(u8::from(responds));
                Ok(())
            },
        )
        .method(
            MethodMeta::instance("isKindOfClass:", "B@:#"),
            |call: &NativeCall<'_>| {
                let runtime = call.runtime();
                let kind = runtime
                    .class_from_object(call.arg::<Id>(0))
                    .is_some_and(|class| runtime.is_kind_of(call.receiver(), class));
                call.set_return(u8::from(kind));
                Ok(())
            },
        )
}

fn string_class() -> NativeClassDef {
    NativeClassDef::new("NSString")
        .superclass(ROOT_CLASS)
        .method(
            MethodMeta::class("stringWithUTF8String:", "@#:r*"),
            |call: &NativeCall<'_>| {
                match call.arg_c_string(0) {
                    Some(text) => return_string(call, &text),
                    None => call.set_return(NIL),
                }
                Ok(())
            },
        )
        .method(
            MethodMeta::instance("initWithUTF8String:", "@@:r*"),
            |call: &NativeCall<'_>| {
                let text = call.arg_c_string(0).unwrap_or_default();
                call.runtime().set_string(call.receiver(), &text);
                call.set_return(call.receiver());
                Ok(())
            },
        )
        .method(MethodMeta::instance("UTF8String", "r*@:"), |call: &NativeCall<'_>| {
            call.set_return(call.runtime().string_utf8_ptr(call.receiver()));
            Ok(())
        })
        .method(MethodMeta::instance("description", "@@:"), |call: &NativeCall<'_>| {
            call.set_return(call.receiver());
            Ok(())
        })
        .property(PropertyMeta::new("length", "Q").readonly())
        .implementation(
            PropertyMeta::new("length", "Q").getter_method(),
            |call: &NativeCall<'_>| {
                let length = call
                    .runtime()
                    .string_value(call.receiver())
                    .map_or(0, |s| s.encode_utf16().count());
                call.set_return(length as u64);
                Ok(())
            },
        )
}

fn number_class() -> NativeClassDef {
    fn boxed(call: &NativeCall<'_>, value: NumberValue) -> NativeResult {
        let runtime = call.runtime();
        call.set_return(runtime.autorelease(runtime.new_number(value)));
        Ok(())
    }
    let value = |call: &NativeCall<'_>| {
        call.runtime()
            .number_value(call.receiver())
            .unwrap_or(NumberValue::Int(0))
    };
    NativeClassDef::new("NSNumber")
        .superclass(ROOT_CLASS)
        .method(MethodMeta::class("numberWithInt:", "@#:i"), |call: &NativeCall<'_>| {
            boxed(call, NumberValue::Int(i64::from(call.arg::<i32>(0))))
        })
        .method(MethodMeta::class("numberWithLongLong:", "@#:q"), |call: &NativeCall<'_>| {
            boxed(call, NumberValue::Int(call.arg::<i64>(0)))
        })
        .method(
            MethodMeta::class("numberWithUnsignedLongLong:", "@#:Q"),
            |call: &NativeCall<'_>| boxed(call, NumberValue::UInt(call.arg::<u64>(0))),
        )
        .method(MethodMeta::class("numberWithDouble:", "@#:d"), |call: &NativeCall<'_>| {
            boxed(call, NumberValue::Double(call.arg::<f64>(0)))
        })
        .method(MethodMeta::class("numberWithBool:", "@#:B"), |call: &NativeCall<'_>| {
            boxed(call, NumberValue::Bool(call.arg::<u8>(0) != 0))
        })
        .method(MethodMeta::instance("intValue", "i@:"), move |call: &NativeCall<'_>| {
            call.set_return(value(call).as_i64() as i32);
            Ok(())
        })
        .method(MethodMeta::instance("longLongValue", "q@:"), move |call: &NativeCall<'_>| {
            call.set_return(value(call).as_i64());
            Ok(())
        })
        .method(
            MethodMeta::instance("unsignedLongLongValue", "Q@:"),
            move |call: &NativeCall<'_>| {
                call.set_return(value(call).as_i64() as u64);
                Ok(())
            },
        )
        .method(MethodMeta::instance("doubleValue", "d@:"), move |call: &NativeCall<'_>| {
            call.set_return(value(call).as_f64());
            Ok(())
        })
        .method(MethodMeta::instance("boolValue", "B@:"), move |call: &NativeCall<'_>| {
            call.set_return(u8::from(value(call).as_f64() != 0.0));
            Ok(())
        })
}

fn null_class() -> NativeClassDef {
    NativeClassDef::new("NSNull")
        .superclass(ROOT_CLASS)
        .method(MethodMeta::class("null", "@#:"), |call: &NativeCall<'_>| {
            call.set_return(call.runtime().null_object());
            Ok(())
        })
}

fn array_items(call: &NativeCall<'_>, index: usize) -> Vec<Id> {
    let runtime = call.runtime();
    let source: Id = call.arg(index);
    runtime.array_items(source).unwrap_or_default()
}

fn array_class() -> NativeClassDef {
    NativeClassDef::new("NSArray")
        .superclass(ROOT_CLASS)
        .method(MethodMeta::class("array", "@#:"), |call: &NativeCall<'_>| {
            let runtime = call.runtime();
            call.set_return(runtime.autorelease(runtime.new_array(Vec::new())));
            Ok(())
        })
        .method(MethodMeta::class("arrayWithArray:", "@#:@"), |call: &NativeCall<'_>| {
            let runtime = call.runtime();
            let items = array_items(call, 0);
            call.set_return(runtime.autorelease(runtime.new_array(items)));
            Ok(())
        })
        .method(MethodMeta::instance("initWithArray:", "@@:@"), |call: &NativeCall<'_>| {
            // Array storage is immutable once created, so the initializer
            // hands back a fresh instance in place of the receiver
            let runtime = call.runtime();
            let items = array_items(call, 0);
            let array = runtime.new_array(items);
            runtime.release(call.receiver())?;
            call.set_return(array);
            Ok(())
        })
        .method(MethodMeta::instance("count", "Q@:"), |call: &NativeCall<'_>| {
            let count = call.runtime().array_items(call.receiver()).map_or(0, |items| items.len());
            call.set_return(count as u64);
            Ok(())
        })
        .method(MethodMeta::instance("objectAtIndex:", "@@:Q"), |call: &NativeCall<'_>| {
            let runtime = call.runtime();
            let items = runtime.array_items(call.receiver()).unwrap_or_default();
            let index = call.arg::<u64>(0);
            let item = usize::try_from(index).ok().and_then(|i| items.get(i).copied()).ok_or_else(|| {
                let bounds = match items.len() {
                    0 => "for empty array".to_string(),
                    n => format!("[0 .. {}]", n - 1),
                };
                NativeException::new(
                    "NSRangeException",
                    format!("*** -[NSArray objectAtIndex:]: index {} beyond bounds {}", index, bounds),
                )
            })?;
            call.set_return(item);
            Ok(())
        })
}

fn dictionary_class() -> NativeClassDef {
    NativeClassDef::new("NSDictionary")
        .superclass(ROOT_CLASS)
        .method(MethodMeta::instance("count", "Q@:"), |call: &NativeCall<'_>| {
            let count = call
                .runtime()
                .dictionary_entries(call.receiver())
                .map_or(0, |entries| entries.len());
            call.set_return(count as u64);
            Ok(())
        })
        .method(MethodMeta::instance("objectForKey:", "@@:@"), |call: &NativeCall<'_>| {
            let value = call
                .runtime()
                .dictionary_get(call.receiver(), call.arg::<Id>(0))
                .unwrap_or(NIL);
            call.set_return(value);
            Ok(())
        })
}

fn data_class() -> NativeClassDef {
    NativeClassDef::new("NSData")
        .superclass(ROOT_CLASS)
        .method(
            MethodMeta::class("dataWithBytes:length:", "@#:r^vQ"),
            |call: &NativeCall<'_>| {
                let runtime = call.runtime();
                let source = call.arg::<usize>(0) as *const u8;
                let length = usize::try_from(call.arg::<u64>(1)).unwrap_or(0);
                let bytes = if source.is_null() || length == 0 {
                    &[][..]
                } else {
                    // SAFETY: the caller passes `length` readable bytes
                    unsafe { std::slice::from_raw_parts(source, length) }
                };
                call.set_return(runtime.autorelease(runtime.new_data(bytes)));
                Ok(())
            },
        )
        .method(MethodMeta::instance("bytes", "r^v@:"), |call: &NativeCall<'_>| {
            let address = call
                .runtime()
                .data_buffer(call.receiver())
                .filter(|buffer| !buffer.is_empty())
                .map_or(0, |buffer| buffer.as_mut_ptr() as usize);
            call.set_return(address);
            Ok(())
        })
        .property(PropertyMeta::new("length", "Q").readonly())
        .implementation(
            PropertyMeta::new("length", "Q").getter_method(),
            |call: &NativeCall<'_>| {
                let length = call.runtime().data_buffer(call.receiver()).map_or(0, |b| b.len());
                call.set_return(length as u64);
                Ok(())
            },
        )
}

fn error_class() -> NativeClassDef {
    let info = |call: &NativeCall<'_>| call.runtime().error_info(call.receiver()).unwrap_or_default();
    NativeClassDef::new("NSError")
        .superclass(ROOT_CLASS)
        .method(
            MethodMeta::class("errorWithDomain:code:userInfo:", "@#:@q@"),
            |call: &NativeCall<'_>| {
                let runtime = call.runtime();
                let domain = call.arg_string(0).unwrap_or_default();
                let code = call.arg::<i64>(1);
                let description = format!("The operation couldn't be completed. ({} error {}.)", domain, code);
                let error = runtime.new_error(&domain, code, &description);
                call.set_return(runtime.autorelease(error));
                Ok(())
            },
        )
        .method(MethodMeta::instance("domain", "@@:"), move |call: &NativeCall<'_>| {
            return_string(call, &info(call).0);
            Ok(())
        })
        .method(MethodMeta::instance("code", "q@:"), move |call: &NativeCall<'_>| {
            call.set_return(info(call).1);
            Ok(())
        })
        .method(
            MethodMeta::instance("localizedDescription", "@@:"),
            move |call: &NativeCall<'_>| {
                return_string(call, &info(call).2);
                Ok(())
            },
        )
}

/// Install the built-in classes on `bridge`'s runtime
pub(crate) fn install(bridge: &Bridge) -> BridgeResult<()> {
    for def in [
        object_class(),
        string_class(),
        number_class(),
        null_class(),
        array_class(),
        dictionary_class(),
        data_class(),
        error_class(),
        NativeClassDef::new("Protocol").superclass(ROOT_CLASS),
        NativeClassDef::new(super::BLOCK_CLASS).superclass(ROOT_CLASS),
    ] {
        bridge.define_class(def)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use jsobjc_sdk::{JsObject, JsValue, TypedArray, TypedArrayKind};

    use crate::bridge::{Bridge, BridgeOptions};
    use crate::interop::Pointer;

    fn global_class(bridge: &Bridge, name: &str) -> JsValue {
        bridge.global(name).unwrap()
    }

    #[test]
    fn test_array_from_script_array() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let ns_array = global_class(&bridge, "NSArray");
        let source = JsValue::Object(JsObject::array(vec![JsValue::from(0), JsValue::from(1), JsValue::from("2")]));
        let array = bridge.call_method(&ns_array, "arrayWithArray", &[source]).unwrap();
        assert_eq!(bridge.call_method(&array, "count", &[]).unwrap(), JsValue::Number(3.0));
        assert_eq!(
            bridge.call_method(&array, "objectAtIndex", &[JsValue::from(2)]).unwrap(),
            JsValue::from("2")
        );
    }

    #[test]
    fn test_out_of_range_index_raises_range_exception() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let ns_array = global_class(&bridge, "NSArray");
        let array = bridge.call_method(&ns_array, "array", &[]).unwrap();
        let err = bridge
            .call_method(&array, "objectAtIndex", &[JsValue::from(0)])
            .unwrap_err();
        assert_eq!(err.error_name(), "NSRangeException");
    }

    #[test]
    fn test_construct_array_with_initializer() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let ns_array = global_class(&bridge, "NSArray");
        let source = JsValue::Object(JsObject::array(vec![JsValue::from(1), JsValue::from(2), JsValue::from(3)]));
        let array = bridge.construct_value(&ns_array, &[source]).unwrap();
        assert_eq!(bridge.call_method(&array, "count", &[]).unwrap(), JsValue::Number(3.0));
    }

    #[test]
    fn test_data_copies_bytes_it_is_given() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let ns_data = global_class(&bridge, "NSData");
        let source = TypedArray::from_numbers(TypedArrayKind::Uint8, &[1.0, 2.0, 3.0]);
        let data = bridge
            .call_method(
                &ns_data,
                "dataWithBytesLength",
                &[JsValue::Object(JsObject::typed_array(source.clone())), JsValue::from(3)],
            )
            .unwrap();
        assert_eq!(bridge.get(&data, "length").unwrap(), JsValue::Number(3.0));
        source.set(0, &JsValue::from(9));
        let handle = bridge.handleof(&[data.clone()]).unwrap();
        let address = handle.as_object().unwrap().host_data::<Pointer>().unwrap().address();
        let buffer = bridge.runtime().data_buffer(address).unwrap();
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_error_accessors() {
        let bridge = Bridge::new(BridgeOptions::default()).unwrap();
        let ns_error = global_class(&bridge, "NSError");
        let error = bridge
            .call_method(
                &ns_error,
                "errorWithDomainCodeUserInfo",
                &[JsValue::from("TNSErrorDomain"), JsValue::from(7), JsValue::Null],
            )
            .unwrap();
        assert_eq!(bridge.call_method(&error, "domain", &[]).unwrap(), JsValue::from("TNSErrorDomain"));
        assert_eq!(bridge.call_method(&error, "code", &[]).unwrap(), JsValue::Number(7.0));
    }
}
