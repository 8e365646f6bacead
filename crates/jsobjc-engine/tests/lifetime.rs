//! Integration tests for wrapper identity and ownership
//!
//! Tests cover:
//! - releaseNativeCounterpart argument checks
//! - Deterministic release running native dealloc
//! - Wrapper identity across calls
//! - Unmanaged return values
//! - Messaging through a released wrapper

mod common;

use common::{fixture, object};
use jsobjc_sdk::{JsObject, JsValue};
use pretty_assertions::assert_eq;

// ===== releaseNativeCounterpart arguments =====

#[test]
fn test_release_rejects_values_that_are_not_wrappers() {
    let fx = fixture();
    let cases = [
        JsValue::from(0),
        JsValue::from(""),
        JsValue::Object(JsObject::array(Vec::new())),
        object(&[]),
        JsValue::Null,
        JsValue::Undefined,
    ];
    for value in cases {
        let expected = format!("{} is an object which is not a native wrapper.", value.to_js_string());
        let err = fx.bridge.release_native_counterpart(&[value]).unwrap_err();
        assert_eq!(err.error_name(), "TypeError");
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn test_release_requires_exactly_one_argument() {
    let fx = fixture();
    let instance = fx.bridge.construct_value(&fx.global("NSObject"), &[]).unwrap();
    for args in [
        vec![instance.clone(), JsValue::from(1)],
        vec![instance.clone(), JsValue::Null, JsValue::Null],
    ] {
        let err = fx.bridge.release_native_counterpart(&args).unwrap_err();
        assert_eq!(err.error_name(), "ArgumentCountError");
        assert_eq!(
            err.to_string(),
            format!("Actual arguments count: \"{}\". Expected: \"1\".", args.len())
        );
    }
    let err = fx.bridge.release_native_counterpart(&[]).unwrap_err();
    assert_eq!(err.error_name(), "ArgumentCountError");
}

// ===== Deterministic release =====

#[test]
fn test_release_runs_native_dealloc() {
    let fx = fixture();
    let instance = fx.bridge.construct_value(&fx.global("TNSAllocLog"), &[]).unwrap();
    assert_eq!(fx.log(), "TNSAllocLog init");
    fx.bridge.release_native_counterpart(&[instance.clone()]).unwrap();
    assert_eq!(fx.log(), "TNSAllocLog initTNSAllocLog dealloc");

    // A second release is a no-op on a detached wrapper
    fx.bridge.release_native_counterpart(&[instance]).unwrap();
    assert_eq!(fx.log(), "TNSAllocLog initTNSAllocLog dealloc");
}

#[test]
fn test_alloc_then_init_through_method_calls() {
    let fx = fixture();
    let class = fx.global("TNSAllocLog");
    let allocated = fx.bridge.call_method(&class, "alloc", &[]).unwrap();
    let initialized = fx.bridge.call_method(&allocated, "init", &[]).unwrap();
    assert_eq!(fx.log(), "TNSAllocLog init");
    assert_eq!(
        fx.bridge.handle_of(&initialized),
        fx.bridge.handle_of(&allocated)
    );
    fx.bridge.release_native_counterpart(&[initialized]).unwrap();
    assert_eq!(fx.log(), "TNSAllocLog initTNSAllocLog dealloc");
}

#[test]
fn test_messages_to_released_wrapper_return_zero() {
    let fx = fixture();
    let calculator = fx.bridge.construct_value(&fx.global("TNSCalculator"), &[]).unwrap();
    assert_eq!(
        fx.bridge.call_method(&calculator, "doubled", &[JsValue::from(4)]).unwrap(),
        JsValue::Number(8.0)
    );
    fx.bridge.release_native_counterpart(&[calculator.clone()]).unwrap();
    assert_eq!(fx.bridge.handle_of(&calculator), None);
    assert_eq!(
        fx.bridge.call_method(&calculator, "doubled", &[JsValue::from(4)]).unwrap(),
        JsValue::Number(0.0)
    );
}

// ===== Identity =====

#[test]
fn test_same_handle_gives_same_wrapper() {
    let fx = fixture();
    let calculator = fx.bridge.construct_value(&fx.global("TNSCalculator"), &[]).unwrap();
    let again = fx.bridge.call_method(&calculator, "retain", &[]).unwrap();
    assert_eq!(again, calculator);
    let handle = fx.bridge.handle_of(&calculator).unwrap();
    assert_eq!(fx.bridge.runtime().retain_count(handle), 2);
    fx.bridge.call_method(&calculator, "release", &[]).unwrap();
    assert_eq!(fx.bridge.runtime().retain_count(handle), 1);
    assert!(fx.bridge.instance_of(&calculator, &fx.global("NSObject")));
    assert!(!fx.bridge.instance_of(&calculator, &fx.global("TNSPoint2D")));
}

#[test]
fn test_class_values_are_stable() {
    let fx = fixture();
    assert_eq!(fx.global("TNSCalculator"), fx.global("TNSCalculator"));
    let calculator = fx.bridge.construct_value(&fx.global("TNSCalculator"), &[]).unwrap();
    assert_eq!(
        fx.bridge.call_method(&calculator, "class", &[]).unwrap(),
        fx.global("TNSCalculator")
    );
}

// ===== Unmanaged =====

#[test]
fn test_unmanaged_value_is_taken_once() {
    let fx = fixture();
    let unmanaged = fx.bridge.call_function("TNSCreateObject", &[]).unwrap();
    let object = fx.bridge.call(&unmanaged, "takeRetainedValue", &[]).unwrap();
    let handle = fx.bridge.handle_of(&object).unwrap();
    assert_eq!(fx.bridge.runtime().retain_count(handle), 1);

    let err = fx.bridge.call(&unmanaged, "takeUnretainedValue", &[]).unwrap_err();
    assert_eq!(err.error_name(), "TypeError");
    let thrown = fx.bridge.to_js_error(err);
    assert_eq!(thrown.name(), "TypeError");
    assert_eq!(thrown.message(), "Unmanaged value has already been consumed");
}
