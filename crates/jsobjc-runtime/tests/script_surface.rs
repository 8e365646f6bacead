//! Integration tests for the globals script sees
//!
//! Tests cover:
//! - Promise objects chained through their script functions
//! - Settling from a plain background thread
//! - console and timers working together

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use jsobjc_runtime::{Isolate, Promise, PromiseState, RuntimeConfig};
use jsobjc_sdk::{JsError, JsObject, JsValue};
use pretty_assertions::assert_eq;

fn isolate() -> Isolate {
    Isolate::new(RuntimeConfig::default()).unwrap()
}

fn call(object: &JsValue, name: &str, args: &[JsValue]) -> JsValue {
    let method = object.as_object().unwrap().get(name);
    method.as_object().unwrap().call(object, args).unwrap()
}

// ===== Promises =====

#[test]
fn test_script_then_chain() {
    let isolate = isolate();
    let promise = isolate.promise();
    let value = promise.to_value();

    let double = JsValue::Object(JsObject::function("double", |_, args| {
        Ok(JsValue::from(args[0].to_number() * 2.0))
    }));
    let console = isolate.console().clone();
    let print = JsValue::Object(JsObject::function("print", move |_, args| {
        console.log(args);
        Ok(JsValue::Undefined)
    }));
    let chained = call(&value, "then", &[double]);
    let last = call(&chained, "then", &[print]);

    promise.resolve(JsValue::from(21));
    assert!(isolate.console().lines().is_empty());
    isolate.run_until_idle();
    assert_eq!(isolate.console().lines(), vec!["42"]);

    let last = Promise::from_value(&last).unwrap();
    assert!(matches!(last.state(), PromiseState::Fulfilled(JsValue::Undefined)));
}

#[test]
fn test_throwing_handler_rejects_next_promise() {
    let isolate = isolate();
    let promise = Promise::resolved(&isolate, JsValue::from(1));
    let value = promise.to_value();
    let throws = JsValue::Object(JsObject::function("throws", |_, _| Err(JsError::range_error("bad"))));
    let next = call(&value, "then", &[throws]);

    let caught = Rc::new(RefCell::new(None));
    let sink = caught.clone();
    let catcher = JsValue::Object(JsObject::function("catcher", move |_, args| {
        *sink.borrow_mut() = Some(JsError::from_value(args[0].clone()));
        Ok(JsValue::from("recovered"))
    }));
    let recovered = call(&next, "catch", &[catcher]);
    isolate.run_until_idle();

    let caught = caught.borrow_mut().take().unwrap();
    assert_eq!(caught.name(), "RangeError");
    assert_eq!(caught.message(), "bad");
    match Promise::from_value(&recovered).unwrap().state() {
        PromiseState::Fulfilled(v) => assert_eq!(v, JsValue::from("recovered")),
        other => panic!("unexpected state {other:?}"),
    }
}

#[test]
fn test_reject_from_background_thread() {
    let isolate = isolate();
    let promise = isolate.promise();
    let resolver = promise.resolver().unwrap();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        resolver.reject(serde_json::json!("network down")).unwrap();
    });

    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    promise.on_complete(move |_, result| *sink.borrow_mut() = Some(result));
    isolate.run_until_idle();
    handle.join().unwrap();

    assert_eq!(
        outcome.borrow_mut().take().unwrap(),
        Err(JsValue::from("network down"))
    );
}

// ===== Console and timers =====

#[test]
fn test_timers_write_to_console_in_order() {
    let isolate = isolate();
    let console = isolate.global_value("console").unwrap();
    let log = console.as_object().unwrap().get("log");

    for (delay, text) in [(10, "third"), (0, "first"), (5, "second")] {
        let log = log.clone();
        let callback = JsValue::Object(JsObject::function("tick", move |_, args| {
            log.as_object().unwrap().call(&JsValue::Undefined, args)
        }));
        isolate
            .call_global("setTimeout", &[callback, JsValue::from(delay), JsValue::from(text)])
            .unwrap();
    }
    isolate.run_until_idle();
    assert_eq!(isolate.console().take(), vec!["first", "second", "third"]);
}
