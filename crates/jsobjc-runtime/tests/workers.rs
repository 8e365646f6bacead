//! Integration tests for workers and cross-thread settlement
//!
//! Tests cover:
//! - Message round trips between an isolate and a worker
//! - postMessage argument and clone checks
//! - Termination: idempotent, no late delivery
//! - Per-worker bridge state
//! - Promises settled from a worker thread
//! - Script-started workers

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use jsobjc_engine::{MethodMeta, NativeCall, NativeClassDef};
use jsobjc_runtime::{Isolate, PromiseState, RuntimeConfig, WorkerScope};
use jsobjc_sdk::{JsObject, JsValue};
use pretty_assertions::assert_eq;

fn isolate() -> Isolate {
    Isolate::new(RuntimeConfig::default()).unwrap()
}

fn data(args: &[JsValue]) -> JsValue {
    args[0].as_object().unwrap().get("data")
}

/// Worker body answering every message with its number doubled
fn doubler(scope: &WorkerScope) -> jsobjc_runtime::RuntimeResult<()> {
    let reply = scope.clone();
    scope.set_onmessage(JsObject::function("onmessage", move |_, args| {
        let n = data(args).to_number();
        reply.post_message(&[JsValue::from(n * 2.0)])?;
        Ok(JsValue::Undefined)
    }));
    Ok(())
}

// ===== Messaging =====

#[test]
fn test_round_trip() {
    let isolate = isolate();
    let worker = isolate.spawn_worker(doubler).unwrap();
    let replies = Rc::new(RefCell::new(Vec::new()));
    let sink = replies.clone();
    let owner = worker.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
        sink.borrow_mut().push(data(args));
        if sink.borrow().len() == 2 {
            owner.terminate();
        }
        Ok(JsValue::Undefined)
    }));
    worker.post_message(&[JsValue::from(21)]).unwrap();
    worker.post_message(&[JsValue::from(5)]).unwrap();
    isolate.run_until_idle();
    worker.join().unwrap();
    assert_eq!(*replies.borrow(), vec![JsValue::Number(42.0), JsValue::Number(10.0)]);
}

#[test]
fn test_messages_are_copies() {
    let isolate = isolate();
    let worker = isolate
        .spawn_worker(|scope| {
            let reply = scope.clone();
            scope.set_onmessage(JsObject::function("onmessage", move |_, args| {
                let received = data(args);
                received.as_object().unwrap().set("seen", JsValue::Bool(true));
                reply.post_message(&[received])?;
                Ok(JsValue::Undefined)
            }));
            Ok(())
        })
        .unwrap();
    let original = JsObject::new();
    original.set("name", JsValue::from("payload"));
    let echoed = Rc::new(RefCell::new(None));
    let sink = echoed.clone();
    let owner = worker.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
        *sink.borrow_mut() = Some(data(args));
        owner.terminate();
        Ok(JsValue::Undefined)
    }));
    worker.post_message(&[JsValue::Object(original.clone())]).unwrap();
    isolate.run_until_idle();

    let echoed = echoed.borrow_mut().take().unwrap();
    let echoed = echoed.as_object().unwrap();
    assert!(!echoed.ptr_eq(&original));
    assert_eq!(echoed.get("name"), JsValue::from("payload"));
    assert_eq!(echoed.get("seen"), JsValue::Bool(true));
    assert!(!original.has("seen"));
}

#[test]
fn test_post_message_checks() {
    let isolate = isolate();
    let worker = isolate.spawn_worker(doubler).unwrap();
    let object = worker.object();
    let post = object.get("postMessage");
    let post = post.as_object().unwrap();

    let err = post.call(&JsValue::Object(object.clone()), &[]).unwrap_err();
    assert_eq!(err.name(), "ArgumentCountError");
    let err = post
        .call(&JsValue::Object(object.clone()), &[JsValue::from(1), JsValue::from(2)])
        .unwrap_err();
    assert_eq!(err.name(), "ArgumentCountError");
    assert_eq!(err.message(), "Actual arguments count: \"2\". Expected: \"1\".");

    let function = JsValue::Object(JsObject::function("f", |_, _| Ok(JsValue::Undefined)));
    let err = post.call(&JsValue::Object(object.clone()), &[function]).unwrap_err();
    assert_eq!(err.name(), "DataCloneError");

    worker.terminate();
    isolate.run_until_idle();
}

// ===== Termination =====

#[test]
fn test_terminate_is_idempotent_and_stops_delivery() {
    let isolate = isolate();
    let worker = isolate
        .spawn_worker(|scope| {
            let ticker = scope.clone();
            let own = scope.isolate().unwrap();
            own.set_interval(Duration::from_millis(1), move |_| {
                ticker.post_message(&[JsValue::from("tick")])?;
                Ok(())
            });
            Ok(())
        })
        .unwrap();
    let received = Rc::new(RefCell::new(0));
    let count = received.clone();
    let owner = worker.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, _| {
        *count.borrow_mut() += 1;
        owner.terminate();
        owner.terminate();
        Ok(JsValue::Undefined)
    }));
    isolate.run_until_idle();
    worker.join().unwrap();
    assert_eq!(*received.borrow(), 1);
    assert!(worker.is_terminated());

    // Posting to a terminated worker is silently dropped
    worker.post_message(&[JsValue::from(1)]).unwrap();
    worker.terminate();
    isolate.run_until_idle();
    assert_eq!(*received.borrow(), 1);
}

#[test]
fn test_close_from_inside_still_delivers_earlier_messages() {
    let isolate = isolate();
    let worker = isolate
        .spawn_worker(|scope| {
            scope.post_message(&[JsValue::from("last words")])?;
            scope.close();
            assert!(scope.is_closed());
            scope.post_message(&[JsValue::from("after close")])?;
            Ok(())
        })
        .unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
        sink.borrow_mut().push(data(args).to_js_string());
        Ok(JsValue::Undefined)
    }));
    isolate.run_until_idle();
    worker.join().unwrap();
    assert_eq!(*received.borrow(), vec!["last words".to_string()]);
}

// ===== Isolation =====

#[test]
fn test_worker_has_its_own_bridge() {
    let isolate = isolate();
    isolate
        .bridge()
        .define_class(
            NativeClassDef::new("TNSOnlyOnOwner")
                .superclass("NSObject")
                .method(MethodMeta::instance("ping", "v@:"), |_: &NativeCall<'_>| Ok(())),
        )
        .unwrap();
    assert!(isolate.global_value("TNSOnlyOnOwner").is_some());

    let worker = isolate
        .spawn_worker(|scope| {
            let own = scope.isolate().unwrap();
            let visible = own.global_value("TNSOnlyOnOwner").is_some();
            let has_foundation = own.global_value("NSObject").is_some();
            scope.post_message(&[JsValue::Object(JsObject::array(vec![
                JsValue::Bool(visible),
                JsValue::Bool(has_foundation),
            ]))])?;
            scope.close();
            Ok(())
        })
        .unwrap();
    let answer = Rc::new(RefCell::new(None));
    let sink = answer.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
        *sink.borrow_mut() = data(args).as_object().and_then(|o| o.array_elements());
        Ok(JsValue::Undefined)
    }));
    isolate.run_until_idle();
    assert_eq!(
        answer.borrow_mut().take().unwrap(),
        vec![JsValue::Bool(false), JsValue::Bool(true)]
    );
}

// ===== Promises across threads =====

#[test]
fn test_worker_settles_owner_promise() {
    let isolate = isolate();
    let promise = isolate.promise();
    let resolver = promise.resolver().unwrap();
    let worker = isolate
        .spawn_worker(move |scope| {
            resolver.resolve(serde_json::json!({ "from": "worker" }))?;
            scope.close();
            Ok(())
        })
        .unwrap();
    let owner_thread = isolate.thread_id();
    let settled_on = Rc::new(RefCell::new(None));
    let sink = settled_on.clone();
    promise.on_complete(move |isolate, _| {
        *sink.borrow_mut() = Some(isolate.thread_id());
    });
    isolate.run_until_idle();
    worker.join().unwrap();

    assert_eq!(*settled_on.borrow(), Some(owner_thread));
    match promise.state() {
        PromiseState::Fulfilled(value) => {
            assert_eq!(value.as_object().unwrap().get("from"), JsValue::from("worker"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

// ===== Script-started workers =====

#[test]
fn test_script_worker_by_name() {
    let isolate = isolate();
    isolate.define_worker("doubler", doubler);
    let worker = isolate.call_global("Worker", &[JsValue::from("doubler")]).unwrap();
    let worker_object = worker.as_object().unwrap().clone();

    let replies = Rc::new(RefCell::new(Vec::new()));
    let sink = replies.clone();
    let terminate = worker_object.get("terminate");
    worker_object.set(
        "onmessage",
        JsValue::Object(JsObject::function("onmessage", move |_, args| {
            sink.borrow_mut().push(data(args));
            terminate.as_object().unwrap().call(&JsValue::Undefined, &[])?;
            Ok(JsValue::Undefined)
        })),
    );
    let post = worker_object.get("postMessage");
    post.as_object().unwrap().call(&worker, &[JsValue::from(4)]).unwrap();
    isolate.run_until_idle();
    assert_eq!(*replies.borrow(), vec![JsValue::Number(8.0)]);

    let err = isolate.call_global("Worker", &[JsValue::from("missing")]).unwrap_err();
    assert_eq!(err.name(), "TypeError");
}
