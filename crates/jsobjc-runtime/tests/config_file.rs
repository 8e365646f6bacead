//! Integration tests for configuration files
//!
//! Tests cover:
//! - Loading a file and creating an isolate from it
//! - Workers inheriting their owner's configuration
//! - Load errors

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use jsobjc_runtime::{Isolate, RuntimeConfig, RuntimeError};
use jsobjc_sdk::{JsObject, JsValue};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

const STRICT: &str = r#"{
    "bridge": { "strict_integers": true },
    "log": { "level": "debug", "ansi": false },
    "timer_resolution_ms": 4
}"#;

// ===== Loading =====

#[test]
fn test_load_file_into_isolate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jsobjc.json");
    fs::write(&path, STRICT).unwrap();

    let config = RuntimeConfig::load(&path).unwrap();
    assert!(config.bridge.strict_integers);
    assert_eq!(config.log.level, "debug");
    assert!(!config.log.ansi);
    assert_eq!(config.timer_resolution_ms, 4);
    assert_eq!(config.worker_stack_size, RuntimeConfig::default().worker_stack_size);

    let isolate = Isolate::new(config.clone()).unwrap();
    assert_eq!(isolate.config(), &config);
    assert!(isolate.bridge().options().strict_integers);
}

#[test]
fn test_worker_inherits_configuration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jsobjc.json");
    fs::write(&path, STRICT).unwrap();
    let isolate = Isolate::new(RuntimeConfig::load(&path).unwrap()).unwrap();

    let worker = isolate
        .spawn_worker(|scope| {
            let own = scope.isolate().unwrap();
            let strict = own.bridge().options().strict_integers;
            let resolution = own.config().timer_resolution_ms as f64;
            scope.post_message(&[JsValue::Object(JsObject::array(vec![
                JsValue::Bool(strict),
                JsValue::Number(resolution),
            ]))])?;
            scope.close();
            Ok(())
        })
        .unwrap();
    let seen = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    worker.set_onmessage(JsObject::function("onmessage", move |_, args| {
        let data = args[0].as_object().unwrap().get("data");
        *sink.borrow_mut() = data.as_object().and_then(|o| o.array_elements());
        Ok(JsValue::Undefined)
    }));
    isolate.run_until_idle();
    worker.join().unwrap();
    assert_eq!(
        seen.borrow_mut().take().unwrap(),
        vec![JsValue::Bool(true), JsValue::Number(4.0)]
    );
}

// ===== Errors =====

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempdir().unwrap();
    let err = RuntimeConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, RuntimeError::Io(_)), "{err}");
}

#[test]
fn test_invalid_file_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");

    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(RuntimeConfig::load(&path).unwrap_err(), RuntimeError::Json(_)));

    fs::write(&path, r#"{ "log": { "level": "loud" } }"#).unwrap();
    let err = RuntimeConfig::load(&path).unwrap_err();
    assert!(matches!(err, RuntimeError::Config(_)));
    assert!(err.to_string().contains("loud"), "{err}");
}
