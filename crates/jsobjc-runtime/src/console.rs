//! `console` sink
//!
//! Lines go to `tracing` under the `jsobjc::console` target and are kept in
//! a buffer the host can inspect.

use std::cell::RefCell;
use std::rc::Rc;

use jsobjc_sdk::{JsObject, JsValue};

/// The script console of one isolate
#[derive(Debug, Default)]
pub struct Console {
    lines: RefCell<Vec<String>>,
}

/// How one `console.log` argument prints. Strings print bare.
fn format_argument(value: &JsValue) -> String {
    match value {
        JsValue::Object(object) if object.is_array() => {
            let elements = object.array_elements().unwrap_or_default();
            let parts: Vec<String> = elements.iter().map(format_nested).collect();
            format!("[ {} ]", parts.join(", "))
        }
        JsValue::Object(object) if object.is_ordinary() => {
            let parts: Vec<String> = object
                .keys()
                .iter()
                .map(|key| format!("{}: {}", key, format_nested(&object.get(key))))
                .collect();
            if parts.is_empty() {
                "{}".to_string()
            } else {
                format!("{{ {} }}", parts.join(", "))
            }
        }
        other => other.to_js_string(),
    }
}

fn format_nested(value: &JsValue) -> String {
    match value {
        JsValue::String(s) => format!("'{}'", s),
        other => format_argument(other),
    }
}

impl Console {
    /// Record one already formatted line
    pub fn record(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "jsobjc::console", "{}", line);
        self.lines.borrow_mut().push(line);
    }

    /// `console.log(...args)`
    pub fn log(&self, args: &[JsValue]) {
        let parts: Vec<String> = args.iter().map(format_argument).collect();
        self.record(parts.join(" "));
    }

    /// Lines logged so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Take and clear the buffer
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }

    /// The script-visible `console` object
    pub(crate) fn to_object(self: &Rc<Self>) -> JsObject {
        let object = JsObject::new();
        for name in ["log", "info", "warn", "error", "debug"] {
            let console = Rc::downgrade(self);
            object.set(
                name,
                JsValue::Object(JsObject::function(name, move |_, args| {
                    if let Some(console) = console.upgrade() {
                        console.log(args);
                    }
                    Ok(JsValue::Undefined)
                })),
            );
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_formatting() {
        let console = Console::default();
        let point = JsObject::new();
        point.set("x", JsValue::from(1));
        point.set("label", JsValue::from("p"));
        console.log(&[
            JsValue::from("point"),
            JsValue::Object(point),
            JsValue::Object(JsObject::array(vec![JsValue::from(1), JsValue::from("two")])),
            JsValue::Null,
        ]);
        assert_eq!(console.take(), vec!["point { x: 1, label: 'p' } [ 1, 'two' ] null"]);
        assert!(console.lines().is_empty());
    }

    #[test]
    fn test_script_object_writes_to_buffer() {
        let console = Rc::new(Console::default());
        let object = console.to_object();
        let log = object.get("log");
        log.as_object()
            .unwrap()
            .call(&JsValue::Undefined, &[JsValue::from("hi"), JsValue::from(2)])
            .unwrap();
        assert_eq!(console.lines(), vec!["hi 2"]);
    }
}
