//! Object lifetime management
//!
//! Every live native object seen by script has at most one wrapper. The
//! wrapper owns one retain on its handle and gives it back when it is
//! finalized (dropped) or explicitly released with
//! [`Bridge::release_native_counterpart`]. The handle table holds weak
//! entries only, so it never keeps a wrapper alive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use jsobjc_sdk::{HostObject, JsObject, JsValue, WeakJsObject};
use rustc_hash::FxHashMap;

use crate::bridge::Bridge;
use crate::encoding::ObjectType;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::numeric::integer_value;
use crate::objc::{ClassId, Id, NumberValue, NIL};

/// Who owns the +1 on a handle entering script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The caller already holds a +1 that the wrapper adopts
    Retained,
    /// The value is borrowed; the wrapper retains it
    Unretained,
}

// ============================================================================
// Host objects
// ============================================================================

/// Script-side wrapper of a native instance
pub struct ObjcWrapper {
    handle: Cell<Id>,
    class: ClassId,
    class_name: Rc<str>,
    protocols: Vec<Rc<str>>,
    bridge: Weak<Bridge>,
}

impl ObjcWrapper {
    /// The wrapped handle, or nil once detached
    pub fn handle(&self) -> Id {
        self.handle.get()
    }

    /// Runtime class at wrap time
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Class name at wrap time
    pub fn class_name_str(&self) -> &str {
        &self.class_name
    }

    /// Protocols contributed by the static type the value arrived with
    pub fn protocols(&self) -> &[Rc<str>] {
        &self.protocols
    }

    /// Whether the wrapper no longer owns its handle
    pub fn is_detached(&self) -> bool {
        self.handle.get() == NIL
    }

    /// Drop the pairing without releasing; returns the old handle
    pub(crate) fn detach(&self) -> Id {
        self.handle.replace(NIL)
    }
}

impl HostObject for ObjcWrapper {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn display(&self) -> String {
        format!("<{}: {:#x}>", self.class_name, self.handle.get())
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Drop for ObjcWrapper {
    fn drop(&mut self) {
        let handle = self.handle.get();
        if handle == NIL {
            return;
        }
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        bridge.objects.forget(handle);
        if let Err(e) = bridge.runtime().release(handle) {
            tracing::warn!(handle, error = %e, "exception while finalizing wrapper");
            bridge.report_uncaught(bridge.native_exception_to_js(e));
        }
    }
}

impl fmt::Debug for ObjcWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjcWrapper({})", self.display())
    }
}

/// Script-side value of a native class (its constructor)
#[derive(Debug, Clone)]
pub struct ClassWrapper {
    class: ClassId,
    name: Rc<str>,
}

impl ClassWrapper {
    /// Runtime class
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Class name
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }
}

impl HostObject for ClassWrapper {
    fn class_name(&self) -> &str {
        "Function"
    }

    fn display(&self) -> String {
        format!("function {}() {{ [native code] }}", self.name)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

/// Script-side value of a protocol
#[derive(Debug)]
pub struct ProtocolWrapper {
    name: Rc<str>,
}

impl ProtocolWrapper {
    /// Protocol name
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }
}

impl HostObject for ProtocolWrapper {
    fn class_name(&self) -> &str {
        "Protocol"
    }

    fn display(&self) -> String {
        format!("[object Protocol {}]", self.name)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

// ============================================================================
// Handle table
// ============================================================================

/// Handle → wrapper identity table
#[derive(Debug, Default)]
pub struct ObjectManager {
    table: RefCell<FxHashMap<Id, WeakJsObject>>,
}

impl ObjectManager {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The live wrapper of `handle`
    pub fn lookup(&self, handle: Id) -> Option<JsObject> {
        let weak = self.table.borrow().get(&handle).cloned()?;
        let object = weak.upgrade()?;
        let attached = object
            .host_data::<ObjcWrapper>()
            .is_some_and(|w| w.handle() == handle);
        attached.then_some(object)
    }

    fn insert(&self, handle: Id, object: &JsObject) {
        self.table.borrow_mut().insert(handle, object.downgrade());
    }

    /// Remove the entry for `handle`
    pub fn forget(&self, handle: Id) {
        if let Ok(mut table) = self.table.try_borrow_mut() {
            table.remove(&handle);
        }
    }

    /// Number of table entries whose wrapper is still alive
    pub fn live_wrappers(&self) -> usize {
        self.table
            .borrow()
            .values()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

// ============================================================================
// Bridge operations
// ============================================================================

impl Bridge {
    /// Turn a native object handle into a script value.
    ///
    /// Strings, numbers and `NSNull` become primitives. Classes and
    /// protocols become their constructor values. Anything else gets its
    /// unique wrapper; a new wrapper takes ownership of one retain.
    pub fn wrap(&self, handle: Id, ownership: Ownership, static_type: Option<&ObjectType>) -> BridgeResult<JsValue> {
        if handle == NIL {
            return Ok(JsValue::Null);
        }
        let runtime = self.runtime();
        if let Some(class) = runtime.class_from_object(handle) {
            return Ok(JsValue::Object(self.class_value(class)));
        }
        if !runtime.is_live(handle) {
            return Ok(JsValue::Null);
        }
        if let Some(primitive) = self.primitive_of(handle) {
            if ownership == Ownership::Retained {
                runtime.release(handle)?;
            }
            return Ok(primitive);
        }
        if let Some(name) = runtime.protocol_name(handle) {
            return Ok(JsValue::Object(self.protocol_value(&name)));
        }
        if runtime.block_entry(handle).is_some() {
            return self.block_function(handle, ownership);
        }
        if let Some(existing) = self.objects.lookup(handle) {
            if ownership == Ownership::Retained {
                runtime.release(handle)?;
            }
            return Ok(JsValue::Object(existing));
        }
        if ownership == Ownership::Unretained {
            runtime.retain(handle);
        }
        let class = runtime.class_of(handle).unwrap_or_default();
        let wrapper = Rc::new(ObjcWrapper {
            handle: Cell::new(handle),
            class,
            class_name: runtime.class_name(class),
            protocols: static_type.map(|t| t.protocols.clone()).unwrap_or_default(),
            bridge: self.weak(),
        });
        let object = JsObject::host(wrapper);
        self.objects.insert(handle, &object);
        Ok(JsValue::Object(object))
    }

    fn primitive_of(&self, handle: Id) -> Option<JsValue> {
        let runtime = self.runtime();
        if runtime.is_null_object(handle) {
            return Some(JsValue::Null);
        }
        if let Some(text) = runtime.string_value(handle) {
            return Some(JsValue::string(text));
        }
        runtime.number_value(handle).map(|n| match n {
            NumberValue::Bool(b) => JsValue::Bool(b),
            NumberValue::UInt(u) => integer_value(i128::from(u)),
            other => JsValue::Number(other.as_f64()),
        })
    }

    /// The constructor value of a class. Identity is stable per class.
    pub fn class_value(&self, class: ClassId) -> JsObject {
        if let Some(existing) = self.class_values.borrow().get(&class) {
            return existing.clone();
        }
        let object = JsObject::host(Rc::new(ClassWrapper {
            class,
            name: self.runtime().class_name(class),
        }));
        self.class_values.borrow_mut().insert(class, object.clone());
        object
    }

    /// The value of a protocol. Identity is stable per name.
    pub fn protocol_value(&self, name: &str) -> JsObject {
        if let Some(existing) = self.protocol_values.borrow().get(name) {
            return existing.clone();
        }
        let object = JsObject::host(Rc::new(ProtocolWrapper { name: Rc::from(name) }));
        self.protocol_values.borrow_mut().insert(Rc::from(name), object.clone());
        object
    }

    /// The handle behind a wrapper value, if it is one and still attached
    pub fn handle_of(&self, value: &JsValue) -> Option<Id> {
        let wrapper = value.as_object()?.host_data::<ObjcWrapper>()?;
        let handle = wrapper.handle();
        (handle != NIL).then_some(handle)
    }

    /// Whether `value` is an instance of the class `class_value` or of a
    /// subclass
    pub fn instance_of(&self, value: &JsValue, class_value: &JsValue) -> bool {
        let (Some(handle), Some(class)) = (
            self.handle_of(value),
            class_value.as_object().and_then(|o| o.host_data::<ClassWrapper>()),
        ) else {
            return false;
        };
        self.runtime().is_kind_of(handle, class.class())
    }

    /// Give up a wrapper's ownership immediately.
    ///
    /// Takes exactly one argument, which must be a native wrapper. The
    /// retain is released first, so a teardown hook run by `dealloc` still
    /// sees the wrapper; then the wrapper is detached and later messages
    /// through it behave like messages to nil.
    pub fn release_native_counterpart(&self, args: &[JsValue]) -> BridgeResult<()> {
        if args.len() != 1 {
            return Err(BridgeError::argument_count(args.len(), 1));
        }
        let value = &args[0];
        let wrapper = value
            .as_object()
            .and_then(|o| o.host_data::<ObjcWrapper>())
            .ok_or_else(|| {
                BridgeError::Type(format!(
                    "{} is an object which is not a native wrapper.",
                    value.to_js_string()
                ))
            })?;
        let handle = wrapper.handle();
        if handle == NIL {
            return Ok(());
        }
        let released = self.runtime().release(handle);
        if wrapper.detach() != NIL {
            self.objects.forget(handle);
        }
        released.map_err(BridgeError::from)
    }
}
