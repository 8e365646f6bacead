//! Swizzling
//!
//! A swizzle replaces the implementation in a class's dispatch table, so
//! instances created before and after it, and native callers, all see the
//! new layer. The implementation a layer replaces stays callable through
//! the value [`Bridge::prototype_get`] returned before the replacement:
//! native implementations are captured as entries, script layers as the
//! functions that were installed.

use std::rc::Rc;

use jsobjc_sdk::{HostObject, JsObject, JsValue, PropertySlot};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::ClassWrapper;
use crate::metadata::{MethodKind, MethodMeta, PropertyMeta};
use crate::objc::{ClassId, MethodEntry};

fn function_argument<'a>(value: &'a JsValue, what: &str) -> BridgeResult<&'a JsObject> {
    value
        .as_object()
        .filter(|o| o.is_function())
        .ok_or_else(|| BridgeError::Type(format!("{} is not a function ({})", value.to_js_string(), what)))
}

/// `Class.prototype`. Reads and writes go through the class's dispatch
/// table.
#[derive(Debug)]
pub struct PrototypeWrapper {
    class: ClassWrapper,
}

impl PrototypeWrapper {
    /// The class this prototype belongs to
    pub fn class(&self) -> &ClassWrapper {
        &self.class
    }
}

impl HostObject for PrototypeWrapper {
    fn class_name(&self) -> &str {
        "Object"
    }

    fn display(&self) -> String {
        format!("[object {}]", self.class.name())
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Bridge {
    /// The prototype value of a class. Identity is stable per class.
    pub fn prototype_value(&self, class: &ClassWrapper) -> JsObject {
        if let Some(existing) = self.prototype_values.borrow().get(&class.class()) {
            return existing.clone();
        }
        let object = JsObject::host(Rc::new(PrototypeWrapper { class: class.clone() }));
        self.prototype_values.borrow_mut().insert(class.class(), object.clone());
        object
    }

    fn prototype_declarations(&self, class: ClassId, name: &str) -> Vec<MethodMeta> {
        let class_name = self.metadata_class_name(class);
        self.registry
            .borrow()
            .lookup_methods(&class_name, &[], name, MethodKind::Instance)
    }

    fn prototype_property(&self, class: ClassId, name: &str) -> Option<PropertyMeta> {
        let class_name = self.metadata_class_name(class);
        self.registry.borrow().lookup_property(&class_name, &[], name)
    }

    /// The implementation instances of `class` currently run for `meta`
    fn current_implementation(&self, class: ClassId, meta: &MethodMeta) -> BridgeResult<JsValue> {
        let runtime = self.runtime();
        let sel = runtime.sel(&meta.selector);
        let mut current = Some(class);
        while let Some(c) = current {
            if runtime.has_own_method(c, sel, MethodKind::Instance) {
                if let Some(function) = self.script_methods.borrow().get(&(c, sel)) {
                    return Ok(JsValue::Object(function.clone()));
                }
                break;
            }
            current = runtime.superclass(c);
        }
        let entry = runtime
            .lookup_method(class, sel, MethodKind::Instance)
            .ok_or_else(|| {
                BridgeError::Type(format!(
                    "{} does not implement {}",
                    runtime.class_name(class),
                    meta.selector
                ))
            })?;
        Ok(self.bound_implementation(entry, meta.clone()))
    }

    /// A native implementation as a function called with the receiver as
    /// `this`
    fn bound_implementation(&self, entry: MethodEntry, meta: MethodMeta) -> JsValue {
        let weak = self.weak();
        let arity = entry.layout.explicit_arg_count();
        let name = meta.js_name.clone();
        let function = JsObject::function(&name, move |this, args| {
            let Some(bridge) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            bridge
                .call_implementation(&entry, &meta, this, args)
                .map_err(|e| bridge.to_js_error(e))
        });
        function.set("length", JsValue::from(arity as f64));
        JsValue::Object(function)
    }

    /// `Class.prototype[name]`: the current implementation of an instance
    /// method as a callable value
    pub fn prototype_get(&self, class: &ClassWrapper, name: &str) -> BridgeResult<JsValue> {
        if let Some(meta) = self.prototype_declarations(class.class(), name).first() {
            return self.current_implementation(class.class(), meta);
        }
        for extension in self.extension_chain(class.class()) {
            if let Some(PropertySlot::Data(value)) = extension.methods.get_own_property(name) {
                return Ok(value);
            }
        }
        Ok(JsValue::Undefined)
    }

    /// `Class.prototype[name] = function`: install a new layer for every
    /// native declaration `name` names
    pub fn prototype_set(&self, class: &ClassWrapper, name: &str, value: &JsValue) -> BridgeResult<()> {
        let function = function_argument(value, name)?;
        let declarations = self.prototype_declarations(class.class(), name);
        let extension = self.extensions.borrow().get(&class.class()).cloned();
        if declarations.is_empty() {
            let extension = extension.ok_or_else(|| {
                BridgeError::Type(format!("{}.prototype.{} is not a native method", class.name(), name))
            })?;
            extension.methods.set(name, value.clone());
            return Ok(());
        }
        for meta in &declarations {
            self.install_script_method(class.class(), meta, function)?;
        }
        if let Some(extension) = extension {
            if extension.methods.has(name) {
                extension.methods.set(name, value.clone());
            }
        }
        tracing::debug!(class = %class.name(), name, "swizzled method");
        Ok(())
    }

    /// The current accessor pair of property `name` as `{ get, set }`
    pub fn prototype_get_accessor(&self, class: &ClassWrapper, name: &str) -> BridgeResult<JsValue> {
        let descriptor = JsObject::new();
        if let Some(property) = self.prototype_property(class.class(), name) {
            descriptor.set("get", self.current_implementation(class.class(), &property.getter_method())?);
            let set = match property.setter_method() {
                Some(meta) => self.current_implementation(class.class(), &meta)?,
                None => JsValue::Undefined,
            };
            descriptor.set("set", set);
            return Ok(JsValue::Object(descriptor));
        }
        for extension in self.extension_chain(class.class()) {
            if let Some(PropertySlot::Accessor { get, set }) = extension.methods.get_own_property(name) {
                descriptor.set("get", get.unwrap_or_default());
                descriptor.set("set", set.unwrap_or_default());
                return Ok(JsValue::Object(descriptor));
            }
        }
        Ok(JsValue::Undefined)
    }

    /// Replace the accessors of property `name`. A missing side keeps its
    /// current implementation.
    pub fn prototype_define_accessor(
        &self,
        class: &ClassWrapper,
        name: &str,
        get: Option<&JsValue>,
        set: Option<&JsValue>,
    ) -> BridgeResult<()> {
        let getter = get.filter(|v| !v.is_nullish()).map(|v| function_argument(v, name)).transpose()?;
        let setter = set.filter(|v| !v.is_nullish()).map(|v| function_argument(v, name)).transpose()?;
        let extension = self.extensions.borrow().get(&class.class()).cloned();
        let Some(property) = self.prototype_property(class.class(), name) else {
            let extension = extension.ok_or_else(|| {
                BridgeError::Type(format!("{}.prototype.{} is not a native property", class.name(), name))
            })?;
            extension
                .methods
                .define_accessor(name, getter.cloned().map(JsValue::Object), setter.cloned().map(JsValue::Object));
            return Ok(());
        };
        if let Some(getter) = getter {
            self.install_script_method(class.class(), &property.getter_method(), getter)?;
        }
        match (setter, property.setter_method()) {
            (Some(setter), Some(meta)) => self.install_script_method(class.class(), &meta, setter)?,
            (Some(_), None) => {
                return Err(BridgeError::Type(format!(
                    "Attempted to assign a setter to readonly property \"{}\"",
                    name
                )))
            }
            (None, _) => {}
        }
        tracing::debug!(class = %class.name(), name, "swizzled property");
        Ok(())
    }
}
