//! Script subclasses of native classes
//!
//! `Base.extend(methods, config)` registers a new runtime class below
//! `Base`. Entries of the method map that name a native method or property
//! of the base chain (or of a declared protocol) replace the native
//! implementation in the new class's dispatch table; the rest stay
//! script-only and are found through the extension record. Every
//! synthesized class gets a `dealloc` that runs the script teardown hook,
//! if any, before the inherited `dealloc` chain.

mod swizzle;

pub use swizzle::PrototypeWrapper;

use std::rc::Rc;

use jsobjc_sdk::{JsObject, JsValue, PropertySlot};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::{ClassWrapper, ObjcWrapper, ProtocolWrapper};
use crate::metadata::names::selector_for_exposed;
use crate::metadata::{ClassMeta, MethodFlags, MethodKind, MethodMeta};
use crate::objc::{ClassId, Id, MethodEntry, NativeCall, NativeException};

/// A class synthesized by `extend`
#[derive(Debug)]
pub(crate) struct ClassExtension {
    /// The method map as given, updated by swizzles on script-only names
    pub methods: JsObject,
    /// The `dealloc` entry of the method map
    pub teardown: Option<JsObject>,
}

/// Recognized options of the second `extend` argument
#[derive(Debug, Default)]
struct ExtendConfig {
    name: Option<String>,
    protocols: Vec<Rc<str>>,
    exposed: Vec<MethodMeta>,
}

impl Bridge {
    fn extend_config(&self, config: &JsValue) -> BridgeResult<ExtendConfig> {
        let object = match config {
            JsValue::Undefined | JsValue::Null => return Ok(ExtendConfig::default()),
            JsValue::Object(o) if o.is_ordinary() => o,
            other => {
                return Err(BridgeError::Type(format!(
                    "{} is not a valid class configuration",
                    other.to_js_string()
                )))
            }
        };
        let mut parsed = ExtendConfig::default();
        match object.get("name") {
            JsValue::Undefined | JsValue::Null => {}
            JsValue::String(name) if !name.is_empty() => parsed.name = Some(name.to_string()),
            other => {
                return Err(BridgeError::Type(format!(
                    "{} is not a valid class name",
                    other.to_js_string()
                )))
            }
        }
        if let Some(protocols) = object.get("protocols").as_object() {
            for value in protocols.array_elements().unwrap_or_default() {
                let name = match &value {
                    JsValue::String(s) => s.clone(),
                    JsValue::Object(o) => match o.host_data::<ProtocolWrapper>() {
                        Some(p) => p.name().clone(),
                        None => return Err(BridgeError::Type(format!("{} is not a protocol", value.to_js_string()))),
                    },
                    _ => return Err(BridgeError::Type(format!("{} is not a protocol", value.to_js_string()))),
                };
                parsed.protocols.push(name);
            }
        }
        if let Some(exposed) = object.get("exposedMethods").as_object() {
            for name in exposed.keys() {
                parsed.exposed.push(self.exposed_method(&name, &exposed.get(&name))?);
            }
        }
        Ok(parsed)
    }

    /// `exposedMethods.<name> = { returns, params }` as a method declaration
    fn exposed_method(&self, name: &str, signature: &JsValue) -> BridgeResult<MethodMeta> {
        let object = signature.as_object().ok_or_else(|| {
            BridgeError::Type(format!("Exposed method \"{}\" needs a signature object", name))
        })?;
        let type_of = |value: &JsValue| {
            self.type_argument(value).ok_or_else(|| {
                BridgeError::Type(format!(
                    "{} is not a valid type in the signature of \"{}\"",
                    value.to_js_string(),
                    name
                ))
            })
        };
        let returns = match object.get("returns") {
            JsValue::Undefined => "v".to_string(),
            value => type_of(&value)?.encode(),
        };
        let params = object
            .get("params")
            .as_object()
            .and_then(|p| p.array_elements())
            .unwrap_or_default();
        let mut encoding = format!("{}@:", returns);
        for param in &params {
            encoding.push_str(&type_of(param)?.encode());
        }
        let selector = selector_for_exposed(name, params.len());
        Ok(MethodMeta::instance(&selector, &encoding).named(name))
    }

    fn extension_name(&self, base: &ClassWrapper, requested: Option<&str>) -> String {
        let runtime = self.runtime();
        if let Some(name) = requested {
            if runtime.class_named(name).is_none() {
                return name.to_string();
            }
        }
        let prefix = match requested {
            Some(name) => name.to_string(),
            None => format!("{}_", base.name()),
        };
        let mut n = 1usize;
        loop {
            let candidate = format!("{}{}", prefix, n);
            if runtime.class_named(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    /// `Base.extend(methods, config)`: register a subclass of `base` and
    /// return its constructor value
    pub fn extend(&self, base: &ClassWrapper, methods: &JsValue, config: &JsValue) -> BridgeResult<JsValue> {
        let methods = match methods {
            JsValue::Object(o) if o.is_ordinary() => o.clone(),
            other => {
                return Err(BridgeError::Type(format!(
                    "{} is not a valid method map",
                    other.to_js_string()
                )))
            }
        };
        let config = self.extend_config(config)?;
        let name = self.extension_name(base, config.name.as_deref());
        let runtime = self.runtime();
        let class = runtime.register_class(&name, Some(base.class()), config.protocols.clone())?;

        let mut meta = ClassMeta::new(&name).superclass(&self.metadata_class_name(base.class()));
        for protocol in &config.protocols {
            meta = meta.protocol(protocol);
        }
        for exposed in &config.exposed {
            meta = meta.method(exposed.clone());
        }
        self.registry.borrow_mut().register_class(meta);

        let mut teardown = None;
        for key in methods.keys() {
            match methods.get_own_property(&key) {
                Some(PropertySlot::Data(JsValue::Object(function))) if function.is_function() => {
                    if &*key == "dealloc" {
                        teardown = Some(function);
                    } else {
                        self.override_method(class, &name, &key, &function)?;
                    }
                }
                Some(PropertySlot::Accessor { get, set }) => {
                    self.override_property(class, &name, &key, get.as_ref(), set.as_ref())?;
                }
                _ => {}
            }
        }
        self.install_dealloc(class)?;
        self.extensions
            .borrow_mut()
            .insert(class, Rc::new(ClassExtension { methods, teardown }));
        tracing::debug!(class = %name, base = %base.name(), "extended native class");
        Ok(JsValue::Object(self.class_value(class)))
    }

    /// Install `function` for every native declaration `js_name` names
    fn override_method(&self, class: ClassId, class_name: &str, js_name: &str, function: &JsObject) -> BridgeResult<()> {
        let declarations = self
            .registry
            .borrow()
            .lookup_methods(class_name, &[], js_name, MethodKind::Instance);
        for meta in declarations {
            self.install_script_method(class, &meta, function)?;
        }
        Ok(())
    }

    fn override_property(
        &self,
        class: ClassId,
        class_name: &str,
        name: &str,
        get: Option<&JsValue>,
        set: Option<&JsValue>,
    ) -> BridgeResult<()> {
        let Some(property) = self.registry.borrow().lookup_property(class_name, &[], name) else {
            return Ok(());
        };
        if let Some(getter) = get.and_then(JsValue::as_object).filter(|f| f.is_function()) {
            self.install_script_method(class, &property.getter_method(), getter)?;
        }
        if let (Some(setter), Some(meta)) = (
            set.and_then(JsValue::as_object).filter(|f| f.is_function()),
            property.setter_method(),
        ) {
            self.install_script_method(class, &meta, setter)?;
        }
        Ok(())
    }

    /// Replace `class`'s own implementation of `meta` with a trampoline
    /// into `function`
    pub(crate) fn install_script_method(&self, class: ClassId, meta: &MethodMeta, function: &JsObject) -> BridgeResult<()> {
        let layout = self.method_layout(meta)?;
        let error_out = meta.flags.contains(MethodFlags::HAS_ERROR_OUT_PARAM);
        let entry = self.script_entry(function, layout, Some(class), error_out);
        let runtime = self.runtime();
        let sel = runtime.sel(&meta.selector);
        runtime.replace_method(class, sel, meta.kind, entry);
        self.script_methods.borrow_mut().insert((class, sel), function.clone());
        tracing::trace!(class = %runtime.class_name(class), selector = &*meta.selector, "installed script method");
        Ok(())
    }

    fn install_dealloc(&self, class: ClassId) -> BridgeResult<()> {
        let layout = self.layout("v@:", 2)?;
        let weak = self.weak();
        let entry = MethodEntry::new(layout, move |call: &NativeCall<'_>| {
            let receiver = call.receiver();
            if let Some(bridge) = weak.upgrade() {
                bridge.run_teardown(class, receiver)?;
            }
            call.runtime().send_super(receiver, class, "dealloc", |_| {}).map(|_| ())
        });
        let runtime = self.runtime();
        runtime.replace_method(class, runtime.sel("dealloc"), MethodKind::Instance, entry);
        Ok(())
    }

    /// Run the teardown hook of `class` for a receiver that still has a
    /// wrapper
    fn run_teardown(&self, class: ClassId, receiver: Id) -> Result<(), NativeException> {
        let hook = self
            .extensions
            .borrow()
            .get(&class)
            .and_then(|e| e.teardown.clone());
        let (Some(hook), Some(wrapper)) = (hook, self.objects.lookup(receiver)) else {
            return Ok(());
        };
        self.call_stack.push_implementation(class);
        let result = hook.call(&JsValue::Object(wrapper), &[]);
        self.call_stack.pop_implementation();
        match result {
            Ok(_) => Ok(()),
            Err(e) if self.call_stack.depth() == 0 => {
                self.report_uncaught(e);
                Ok(())
            }
            Err(e) => Err(NativeException::from_script(e)),
        }
    }

    /// Synthesized classes in the chain of `class`, most-derived first
    pub(crate) fn extension_chain(&self, class: ClassId) -> Vec<Rc<ClassExtension>> {
        let runtime = self.runtime();
        let extensions = self.extensions.borrow();
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(extension) = extensions.get(&c) {
                chain.push(extension.clone());
            }
            current = runtime.superclass(c);
        }
        chain
    }

    /// `super.name(...args)` from a script implementation running on `this`.
    ///
    /// The lookup starts above the class whose implementation is running;
    /// outside one it starts above the nearest synthesized class of the
    /// receiver.
    pub fn call_super(&self, this: &JsValue, name: &str, args: &[JsValue]) -> BridgeResult<JsValue> {
        let wrapper = this
            .as_object()
            .and_then(|o| o.host_data::<ObjcWrapper>())
            .ok_or_else(|| BridgeError::Type(format!("{} is not a native object", this.to_js_string())))?;
        let receiver = wrapper.handle();
        let runtime = self.runtime();
        let class = self
            .call_stack
            .implementing_class()
            .filter(|c| runtime.is_kind_of(receiver, *c))
            .or_else(|| {
                let extensions = self.extensions.borrow();
                let mut current = Some(wrapper.class());
                while let Some(c) = current {
                    if extensions.contains_key(&c) {
                        return Some(c);
                    }
                    current = runtime.superclass(c);
                }
                None
            })
            .unwrap_or_else(|| wrapper.class());
        let Some(superclass) = runtime.superclass(class) else {
            return Err(BridgeError::Type(format!("super.{} is not a function", name)));
        };
        let super_name = self.metadata_class_name(superclass);
        let candidates = self
            .registry
            .borrow()
            .lookup_methods(&super_name, wrapper.protocols(), name, MethodKind::Instance);
        if candidates.is_empty() {
            return Err(BridgeError::Type(format!("super.{} is not a function", name)));
        }
        let resolved = self.resolve_overload(&candidates, args, "method", name, false)?;
        self.invoke_super(receiver, class, &resolved.meta, &resolved.args)
    }
}
