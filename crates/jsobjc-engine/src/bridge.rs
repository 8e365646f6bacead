//! The bridge
//!
//! One [`Bridge`] per isolate. It owns the simulated native runtime, the
//! metadata registry and every cache that gives native things a stable
//! script identity (class values, struct types, pointers, wrappers), and it
//! is the entry point for property access on bridge values: the scripting
//! layer routes `get`, `set`, `new` and global lookups through here.

use std::cell::{OnceCell, RefCell};
use std::rc::{Rc, Weak};

use jsobjc_sdk::{JsObject, JsValue, PropertySlot, WeakJsObject};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abi::CallLayout;
use crate::class_builder::{ClassExtension, PrototypeWrapper};
use crate::encoding::{Abi, Signature, StructCache, TypeDecoder, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::exception::UncaughtHandler;
use crate::interop::{InteropConstructor, Pointer, Reference, Unmanaged};
use crate::invoke::{CallStack, Invocation};
use crate::lifetime::{ClassWrapper, ObjcWrapper, ObjectManager, ProtocolWrapper};
use crate::marshal::{StructType, StructValue};
use crate::memory::NativeAllocation;
use crate::metadata::{
    ClassMeta, FunctionMeta, MetadataRegistry, MethodKind, MethodMeta, PropertyMeta, ProtocolMeta,
    StructMeta,
};
use crate::objc::{foundation, ClassId, Id, Imp, MethodEntry, NativeCall, NativeException, NativeRuntime, Sel};

const POINTER_METHODS: &[&str] = &["add", "subtract", "toString", "toHexString", "toDecimalString", "toNumber"];
const UNMANAGED_METHODS: &[&str] = &["takeRetainedValue", "takeUnretainedValue"];
const INVOCATION_METHODS: &[&str] = &[
    "setTarget",
    "target",
    "setSelector",
    "selector",
    "setArgumentAtIndex",
    "invoke",
    "returnValue",
];

/// Behavior switches for a bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Reject fractional and out-of-range numbers passed for integer
    /// parameters instead of truncating them
    pub strict_integers: bool,
}

/// A native class: its metadata plus the implementations to install.
///
/// Declarations and implementations are separate so a class can declare
/// a property whose accessors are implemented one by one, or implement a
/// selector metadata never mentions.
pub struct NativeClassDef {
    meta: ClassMeta,
    implementations: Vec<(MethodMeta, Imp)>,
}

impl NativeClassDef {
    /// Start a class definition
    pub fn new(name: &str) -> Self {
        Self {
            meta: ClassMeta::new(name),
            implementations: Vec::new(),
        }
    }

    /// Set the superclass
    pub fn superclass(mut self, name: &str) -> Self {
        self.meta = self.meta.superclass(name);
        self
    }

    /// Adopt a protocol
    pub fn protocol(mut self, name: &str) -> Self {
        self.meta = self.meta.protocol(name);
        self
    }

    /// Declare and implement a method
    pub fn method(
        mut self,
        meta: MethodMeta,
        imp: impl Fn(&NativeCall<'_>) -> Result<(), NativeException> + 'static,
    ) -> Self {
        self.implementations.push((meta.clone(), Rc::new(imp)));
        self.meta = self.meta.method(meta);
        self
    }

    /// Declare a method without implementing it
    pub fn declare(mut self, meta: MethodMeta) -> Self {
        self.meta = self.meta.method(meta);
        self
    }

    /// Declare a property
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.meta = self.meta.property(property);
        self
    }

    /// Implement a selector without declaring it
    pub fn implementation(
        mut self,
        meta: MethodMeta,
        imp: impl Fn(&NativeCall<'_>) -> Result<(), NativeException> + 'static,
    ) -> Self {
        self.implementations.push((meta, Rc::new(imp)));
        self
    }
}

impl std::fmt::Debug for NativeClassDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeClassDef")
            .field("meta", &self.meta)
            .field("implementations", &self.implementations.len())
            .finish()
    }
}

/// Per-isolate bridge state
pub struct Bridge {
    options: BridgeOptions,
    abi: Abi,
    runtime: NativeRuntime,
    weak_self: Weak<Bridge>,
    pub(crate) registry: RefCell<MetadataRegistry>,
    pub(crate) structs: StructCache,
    signatures: RefCell<FxHashMap<Rc<str>, Rc<Signature>>>,
    layouts: RefCell<FxHashMap<(Rc<str>, usize), Rc<CallLayout>>>,
    pub(crate) objects: ObjectManager,
    pub(crate) call_stack: CallStack,
    pub(crate) class_values: RefCell<FxHashMap<ClassId, JsObject>>,
    pub(crate) prototype_values: RefCell<FxHashMap<ClassId, JsObject>>,
    pub(crate) protocol_values: RefCell<FxHashMap<Rc<str>, JsObject>>,
    pub(crate) struct_types: RefCell<FxHashMap<Rc<str>, JsObject>>,
    pub(crate) pointers: RefCell<FxHashMap<usize, WeakJsObject>>,
    pub(crate) types_object: OnceCell<JsObject>,
    pub(crate) uncaught: RefCell<Option<Box<UncaughtHandler>>>,
    pub(crate) script_blocks: RefCell<FxHashMap<Id, WeakJsObject>>,
    /// Trampoline address per live script function, keyed by object id
    pub(crate) function_pointers: RefCell<FxHashMap<usize, (WeakJsObject, usize)>>,
    pub(crate) extensions: RefCell<FxHashMap<ClassId, Rc<ClassExtension>>>,
    pub(crate) script_methods: RefCell<FxHashMap<(ClassId, Sel), JsObject>>,
    method_functions: RefCell<FxHashMap<String, JsObject>>,
    function_values: RefCell<FxHashMap<Rc<str>, JsObject>>,
    deferred: RefCell<Vec<NativeAllocation>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("options", &self.options)
            .field("abi", &self.abi)
            .field("runtime", &self.runtime)
            .field("live_wrappers", &self.objects.live_wrappers())
            .finish()
    }
}

impl Bridge {
    /// Create a bridge with the built-in Foundation classes installed
    pub fn new(options: BridgeOptions) -> BridgeResult<Rc<Bridge>> {
        let bridge = Rc::new_cyclic(|weak_self| Bridge {
            options,
            abi: Abi::host(),
            runtime: NativeRuntime::new(),
            weak_self: weak_self.clone(),
            registry: RefCell::new(MetadataRegistry::new()),
            structs: StructCache::new(),
            signatures: RefCell::new(FxHashMap::default()),
            layouts: RefCell::new(FxHashMap::default()),
            objects: ObjectManager::new(),
            call_stack: CallStack::new(),
            class_values: RefCell::new(FxHashMap::default()),
            prototype_values: RefCell::new(FxHashMap::default()),
            protocol_values: RefCell::new(FxHashMap::default()),
            struct_types: RefCell::new(FxHashMap::default()),
            pointers: RefCell::new(FxHashMap::default()),
            types_object: OnceCell::new(),
            uncaught: RefCell::new(None),
            script_blocks: RefCell::new(FxHashMap::default()),
            function_pointers: RefCell::new(FxHashMap::default()),
            extensions: RefCell::new(FxHashMap::default()),
            script_methods: RefCell::new(FxHashMap::default()),
            method_functions: RefCell::new(FxHashMap::default()),
            function_values: RefCell::new(FxHashMap::default()),
            deferred: RefCell::new(Vec::new()),
        });
        foundation::install(&bridge)?;
        debug!(abi = ?bridge.abi, "bridge ready");
        Ok(bridge)
    }

    /// Options the bridge was created with
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Target architecture for layouts
    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// The native runtime
    pub fn runtime(&self) -> &NativeRuntime {
        &self.runtime
    }

    pub(crate) fn weak(&self) -> Weak<Bridge> {
        self.weak_self.clone()
    }

    /// Number of wrappers currently paired with a native object
    pub fn live_wrappers(&self) -> usize {
        self.objects.live_wrappers()
    }

    /// Keep allocations alive until the current outermost call returns
    pub(crate) fn defer_allocations(&self, allocations: Vec<NativeAllocation>) {
        if !allocations.is_empty() {
            self.deferred.borrow_mut().extend(allocations);
        }
    }

    /// Free allocations handed to native code by callbacks that have
    /// since returned
    pub fn collect_deferred(&self) {
        let freed = std::mem::take(&mut *self.deferred.borrow_mut());
        if !freed.is_empty() {
            debug!(count = freed.len(), "freed deferred callback allocations");
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Declare a struct
    pub fn define_struct(&self, meta: StructMeta) {
        self.registry.borrow_mut().register_struct(meta);
    }

    /// Declare a protocol and create its runtime object
    pub fn define_protocol(&self, meta: ProtocolMeta) {
        let name = meta.name.clone();
        self.registry.borrow_mut().register_protocol(meta);
        self.runtime.protocol_object(&name);
    }

    /// Register (or extend) a native class and install its implementations.
    /// Installing over a script layer drops that layer.
    pub fn define_class(&self, def: NativeClassDef) -> BridgeResult<ClassId> {
        let NativeClassDef { meta, implementations } = def;
        let runtime = &self.runtime;
        let class = match runtime.class_named(&meta.name) {
            Some(class) => {
                for protocol in &meta.protocols {
                    runtime.add_protocol(class, protocol);
                }
                class
            }
            None => {
                let superclass = match meta.superclass.as_deref() {
                    Some(name) => Some(runtime.class_named(name).ok_or_else(|| {
                        BridgeError::Metadata(format!(
                            "Superclass \"{}\" of \"{}\" is not defined",
                            name, meta.name
                        ))
                    })?),
                    None => None,
                };
                runtime.register_class(&meta.name, superclass, meta.protocols.clone())?
            }
        };

        let name = meta.name.clone();
        let merged = match self.registry.borrow().find_class(&name).cloned() {
            Some(mut existing) => {
                existing.protocols.extend(meta.protocols);
                existing.methods.extend(meta.methods);
                existing.properties.extend(meta.properties);
                if existing.superclass.is_none() {
                    existing.superclass = meta.superclass;
                }
                existing
            }
            None => meta,
        };
        self.registry.borrow_mut().register_class(merged);

        let count = implementations.len();
        for (method, imp) in implementations {
            let layout = self.method_layout(&method)?;
            let sel = runtime.sel(&method.selector);
            runtime.replace_method(class, sel, method.kind, MethodEntry { imp, layout });
            self.script_methods.borrow_mut().remove(&(class, sel));
        }
        debug!(class = %name, methods = count, "defined native class");
        Ok(class)
    }

    /// Declare a C function and export its implementation
    pub fn define_function(
        &self,
        meta: FunctionMeta,
        imp: impl Fn(&NativeCall<'_>) -> Result<(), NativeException> + 'static,
    ) -> BridgeResult<()> {
        let layout = self.layout(&meta.encoding, 0)?;
        self.runtime.register_function(&meta.name, MethodEntry::new(layout, imp));
        self.declare_function(meta);
        Ok(())
    }

    /// Declare a C function whose symbol may be exported later
    pub fn declare_function(&self, meta: FunctionMeta) {
        self.function_values.borrow_mut().remove(&meta.name);
        self.registry.borrow_mut().register_function(meta);
    }

    // ------------------------------------------------------------------
    // Types and layouts
    // ------------------------------------------------------------------

    /// Decode a single type encoding
    pub fn decode_type(&self, encoding: &str) -> BridgeResult<TypeDescriptor> {
        let registry = self.registry.borrow();
        TypeDecoder::new(&registry, &self.structs, self.abi).decode(encoding)
    }

    /// Decode a signature encoding (return type first). Cached per encoding.
    pub fn signature(&self, encoding: &str) -> BridgeResult<Rc<Signature>> {
        if let Some(existing) = self.signatures.borrow().get(encoding) {
            return Ok(existing.clone());
        }
        let decoded = {
            let registry = self.registry.borrow();
            TypeDecoder::new(&registry, &self.structs, self.abi).decode_signature(encoding)?
        };
        let signature = Rc::new(decoded);
        self.signatures
            .borrow_mut()
            .insert(Rc::from(encoding), signature.clone());
        Ok(signature)
    }

    /// Call layout of an encoding with `implicit_args` leading hidden
    /// arguments (2 for methods, 1 for blocks, 0 for functions)
    pub fn layout(&self, encoding: &str, implicit_args: usize) -> BridgeResult<Rc<CallLayout>> {
        let signature = self.signature(encoding)?;
        Ok(self.signature_layout(signature, implicit_args))
    }

    pub(crate) fn signature_layout(&self, signature: Rc<Signature>, implicit_args: usize) -> Rc<CallLayout> {
        let key: (Rc<str>, usize) = (Rc::from(signature.encode()), implicit_args);
        if let Some(existing) = self.layouts.borrow().get(&key) {
            return existing.clone();
        }
        let layout = Rc::new(CallLayout::new(signature, implicit_args, self.abi));
        debug!(encoding = %key.0, implicit_args, "computed call layout");
        self.layouts.borrow_mut().insert(key, layout.clone());
        layout
    }

    // ------------------------------------------------------------------
    // Script-facing values
    // ------------------------------------------------------------------

    /// A script function backed by `f`. Errors are thrown with the bridge
    /// call stack attached.
    pub fn script_function<F>(&self, name: &str, f: F) -> JsValue
    where
        F: Fn(&Bridge, &JsValue, &[JsValue]) -> BridgeResult<JsValue> + 'static,
    {
        let weak = self.weak();
        let symbol: Rc<str> = Rc::from(name);
        JsValue::Object(JsObject::function(name, move |this, args| {
            let Some(strong) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            let bridge: &Bridge = &strong;
            bridge
                .in_frame(&symbol, || f(bridge, this, args))
                .map_err(|e| bridge.to_js_error(e))
        }))
    }

    /// The global value metadata gives `name`: a class, a protocol, a
    /// struct constructor or a function
    pub fn global(&self, name: &str) -> Option<JsValue> {
        if name == "interop" {
            return Some(JsValue::Object(self.interop_object()));
        }
        if let Some(class) = self.runtime.class_named(name) {
            return Some(JsValue::Object(self.class_value(class)));
        }
        if self.registry.borrow().find_protocol(name).is_some() {
            return Some(JsValue::Object(self.protocol_value(name)));
        }
        if self.registry.borrow().find_struct(name).is_some() {
            return match self.decode_type(&format!("{{{}}}", name)) {
                Ok(TypeDescriptor::Struct(layout)) => Some(JsValue::Object(self.struct_type_value(layout))),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(name, error = %e, "struct declaration does not decode");
                    None
                }
            };
        }
        let function = self.registry.borrow().find_function(name).cloned();
        function.map(|meta| JsValue::Object(self.function_value(&meta)))
    }

    fn function_value(&self, meta: &FunctionMeta) -> JsObject {
        if let Some(existing) = self.function_values.borrow().get(&meta.name) {
            return existing.clone();
        }
        let weak = self.weak();
        let name = meta.name.clone();
        let function = JsObject::function(&meta.name, move |_, args| {
            let Some(bridge) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            bridge.call_function(&name, args).map_err(|e| bridge.to_js_error(e))
        });
        if let Ok(layout) = self.layout(&meta.encoding, 0) {
            function.set("length", JsValue::from(layout.explicit_arg_count() as f64));
        }
        self.function_values
            .borrow_mut()
            .insert(meta.name.clone(), function.clone());
        function
    }

    /// A cached function that calls the native method `name` on `this`
    fn method_function(&self, name: &str, arity: usize) -> JsValue {
        let key = format!("{}/{}", name, arity);
        if let Some(existing) = self.method_functions.borrow().get(&key) {
            return JsValue::Object(existing.clone());
        }
        let weak = self.weak();
        let method: Rc<str> = Rc::from(name);
        let function = JsObject::function(name, move |this, args| {
            let Some(bridge) = weak.upgrade() else {
                return Ok(JsValue::Undefined);
            };
            bridge.call_method(this, &method, args).map_err(|e| bridge.to_js_error(e))
        });
        function.set("length", JsValue::from(arity as f64));
        self.method_functions.borrow_mut().insert(key, function.clone());
        JsValue::Object(function)
    }

    /// A cached function for a method of a host value (pointers,
    /// invocations, class values)
    fn host_function(&self, name: &str) -> JsValue {
        let key = format!("host:{}", name);
        if let Some(existing) = self.method_functions.borrow().get(&key) {
            return JsValue::Object(existing.clone());
        }
        let method: Rc<str> = Rc::from(name);
        let function = match self.script_function(name, move |b, this, args| b.host_call(this, &method, args)) {
            JsValue::Object(function) => function,
            _ => JsObject::new(),
        };
        self.method_functions.borrow_mut().insert(key, function.clone());
        JsValue::Object(function)
    }

    fn host_call(&self, this: &JsValue, name: &str, args: &[JsValue]) -> BridgeResult<JsValue> {
        let not_a_function = || BridgeError::Type(format!("{}.{} is not a function", this.to_js_string(), name));
        let object = this.as_object().ok_or_else(not_a_function)?;
        if let Some(pointer) = object.host_data::<Pointer>() {
            if let Some(result) = self.pointer_method(&pointer, name, args) {
                return result;
            }
        }
        if let Some(unmanaged) = object.host_data::<Unmanaged>() {
            if let Some(result) = self.unmanaged_method(&unmanaged, name) {
                return result;
            }
        }
        if let Some(invocation) = object.host_data::<Invocation>() {
            if let Some(result) = self.invocation_method(&invocation, name, args) {
                return result;
            }
        }
        if let Some(class) = object.host_data::<ClassWrapper>() {
            if name == "extend" {
                let first = args.first().cloned().unwrap_or_default();
                let second = args.get(1).cloned().unwrap_or_default();
                return self.extend(&class, &first, &second);
            }
        }
        if let Some(struct_type) = object.host_data::<StructType>() {
            if name == "equals" {
                let first = args.first().cloned().unwrap_or_default();
                let second = args.get(1).cloned().unwrap_or_default();
                return self
                    .struct_equals(struct_type.layout(), &first, &second)
                    .map(JsValue::Bool);
            }
        }
        if name == "toString" {
            return Ok(JsValue::string(match object.host_object() {
                Some(host) => host.display(),
                None => object.display_string(),
            }));
        }
        Err(not_a_function())
    }

    // ------------------------------------------------------------------
    // Property access
    // ------------------------------------------------------------------

    /// Read an own property, running an accessor getter with `this`
    fn own_property(&self, this: &JsValue, object: &JsObject, name: &str) -> BridgeResult<Option<JsValue>> {
        match object.get_own_property(name) {
            Some(PropertySlot::Data(value)) => Ok(Some(value)),
            Some(PropertySlot::Accessor { get: Some(getter), .. }) => call_script(&getter, this, &[]).map(Some),
            Some(PropertySlot::Accessor { get: None, .. }) => Ok(Some(JsValue::Undefined)),
            None => Ok(None),
        }
    }

    /// `target[name]` for any value the bridge hands out
    pub fn get(&self, target: &JsValue, name: &str) -> BridgeResult<JsValue> {
        let object = match target {
            JsValue::Object(object) => object,
            JsValue::Undefined | JsValue::Null => {
                return Err(BridgeError::Type(format!(
                    "Cannot read property \"{}\" of {}",
                    name,
                    target.to_js_string()
                )))
            }
            _ => return Ok(JsValue::Undefined),
        };
        if let Some(wrapper) = object.host_data::<ObjcWrapper>() {
            return self.instance_get(target, object, &wrapper, name);
        }
        if let Some(class) = object.host_data::<ClassWrapper>() {
            return self.class_get(target, object, &class, name);
        }
        if let Some(prototype) = object.host_data::<PrototypeWrapper>() {
            return self.prototype_get(prototype.class(), name);
        }
        if let Some(value) = object.host_data::<StructValue>() {
            if let Some(result) = self.struct_field(object, &value, name) {
                return result;
            }
        }
        if object.host_data::<StructType>().is_some() && name == "equals" {
            return Ok(self.host_function(name));
        }
        if let Some(reference) = object.host_data::<Reference>() {
            if name == "value" {
                return self.reference_value(&reference);
            }
            if let Ok(index) = name.parse::<usize>() {
                return self.reference_index(&reference, index);
            }
        }
        let host_methods: &[&str] = if object.host_data::<Pointer>().is_some() {
            POINTER_METHODS
        } else if object.host_data::<Unmanaged>().is_some() {
            UNMANAGED_METHODS
        } else if object.host_data::<Invocation>().is_some() {
            INVOCATION_METHODS
        } else {
            &[]
        };
        if host_methods.contains(&name) {
            return Ok(self.host_function(name));
        }
        if let Some(value) = self.own_property(target, object, name)? {
            return Ok(value);
        }
        if name == "toString" && object.host_object().is_some() {
            return Ok(self.host_function(name));
        }
        Ok(object.get(name))
    }

    fn instance_get(&self, this: &JsValue, object: &JsObject, wrapper: &ObjcWrapper, name: &str) -> BridgeResult<JsValue> {
        if let Some(value) = self.own_property(this, object, name)? {
            return Ok(value);
        }
        for extension in self.extension_chain(wrapper.class()) {
            if let Some(value) = self.own_property(this, &extension.methods, name)? {
                return Ok(value);
            }
        }
        let class_name = self.metadata_class_name(wrapper.class());
        let property = self
            .registry
            .borrow()
            .lookup_property(&class_name, wrapper.protocols(), name);
        if let Some(property) = property {
            return self.invoke_method(this, wrapper.handle(), &property.getter_method(), &[]);
        }
        let arity = self
            .registry
            .borrow()
            .lookup_methods(&class_name, wrapper.protocols(), name, MethodKind::Instance)
            .iter()
            .map(|m| m.selector.matches(':').count())
            .max();
        if let Some(arity) = arity {
            return Ok(self.method_function(name, arity));
        }
        if name == "toString" {
            return Ok(self.host_function(name));
        }
        Ok(JsValue::Undefined)
    }

    fn class_get(&self, this: &JsValue, object: &JsObject, class: &ClassWrapper, name: &str) -> BridgeResult<JsValue> {
        if let Some(value) = self.own_property(this, object, name)? {
            return Ok(value);
        }
        match name {
            "extend" | "toString" => return Ok(self.host_function(name)),
            "name" => return Ok(JsValue::string(&**class.name())),
            "prototype" => return Ok(JsValue::Object(self.prototype_value(class))),
            _ => {}
        }
        let class_name = self.metadata_class_name(class.class());
        let arity = self
            .registry
            .borrow()
            .lookup_methods(&class_name, &[], name, MethodKind::Class)
            .iter()
            .map(|m| m.selector.matches(':').count())
            .max();
        Ok(arity.map_or(JsValue::Undefined, |arity| self.method_function(name, arity)))
    }

    /// `target[name] = value`
    pub fn set(&self, target: &JsValue, name: &str, value: &JsValue) -> BridgeResult<()> {
        let object = match target {
            JsValue::Object(object) => object,
            JsValue::Undefined | JsValue::Null => {
                return Err(BridgeError::Type(format!(
                    "Cannot set property \"{}\" of {}",
                    name,
                    target.to_js_string()
                )))
            }
            _ => return Ok(()),
        };
        if let Some(wrapper) = object.host_data::<ObjcWrapper>() {
            return self.instance_set(target, object, &wrapper, name, value);
        }
        if let Some(prototype) = object.host_data::<PrototypeWrapper>() {
            return self.prototype_set(prototype.class(), name, value);
        }
        if let Some(struct_value) = object.host_data::<StructValue>() {
            if struct_value.layout().field(name).is_some() {
                return self.set_struct_field(&struct_value, name, value);
            }
        }
        if let Some(reference) = object.host_data::<Reference>() {
            if name == "value" {
                return self.set_reference_value(&reference, value);
            }
            if let Ok(index) = name.parse::<usize>() {
                return self.set_reference_index(&reference, index, value);
            }
        }
        set_own_property(target, object, name, value)
    }

    fn instance_set(
        &self,
        this: &JsValue,
        object: &JsObject,
        wrapper: &ObjcWrapper,
        name: &str,
        value: &JsValue,
    ) -> BridgeResult<()> {
        if object.get_own_property(name).is_some() {
            return set_own_property(this, object, name, value);
        }
        for extension in self.extension_chain(wrapper.class()) {
            match extension.methods.get_own_property(name) {
                Some(PropertySlot::Accessor { set: Some(setter), .. }) => {
                    return call_script(&setter, this, std::slice::from_ref(value)).map(|_| ());
                }
                Some(PropertySlot::Accessor { set: None, .. }) => return Err(readonly()),
                Some(PropertySlot::Data(_)) => break,
                None => {}
            }
        }
        let class_name = self.metadata_class_name(wrapper.class());
        let property = self
            .registry
            .borrow()
            .lookup_property(&class_name, wrapper.protocols(), name);
        if let Some(property) = property {
            let setter = property.setter_method().ok_or_else(readonly)?;
            self.invoke_method(this, wrapper.handle(), &setter, std::slice::from_ref(value))?;
            return Ok(());
        }
        object.set(name, value.clone());
        Ok(())
    }

    /// `new callee(...args)` for class values, struct types and the
    /// `interop` constructors
    pub fn construct_value(&self, callee: &JsValue, args: &[JsValue]) -> BridgeResult<JsValue> {
        let not_a_constructor = || BridgeError::Type(format!("{} is not a constructor", callee.to_js_string()));
        let object = callee.as_object().ok_or_else(not_a_constructor)?;
        if let Some(class) = object.host_data::<ClassWrapper>() {
            return self.construct(&class, args);
        }
        if let Some(struct_type) = object.host_data::<StructType>() {
            return self.construct_struct(struct_type.layout(), args);
        }
        if let Some(constructor) = object.host_data::<InteropConstructor>() {
            return match *constructor {
                InteropConstructor::Reference => self.new_reference(args),
                InteropConstructor::Pointer => self.new_pointer(args),
                InteropConstructor::Invocation => self.new_invocation(args),
            };
        }
        if object.host_data::<ProtocolWrapper>().is_some() {
            return Err(BridgeError::Type(format!(
                "Protocol {} cannot be instantiated",
                callee.to_js_string()
            )));
        }
        Err(not_a_constructor())
    }

    /// `this[name](...args)`
    pub fn call(&self, this: &JsValue, name: &str, args: &[JsValue]) -> BridgeResult<JsValue> {
        let member = self.get(this, name)?;
        match member.as_object() {
            Some(function) if function.is_function() => call_script(&member, this, args),
            _ => Err(BridgeError::Type(format!(
                "{}.{} is not a function",
                this.to_js_string(),
                name
            ))),
        }
    }
}

fn readonly() -> BridgeError {
    BridgeError::Type("Attempted to assign to readonly property.".to_string())
}

fn call_script(function: &JsValue, this: &JsValue, args: &[JsValue]) -> BridgeResult<JsValue> {
    match function.as_object() {
        Some(object) => object.call(this, args).map_err(BridgeError::Script),
        None => Err(BridgeError::Type(format!("{} is not a function", function.to_js_string()))),
    }
}

fn set_own_property(this: &JsValue, object: &JsObject, name: &str, value: &JsValue) -> BridgeResult<()> {
    match object.get_own_property(name) {
        Some(PropertySlot::Accessor { set: Some(setter), .. }) => {
            call_script(&setter, this, std::slice::from_ref(value)).map(|_| ())
        }
        Some(PropertySlot::Accessor { set: None, .. }) => Err(readonly()),
        _ => {
            object.set(name, value.clone());
            Ok(())
        }
    }
}
