//! Metadata registry
//!
//! Describes the native API surface the bridge exposes: structs, classes,
//! protocols and C functions. Lookups walk superclass chains and adopted
//! protocols and produce the ordered overload sets the invocation engine
//! resolves against.

pub mod names;

use std::rc::Rc;

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};

pub use names::{initializer_tokens, js_name_for_selector};

bitflags! {
    /// Calling-convention and ownership flags of a method or function
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u32 {
        /// An `init`-family instance method
        const INITIALIZER = 1;
        /// Accepts variadic arguments after the fixed ones
        const VARIADIC = 1 << 1;
        /// Returns a +1 object
        const RETURNS_RETAINED = 1 << 2;
        /// Returns an unmanaged object the caller must take explicitly
        const RETURNS_UNMANAGED = 1 << 3;
        /// The last parameter is an `NSError **` out slot
        const HAS_ERROR_OUT_PARAM = 1 << 4;
        /// Optional protocol requirement
        const OPTIONAL = 1 << 5;
    }
}

/// Instance or class method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// `-` method
    Instance,
    /// `+` method
    Class,
}

/// A method declaration
#[derive(Debug, Clone)]
pub struct MethodMeta {
    /// Selector, e.g. `initWithInt:andInt:`
    pub selector: Rc<str>,
    /// Script-side name, e.g. `initWithIntAndInt`
    pub js_name: Rc<str>,
    /// Type encoding including receiver and selector, e.g. `@@:ii`
    pub encoding: Rc<str>,
    /// Instance or class method
    pub kind: MethodKind,
    /// Flags
    pub flags: MethodFlags,
}

impl MethodMeta {
    fn new(selector: &str, encoding: &str, kind: MethodKind) -> Self {
        let mut flags = MethodFlags::empty();
        if kind == MethodKind::Instance && initializer_tokens(selector).is_some() {
            flags |= MethodFlags::INITIALIZER;
        }
        if names::returns_retained_by_convention(selector) {
            flags |= MethodFlags::RETURNS_RETAINED;
        }
        Self {
            selector: Rc::from(selector),
            js_name: Rc::from(js_name_for_selector(selector)),
            encoding: Rc::from(encoding),
            kind,
            flags,
        }
    }

    /// Declare an instance method
    pub fn instance(selector: &str, encoding: &str) -> Self {
        Self::new(selector, encoding, MethodKind::Instance)
    }

    /// Declare a class method
    pub fn class(selector: &str, encoding: &str) -> Self {
        Self::new(selector, encoding, MethodKind::Class)
    }

    /// Add flags
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Override the script-side name
    pub fn named(mut self, js_name: &str) -> Self {
        self.js_name = Rc::from(js_name);
        self
    }

    /// Whether this is an initializer
    pub fn is_initializer(&self) -> bool {
        self.flags.contains(MethodFlags::INITIALIZER)
    }

    /// Initializer parameter-name tokens
    pub fn initializer_tokens(&self) -> Option<Vec<String>> {
        if self.is_initializer() {
            initializer_tokens(&self.selector)
        } else {
            None
        }
    }
}

/// A property declaration
#[derive(Debug, Clone)]
pub struct PropertyMeta {
    /// Property name
    pub name: Rc<str>,
    /// Value type encoding
    pub encoding: Rc<str>,
    /// Getter selector
    pub getter: Rc<str>,
    /// Setter selector, `None` when read-only
    pub setter: Option<Rc<str>>,
}

impl PropertyMeta {
    /// Declare a read-write property with conventional accessor selectors
    pub fn new(name: &str, encoding: &str) -> Self {
        Self {
            name: Rc::from(name),
            encoding: Rc::from(encoding),
            getter: Rc::from(name),
            setter: Some(Rc::from(names::setter_for_property(name))),
        }
    }

    /// Drop the setter
    pub fn readonly(mut self) -> Self {
        self.setter = None;
        self
    }

    /// Getter method declaration
    pub fn getter_method(&self) -> MethodMeta {
        MethodMeta::instance(&self.getter, &format!("{}@:", self.encoding))
    }

    /// Setter method declaration, if writable
    pub fn setter_method(&self) -> Option<MethodMeta> {
        self.setter
            .as_ref()
            .map(|s| MethodMeta::instance(s, &format!("v@:{}", self.encoding)))
    }
}

/// A class declaration
#[derive(Debug, Clone)]
pub struct ClassMeta {
    /// Class name
    pub name: Rc<str>,
    /// Superclass name
    pub superclass: Option<Rc<str>>,
    /// Adopted protocols
    pub protocols: Vec<Rc<str>>,
    /// Methods in declaration order
    pub methods: Vec<MethodMeta>,
    /// Properties in declaration order
    pub properties: Vec<PropertyMeta>,
}

impl ClassMeta {
    /// Start a class declaration
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            superclass: None,
            protocols: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Set the superclass
    pub fn superclass(mut self, name: &str) -> Self {
        self.superclass = Some(Rc::from(name));
        self
    }

    /// Adopt a protocol
    pub fn protocol(mut self, name: &str) -> Self {
        self.protocols.push(Rc::from(name));
        self
    }

    /// Declare a method
    pub fn method(mut self, method: MethodMeta) -> Self {
        self.methods.push(method);
        self
    }

    /// Declare a property
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }
}

/// A protocol declaration
#[derive(Debug, Clone)]
pub struct ProtocolMeta {
    /// Protocol name
    pub name: Rc<str>,
    /// Inherited protocols
    pub protocols: Vec<Rc<str>>,
    /// Required and optional methods
    pub methods: Vec<MethodMeta>,
    /// Properties
    pub properties: Vec<PropertyMeta>,
}

impl ProtocolMeta {
    /// Start a protocol declaration
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            protocols: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Inherit a protocol
    pub fn protocol(mut self, name: &str) -> Self {
        self.protocols.push(Rc::from(name));
        self
    }

    /// Declare a method
    pub fn method(mut self, method: MethodMeta) -> Self {
        self.methods.push(method);
        self
    }

    /// Declare a property
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }
}

/// A struct declaration
#[derive(Debug, Clone)]
pub struct StructMeta {
    /// Struct name
    pub name: Rc<str>,
    /// Field names in order
    pub field_names: Vec<Rc<str>>,
    /// Concatenated field encodings
    pub encoding: Rc<str>,
}

impl StructMeta {
    /// Declare a struct from `(field name, field encoding)` pairs
    pub fn new(name: &str, fields: &[(&str, &str)]) -> Self {
        Self {
            name: Rc::from(name),
            field_names: fields.iter().map(|(n, _)| Rc::from(*n)).collect(),
            encoding: Rc::from(fields.iter().map(|(_, e)| *e).collect::<String>()),
        }
    }
}

/// A C function declaration
#[derive(Debug, Clone)]
pub struct FunctionMeta {
    /// Symbol name
    pub name: Rc<str>,
    /// Type encoding: return type then parameters
    pub encoding: Rc<str>,
    /// Flags
    pub flags: MethodFlags,
}

impl FunctionMeta {
    /// Declare a function
    pub fn new(name: &str, encoding: &str) -> Self {
        Self {
            name: Rc::from(name),
            encoding: Rc::from(encoding),
            flags: MethodFlags::empty(),
        }
    }

    /// Add flags
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All known metadata for one isolate
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    structs: FxHashMap<Rc<str>, StructMeta>,
    classes: FxHashMap<Rc<str>, ClassMeta>,
    protocols: FxHashMap<Rc<str>, ProtocolMeta>,
    functions: FxHashMap<Rc<str>, FunctionMeta>,
}

impl MetadataRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct
    pub fn register_struct(&mut self, meta: StructMeta) {
        self.structs.insert(meta.name.clone(), meta);
    }

    /// Register a class, replacing any previous declaration
    pub fn register_class(&mut self, meta: ClassMeta) {
        self.classes.insert(meta.name.clone(), meta);
    }

    /// Register a protocol
    pub fn register_protocol(&mut self, meta: ProtocolMeta) {
        self.protocols.insert(meta.name.clone(), meta);
    }

    /// Register a function
    pub fn register_function(&mut self, meta: FunctionMeta) {
        self.functions.insert(meta.name.clone(), meta);
    }

    /// Find a struct by name
    pub fn find_struct(&self, name: &str) -> Option<&StructMeta> {
        self.structs.get(name)
    }

    /// Find a class by name
    pub fn find_class(&self, name: &str) -> Option<&ClassMeta> {
        self.classes.get(name)
    }

    /// Find a protocol by name
    pub fn find_protocol(&self, name: &str) -> Option<&ProtocolMeta> {
        self.protocols.get(name)
    }

    /// Find a function by name
    pub fn find_function(&self, name: &str) -> Option<&FunctionMeta> {
        self.functions.get(name)
    }

    /// Names of all registered structs
    pub fn struct_names(&self) -> Vec<Rc<str>> {
        self.structs.keys().cloned().collect()
    }

    /// The class and its ancestors, most-derived first
    pub fn class_chain(&self, name: &str) -> Vec<&ClassMeta> {
        let mut chain = Vec::new();
        let mut current = self.classes.get(name);
        while let Some(class) = current {
            if chain.iter().any(|c: &&ClassMeta| c.name == class.name) {
                break;
            }
            chain.push(class);
            current = class.superclass.as_deref().and_then(|s| self.classes.get(s));
        }
        chain
    }

    /// Whether `class` is `ancestor` or inherits from it
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        self.class_chain(class).iter().any(|c| &*c.name == ancestor)
    }

    fn protocol_methods(
        &self,
        protocol: &str,
        visited: &mut FxHashSet<Rc<str>>,
        out: &mut Vec<MethodMeta>,
    ) {
        let Some(meta) = self.protocols.get(protocol) else {
            return;
        };
        if !visited.insert(meta.name.clone()) {
            return;
        }
        out.extend(meta.methods.iter().cloned());
        for p in &meta.properties {
            out.push(p.getter_method());
            out.extend(p.setter_method());
        }
        for inherited in &meta.protocols {
            self.protocol_methods(inherited, visited, out);
        }
    }

    /// Every method visible on `class` (plus `extra_protocols`), most-derived
    /// declaration first, de-duplicated by selector and kind.
    pub fn visible_methods(&self, class: &str, extra_protocols: &[Rc<str>]) -> Vec<MethodMeta> {
        let mut all = Vec::new();
        let mut visited = FxHashSet::default();
        for p in extra_protocols {
            self.protocol_methods(p, &mut visited, &mut all);
        }
        for meta in self.class_chain(class) {
            all.extend(meta.methods.iter().cloned());
            for p in &meta.properties {
                all.push(p.getter_method());
                all.extend(p.setter_method());
            }
            for p in &meta.protocols {
                self.protocol_methods(p, &mut visited, &mut all);
            }
        }
        let mut seen = FxHashSet::default();
        all.retain(|m| seen.insert((m.selector.clone(), m.kind)));
        all
    }

    /// The overload set for `js_name` on `class`
    pub fn lookup_methods(
        &self,
        class: &str,
        extra_protocols: &[Rc<str>],
        js_name: &str,
        kind: MethodKind,
    ) -> Vec<MethodMeta> {
        self.visible_methods(class, extra_protocols)
            .into_iter()
            .filter(|m| m.kind == kind && &*m.js_name == js_name)
            .collect()
    }

    /// Find a method by exact selector
    pub fn method_by_selector(
        &self,
        class: &str,
        extra_protocols: &[Rc<str>],
        selector: &str,
        kind: MethodKind,
    ) -> Option<MethodMeta> {
        self.visible_methods(class, extra_protocols)
            .into_iter()
            .find(|m| m.kind == kind && &*m.selector == selector)
    }

    /// Initializers visible on `class`, in declaration order
    pub fn initializers(&self, class: &str, extra_protocols: &[Rc<str>]) -> Vec<MethodMeta> {
        self.visible_methods(class, extra_protocols)
            .into_iter()
            .filter(|m| m.kind == MethodKind::Instance && m.is_initializer())
            .collect()
    }

    /// Find a property on the class chain or its protocols
    pub fn lookup_property(
        &self,
        class: &str,
        extra_protocols: &[Rc<str>],
        name: &str,
    ) -> Option<PropertyMeta> {
        for meta in self.class_chain(class) {
            if let Some(p) = meta.properties.iter().find(|p| &*p.name == name) {
                return Some(p.clone());
            }
        }
        let mut pending: Vec<Rc<str>> = extra_protocols.to_vec();
        for meta in self.class_chain(class) {
            pending.extend(meta.protocols.iter().cloned());
        }
        let mut visited = FxHashSet::default();
        while let Some(protocol) = pending.pop() {
            if !visited.insert(protocol.clone()) {
                continue;
            }
            if let Some(meta) = self.protocols.get(&protocol) {
                if let Some(p) = meta.properties.iter().find(|p| &*p.name == name) {
                    return Some(p.clone());
                }
                pending.extend(meta.protocols.iter().cloned());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.register_protocol(
            ProtocolMeta::new("TNSBaseProtocol")
                .method(MethodMeta::instance("baseProtocolMethod", "v@:")),
        );
        registry.register_class(
            ClassMeta::new("NSObject")
                .method(MethodMeta::instance("init", "@@:"))
                .method(MethodMeta::class("alloc", "@#:")),
        );
        registry.register_class(
            ClassMeta::new("TNSBase")
                .superclass("NSObject")
                .protocol("TNSBaseProtocol")
                .method(MethodMeta::instance("initWithInt:", "@@:i"))
                .method(MethodMeta::instance("method:", "v@:i"))
                .method(MethodMeta::instance("method:withString:", "v@:i@"))
                .property(PropertyMeta::new("aProperty", "i")),
        );
        registry
    }

    #[test]
    fn test_initializer_flags() {
        let init = MethodMeta::instance("initWithInt:", "@@:i");
        assert!(init.is_initializer());
        assert!(init.flags.contains(MethodFlags::RETURNS_RETAINED));
        let other = MethodMeta::instance("method:", "v@:i");
        assert!(!other.is_initializer());
        assert!(!MethodMeta::class("initialize", "v#:").is_initializer());
    }

    #[test]
    fn test_lookup_walks_chain_and_protocols() {
        let registry = registry();
        let found = registry.lookup_methods("TNSBase", &[], "baseProtocolMethod", MethodKind::Instance);
        assert_eq!(found.len(), 1);
        let found = registry.lookup_methods("TNSBase", &[], "init", MethodKind::Instance);
        assert_eq!(&*found[0].selector, "init");
        assert!(registry.is_subclass_of("TNSBase", "NSObject"));
    }

    #[test]
    fn test_initializers_most_derived_first() {
        let registry = registry();
        let inits: Vec<String> = registry
            .initializers("TNSBase", &[])
            .iter()
            .map(|m| m.selector.to_string())
            .collect();
        assert_eq!(inits, vec!["initWithInt:", "init"]);
    }

    #[test]
    fn test_property_accessors_become_methods() {
        let registry = registry();
        let getter = registry.method_by_selector("TNSBase", &[], "aProperty", MethodKind::Instance);
        assert_eq!(getter.map(|m| m.encoding.to_string()), Some("i@:".to_string()));
        let setter = registry.method_by_selector("TNSBase", &[], "setAProperty:", MethodKind::Instance);
        assert_eq!(setter.map(|m| m.encoding.to_string()), Some("v@:i".to_string()));
        assert!(registry.lookup_property("TNSBase", &[], "aProperty").is_some());
    }

    #[test]
    fn test_struct_meta_concatenates_encodings() {
        let meta = StructMeta::new("CGPoint", &[("x", "d"), ("y", "d")]);
        assert_eq!(&*meta.encoding, "dd");
        assert_eq!(meta.field_names.len(), 2);
    }
}
