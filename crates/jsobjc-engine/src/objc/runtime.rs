//! In-process object runtime
//!
//! Objects are records in an address-keyed table. Classes carry instance and
//! class method tables whose entries pair an implementation with the call
//! layout it reads its arguments through. Messaging looks the selector up
//! along the superclass chain and calls the implementation with a
//! [`NativeCall`] view over the caller's [`CallFrame`].

use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::fmt;
use std::rc::Rc;

use jsobjc_sdk::{ArrayBuffer, JsError};
use rustc_hash::FxHashMap;

use super::selector::{Sel, SelectorTable};
use crate::abi::{CallFrame, CallLayout};
use crate::metadata::MethodKind;

/// Address of a native object. 0 is nil.
pub type Id = usize;

/// Index of a registered class
pub type ClassId = usize;

/// The nil object
pub const NIL: Id = 0;

const FIRST_ADDRESS: usize = 0x1_0000;
const ADDRESS_STRIDE: usize = 0x10;

/// Root class every built-in class derives from
pub const ROOT_CLASS: &str = "NSObject";
/// Class of heap blocks
pub const BLOCK_CLASS: &str = "__NSMallocBlock__";

const BUILTIN_CLASSES: &[(&str, Option<&str>)] = &[
    (ROOT_CLASS, None),
    ("NSString", Some(ROOT_CLASS)),
    ("NSNumber", Some(ROOT_CLASS)),
    ("NSNull", Some(ROOT_CLASS)),
    ("NSArray", Some(ROOT_CLASS)),
    ("NSDictionary", Some(ROOT_CLASS)),
    ("NSError", Some(ROOT_CLASS)),
    ("NSData", Some(ROOT_CLASS)),
    ("Protocol", Some(ROOT_CLASS)),
    (BLOCK_CLASS, Some(ROOT_CLASS)),
];

/// An exception raised by native code
#[derive(Debug, Clone)]
pub struct NativeException {
    /// Exception name, e.g. `NSInvalidArgumentException`
    pub name: String,
    /// Human readable reason
    pub reason: String,
    /// Script error that unwound through native frames, rethrown unchanged
    /// when it reaches script again
    pub script_error: Option<JsError>,
}

impl NativeException {
    /// A native exception
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
            script_error: None,
        }
    }

    /// Carry a script error across native frames
    pub fn from_script(error: JsError) -> Self {
        Self {
            name: error.name(),
            reason: error.message(),
            script_error: Some(error),
        }
    }
}

impl fmt::Display for NativeException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

impl std::error::Error for NativeException {}

/// A method implementation
pub type Imp = Rc<dyn Fn(&NativeCall<'_>) -> Result<(), NativeException>>;

/// An implementation plus the layout it reads its frame through
#[derive(Clone)]
pub struct MethodEntry {
    /// Implementation
    pub imp: Imp,
    /// Argument layout the implementation expects
    pub layout: Rc<CallLayout>,
}

impl MethodEntry {
    /// Pair an implementation with its layout
    pub fn new(
        layout: Rc<CallLayout>,
        imp: impl Fn(&NativeCall<'_>) -> Result<(), NativeException> + 'static,
    ) -> Self {
        Self {
            imp: Rc::new(imp),
            layout,
        }
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodEntry({})", self.layout.signature().encode())
    }
}

/// Numeric payload of a boxed number
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberValue {
    /// `numberWithBool:`
    Bool(bool),
    /// Any signed integer constructor
    Int(i64),
    /// `numberWithUnsignedLongLong:`
    UInt(u64),
    /// `numberWithDouble:` / `numberWithFloat:`
    Double(f64),
}

impl NumberValue {
    /// As a double
    pub fn as_f64(self) -> f64 {
        match self {
            NumberValue::Bool(b) => f64::from(u8::from(b)),
            NumberValue::Int(i) => i as f64,
            NumberValue::UInt(u) => u as f64,
            NumberValue::Double(d) => d,
        }
    }

    /// As an integer, truncating doubles
    pub fn as_i64(self) -> i64 {
        match self {
            NumberValue::Bool(b) => i64::from(b),
            NumberValue::Int(i) => i,
            NumberValue::UInt(u) => u as i64,
            NumberValue::Double(d) => d as i64,
        }
    }
}

#[derive(Debug)]
enum Payload {
    None,
    /// UTF-8 bytes with a trailing NUL
    String(Box<[u8]>),
    Number(NumberValue),
    Array(Vec<Id>),
    Dictionary(Vec<(Id, Id)>),
    /// Shared with any ArrayBuffer handed out over the same bytes
    Data(ArrayBuffer),
    Error {
        domain: String,
        code: i64,
        description: String,
    },
    Block(MethodEntry),
    Protocol(Rc<str>),
}

struct ObjectRecord {
    class: ClassId,
    retain_count: usize,
    payload: Payload,
    ivars: FxHashMap<Rc<str>, u64>,
}

struct ClassRecord {
    name: Rc<str>,
    superclass: Option<ClassId>,
    protocols: Vec<Rc<str>>,
    address: Id,
    instance_methods: FxHashMap<Sel, MethodEntry>,
    class_methods: FxHashMap<Sel, MethodEntry>,
}

impl ClassRecord {
    fn methods(&self, kind: MethodKind) -> &FxHashMap<Sel, MethodEntry> {
        match kind {
            MethodKind::Instance => &self.instance_methods,
            MethodKind::Class => &self.class_methods,
        }
    }

    fn methods_mut(&mut self, kind: MethodKind) -> &mut FxHashMap<Sel, MethodEntry> {
        match kind {
            MethodKind::Instance => &mut self.instance_methods,
            MethodKind::Class => &mut self.class_methods,
        }
    }
}

/// The view an implementation gets of the call it is servicing
pub struct NativeCall<'a> {
    runtime: &'a NativeRuntime,
    receiver: Id,
    selector: Sel,
    frame: &'a CallFrame,
}

impl<'a> NativeCall<'a> {
    /// The runtime the call runs in
    pub fn runtime(&self) -> &'a NativeRuntime {
        self.runtime
    }

    /// Receiver (`self`), or the block / nil for non-message calls
    pub fn receiver(&self) -> Id {
        self.receiver
    }

    /// Selector (`_cmd`); null for functions and blocks
    pub fn selector(&self) -> Sel {
        self.selector
    }

    /// Selector name
    pub fn selector_name(&self) -> Rc<str> {
        self.runtime
            .selectors
            .name(self.selector)
            .unwrap_or_else(|| Rc::from(""))
    }

    /// The frame holding arguments and the return slot
    pub fn frame(&self) -> &'a CallFrame {
        self.frame
    }

    /// Number of caller-supplied arguments
    pub fn arg_count(&self) -> usize {
        self.frame.layout().explicit_arg_count()
    }

    /// Read caller-supplied argument `index`
    pub fn arg<T: Copy>(&self, index: usize) -> T {
        self.frame.read_arg(self.frame.layout().implicit_args() + index)
    }

    /// Storage of caller-supplied argument `index`
    pub fn arg_ptr(&self, index: usize) -> *mut u8 {
        self.frame.explicit_arg_ptr(index)
    }

    /// Argument `index` as the contents of a string object
    pub fn arg_string(&self, index: usize) -> Option<String> {
        self.runtime.string_value(self.arg::<Id>(index))
    }

    /// Argument `index` as a NUL-terminated C string
    pub fn arg_c_string(&self, index: usize) -> Option<String> {
        let ptr = self.arg::<*const libc::c_char>(index);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the caller passed a NUL-terminated string for a `*` slot
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    /// Store the return value
    pub fn set_return<T: Copy>(&self, value: T) {
        self.frame.write_return(value);
    }

    /// Return slot storage
    pub fn return_ptr(&self) -> *mut u8 {
        self.frame.return_ptr()
    }
}

/// Object table, class table and messaging
pub struct NativeRuntime {
    objects: RefCell<FxHashMap<Id, ObjectRecord>>,
    classes: RefCell<Vec<ClassRecord>>,
    class_names: RefCell<FxHashMap<Rc<str>, ClassId>>,
    class_objects: RefCell<FxHashMap<Id, ClassId>>,
    selectors: SelectorTable,
    functions: RefCell<FxHashMap<Rc<str>, MethodEntry>>,
    function_pointers: RefCell<FxHashMap<usize, MethodEntry>>,
    protocols: RefCell<FxHashMap<Rc<str>, Id>>,
    pools: RefCell<Vec<Vec<Id>>>,
    null_object: Cell<Id>,
    next_address: Cell<usize>,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NativeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRuntime")
            .field("objects", &self.objects.borrow().len())
            .field("classes", &self.classes.borrow().len())
            .field("selectors", &self.selectors.len())
            .finish()
    }
}

impl NativeRuntime {
    /// Create a runtime with the built-in class records (no methods yet)
    pub fn new() -> Self {
        let runtime = Self {
            objects: RefCell::new(FxHashMap::default()),
            classes: RefCell::new(Vec::new()),
            class_names: RefCell::new(FxHashMap::default()),
            class_objects: RefCell::new(FxHashMap::default()),
            selectors: SelectorTable::new(),
            functions: RefCell::new(FxHashMap::default()),
            function_pointers: RefCell::new(FxHashMap::default()),
            protocols: RefCell::new(FxHashMap::default()),
            pools: RefCell::new(Vec::new()),
            null_object: Cell::new(NIL),
            next_address: Cell::new(FIRST_ADDRESS),
        };
        for (name, superclass) in BUILTIN_CLASSES {
            let superclass = superclass.and_then(|s| runtime.class_named(s));
            runtime.insert_class(name, superclass, Vec::new());
        }
        runtime
    }

    fn allocate_address(&self) -> Id {
        let address = self.next_address.get();
        self.next_address.set(address + ADDRESS_STRIDE);
        address
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    /// Intern a selector
    pub fn sel(&self, name: &str) -> Sel {
        self.selectors.intern(name)
    }

    /// Name of a selector
    pub fn sel_name(&self, sel: Sel) -> Option<Rc<str>> {
        self.selectors.name(sel)
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    fn insert_class(&self, name: &str, superclass: Option<ClassId>, protocols: Vec<Rc<str>>) -> ClassId {
        let name: Rc<str> = Rc::from(name);
        let address = self.allocate_address();
        let mut classes = self.classes.borrow_mut();
        let id = classes.len();
        classes.push(ClassRecord {
            name: name.clone(),
            superclass,
            protocols,
            address,
            instance_methods: FxHashMap::default(),
            class_methods: FxHashMap::default(),
        });
        self.class_names.borrow_mut().insert(name, id);
        self.class_objects.borrow_mut().insert(address, id);
        id
    }

    /// Register a new class. Fails if the name is taken.
    pub fn register_class(
        &self,
        name: &str,
        superclass: Option<ClassId>,
        protocols: Vec<Rc<str>>,
    ) -> Result<ClassId, NativeException> {
        if self.class_named(name).is_some() {
            return Err(NativeException::new(
                "NSInternalInconsistencyException",
                format!("Class \"{}\" is already registered", name),
            ));
        }
        let id = self.insert_class(name, superclass, protocols);
        tracing::debug!(class = name, "registered native class");
        Ok(id)
    }

    /// Look a class up by name
    pub fn class_named(&self, name: &str) -> Option<ClassId> {
        self.class_names.borrow().get(name).copied()
    }

    /// Name of a class
    pub fn class_name(&self, class: ClassId) -> Rc<str> {
        self.classes
            .borrow()
            .get(class)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| Rc::from("<unknown>"))
    }

    /// Superclass of a class
    pub fn superclass(&self, class: ClassId) -> Option<ClassId> {
        self.classes.borrow().get(class).and_then(|c| c.superclass)
    }

    /// Address of a class object
    pub fn class_object(&self, class: ClassId) -> Id {
        self.classes.borrow().get(class).map_or(NIL, |c| c.address)
    }

    /// The class a class-object address stands for
    pub fn class_from_object(&self, id: Id) -> Option<ClassId> {
        self.class_objects.borrow().get(&id).copied()
    }

    /// Class of an instance
    pub fn class_of(&self, id: Id) -> Option<ClassId> {
        self.objects.borrow().get(&id).map(|o| o.class)
    }

    /// Whether `class` is `ancestor` or a subclass of it
    pub fn is_subclass(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.superclass(c);
        }
        false
    }

    /// Whether `id` is an instance of `class` or one of its subclasses
    pub fn is_kind_of(&self, id: Id, class: ClassId) -> bool {
        self.class_of(id).is_some_and(|c| self.is_subclass(c, class))
    }

    /// Whether `class` or an ancestor adopts `protocol`
    pub fn conforms_to(&self, class: ClassId, protocol: &str) -> bool {
        let classes = self.classes.borrow();
        let mut current = classes.get(class);
        while let Some(record) = current {
            if record.protocols.iter().any(|p| &**p == protocol) {
                return true;
            }
            current = record.superclass.and_then(|s| classes.get(s));
        }
        false
    }

    /// Add a protocol to a class
    pub fn add_protocol(&self, class: ClassId, protocol: &str) {
        if let Some(record) = self.classes.borrow_mut().get_mut(class) {
            if !record.protocols.iter().any(|p| &**p == protocol) {
                record.protocols.push(Rc::from(protocol));
            }
        }
    }

    /// Add a method unless the class already defines it itself
    pub fn add_method(&self, class: ClassId, sel: Sel, kind: MethodKind, entry: MethodEntry) -> bool {
        let mut classes = self.classes.borrow_mut();
        let Some(record) = classes.get_mut(class) else {
            return false;
        };
        let methods = record.methods_mut(kind);
        if methods.contains_key(&sel) {
            return false;
        }
        methods.insert(sel, entry);
        true
    }

    /// Install a method, returning the entry the class itself defined before
    pub fn replace_method(
        &self,
        class: ClassId,
        sel: Sel,
        kind: MethodKind,
        entry: MethodEntry,
    ) -> Option<MethodEntry> {
        self.classes
            .borrow_mut()
            .get_mut(class)
            .and_then(|record| record.methods_mut(kind).insert(sel, entry))
    }

    /// Whether the class itself (not an ancestor) defines `sel`
    pub fn has_own_method(&self, class: ClassId, sel: Sel, kind: MethodKind) -> bool {
        self.classes
            .borrow()
            .get(class)
            .is_some_and(|record| record.methods(kind).contains_key(&sel))
    }

    /// Find the implementation of `sel` starting at `class`
    pub fn lookup_method(&self, class: ClassId, sel: Sel, kind: MethodKind) -> Option<MethodEntry> {
        let classes = self.classes.borrow();
        let mut current = classes.get(class);
        while let Some(record) = current {
            if let Some(entry) = record.methods(kind).get(&sel) {
                return Some(entry.clone());
            }
            current = record.superclass.and_then(|s| classes.get(s));
        }
        None
    }

    // ------------------------------------------------------------------
    // Objects and reference counts
    // ------------------------------------------------------------------

    /// Allocate a zeroed instance with a retain count of 1
    pub fn alloc_instance(&self, class: ClassId) -> Id {
        let id = self.allocate_address();
        self.objects.borrow_mut().insert(
            id,
            ObjectRecord {
                class,
                retain_count: 1,
                payload: Payload::None,
                ivars: FxHashMap::default(),
            },
        );
        tracing::trace!(address = id, class = %self.class_name(class), "alloc");
        id
    }

    /// Whether `id` is a live instance or a class object
    pub fn is_live(&self, id: Id) -> bool {
        id != NIL && (self.objects.borrow().contains_key(&id) || self.class_objects.borrow().contains_key(&id))
    }

    /// Current retain count (0 for dead objects)
    pub fn retain_count(&self, id: Id) -> usize {
        self.objects.borrow().get(&id).map_or(0, |o| o.retain_count)
    }

    /// Increment the retain count
    pub fn retain(&self, id: Id) -> Id {
        if let Some(record) = self.objects.borrow_mut().get_mut(&id) {
            record.retain_count += 1;
        }
        id
    }

    /// Decrement the retain count; sends `dealloc` when it reaches zero
    pub fn release(&self, id: Id) -> Result<(), NativeException> {
        let dealloc = {
            let mut objects = self.objects.borrow_mut();
            let Some(record) = objects.get_mut(&id) else {
                return Ok(());
            };
            if record.retain_count == 0 {
                return Ok(());
            }
            record.retain_count -= 1;
            record.retain_count == 0
        };
        if dealloc {
            tracing::trace!(address = id, "dealloc");
            if self.lookup(id, self.sel("dealloc")).is_some() {
                self.send(id, "dealloc", |_| {})?;
            } else {
                self.destroy(id)?;
            }
        }
        Ok(())
    }

    /// Remove an object from the table, releasing what it owns. Called by
    /// the root class's `dealloc`.
    pub fn destroy(&self, id: Id) -> Result<(), NativeException> {
        let Some(record) = self.objects.borrow_mut().remove(&id) else {
            return Ok(());
        };
        let owned: Vec<Id> = match record.payload {
            Payload::Array(items) => items,
            Payload::Dictionary(entries) => entries.into_iter().flat_map(|(k, v)| [k, v]).collect(),
            _ => Vec::new(),
        };
        let mut first_error = None;
        for child in owned {
            if let Err(e) = self.release(child) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Defer a release to the innermost autorelease pool
    pub fn autorelease(&self, id: Id) -> Id {
        if id == NIL || !self.objects.borrow().contains_key(&id) {
            return id;
        }
        let mut pools = self.pools.borrow_mut();
        if pools.is_empty() {
            pools.push(Vec::new());
        }
        if let Some(pool) = pools.last_mut() {
            pool.push(id);
        }
        id
    }

    /// Open an autorelease pool
    pub fn push_autorelease_pool(&self) {
        self.pools.borrow_mut().push(Vec::new());
    }

    /// Close the innermost pool, releasing its objects
    pub fn pop_autorelease_pool(&self) -> Result<(), NativeException> {
        let pending = self.pools.borrow_mut().pop().unwrap_or_default();
        let mut first_error = None;
        for id in pending {
            if let Err(e) = self.release(id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of open pools
    pub fn pool_depth(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Read a per-instance storage slot (0 if unset)
    pub fn ivar(&self, id: Id, name: &str) -> u64 {
        self.objects
            .borrow()
            .get(&id)
            .and_then(|o| o.ivars.get(name).copied())
            .unwrap_or(0)
    }

    /// Write a per-instance storage slot
    pub fn set_ivar(&self, id: Id, name: &str, value: u64) {
        if let Some(record) = self.objects.borrow_mut().get_mut(&id) {
            record.ivars.insert(Rc::from(name), value);
        }
    }

    /// Number of live instances
    pub fn live_objects(&self) -> usize {
        self.objects.borrow().len()
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Resolve `sel` for a receiver (instance or class object)
    pub fn lookup(&self, receiver: Id, sel: Sel) -> Option<MethodEntry> {
        if let Some(class) = self.class_from_object(receiver) {
            return self.lookup_method(class, sel, MethodKind::Class);
        }
        let class = self.class_of(receiver)?;
        self.lookup_method(class, sel, MethodKind::Instance)
    }

    fn unrecognized(&self, receiver: Id, sel: Sel) -> NativeException {
        let name = self.sel_name(sel).unwrap_or_else(|| Rc::from("(null)"));
        let reason = match self.class_from_object(receiver) {
            Some(class) => format!(
                "+[{} {}]: unrecognized selector sent to class {:#x}",
                self.class_name(class),
                name,
                receiver
            ),
            None => format!(
                "-[{} {}]: unrecognized selector sent to instance {:#x}",
                self.class_of(receiver).map(|c| self.class_name(c)).unwrap_or_else(|| Rc::from("?")),
                name,
                receiver
            ),
        };
        NativeException::new("NSInvalidArgumentException", reason)
    }

    /// Call an implementation directly
    pub fn call_entry(
        &self,
        entry: &MethodEntry,
        receiver: Id,
        sel: Sel,
        frame: &CallFrame,
    ) -> Result<(), NativeException> {
        let call = NativeCall {
            runtime: self,
            receiver,
            selector: sel,
            frame,
        };
        (entry.imp)(&call)
    }

    /// Dynamic dispatch. Messages to nil or dead objects zero the return
    /// slot and do nothing.
    pub fn msg_send(&self, receiver: Id, sel: Sel, frame: &CallFrame) -> Result<(), NativeException> {
        if !self.is_live(receiver) {
            frame.clear_return();
            return Ok(());
        }
        match self.lookup(receiver, sel) {
            Some(entry) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    let name = self.sel_name(sel);
                    tracing::trace!(receiver, selector = name.as_deref().unwrap_or(""), "msgSend");
                }
                self.call_entry(&entry, receiver, sel, frame)
            }
            None => Err(self.unrecognized(receiver, sel)),
        }
    }

    /// Dispatch starting at the superclass of `class`
    pub fn msg_send_super(
        &self,
        receiver: Id,
        class: ClassId,
        sel: Sel,
        frame: &CallFrame,
    ) -> Result<(), NativeException> {
        if !self.is_live(receiver) {
            frame.clear_return();
            return Ok(());
        }
        let kind = if self.class_from_object(receiver).is_some() {
            MethodKind::Class
        } else {
            MethodKind::Instance
        };
        let entry = self
            .superclass(class)
            .and_then(|s| self.lookup_method(s, sel, kind))
            .ok_or_else(|| self.unrecognized(receiver, sel))?;
        self.call_entry(&entry, receiver, sel, frame)
    }

    fn prepared_frame(entry: &MethodEntry, receiver: Id, sel: Sel, fill: impl FnOnce(&CallFrame)) -> CallFrame {
        let frame = CallFrame::new(entry.layout.clone());
        frame.write_arg(0, receiver);
        if entry.layout.implicit_args() > 1 {
            frame.write_arg(1, sel.as_raw());
        }
        fill(&frame);
        frame
    }

    /// Send a message from native code using the receiver's own method
    /// layout. `fill` stores the explicit arguments. Returns `None` for
    /// nil or dead receivers.
    pub fn send(
        &self,
        receiver: Id,
        selector: &str,
        fill: impl FnOnce(&CallFrame),
    ) -> Result<Option<CallFrame>, NativeException> {
        if !self.is_live(receiver) {
            return Ok(None);
        }
        let sel = self.sel(selector);
        let entry = self.lookup(receiver, sel).ok_or_else(|| self.unrecognized(receiver, sel))?;
        let frame = Self::prepared_frame(&entry, receiver, sel, fill);
        self.call_entry(&entry, receiver, sel, &frame)?;
        Ok(Some(frame))
    }

    /// [`send`](Self::send) starting at the superclass of `class`
    pub fn send_super(
        &self,
        receiver: Id,
        class: ClassId,
        selector: &str,
        fill: impl FnOnce(&CallFrame),
    ) -> Result<Option<CallFrame>, NativeException> {
        if !self.is_live(receiver) {
            return Ok(None);
        }
        let sel = self.sel(selector);
        let kind = if self.class_from_object(receiver).is_some() {
            MethodKind::Class
        } else {
            MethodKind::Instance
        };
        let entry = self
            .superclass(class)
            .and_then(|s| self.lookup_method(s, sel, kind))
            .ok_or_else(|| self.unrecognized(receiver, sel))?;
        let frame = Self::prepared_frame(&entry, receiver, sel, fill);
        self.call_entry(&entry, receiver, sel, &frame)?;
        Ok(Some(frame))
    }

    // ------------------------------------------------------------------
    // Functions, function pointers and blocks
    // ------------------------------------------------------------------

    /// Export a C function symbol
    pub fn register_function(&self, name: &str, entry: MethodEntry) {
        self.functions.borrow_mut().insert(Rc::from(name), entry);
    }

    /// Look up a C function symbol
    pub fn function(&self, name: &str) -> Option<MethodEntry> {
        self.functions.borrow().get(name).cloned()
    }

    /// Give an implementation a callable address
    pub fn register_function_pointer(&self, entry: MethodEntry) -> usize {
        let address = self.allocate_address();
        self.function_pointers.borrow_mut().insert(address, entry);
        address
    }

    /// Remove a function-pointer address. Later calls through it do nothing.
    pub fn unregister_function_pointer(&self, address: usize) -> bool {
        self.function_pointers.borrow_mut().remove(&address).is_some()
    }

    /// Implementation behind a function-pointer address
    pub fn function_pointer(&self, address: usize) -> Option<MethodEntry> {
        self.function_pointers.borrow().get(&address).cloned()
    }

    /// Call through a function pointer from native code
    pub fn call_function_pointer(
        &self,
        address: usize,
        fill: impl FnOnce(&CallFrame),
    ) -> Result<Option<CallFrame>, NativeException> {
        let Some(entry) = self.function_pointer(address) else {
            return Ok(None);
        };
        let frame = CallFrame::new(entry.layout.clone());
        fill(&frame);
        self.call_entry(&entry, NIL, Sel::NULL, &frame)?;
        Ok(Some(frame))
    }

    /// Create a heap block (+1). The block itself is the first implicit
    /// argument of its layout.
    pub fn create_block(&self, entry: MethodEntry) -> Id {
        let class = self.class_named(BLOCK_CLASS).unwrap_or(0);
        let id = self.alloc_instance(class);
        self.set_payload(id, Payload::Block(entry));
        id
    }

    /// Implementation of a block
    pub fn block_entry(&self, id: Id) -> Option<MethodEntry> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Block(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Invoke a block from native code. Returns `None` for nil blocks.
    pub fn invoke_block(
        &self,
        block: Id,
        fill: impl FnOnce(&CallFrame),
    ) -> Result<Option<CallFrame>, NativeException> {
        let Some(entry) = self.block_entry(block) else {
            return Ok(None);
        };
        let frame = CallFrame::new(entry.layout.clone());
        if entry.layout.implicit_args() > 0 {
            frame.write_arg(0, block);
        }
        fill(&frame);
        self.call_entry(&entry, block, Sel::NULL, &frame)?;
        Ok(Some(frame))
    }

    // ------------------------------------------------------------------
    // Foundation payloads
    // ------------------------------------------------------------------

    fn set_payload(&self, id: Id, payload: Payload) {
        if let Some(record) = self.objects.borrow_mut().get_mut(&id) {
            record.payload = payload;
        }
    }

    fn builtin(&self, name: &str) -> ClassId {
        self.class_named(name).unwrap_or(0)
    }

    /// A new string object (+1)
    pub fn new_string(&self, value: &str) -> Id {
        let id = self.alloc_instance(self.builtin("NSString"));
        self.set_string(id, value);
        id
    }

    /// Replace the contents of a string object
    pub fn set_string(&self, id: Id, value: &str) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.set_payload(id, Payload::String(bytes.into_boxed_slice()));
    }

    /// Contents of a string object
    pub fn string_value(&self, id: Id) -> Option<String> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::String(bytes)) => {
                let text = &bytes[..bytes.len().saturating_sub(1)];
                Some(String::from_utf8_lossy(text).into_owned())
            }
            _ => None,
        }
    }

    /// NUL-terminated UTF-8 storage of a string object, valid while it lives
    pub fn string_utf8_ptr(&self, id: Id) -> *const libc::c_char {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::String(bytes)) => bytes.as_ptr() as *const libc::c_char,
            _ => std::ptr::null(),
        }
    }

    /// A new boxed number (+1)
    pub fn new_number(&self, value: NumberValue) -> Id {
        let id = self.alloc_instance(self.builtin("NSNumber"));
        self.set_number(id, value);
        id
    }

    /// Replace the value of a boxed number
    pub fn set_number(&self, id: Id, value: NumberValue) {
        self.set_payload(id, Payload::Number(value));
    }

    /// Value of a boxed number
    pub fn number_value(&self, id: Id) -> Option<NumberValue> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// A new array (+1) retaining its items
    pub fn new_array(&self, items: Vec<Id>) -> Id {
        for item in &items {
            self.retain(*item);
        }
        let id = self.alloc_instance(self.builtin("NSArray"));
        self.set_payload(id, Payload::Array(items));
        id
    }

    /// Items of an array
    pub fn array_items(&self, id: Id) -> Option<Vec<Id>> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Array(items)) => Some(items.clone()),
            _ => None,
        }
    }

    /// A new dictionary (+1) retaining keys and values
    pub fn new_dictionary(&self, entries: Vec<(Id, Id)>) -> Id {
        for (k, v) in &entries {
            self.retain(*k);
            self.retain(*v);
        }
        let id = self.alloc_instance(self.builtin("NSDictionary"));
        self.set_payload(id, Payload::Dictionary(entries));
        id
    }

    /// Entries of a dictionary in insertion order
    pub fn dictionary_entries(&self, id: Id) -> Option<Vec<(Id, Id)>> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Dictionary(entries)) => Some(entries.clone()),
            _ => None,
        }
    }

    /// Look a key up by string equality (string keys) or identity
    pub fn dictionary_get(&self, id: Id, key: Id) -> Option<Id> {
        let key_text = self.string_value(key);
        self.dictionary_entries(id)?.into_iter().find_map(|(k, v)| {
            let matches = k == key || (key_text.is_some() && self.string_value(k) == key_text);
            matches.then_some(v)
        })
    }

    /// A new data object (+1) holding a copy of `bytes`
    pub fn new_data(&self, bytes: &[u8]) -> Id {
        let id = self.alloc_instance(self.builtin("NSData"));
        self.set_payload(id, Payload::Data(ArrayBuffer::from_bytes(bytes.to_vec())));
        id
    }

    /// Backing store of a data object
    pub fn data_buffer(&self, id: Id) -> Option<ArrayBuffer> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Data(buffer)) => Some(buffer.clone()),
            _ => None,
        }
    }

    /// A new error object (+1)
    pub fn new_error(&self, domain: &str, code: i64, description: &str) -> Id {
        let id = self.alloc_instance(self.builtin("NSError"));
        self.set_error(id, domain, code, description);
        id
    }

    /// Replace the contents of an error object
    pub fn set_error(&self, id: Id, domain: &str, code: i64, description: &str) {
        self.set_payload(
            id,
            Payload::Error {
                domain: domain.to_string(),
                code,
                description: description.to_string(),
            },
        );
    }

    /// Domain, code and description of an error object
    pub fn error_info(&self, id: Id) -> Option<(String, i64, String)> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Error {
                domain,
                code,
                description,
            }) => Some((domain.clone(), *code, description.clone())),
            _ => None,
        }
    }

    /// The `NSNull` singleton
    pub fn null_object(&self) -> Id {
        let existing = self.null_object.get();
        if existing != NIL && self.is_live(existing) {
            return existing;
        }
        let id = self.alloc_instance(self.builtin("NSNull"));
        self.null_object.set(id);
        id
    }

    /// Whether `id` is the `NSNull` singleton
    pub fn is_null_object(&self, id: Id) -> bool {
        id != NIL && id == self.null_object.get()
    }

    /// The protocol object for `name`
    pub fn protocol_object(&self, name: &str) -> Id {
        if let Some(id) = self.protocols.borrow().get(name) {
            return *id;
        }
        let id = self.alloc_instance(self.builtin("Protocol"));
        let name: Rc<str> = Rc::from(name);
        self.set_payload(id, Payload::Protocol(name.clone()));
        self.protocols.borrow_mut().insert(name, id);
        id
    }

    /// Name of a protocol object
    pub fn protocol_name(&self, id: Id) -> Option<Rc<str>> {
        match self.objects.borrow().get(&id).map(|o| &o.payload) {
            Some(Payload::Protocol(name)) => Some(name.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{Abi, IntWidth, Signature, TypeDescriptor};

    fn layout(ret: TypeDescriptor, params: Vec<TypeDescriptor>, implicit: usize) -> Rc<CallLayout> {
        Rc::new(CallLayout::new(Rc::new(Signature { ret, params }), implicit, Abi::host()))
    }

    fn msg_layout(ret: TypeDescriptor, extra: Vec<TypeDescriptor>) -> Rc<CallLayout> {
        let mut params = vec![TypeDescriptor::id(), TypeDescriptor::Selector];
        params.extend(extra);
        layout(ret, params, 2)
    }

    fn runtime_with_dealloc(log: Rc<RefCell<Vec<String>>>) -> NativeRuntime {
        let runtime = NativeRuntime::new();
        let root = runtime.class_named(ROOT_CLASS).unwrap();
        let sel = runtime.sel("dealloc");
        runtime.add_method(
            root,
            sel,
            MethodKind::Instance,
            MethodEntry::new(msg_layout(TypeDescriptor::Void, vec![]), move |call| {
                log.borrow_mut().push(format!("dealloc {:#x}", call.receiver()));
                call.runtime().destroy(call.receiver())
            }),
        );
        runtime
    }

    #[test]
    fn test_release_to_zero_sends_dealloc() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let runtime = runtime_with_dealloc(log.clone());
        let root = runtime.class_named(ROOT_CLASS).unwrap();
        let id = runtime.alloc_instance(root);
        runtime.retain(id);
        assert_eq!(runtime.retain_count(id), 2);
        runtime.release(id).unwrap();
        assert!(log.borrow().is_empty());
        runtime.release(id).unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(!runtime.is_live(id));
        // Releasing a dead object is a no-op
        runtime.release(id).unwrap();
    }

    #[test]
    fn test_message_to_nil_zeroes_return() {
        let runtime = NativeRuntime::new();
        let frame = CallFrame::new(msg_layout(TypeDescriptor::int(IntWidth::W32, true), vec![]));
        frame.write_return(55i32);
        runtime.msg_send(NIL, runtime.sel("count"), &frame).unwrap();
        assert_eq!(frame.read_return::<i32>(), 0);
    }

    #[test]
    fn test_unrecognized_selector() {
        let runtime = NativeRuntime::new();
        let root = runtime.class_named(ROOT_CLASS).unwrap();
        let id = runtime.alloc_instance(root);
        let frame = CallFrame::new(msg_layout(TypeDescriptor::Void, vec![]));
        let err = runtime.msg_send(id, runtime.sel("frobnicate"), &frame).unwrap_err();
        assert_eq!(err.name, "NSInvalidArgumentException");
        assert!(err.reason.starts_with("-[NSObject frobnicate]: unrecognized selector"));
    }

    #[test]
    fn test_lookup_walks_superclasses_and_super_send() {
        let runtime = NativeRuntime::new();
        let root = runtime.class_named(ROOT_CLASS).unwrap();
        let base = runtime.register_class("Base", Some(root), vec![]).unwrap();
        let derived = runtime.register_class("Derived", Some(base), vec![]).unwrap();
        let int = TypeDescriptor::int(IntWidth::W32, true);
        let sel = runtime.sel("value");
        runtime.add_method(
            base,
            sel,
            MethodKind::Instance,
            MethodEntry::new(msg_layout(int.clone(), vec![]), |call| {
                call.set_return(1i32);
                Ok(())
            }),
        );
        runtime.add_method(
            derived,
            sel,
            MethodKind::Instance,
            MethodEntry::new(msg_layout(int, vec![]), move |call| {
                let derived = call.runtime().class_named("Derived").unwrap();
                let inner = call.runtime().send_super(call.receiver(), derived, "value", |_| {})?;
                let base_value = inner.map_or(0, |f| f.read_return::<i32>());
                call.set_return(base_value + 10);
                Ok(())
            }),
        );
        let id = runtime.alloc_instance(derived);
        let frame = runtime.send(id, "value", |_| {}).unwrap().unwrap();
        assert_eq!(frame.read_return::<i32>(), 11);
        assert!(runtime.register_class("Base", None, vec![]).is_err());
    }

    #[test]
    fn test_autorelease_pool_drains() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let runtime = runtime_with_dealloc(log.clone());
        runtime.push_autorelease_pool();
        let s = runtime.autorelease(runtime.new_string("temp"));
        assert_eq!(runtime.string_value(s).as_deref(), Some("temp"));
        runtime.pop_autorelease_pool().unwrap();
        assert!(!runtime.is_live(s));
        assert_eq!(runtime.pool_depth(), 0);
    }

    #[test]
    fn test_array_owns_items() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let runtime = runtime_with_dealloc(log.clone());
        let item = runtime.new_string("a");
        let array = runtime.new_array(vec![item]);
        runtime.release(item).unwrap();
        assert!(runtime.is_live(item));
        runtime.release(array).unwrap();
        assert!(!runtime.is_live(item));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_blocks_receive_themselves() {
        let runtime = NativeRuntime::new();
        let int = TypeDescriptor::int(IntWidth::W32, true);
        let entry = MethodEntry::new(
            layout(int.clone(), vec![TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void)), int], 1),
            |call| {
                let x: i32 = call.arg(0);
                call.set_return(x * 2);
                Ok(())
            },
        );
        let block = runtime.create_block(entry);
        let frame = runtime.invoke_block(block, |f| f.write_arg(1, 21i32)).unwrap().unwrap();
        assert_eq!(frame.read_return::<i32>(), 42);
        assert!(runtime.invoke_block(NIL, |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_dictionary_string_keys() {
        let runtime = NativeRuntime::new();
        let key = runtime.new_string("k");
        let value = runtime.new_number(NumberValue::Int(3));
        let dict = runtime.new_dictionary(vec![(key, value)]);
        let probe = runtime.new_string("k");
        assert_eq!(runtime.dictionary_get(dict, probe), Some(value));
        assert_eq!(runtime.number_value(value).map(NumberValue::as_f64), Some(3.0));
    }
}
