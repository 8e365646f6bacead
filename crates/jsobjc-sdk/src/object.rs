//! Scripting objects
//!
//! A `JsObject` is a shared, identity-compared handle to an object cell.
//! The cell carries a kind (ordinary, array, function, error, binary
//! buffer, typed array or host object) and an insertion-ordered list of own
//! properties.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{JsError, JsResult};
use crate::value::JsValue;

// ============================================================================
// Functions
// ============================================================================

/// Signature of a callable: `(this, args) -> result`
pub type NativeFn = dyn Fn(&JsValue, &[JsValue]) -> JsResult<JsValue>;

/// A callable scripting function backed by a Rust closure.
#[derive(Clone)]
pub struct JsFunction {
    name: Rc<str>,
    call: Rc<NativeFn>,
}

impl JsFunction {
    /// Create a function from a closure
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&JsValue, &[JsValue]) -> JsResult<JsValue> + 'static,
    {
        Self {
            name: Rc::from(name),
            call: Rc::new(f),
        }
    }

    /// The function's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function
    pub fn call(&self, this: &JsValue, args: &[JsValue]) -> JsResult<JsValue> {
        (self.call)(this, args)
    }
}

impl fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsFunction({})", self.name)
    }
}

// ============================================================================
// Host objects
// ============================================================================

/// Native-side state carried by a scripting object.
///
/// The bridge stores wrappers, references, pointers and struct values as
/// host objects and recovers them with [`JsObject::host_data`].
pub trait HostObject: Any {
    /// Class name used in diagnostics
    fn class_name(&self) -> &str;

    /// ToString of the owning object
    fn display(&self) -> String {
        format!("[object {}]", self.class_name())
    }

    /// Upcast used for downcasting to the concrete type
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

// ============================================================================
// Binary data
// ============================================================================

/// A fixed-size byte buffer with a stable backing address.
#[derive(Clone)]
pub struct ArrayBuffer(Rc<RefCell<Box<[u8]>>>);

impl ArrayBuffer {
    /// Allocate a zero-filled buffer
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    /// Take ownership of existing bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(bytes.into_boxed_slice())))
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Whether the buffer has no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the first byte. The allocation never moves.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0.borrow_mut().as_mut_ptr()
    }

    /// Copy out the contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().to_vec()
    }

    /// Copy bytes into the buffer starting at `offset`, clipped to its end
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.0.borrow_mut();
        if offset >= data.len() {
            return;
        }
        let n = bytes.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&bytes[..n]);
    }

    /// Read `len` bytes starting at `offset`, clipped to the buffer's end
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.0.borrow();
        if offset >= data.len() {
            return Vec::new();
        }
        let end = (offset + len).min(data.len());
        data[offset..end].to_vec()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &ArrayBuffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayBuffer({} bytes)", self.len())
    }
}

/// Element type of a typed array view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedArrayKind {
    /// Int8Array
    Int8,
    /// Uint8Array
    Uint8,
    /// Int16Array
    Int16,
    /// Uint16Array
    Uint16,
    /// Int32Array
    Int32,
    /// Uint32Array
    Uint32,
    /// Float32Array
    Float32,
    /// Float64Array
    Float64,
    /// BigInt64Array
    BigInt64,
    /// BigUint64Array
    BigUint64,
}

impl TypedArrayKind {
    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }

    /// Constructor name
    pub fn name(self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
        }
    }
}

/// A typed view over an [`ArrayBuffer`].
#[derive(Clone)]
pub struct TypedArray {
    kind: TypedArrayKind,
    buffer: ArrayBuffer,
    byte_offset: usize,
    length: usize,
}

impl TypedArray {
    /// Allocate a zero-filled array of `length` elements
    pub fn new(kind: TypedArrayKind, length: usize) -> Self {
        Self {
            kind,
            buffer: ArrayBuffer::new(length * kind.element_size()),
            byte_offset: 0,
            length,
        }
    }

    /// View part of an existing buffer. Returns `None` if the view would
    /// extend past the end of the buffer.
    pub fn view(
        kind: TypedArrayKind,
        buffer: ArrayBuffer,
        byte_offset: usize,
        length: usize,
    ) -> Option<Self> {
        let end = byte_offset.checked_add(length.checked_mul(kind.element_size())?)?;
        if end > buffer.len() {
            return None;
        }
        Some(Self {
            kind,
            buffer,
            byte_offset,
            length,
        })
    }

    /// Build an array from numbers
    pub fn from_numbers(kind: TypedArrayKind, values: &[f64]) -> Self {
        let array = Self::new(kind, values.len());
        for (i, v) in values.iter().enumerate() {
            array.set(i, &JsValue::Number(*v));
        }
        array
    }

    /// Element type
    pub fn kind(&self) -> TypedArrayKind {
        self.kind
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view has no elements
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Length of the view in bytes
    pub fn byte_length(&self) -> usize {
        self.length * self.kind.element_size()
    }

    /// Offset of the view into its buffer
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// The backing buffer
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    /// Address of the first element
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: `view` checked that the offset lies within the buffer
        unsafe { self.buffer.as_mut_ptr().add(self.byte_offset) }
    }

    /// Read an element; out-of-range reads yield `undefined`
    pub fn get(&self, index: usize) -> JsValue {
        if index >= self.length {
            return JsValue::Undefined;
        }
        let size = self.kind.element_size();
        let bytes = self.buffer.read(self.byte_offset + index * size, size);
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes);
        match self.kind {
            TypedArrayKind::Int8 => JsValue::Number(raw[0] as i8 as f64),
            TypedArrayKind::Uint8 => JsValue::Number(raw[0] as f64),
            TypedArrayKind::Int16 => {
                JsValue::Number(i16::from_ne_bytes([raw[0], raw[1]]) as f64)
            }
            TypedArrayKind::Uint16 => {
                JsValue::Number(u16::from_ne_bytes([raw[0], raw[1]]) as f64)
            }
            TypedArrayKind::Int32 => {
                JsValue::Number(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64)
            }
            TypedArrayKind::Uint32 => {
                JsValue::Number(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64)
            }
            TypedArrayKind::Float32 => {
                JsValue::Number(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64)
            }
            TypedArrayKind::Float64 => JsValue::Number(f64::from_ne_bytes(raw)),
            TypedArrayKind::BigInt64 => JsValue::BigInt(i64::from_ne_bytes(raw) as i128),
            TypedArrayKind::BigUint64 => JsValue::BigInt(u64::from_ne_bytes(raw) as i128),
        }
    }

    /// Write an element with the wrapping conversion typed arrays use;
    /// out-of-range writes are ignored.
    pub fn set(&self, index: usize, value: &JsValue) {
        if index >= self.length {
            return;
        }
        let offset = self.byte_offset + index * self.kind.element_size();
        let bits = match value {
            JsValue::BigInt(b) => *b as i64,
            other => {
                let n = other.to_number();
                if n.is_finite() {
                    n.trunc() as i128 as i64
                } else {
                    0
                }
            }
        };
        match self.kind {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 => {
                self.buffer.write(offset, &[bits as u8])
            }
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => {
                self.buffer.write(offset, &(bits as u16).to_ne_bytes())
            }
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 => {
                self.buffer.write(offset, &(bits as u32).to_ne_bytes())
            }
            TypedArrayKind::Float32 => {
                self.buffer.write(offset, &(value.to_number() as f32).to_ne_bytes())
            }
            TypedArrayKind::Float64 => self.buffer.write(offset, &value.to_number().to_ne_bytes()),
            TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => {
                self.buffer.write(offset, &bits.to_ne_bytes())
            }
        }
    }
}

// ============================================================================
// Object cells
// ============================================================================

/// What an object is, beyond its property list
pub enum ObjectKind {
    /// A plain object
    Ordinary,
    /// An array with dense elements
    Array(RefCell<Vec<JsValue>>),
    /// A callable
    Function(JsFunction),
    /// An error object (`name`, `message` and `stack` live in properties)
    Error,
    /// An ArrayBuffer
    ArrayBuffer(ArrayBuffer),
    /// A typed array view
    TypedArray(TypedArray),
    /// Host-provided state
    Host(Rc<dyn HostObject>),
}

/// An own property
#[derive(Clone, Debug)]
pub enum PropertySlot {
    /// A plain value
    Data(JsValue),
    /// A getter/setter pair
    Accessor {
        /// Getter function
        get: Option<JsValue>,
        /// Setter function
        set: Option<JsValue>,
    },
}

struct ObjectData {
    kind: ObjectKind,
    props: RefCell<Vec<(Rc<str>, PropertySlot)>>,
}

/// A shared handle to a scripting object. Clones refer to the same object.
#[derive(Clone)]
pub struct JsObject(Rc<ObjectData>);

/// A non-owning handle to a scripting object
#[derive(Clone)]
pub struct WeakJsObject(Weak<ObjectData>);

impl WeakJsObject {
    /// Recover the object if it is still alive
    pub fn upgrade(&self) -> Option<JsObject> {
        self.0.upgrade().map(JsObject)
    }
}

impl fmt::Debug for WeakJsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakJsObject(alive: {})", self.0.strong_count() > 0)
    }
}

impl Default for JsObject {
    fn default() -> Self {
        Self::new()
    }
}

impl JsObject {
    fn with_kind(kind: ObjectKind) -> Self {
        JsObject(Rc::new(ObjectData {
            kind,
            props: RefCell::new(Vec::new()),
        }))
    }

    /// Create an empty ordinary object
    pub fn new() -> Self {
        Self::with_kind(ObjectKind::Ordinary)
    }

    /// Create an array
    pub fn array(elements: Vec<JsValue>) -> Self {
        Self::with_kind(ObjectKind::Array(RefCell::new(elements)))
    }

    /// Create a function object from a closure
    pub fn function<F>(name: &str, f: F) -> Self
    where
        F: Fn(&JsValue, &[JsValue]) -> JsResult<JsValue> + 'static,
    {
        Self::from_function(JsFunction::new(name, f))
    }

    /// Create a function object from an existing function
    pub fn from_function(f: JsFunction) -> Self {
        Self::with_kind(ObjectKind::Function(f))
    }

    /// Create an error object with `name` and `message`
    pub fn error(name: &str, message: &str) -> Self {
        let obj = Self::with_kind(ObjectKind::Error);
        obj.set("name", JsValue::from(name));
        obj.set("message", JsValue::from(message));
        obj
    }

    /// Create an ArrayBuffer object
    pub fn array_buffer(buffer: ArrayBuffer) -> Self {
        Self::with_kind(ObjectKind::ArrayBuffer(buffer))
    }

    /// Create a typed array object
    pub fn typed_array(array: TypedArray) -> Self {
        Self::with_kind(ObjectKind::TypedArray(array))
    }

    /// Create an object carrying host state
    pub fn host<T: HostObject>(data: Rc<T>) -> Self {
        let data: Rc<dyn HostObject> = data;
        Self::with_kind(ObjectKind::Host(data))
    }

    /// The object's kind
    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    /// Whether this object is callable
    pub fn is_function(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Function(_))
    }

    /// Whether this is an array
    pub fn is_array(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Array(_))
    }

    /// Whether this is a plain object
    pub fn is_ordinary(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Ordinary)
    }

    /// Whether this is an error object
    pub fn is_error(&self) -> bool {
        matches!(self.0.kind, ObjectKind::Error)
    }

    /// The function, if callable
    pub fn as_function(&self) -> Option<&JsFunction> {
        match &self.0.kind {
            ObjectKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The host state, if this is a host object
    pub fn host_object(&self) -> Option<&Rc<dyn HostObject>> {
        match &self.0.kind {
            ObjectKind::Host(h) => Some(h),
            _ => None,
        }
    }

    /// The host state downcast to `T`
    pub fn host_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.host_object()
            .and_then(|h| Rc::clone(h).into_any().downcast::<T>().ok())
    }

    /// Call the object as a function
    pub fn call(&self, this: &JsValue, args: &[JsValue]) -> JsResult<JsValue> {
        match &self.0.kind {
            ObjectKind::Function(f) => f.call(this, args),
            _ => Err(JsError::type_error(format!(
                "{} is not a function",
                self.display_string()
            ))),
        }
    }

    /// Read an own data property; arrays also answer `length` and indices.
    /// Accessor properties read as `undefined`; see [`JsObject::get_own_property`].
    pub fn get(&self, key: &str) -> JsValue {
        if let ObjectKind::Array(elements) = &self.0.kind {
            if key == "length" {
                return JsValue::Number(elements.borrow().len() as f64);
            }
            if let Ok(index) = key.parse::<usize>() {
                return elements.borrow().get(index).cloned().unwrap_or_default();
            }
        }
        match self.get_own_property(key) {
            Some(PropertySlot::Data(v)) => v,
            Some(PropertySlot::Accessor { .. }) => JsValue::Undefined,
            None => match &self.0.kind {
                ObjectKind::Function(f) if key == "name" => JsValue::from(f.name()),
                _ => JsValue::Undefined,
            },
        }
    }

    /// Define or overwrite an own data property
    pub fn set(&self, key: &str, value: JsValue) {
        if let ObjectKind::Array(elements) = &self.0.kind {
            if let Ok(index) = key.parse::<usize>() {
                let mut elements = elements.borrow_mut();
                if index >= elements.len() {
                    elements.resize(index + 1, JsValue::Undefined);
                }
                elements[index] = value;
                return;
            }
        }
        self.put(key, PropertySlot::Data(value));
    }

    /// Define an accessor property
    pub fn define_accessor(&self, key: &str, get: Option<JsValue>, set: Option<JsValue>) {
        self.put(key, PropertySlot::Accessor { get, set });
    }

    fn put(&self, key: &str, slot: PropertySlot) {
        let mut props = self.0.props.borrow_mut();
        match props.iter_mut().find(|(k, _)| &**k == key) {
            Some((_, existing)) => *existing = slot,
            None => props.push((Rc::from(key), slot)),
        }
    }

    /// Look up an own property slot
    pub fn get_own_property(&self, key: &str) -> Option<PropertySlot> {
        self.0
            .props
            .borrow()
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, slot)| slot.clone())
    }

    /// Whether an own property (or array index) exists
    pub fn has(&self, key: &str) -> bool {
        if let ObjectKind::Array(elements) = &self.0.kind {
            if let Ok(index) = key.parse::<usize>() {
                return index < elements.borrow().len();
            }
        }
        self.0.props.borrow().iter().any(|(k, _)| &**k == key)
    }

    /// Remove an own property; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let mut props = self.0.props.borrow_mut();
        let before = props.len();
        props.retain(|(k, _)| &**k != key);
        props.len() != before
    }

    /// Own enumerable keys in insertion order (array indices first)
    pub fn keys(&self) -> Vec<Rc<str>> {
        let mut keys = Vec::new();
        if let ObjectKind::Array(elements) = &self.0.kind {
            keys.extend((0..elements.borrow().len()).map(|i| Rc::from(i.to_string())));
        }
        keys.extend(self.0.props.borrow().iter().map(|(k, _)| k.clone()));
        keys
    }

    /// A snapshot of the array elements
    pub fn array_elements(&self) -> Option<Vec<JsValue>> {
        match &self.0.kind {
            ObjectKind::Array(elements) => Some(elements.borrow().clone()),
            _ => None,
        }
    }

    /// Append to an array; no-op on other kinds
    pub fn array_push(&self, value: JsValue) {
        if let ObjectKind::Array(elements) = &self.0.kind {
            elements.borrow_mut().push(value);
        }
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &JsObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// A stable identifier for the lifetime of the object
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Create a weak handle
    pub fn downgrade(&self) -> WeakJsObject {
        WeakJsObject(Rc::downgrade(&self.0))
    }

    /// ToString of the object
    pub fn display_string(&self) -> String {
        match &self.0.kind {
            ObjectKind::Ordinary => "[object Object]".to_string(),
            ObjectKind::Array(elements) => elements
                .borrow()
                .iter()
                .map(|v| {
                    if v.is_nullish() {
                        String::new()
                    } else {
                        v.to_js_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
            ObjectKind::Error => {
                let name = self.get("name").to_js_string();
                let message = self.get("message").to_js_string();
                if message.is_empty() {
                    name
                } else {
                    format!("{}: {}", name, message)
                }
            }
            ObjectKind::ArrayBuffer(_) => "[object ArrayBuffer]".to_string(),
            ObjectKind::TypedArray(array) => (0..array.len())
                .map(|i| array.get(i).to_js_string())
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Host(h) => h.display(),
        }
    }

    fn kind_name(&self) -> &'static str {
        match &self.0.kind {
            ObjectKind::Ordinary => "Object",
            ObjectKind::Array(_) => "Array",
            ObjectKind::Function(_) => "Function",
            ObjectKind::Error => "Error",
            ObjectKind::ArrayBuffer(_) => "ArrayBuffer",
            ObjectKind::TypedArray(_) => "TypedArray",
            ObjectKind::Host(_) => "Host",
        }
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsObject")
            .field("kind", &self.kind_name())
            .field("id", &format_args!("{:#x}", self.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(u32);

    impl HostObject for Marker {
        fn class_name(&self) -> &str {
            "Marker"
        }

        fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
            self
        }
    }

    #[test]
    fn test_properties_keep_insertion_order() {
        let obj = JsObject::new();
        obj.set("b", JsValue::from(1));
        obj.set("a", JsValue::from(2));
        obj.set("b", JsValue::from(3));
        let keys: Vec<String> = obj.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(obj.get("b").as_number(), Some(3.0));
        assert!(obj.delete("b"));
        assert!(!obj.has("b"));
    }

    #[test]
    fn test_array_length_and_indices() {
        let arr = JsObject::array(vec![JsValue::from(1)]);
        arr.set("2", JsValue::from("x"));
        assert_eq!(arr.get("length").as_number(), Some(3.0));
        assert!(arr.get("1").is_undefined());
        assert_eq!(arr.get("2").as_str(), Some("x"));
    }

    #[test]
    fn test_function_call() {
        let f = JsObject::function("double", |_, args| {
            Ok(JsValue::from(args[0].to_number() * 2.0))
        });
        let result = f.call(&JsValue::Undefined, &[JsValue::from(21)]).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
        assert_eq!(f.get("name").as_str(), Some("double"));
        assert!(JsObject::new().call(&JsValue::Undefined, &[]).is_err());
    }

    #[test]
    fn test_host_data_downcast() {
        let obj = JsObject::host(Rc::new(Marker(7)));
        assert_eq!(obj.host_data::<Marker>().map(|m| m.0), Some(7));
        assert!(obj.host_data::<String>().is_none());
        assert_eq!(obj.display_string(), "[object Marker]");
    }

    #[test]
    fn test_weak_handle() {
        let obj = JsObject::new();
        let weak = obj.downgrade();
        assert!(weak.upgrade().is_some_and(|o| o.ptr_eq(&obj)));
        drop(obj);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_typed_array_wraps_on_store() {
        let array = TypedArray::new(TypedArrayKind::Uint8, 2);
        array.set(0, &JsValue::from(257));
        array.set(1, &JsValue::from(-1));
        assert_eq!(array.get(0).as_number(), Some(1.0));
        assert_eq!(array.get(1).as_number(), Some(255.0));
        assert!(array.get(2).is_undefined());
    }

    #[test]
    fn test_typed_array_view_bounds() {
        let buffer = ArrayBuffer::new(8);
        assert!(TypedArray::view(TypedArrayKind::Int32, buffer.clone(), 4, 1).is_some());
        assert!(TypedArray::view(TypedArrayKind::Int32, buffer, 4, 2).is_none());
    }

    #[test]
    fn test_accessor_slot() {
        let obj = JsObject::new();
        let getter = JsValue::from(JsObject::function("get", |_, _| Ok(JsValue::from(1))));
        obj.define_accessor("value", Some(getter), None);
        assert!(obj.get("value").is_undefined());
        assert!(matches!(
            obj.get_own_property("value"),
            Some(PropertySlot::Accessor { get: Some(_), set: None })
        ));
    }
}
