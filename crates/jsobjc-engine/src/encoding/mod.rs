//! Native type encodings
//!
//! Parses Objective-C type-encoding strings into [`TypeDescriptor`] trees
//! and computes their layout for a target ABI.
//!
//! Grammar accepted by the decoder:
//!
//! | Code | Type |
//! |------|------|
//! | `c i s l q` | signed 8/32/16/32/64-bit integers (`l` is always 32-bit) |
//! | `C I S L Q` | unsigned counterparts |
//! | `f d B v` | float, double, bool, void |
//! | `*` | C string |
//! | `@` `@"Name"` `@"<Proto>"` | object, optionally class/protocol typed |
//! | `@"Protocol"` | protocol object |
//! | `@?` `@?<sig>` | block, optionally with its signature |
//! | `#` `:` | class, selector |
//! | `^T` `^?` | pointer, function pointer |
//! | `[N T]` `[T]` | constant array, incomplete array |
//! | `{Name=...}` `(Name=...)` | struct, union (fields may be `"name"`-prefixed) |
//! | `r n N o O R V A` | qualifiers, ignored |

mod layout;
mod parser;

use std::fmt;
use std::rc::Rc;

pub use layout::{
    align_of, compute_struct_layout, is_homogeneous_float_aggregate, msg_send_variant,
    return_convention, size_of, Abi, MsgSendVariant, ReturnConvention,
};
pub use parser::{StructCache, TypeDecoder};

// ============================================================================
// Type descriptors
// ============================================================================

/// Width of a native integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    /// 8 bits
    W8,
    /// 16 bits
    W16,
    /// 32 bits
    W32,
    /// 64 bits
    W64,
}

impl IntWidth {
    /// Width in bytes
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }

    /// Width in bits
    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// Static typing carried by an `id` encoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectType {
    /// Class name from `@"Name"`
    pub class: Option<Rc<str>>,
    /// Protocol names from `@"<P1><P2>"`
    pub protocols: Vec<Rc<str>>,
}

/// A field of a struct or union
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    /// Field name
    pub name: Rc<str>,
    /// Field type
    pub ty: TypeDescriptor,
    /// Byte offset from the start of the aggregate
    pub offset: usize,
}

/// Decoded aggregate with its ABI layout
#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    /// Struct name (`?` for anonymous aggregates)
    pub name: Rc<str>,
    /// Fields in declaration order
    pub fields: Vec<StructField>,
    /// Total size including tail padding
    pub size: usize,
    /// Alignment
    pub align: usize,
    /// Whether all fields share offset zero
    pub is_union: bool,
}

impl StructLayout {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| &*f.name == name)
    }
}

/// A function, method or block signature. Method signatures include the
/// receiver and selector parameters; block signatures include the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Return type
    pub ret: TypeDescriptor,
    /// Parameter types
    pub params: Vec<TypeDescriptor>,
}

impl Signature {
    /// Render back to an encoding string without offsets
    pub fn encode(&self) -> String {
        let mut out = self.ret.encode();
        for p in &self.params {
            out.push_str(&p.encode());
        }
        out
    }
}

/// A decoded native type
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    /// `v`
    Void,
    /// `B`
    Bool,
    /// Integer of a given width and signedness
    Int {
        /// Width
        width: IntWidth,
        /// Signedness
        signed: bool,
    },
    /// `f`
    Float,
    /// `d`
    Double,
    /// `*`, a NUL-terminated UTF-8 string
    CString,
    /// `^T`
    Pointer(Box<TypeDescriptor>),
    /// `{...}` or `(...)`
    Struct(Rc<StructLayout>),
    /// A named aggregate whose body is unknown; only valid behind a pointer
    Opaque(Rc<str>),
    /// `@`
    Id(ObjectType),
    /// `#`
    Class,
    /// `:`
    Selector,
    /// `@"Protocol"`
    Protocol,
    /// `@?`, with the signature when the encoding carries one
    Block(Option<Rc<Signature>>),
    /// `^?`, with the signature when known
    FunctionPointer(Option<Rc<Signature>>),
    /// `[T]`
    IncompleteArray(Box<TypeDescriptor>),
    /// `[N T]`
    ConstantArray(Box<TypeDescriptor>, usize),
}

impl TypeDescriptor {
    /// Shorthand for an integer type
    pub fn int(width: IntWidth, signed: bool) -> Self {
        TypeDescriptor::Int { width, signed }
    }

    /// An untyped `id`
    pub fn id() -> Self {
        TypeDescriptor::Id(ObjectType::default())
    }

    /// Whether values of this type are passed as a single pointer-sized word
    /// holding an object
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Id(_)
                | TypeDescriptor::Class
                | TypeDescriptor::Protocol
                | TypeDescriptor::Block(_)
        )
    }

    /// Whether this is an integer, bool or floating type
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Bool
                | TypeDescriptor::Int { .. }
                | TypeDescriptor::Float
                | TypeDescriptor::Double
        )
    }

    /// Whether this is `id` or a pointer to one (`NSError **` style out slot)
    pub fn is_object_out_pointer(&self) -> bool {
        matches!(self, TypeDescriptor::Pointer(inner) if matches!(**inner, TypeDescriptor::Id(_)))
    }

    /// Render back to an encoding string
    pub fn encode(&self) -> String {
        match self {
            TypeDescriptor::Void => "v".to_string(),
            TypeDescriptor::Bool => "B".to_string(),
            TypeDescriptor::Int { width, signed } => {
                let code = match (width, signed) {
                    (IntWidth::W8, true) => "c",
                    (IntWidth::W8, false) => "C",
                    (IntWidth::W16, true) => "s",
                    (IntWidth::W16, false) => "S",
                    (IntWidth::W32, true) => "i",
                    (IntWidth::W32, false) => "I",
                    (IntWidth::W64, true) => "q",
                    (IntWidth::W64, false) => "Q",
                };
                code.to_string()
            }
            TypeDescriptor::Float => "f".to_string(),
            TypeDescriptor::Double => "d".to_string(),
            TypeDescriptor::CString => "*".to_string(),
            TypeDescriptor::Pointer(inner) => format!("^{}", inner.encode()),
            TypeDescriptor::Struct(layout) => {
                let (open, close) = if layout.is_union { ('(', ')') } else { ('{', '}') };
                let mut out = format!("{}{}=", open, layout.name);
                for field in &layout.fields {
                    out.push_str(&field.ty.encode());
                }
                out.push(close);
                out
            }
            TypeDescriptor::Opaque(name) => format!("{{{}}}", name),
            TypeDescriptor::Id(object) => {
                if object.class.is_none() && object.protocols.is_empty() {
                    return "@".to_string();
                }
                let mut out = String::from("@\"");
                if let Some(class) = &object.class {
                    out.push_str(class);
                }
                for p in &object.protocols {
                    out.push('<');
                    out.push_str(p);
                    out.push('>');
                }
                out.push('"');
                out
            }
            TypeDescriptor::Class => "#".to_string(),
            TypeDescriptor::Selector => ":".to_string(),
            TypeDescriptor::Protocol => "@\"Protocol\"".to_string(),
            TypeDescriptor::Block(None) => "@?".to_string(),
            TypeDescriptor::Block(Some(sig)) => format!("@?<{}>", sig.encode()),
            TypeDescriptor::FunctionPointer(_) => "^?".to_string(),
            TypeDescriptor::IncompleteArray(inner) => format!("[{}]", inner.encode()),
            TypeDescriptor::ConstantArray(inner, n) => format!("[{}{}]", n, inner.encode()),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
