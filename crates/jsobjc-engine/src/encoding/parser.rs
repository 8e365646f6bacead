//! Type-encoding decoder

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::layout::{compute_struct_layout, Abi};
use super::{IntWidth, ObjectType, Signature, StructLayout, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};
use crate::metadata::MetadataRegistry;

/// Decoded structs memoized by name, so every decode of the same struct
/// shares one layout.
#[derive(Debug, Default)]
pub struct StructCache {
    layouts: RefCell<FxHashMap<Rc<str>, Rc<StructLayout>>>,
}

impl StructCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached layout for a struct name
    pub fn get(&self, name: &str) -> Option<Rc<StructLayout>> {
        self.layouts.borrow().get(name).cloned()
    }

    /// Insert if absent; returns the layout that is cached afterwards
    pub fn insert(&self, layout: Rc<StructLayout>) -> Rc<StructLayout> {
        self.layouts
            .borrow_mut()
            .entry(layout.name.clone())
            .or_insert(layout)
            .clone()
    }

    /// Number of cached structs
    pub fn len(&self) -> usize {
        self.layouts.borrow().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Default)]
struct Context {
    behind_pointer: bool,
    named_fields: bool,
}

struct Cursor<'s> {
    src: &'s str,
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> Cursor<'s> {
    fn new(src: &'s str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_digits(&mut self) {
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn read_number(&mut self) -> Option<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        self.src[start..self.pos].parse().ok()
    }

    /// Read up to (not including) `end`, consuming the terminator
    fn read_until(&mut self, end: u8) -> Option<&'s str> {
        let start = self.pos;
        let offset = self.bytes[start..].iter().position(|b| *b == end)?;
        self.pos = start + offset + 1;
        Some(&self.src[start..start + offset])
    }

    /// The code at `start` plus any digits following it
    fn fragment(&self, start: usize) -> &'s str {
        let mut end = (start + 1).min(self.bytes.len());
        while end < self.bytes.len() && self.bytes[end].is_ascii_digit() {
            end += 1;
        }
        &self.src[start..end]
    }
}

/// Decodes encoding strings against a registry and struct cache
pub struct TypeDecoder<'a> {
    registry: &'a MetadataRegistry,
    cache: &'a StructCache,
    abi: Abi,
    in_progress: RefCell<Vec<Rc<str>>>,
}

impl<'a> TypeDecoder<'a> {
    /// Create a decoder for `abi`
    pub fn new(registry: &'a MetadataRegistry, cache: &'a StructCache, abi: Abi) -> Self {
        Self {
            registry,
            cache,
            abi,
            in_progress: RefCell::new(Vec::new()),
        }
    }

    /// Decode a single type; the whole string must be consumed
    pub fn decode(&self, encoding: &str) -> BridgeResult<TypeDescriptor> {
        let mut cur = Cursor::new(encoding);
        let ty = self.parse_type(&mut cur, Context::default())?;
        if !cur.at_end() {
            return Err(BridgeError::bad_encoding(
                &encoding[cur.pos..],
                "Unexpected trailing characters",
            ));
        }
        Ok(ty)
    }

    /// Decode a method or function signature; stack offsets are skipped
    pub fn decode_signature(&self, encoding: &str) -> BridgeResult<Signature> {
        let mut cur = Cursor::new(encoding);
        let mut types = Vec::new();
        cur.skip_digits();
        while !cur.at_end() {
            types.push(self.parse_type(&mut cur, Context::default())?);
            cur.skip_digits();
        }
        let mut types = types.into_iter();
        let ret = types
            .next()
            .ok_or_else(|| BridgeError::bad_encoding(encoding, "Empty signature"))?;
        Ok(Signature {
            ret,
            params: types.collect(),
        })
    }

    fn parse_type(&self, cur: &mut Cursor<'_>, ctx: Context) -> BridgeResult<TypeDescriptor> {
        while matches!(
            cur.peek(),
            Some(b'r' | b'n' | b'N' | b'o' | b'O' | b'R' | b'V' | b'A')
        ) {
            cur.bump();
        }
        let start = cur.pos;
        let Some(code) = cur.bump() else {
            return Err(BridgeError::bad_encoding(cur.src, "Unexpected end of type"));
        };
        let int = |width, signed| -> BridgeResult<TypeDescriptor> {
            Ok(TypeDescriptor::Int { width, signed })
        };
        match code {
            b'v' => Ok(TypeDescriptor::Void),
            b'B' => Ok(TypeDescriptor::Bool),
            b'c' => int(IntWidth::W8, true),
            b'C' => int(IntWidth::W8, false),
            b's' => int(IntWidth::W16, true),
            b'S' => int(IntWidth::W16, false),
            b'i' | b'l' => int(IntWidth::W32, true),
            b'I' | b'L' => int(IntWidth::W32, false),
            b'q' => int(IntWidth::W64, true),
            b'Q' => int(IntWidth::W64, false),
            b'f' => Ok(TypeDescriptor::Float),
            b'd' => Ok(TypeDescriptor::Double),
            b'*' => Ok(TypeDescriptor::CString),
            b'#' => Ok(TypeDescriptor::Class),
            b':' => Ok(TypeDescriptor::Selector),
            b'@' => self.parse_object(cur, ctx),
            b'^' => {
                if cur.peek() == Some(b'?') {
                    cur.bump();
                    return Ok(TypeDescriptor::FunctionPointer(None));
                }
                let pointee = self.parse_type(
                    cur,
                    Context {
                        behind_pointer: true,
                        named_fields: false,
                    },
                )?;
                Ok(TypeDescriptor::Pointer(Box::new(pointee)))
            }
            b'[' => self.parse_array(cur, ctx),
            b'{' => self.parse_aggregate(cur, ctx, false),
            b'(' => self.parse_aggregate(cur, ctx, true),
            b'b' => Err(BridgeError::bad_encoding(
                cur.fragment(start),
                "Bitfields are not supported",
            )),
            b'D' => Err(BridgeError::bad_encoding(
                cur.fragment(start),
                "long double is not supported",
            )),
            b'j' => Err(BridgeError::bad_encoding(
                cur.fragment(start),
                "Complex types are not supported",
            )),
            b'?' => Err(BridgeError::bad_encoding(
                cur.fragment(start),
                "Unknown type",
            )),
            _ => Err(BridgeError::bad_encoding(
                cur.fragment(start),
                format!("Unknown type code '{}'", code as char),
            )),
        }
    }

    fn parse_object(&self, cur: &mut Cursor<'_>, ctx: Context) -> BridgeResult<TypeDescriptor> {
        match cur.peek() {
            Some(b'?') => {
                cur.bump();
                if cur.peek() != Some(b'<') {
                    return Ok(TypeDescriptor::Block(None));
                }
                cur.bump();
                let start = cur.pos;
                let mut depth = 1usize;
                while let Some(b) = cur.bump() {
                    match b {
                        b'<' => depth += 1,
                        b'>' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                if depth != 0 {
                    return Err(BridgeError::bad_encoding(
                        &cur.src[start - 3..],
                        "Unterminated block signature",
                    ));
                }
                let inner = &cur.src[start..cur.pos - 1];
                let signature = self.decode_signature(inner)?;
                Ok(TypeDescriptor::Block(Some(Rc::new(signature))))
            }
            Some(b'"') if self.quote_is_class_name(cur, ctx) => {
                cur.bump();
                let name = cur.read_until(b'"').ok_or_else(|| {
                    BridgeError::bad_encoding(cur.src, "Unterminated class name")
                })?;
                if name == "Protocol" {
                    return Ok(TypeDescriptor::Protocol);
                }
                let (class, protocols) = match name.find('<') {
                    Some(i) => (&name[..i], &name[i..]),
                    None => (name, ""),
                };
                let protocols = protocols
                    .split(['<', '>'])
                    .filter(|p| !p.is_empty())
                    .map(Rc::from)
                    .collect();
                Ok(TypeDescriptor::Id(ObjectType {
                    class: if class.is_empty() {
                        None
                    } else {
                        Some(Rc::from(class))
                    },
                    protocols,
                }))
            }
            _ => Ok(TypeDescriptor::id()),
        }
    }

    /// Inside a struct with quoted field names, `@"X"` is ambiguous with a
    /// plain `@` followed by the next field's name. Treat the quote as a
    /// class name only when it is followed by another field or the end of
    /// the aggregate.
    fn quote_is_class_name(&self, cur: &Cursor<'_>, ctx: Context) -> bool {
        if !ctx.named_fields {
            return true;
        }
        let rest = &cur.bytes[cur.pos + 1..];
        match rest.iter().position(|b| *b == b'"') {
            Some(close) => matches!(
                rest.get(close + 1),
                None | Some(b'"') | Some(b'}') | Some(b')')
            ),
            None => false,
        }
    }

    fn parse_array(&self, cur: &mut Cursor<'_>, ctx: Context) -> BridgeResult<TypeDescriptor> {
        let start = cur.pos - 1;
        let count = cur.read_number();
        let element = self.parse_type(
            cur,
            Context {
                behind_pointer: ctx.behind_pointer,
                named_fields: false,
            },
        )?;
        if cur.bump() != Some(b']') {
            return Err(BridgeError::bad_encoding(
                &cur.src[start..],
                "Unterminated array",
            ));
        }
        Ok(match count {
            Some(n) => TypeDescriptor::ConstantArray(Box::new(element), n),
            None => TypeDescriptor::IncompleteArray(Box::new(element)),
        })
    }

    fn parse_aggregate(
        &self,
        cur: &mut Cursor<'_>,
        ctx: Context,
        is_union: bool,
    ) -> BridgeResult<TypeDescriptor> {
        let start = cur.pos - 1;
        let close = if is_union { b')' } else { b'}' };
        let name_start = cur.pos;
        while cur.peek().is_some_and(|b| b != b'=' && b != close) {
            cur.bump();
        }
        let name: Rc<str> = Rc::from(&cur.src[name_start..cur.pos]);
        match cur.bump() {
            Some(b) if b == close => return self.resolve_named(&name, cur.src, start, ctx),
            Some(b'=') => {}
            _ => {
                return Err(BridgeError::bad_encoding(
                    &cur.src[start..],
                    "Unterminated aggregate",
                ))
            }
        }

        if cur.peek() == Some(close) {
            cur.bump();
            return self.resolve_named(&name, cur.src, start, ctx);
        }

        let named_fields = cur.peek() == Some(b'"');
        let mut fields = Vec::new();
        self.in_progress.borrow_mut().push(name.clone());
        let parsed = (|| -> BridgeResult<()> {
            while cur.peek() != Some(close) {
                if cur.at_end() {
                    return Err(BridgeError::bad_encoding(
                        &cur.src[start..],
                        "Unterminated aggregate",
                    ));
                }
                let field_name = if cur.peek() == Some(b'"') {
                    cur.bump();
                    let n = cur.read_until(b'"').ok_or_else(|| {
                        BridgeError::bad_encoding(&cur.src[start..], "Unterminated field name")
                    })?;
                    Some(Rc::<str>::from(n))
                } else {
                    None
                };
                let ty = self.parse_type(
                    cur,
                    Context {
                        behind_pointer: false,
                        named_fields,
                    },
                )?;
                fields.push((field_name, ty));
            }
            cur.bump();
            Ok(())
        })();
        self.in_progress.borrow_mut().pop();
        parsed?;

        if &*name != "?" {
            if let Some(cached) = self.cache.get(&name) {
                return Ok(TypeDescriptor::Struct(cached));
            }
        }

        let registered_names = self
            .registry
            .find_struct(&name)
            .filter(|meta| meta.field_names.len() == fields.len())
            .map(|meta| meta.field_names.clone());
        let fields = fields
            .into_iter()
            .enumerate()
            .map(|(i, (field_name, ty))| {
                let resolved = field_name
                    .or_else(|| registered_names.as_ref().map(|names| names[i].clone()))
                    .unwrap_or_else(|| Rc::from(format!("field{}", i)));
                (resolved, ty)
            })
            .collect();
        let layout = Rc::new(compute_struct_layout(name.clone(), fields, is_union, self.abi));
        Ok(TypeDescriptor::Struct(if &*name == "?" {
            layout
        } else {
            self.cache.insert(layout)
        }))
    }

    /// Resolve a body-less aggregate reference such as `{CGPoint}` or
    /// `{__CFString=}`
    fn resolve_named(
        &self,
        name: &Rc<str>,
        src: &str,
        start: usize,
        ctx: Context,
    ) -> BridgeResult<TypeDescriptor> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(TypeDescriptor::Struct(cached));
        }
        if self.in_progress.borrow().iter().any(|n| n == name) {
            return Ok(TypeDescriptor::Opaque(name.clone()));
        }
        if let Some(meta) = self.registry.find_struct(name) {
            let meta = meta.clone();
            self.in_progress.borrow_mut().push(name.clone());
            let decoded = self.decode_fields(&meta.encoding);
            self.in_progress.borrow_mut().pop();
            let types = decoded?;
            if types.len() != meta.field_names.len() {
                return Err(BridgeError::bad_encoding(
                    &meta.encoding,
                    format!(
                        "Struct {} declares {} field names for {} field types",
                        name,
                        meta.field_names.len(),
                        types.len()
                    ),
                ));
            }
            let fields = meta.field_names.iter().cloned().zip(types).collect();
            let layout = compute_struct_layout(name.clone(), fields, false, self.abi);
            return Ok(TypeDescriptor::Struct(self.cache.insert(Rc::new(layout))));
        }
        if ctx.behind_pointer {
            return Ok(TypeDescriptor::Opaque(name.clone()));
        }
        let end = src[start..]
            .find(['}', ')'])
            .map(|i| start + i + 1)
            .unwrap_or(src.len());
        Err(BridgeError::bad_encoding(
            &src[start..end],
            format!("Unresolved struct reference {}", name),
        ))
    }

    fn decode_fields(&self, encoding: &str) -> BridgeResult<Vec<TypeDescriptor>> {
        let mut cur = Cursor::new(encoding);
        let mut types = Vec::new();
        while !cur.at_end() {
            types.push(self.parse_type(&mut cur, Context::default())?);
        }
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::size_of;
    use crate::metadata::StructMeta;
    use pretty_assertions::assert_eq;

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.register_struct(StructMeta::new("CGPoint", &[("x", "d"), ("y", "d")]));
        registry.register_struct(StructMeta::new("CGSize", &[("width", "d"), ("height", "d")]));
        registry.register_struct(StructMeta::new(
            "CGRect",
            &[("origin", "{CGPoint}"), ("size", "{CGSize}")],
        ));
        registry
    }

    fn decode(encoding: &str) -> BridgeResult<TypeDescriptor> {
        let registry = registry();
        let cache = StructCache::new();
        TypeDecoder::new(&registry, &cache, Abi::X86_64).decode(encoding)
    }

    #[test]
    fn test_primitives() {
        assert_eq!(decode("i").unwrap(), TypeDescriptor::int(IntWidth::W32, true));
        assert_eq!(decode("l").unwrap(), TypeDescriptor::int(IntWidth::W32, true));
        assert_eq!(decode("Q").unwrap(), TypeDescriptor::int(IntWidth::W64, false));
        assert_eq!(decode("B").unwrap(), TypeDescriptor::Bool);
        assert_eq!(decode("r*").unwrap(), TypeDescriptor::CString);
        assert_eq!(decode(":").unwrap(), TypeDescriptor::Selector);
    }

    #[test]
    fn test_pointers_and_arrays() {
        assert_eq!(
            decode("^^i").unwrap(),
            TypeDescriptor::Pointer(Box::new(TypeDescriptor::Pointer(Box::new(
                TypeDescriptor::int(IntWidth::W32, true)
            ))))
        );
        assert_eq!(
            decode("[4f]").unwrap(),
            TypeDescriptor::ConstantArray(Box::new(TypeDescriptor::Float), 4)
        );
        assert_eq!(
            decode("[c]").unwrap(),
            TypeDescriptor::IncompleteArray(Box::new(TypeDescriptor::int(IntWidth::W8, true)))
        );
        assert_eq!(decode("^?").unwrap(), TypeDescriptor::FunctionPointer(None));
    }

    #[test]
    fn test_object_types() {
        let ty = decode("@\"NSString<NSCopying>\"").unwrap();
        match ty {
            TypeDescriptor::Id(object) => {
                assert_eq!(object.class.as_deref(), Some("NSString"));
                assert_eq!(object.protocols.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decode("@\"Protocol\"").unwrap(), TypeDescriptor::Protocol);
        assert_eq!(decode("@?").unwrap(), TypeDescriptor::Block(None));
    }

    #[test]
    fn test_block_with_signature() {
        match decode("@?<v@?i>").unwrap() {
            TypeDescriptor::Block(Some(sig)) => {
                assert_eq!(sig.ret, TypeDescriptor::Void);
                assert_eq!(sig.params.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_struct_reference_resolves_through_registry() {
        let registry = registry();
        let cache = StructCache::new();
        let decoder = TypeDecoder::new(&registry, &cache, Abi::X86_64);
        let rect = decoder.decode("{CGRect}").unwrap();
        let TypeDescriptor::Struct(layout) = &rect else {
            panic!("expected struct");
        };
        assert_eq!(layout.size, 32);
        let names: Vec<&str> = layout.fields.iter().map(|f| &*f.name).collect();
        assert_eq!(names, vec!["origin", "size"]);
        assert_eq!(layout.fields[1].offset, 16);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_struct_memoized_by_name() {
        let registry = registry();
        let cache = StructCache::new();
        let decoder = TypeDecoder::new(&registry, &cache, Abi::X86_64);
        let a = decoder.decode("{CGPoint=dd}").unwrap();
        let b = decoder.decode("{CGPoint}").unwrap();
        match (&a, &b) {
            (TypeDescriptor::Struct(a), TypeDescriptor::Struct(b)) => {
                assert!(Rc::ptr_eq(a, b));
                assert_eq!(&*a.fields[0].name, "x");
            }
            _ => panic!("expected structs"),
        }
    }

    #[test]
    fn test_quoted_field_names() {
        match decode("{Pair=\"key\"@\"value\"i}").unwrap() {
            TypeDescriptor::Struct(layout) => {
                assert_eq!(&*layout.fields[0].name, "key");
                assert_eq!(layout.fields[0].ty, TypeDescriptor::id());
                assert_eq!(&*layout.fields[1].name, "value");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recursive_struct_behind_pointer() {
        match decode("{Node=^{Node}i}").unwrap() {
            TypeDescriptor::Struct(layout) => {
                assert_eq!(
                    layout.fields[0].ty,
                    TypeDescriptor::Pointer(Box::new(TypeDescriptor::Opaque(Rc::from("Node"))))
                );
                assert_eq!(layout.size, 16);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            decode("^{__CFString=}").unwrap(),
            TypeDescriptor::Pointer(Box::new(TypeDescriptor::Opaque(Rc::from("__CFString"))))
        );
    }

    #[test]
    fn test_union_decoding() {
        let ty = decode("(Value=id)").unwrap();
        assert_eq!(size_of(&ty, Abi::X86_64), 8);
    }

    #[test]
    fn test_errors_name_fragment() {
        let err = decode("b4").unwrap_err();
        assert!(err.to_string().contains("\"b4\""));
        let err = decode("{Missing}").unwrap_err();
        assert!(err.to_string().contains("Missing"));
        assert_eq!(err.error_name(), "MetadataError");
        assert!(decode("x").unwrap_err().to_string().contains("'x'"));
        assert!(decode("ii").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_signature_with_offsets() {
        let registry = registry();
        let cache = StructCache::new();
        let decoder = TypeDecoder::new(&registry, &cache, Abi::X86_64);
        let sig = decoder.decode_signature("v24@0:8i16").unwrap();
        assert_eq!(sig.ret, TypeDescriptor::Void);
        assert_eq!(
            sig.params,
            vec![
                TypeDescriptor::id(),
                TypeDescriptor::Selector,
                TypeDescriptor::int(IntWidth::W32, true)
            ]
        );
        assert_eq!(sig.encode(), "v@:i");
    }
}
