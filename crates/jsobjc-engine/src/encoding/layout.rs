//! ABI layout rules
//!
//! Sizes, alignments and return conventions per target architecture. All
//! functions here are pure in `(type, abi)`.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{IntWidth, StructField, StructLayout, TypeDescriptor};

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Abi {
    /// 64-bit ARM (AAPCS64, Apple variant)
    Arm64,
    /// x86-64 System V
    X86_64,
    /// 32-bit ARM
    Armv7,
    /// 32-bit x86
    I386,
}

impl Abi {
    /// The architecture this crate was compiled for
    pub fn host() -> Abi {
        if cfg!(target_arch = "aarch64") {
            Abi::Arm64
        } else if cfg!(target_arch = "arm") {
            Abi::Armv7
        } else if cfg!(target_arch = "x86") {
            Abi::I386
        } else {
            Abi::X86_64
        }
    }

    /// Pointer size in bytes
    pub fn pointer_size(self) -> usize {
        match self {
            Abi::Arm64 | Abi::X86_64 => 8,
            Abi::Armv7 | Abi::I386 => 4,
        }
    }

    /// Number of integer argument registers
    pub fn int_arg_registers(self) -> usize {
        match self {
            Abi::Arm64 => 8,
            Abi::X86_64 => 6,
            Abi::Armv7 => 4,
            Abi::I386 => 0,
        }
    }

    /// Number of floating-point argument registers
    pub fn float_arg_registers(self) -> usize {
        match self {
            Abi::Arm64 | Abi::X86_64 => 8,
            Abi::Armv7 | Abi::I386 => 0,
        }
    }
}

/// How a return value comes back from a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnConvention {
    /// Nothing is returned
    Void,
    /// In general-purpose registers
    Register,
    /// In floating-point registers
    FloatRegister,
    /// Through caller-allocated memory whose address is passed hidden
    Indirect,
}

/// Which message-send entry point a signature needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgSendVariant {
    /// `objc_msgSend`
    Normal,
    /// `objc_msgSend_stret`
    Stret,
    /// `objc_msgSend_fpret`
    Fpret,
}

fn round_up(n: usize, align: usize) -> usize {
    if align <= 1 {
        n
    } else {
        n.div_ceil(align) * align
    }
}

/// Size of a value of type `ty`
pub fn size_of(ty: &TypeDescriptor, abi: Abi) -> usize {
    match ty {
        TypeDescriptor::Void | TypeDescriptor::Opaque(_) => 0,
        TypeDescriptor::Bool => 1,
        TypeDescriptor::Int { width, .. } => width.bytes(),
        TypeDescriptor::Float => 4,
        TypeDescriptor::Double => 8,
        TypeDescriptor::Struct(layout) => layout.size,
        TypeDescriptor::IncompleteArray(_) => 0,
        TypeDescriptor::ConstantArray(inner, n) => size_of(inner, abi) * n,
        TypeDescriptor::CString
        | TypeDescriptor::Pointer(_)
        | TypeDescriptor::Id(_)
        | TypeDescriptor::Class
        | TypeDescriptor::Selector
        | TypeDescriptor::Protocol
        | TypeDescriptor::Block(_)
        | TypeDescriptor::FunctionPointer(_) => abi.pointer_size(),
    }
}

/// Alignment of `ty` as a struct member
pub fn align_of(ty: &TypeDescriptor, abi: Abi) -> usize {
    match ty {
        TypeDescriptor::Void | TypeDescriptor::Opaque(_) => 1,
        TypeDescriptor::Int {
            width: IntWidth::W64,
            ..
        }
        | TypeDescriptor::Double => match abi {
            // Both 32-bit Apple ABIs align 8-byte scalars to 4
            Abi::I386 | Abi::Armv7 => 4,
            Abi::Arm64 | Abi::X86_64 => 8,
        },
        TypeDescriptor::Struct(layout) => layout.align,
        TypeDescriptor::IncompleteArray(inner) | TypeDescriptor::ConstantArray(inner, _) => {
            align_of(inner, abi)
        }
        other => size_of(other, abi).max(1),
    }
}

/// Lay out fields in declaration order with natural alignment
pub fn compute_struct_layout(
    name: Rc<str>,
    fields: Vec<(Rc<str>, TypeDescriptor)>,
    is_union: bool,
    abi: Abi,
) -> StructLayout {
    let mut offset = 0usize;
    let mut extent = 0usize;
    let mut align = 1usize;
    let mut laid_out = Vec::with_capacity(fields.len());

    for (field_name, ty) in fields {
        let field_align = align_of(&ty, abi);
        let field_size = size_of(&ty, abi);
        align = align.max(field_align);
        let field_offset = if is_union { 0 } else { round_up(offset, field_align) };
        if is_union {
            extent = extent.max(field_size);
        } else {
            offset = field_offset + field_size;
            extent = offset;
        }
        laid_out.push(StructField {
            name: field_name,
            ty,
            offset: field_offset,
        });
    }

    StructLayout {
        name,
        fields: laid_out,
        size: round_up(extent, align),
        align,
        is_union,
    }
}

fn collect_scalars(ty: &TypeDescriptor, out: &mut Vec<TypeDescriptor>) {
    match ty {
        TypeDescriptor::Struct(layout) => {
            for field in &layout.fields {
                collect_scalars(&field.ty, out);
            }
        }
        TypeDescriptor::ConstantArray(inner, n) => {
            for _ in 0..*n {
                collect_scalars(inner, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Whether `layout` is a homogeneous floating-point aggregate: one to four
/// members, all `float` or all `double`.
pub fn is_homogeneous_float_aggregate(layout: &StructLayout) -> bool {
    if layout.is_union {
        return false;
    }
    let mut scalars = Vec::new();
    for field in &layout.fields {
        collect_scalars(&field.ty, &mut scalars);
    }
    if scalars.is_empty() || scalars.len() > 4 {
        return false;
    }
    let first = &scalars[0];
    matches!(first, TypeDescriptor::Float | TypeDescriptor::Double)
        && scalars.iter().all(|s| s == first)
}

/// Choose the return convention for `ty` on `abi`
pub fn return_convention(ty: &TypeDescriptor, abi: Abi) -> ReturnConvention {
    match ty {
        TypeDescriptor::Void => ReturnConvention::Void,
        TypeDescriptor::Float | TypeDescriptor::Double => ReturnConvention::FloatRegister,
        TypeDescriptor::Struct(layout) => match abi {
            Abi::Arm64 => {
                if is_homogeneous_float_aggregate(layout) {
                    ReturnConvention::FloatRegister
                } else if layout.size > 16 {
                    ReturnConvention::Indirect
                } else {
                    ReturnConvention::Register
                }
            }
            Abi::X86_64 => {
                if layout.size > 16 {
                    ReturnConvention::Indirect
                } else if is_homogeneous_float_aggregate(layout) {
                    ReturnConvention::FloatRegister
                } else {
                    ReturnConvention::Register
                }
            }
            Abi::Armv7 => {
                if layout.size > 4 {
                    ReturnConvention::Indirect
                } else {
                    ReturnConvention::Register
                }
            }
            Abi::I386 => match layout.size {
                1 | 2 | 4 | 8 => ReturnConvention::Register,
                _ => ReturnConvention::Indirect,
            },
        },
        _ => ReturnConvention::Register,
    }
}

/// Choose the message-send entry point for a return type on `abi`.
/// arm64 has no stret entry point; large aggregates go through `x8`.
pub fn msg_send_variant(ret: &TypeDescriptor, abi: Abi) -> MsgSendVariant {
    match (return_convention(ret, abi), abi) {
        (ReturnConvention::Indirect, Abi::Arm64) => MsgSendVariant::Normal,
        (ReturnConvention::Indirect, _) => MsgSendVariant::Stret,
        (_, Abi::I386) if matches!(ret, TypeDescriptor::Float | TypeDescriptor::Double) => {
            MsgSendVariant::Fpret
        }
        _ => MsgSendVariant::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_of(fields: &[TypeDescriptor], abi: Abi) -> StructLayout {
        compute_struct_layout(
            Rc::from("S"),
            fields
                .iter()
                .enumerate()
                .map(|(i, t)| (Rc::from(format!("f{}", i)), t.clone()))
                .collect(),
            false,
            abi,
        )
    }

    fn int(width: IntWidth) -> TypeDescriptor {
        TypeDescriptor::int(width, true)
    }

    #[test]
    fn test_padding_between_fields() {
        let layout = layout_of(&[int(IntWidth::W8), TypeDescriptor::Double], Abi::X86_64);
        assert_eq!(layout.fields[1].offset, 8);
        assert_eq!(layout.size, 16);
        assert_eq!(layout.align, 8);
    }

    #[test]
    fn test_i386_packs_doubles_to_four() {
        let layout = layout_of(&[int(IntWidth::W32), TypeDescriptor::Double], Abi::I386);
        assert_eq!(layout.fields[1].offset, 4);
        assert_eq!(layout.size, 12);
    }

    #[test]
    fn test_int_then_double_on_each_abi() {
        let fields = [int(IntWidth::W32), TypeDescriptor::Double];
        for (abi, offset, size, align) in [
            (Abi::Arm64, 8, 16, 8),
            (Abi::X86_64, 8, 16, 8),
            (Abi::Armv7, 4, 12, 4),
            (Abi::I386, 4, 12, 4),
        ] {
            let layout = layout_of(&fields, abi);
            assert_eq!(
                (layout.fields[1].offset, layout.size, layout.align),
                (offset, size, align),
                "{abi:?}"
            );
        }
    }

    #[test]
    fn test_armv7_long_long_aligns_to_four() {
        let layout = layout_of(&[int(IntWidth::W8), int(IntWidth::W64)], Abi::Armv7);
        assert_eq!(layout.fields[1].offset, 4);
        assert_eq!(layout.size, 12);
    }

    #[test]
    fn test_tail_padding() {
        let layout = layout_of(&[int(IntWidth::W32), int(IntWidth::W8)], Abi::Arm64);
        assert_eq!(layout.size, 8);
    }

    #[test]
    fn test_union_layout() {
        let layout = compute_struct_layout(
            Rc::from("U"),
            vec![
                (Rc::from("a"), int(IntWidth::W8)),
                (Rc::from("b"), TypeDescriptor::Double),
            ],
            true,
            Abi::Arm64,
        );
        assert!(layout.fields.iter().all(|f| f.offset == 0));
        assert_eq!(layout.size, 8);
    }

    #[test]
    fn test_struct_return_thresholds_differ_by_abi() {
        let big = TypeDescriptor::Struct(Rc::new(layout_of(
            &[int(IntWidth::W64), int(IntWidth::W64), int(IntWidth::W64)],
            Abi::X86_64,
        )));
        assert_eq!(return_convention(&big, Abi::X86_64), ReturnConvention::Indirect);
        assert_eq!(msg_send_variant(&big, Abi::X86_64), MsgSendVariant::Stret);
        assert_eq!(return_convention(&big, Abi::Arm64), ReturnConvention::Indirect);
        assert_eq!(msg_send_variant(&big, Abi::Arm64), MsgSendVariant::Normal);

        let small = TypeDescriptor::Struct(Rc::new(layout_of(
            &[int(IntWidth::W32), int(IntWidth::W32)],
            Abi::Armv7,
        )));
        assert_eq!(return_convention(&small, Abi::Armv7), ReturnConvention::Indirect);
        assert_eq!(return_convention(&small, Abi::I386), ReturnConvention::Register);
        assert_eq!(return_convention(&small, Abi::X86_64), ReturnConvention::Register);
    }

    #[test]
    fn test_hfa_returns_in_float_registers_on_arm64() {
        let rect = TypeDescriptor::Struct(Rc::new(layout_of(
            &[
                TypeDescriptor::Double,
                TypeDescriptor::Double,
                TypeDescriptor::Double,
                TypeDescriptor::Double,
            ],
            Abi::Arm64,
        )));
        assert_eq!(return_convention(&rect, Abi::Arm64), ReturnConvention::FloatRegister);
        assert_eq!(return_convention(&rect, Abi::X86_64), ReturnConvention::Indirect);
    }

    #[test]
    fn test_i386_odd_sizes_use_stret() {
        let three = TypeDescriptor::Struct(Rc::new(layout_of(
            &[int(IntWidth::W8), int(IntWidth::W8), int(IntWidth::W8)],
            Abi::I386,
        )));
        assert_eq!(return_convention(&three, Abi::I386), ReturnConvention::Indirect);
        assert_eq!(msg_send_variant(&TypeDescriptor::Double, Abi::I386), MsgSendVariant::Fpret);
        assert_eq!(msg_send_variant(&TypeDescriptor::Double, Abi::X86_64), MsgSendVariant::Normal);
    }
}
