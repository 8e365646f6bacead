//! Call layouts
//!
//! A [`CallLayout`] describes, once per signature, where every argument of
//! a call lives: its slot in the frame buffer and the register or stack
//! location the target ABI assigns it. Layouts are cached by the bridge and
//! shared by every [`CallFrame`] built from them.

mod frame;

use std::rc::Rc;

pub use frame::CallFrame;

use crate::encoding::{
    is_homogeneous_float_aggregate, msg_send_variant, return_convention, size_of, Abi,
    MsgSendVariant, ReturnConvention, Signature, TypeDescriptor,
};

/// Register file an argument is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    /// General-purpose registers
    Integer,
    /// Floating-point / vector registers
    Float,
}

/// Where the ABI places an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// In `count` consecutive registers starting at `first`
    Registers {
        /// Register file
        class: RegisterClass,
        /// First register index
        first: usize,
        /// Number of registers used
        count: usize,
    },
    /// On the stack at a byte offset from the outgoing argument area
    Stack {
        /// Byte offset
        offset: usize,
    },
    /// A pointer to a caller-owned copy, itself in an integer register or on
    /// the stack
    ByReference {
        /// Integer register holding the pointer, if any
        register: Option<usize>,
    },
    /// Passed out of band (arm64 `x8` for indirect returns)
    Dedicated,
}

/// One argument of a laid-out call
#[derive(Debug, Clone)]
pub struct ArgSlot {
    /// Parameter type
    pub ty: TypeDescriptor,
    /// Byte offset of the argument's storage in the frame buffer
    pub offset: usize,
    /// Bytes reserved for the argument in the frame buffer
    pub size: usize,
    /// ABI location
    pub location: ArgLocation,
}

/// Slot assignment for a signature on one ABI
#[derive(Debug, Clone)]
pub struct CallLayout {
    signature: Rc<Signature>,
    abi: Abi,
    implicit_args: usize,
    slots: Vec<ArgSlot>,
    return_offset: usize,
    return_size: usize,
    convention: ReturnConvention,
    variant: MsgSendVariant,
    hidden_return: Option<ArgLocation>,
    buffer_size: usize,
}

fn slot_size(bytes: usize) -> usize {
    bytes.max(8).div_ceil(8) * 8
}

/// Arrays decay to pointers when passed as parameters
pub(crate) fn decayed(ty: &TypeDescriptor) -> TypeDescriptor {
    match ty {
        TypeDescriptor::ConstantArray(inner, _) | TypeDescriptor::IncompleteArray(inner) => {
            TypeDescriptor::Pointer(inner.clone())
        }
        other => other.clone(),
    }
}

struct Classifier {
    abi: Abi,
    next_int: usize,
    next_float: usize,
    stack: usize,
}

impl Classifier {
    fn new(abi: Abi) -> Self {
        Self {
            abi,
            next_int: 0,
            next_float: 0,
            stack: 0,
        }
    }

    fn stack_slot(&mut self, size: usize) -> ArgLocation {
        let word = self.abi.pointer_size();
        let offset = self.stack;
        self.stack += size.max(word).div_ceil(word) * word;
        ArgLocation::Stack { offset }
    }

    fn int_regs(&mut self, count: usize, size: usize) -> ArgLocation {
        if self.abi == Abi::Armv7 && size == 8 && self.next_int % 2 == 1 {
            // 64-bit values start at an even register
            self.next_int += 1;
        }
        if self.next_int + count <= self.abi.int_arg_registers() {
            let first = self.next_int;
            self.next_int += count;
            ArgLocation::Registers {
                class: RegisterClass::Integer,
                first,
                count,
            }
        } else {
            self.next_int = self.abi.int_arg_registers();
            self.stack_slot(size)
        }
    }

    fn float_regs(&mut self, count: usize, size: usize) -> ArgLocation {
        if self.next_float + count <= self.abi.float_arg_registers() {
            let first = self.next_float;
            self.next_float += count;
            ArgLocation::Registers {
                class: RegisterClass::Float,
                first,
                count,
            }
        } else {
            self.stack_slot(size)
        }
    }

    fn hidden_return(&mut self) -> ArgLocation {
        match self.abi {
            Abi::Arm64 => ArgLocation::Dedicated,
            Abi::I386 => self.stack_slot(4),
            Abi::X86_64 | Abi::Armv7 => self.int_regs(1, self.abi.pointer_size()),
        }
    }

    fn classify(&mut self, ty: &TypeDescriptor) -> ArgLocation {
        let word = self.abi.pointer_size();
        let size = size_of(ty, self.abi);
        match (self.abi, ty) {
            (Abi::I386, _) => self.stack_slot(size),
            (_, TypeDescriptor::Float | TypeDescriptor::Double) if self.abi != Abi::Armv7 => {
                self.float_regs(1, size)
            }
            (Abi::Arm64, TypeDescriptor::Struct(layout)) => {
                if is_homogeneous_float_aggregate(layout) {
                    let members = layout_member_count(layout);
                    self.float_regs(members, size)
                } else if size > 16 {
                    let register = match self.int_regs(1, word) {
                        ArgLocation::Registers { first, .. } => Some(first),
                        _ => None,
                    };
                    ArgLocation::ByReference { register }
                } else {
                    self.int_regs(size.div_ceil(8).max(1), size)
                }
            }
            (Abi::X86_64, TypeDescriptor::Struct(layout)) => {
                if size > 16 {
                    self.stack_slot(size)
                } else if is_homogeneous_float_aggregate(layout) {
                    self.float_regs(size.div_ceil(8).max(1), size)
                } else {
                    self.int_regs(size.div_ceil(8).max(1), size)
                }
            }
            (Abi::Armv7, _) => self.int_regs(size.div_ceil(4).max(1), size),
            _ => self.int_regs(1, size),
        }
    }
}

fn layout_member_count(layout: &crate::encoding::StructLayout) -> usize {
    layout
        .fields
        .iter()
        .map(|f| match &f.ty {
            TypeDescriptor::Struct(inner) => layout_member_count(inner),
            TypeDescriptor::ConstantArray(_, n) => *n,
            _ => 1,
        })
        .sum()
}

impl CallLayout {
    /// Lay out `signature` for `abi`. `implicit_args` counts the leading
    /// parameters the bridge fills itself: 2 for message sends (receiver,
    /// selector), 1 for blocks, 0 for functions.
    pub fn new(signature: Rc<Signature>, implicit_args: usize, abi: Abi) -> Self {
        let convention = return_convention(&signature.ret, abi);
        let variant = msg_send_variant(&signature.ret, abi);
        let mut classifier = Classifier::new(abi);
        let hidden_return = if convention == ReturnConvention::Indirect {
            Some(classifier.hidden_return())
        } else {
            None
        };

        let mut offset = 0usize;
        let mut slots = Vec::with_capacity(signature.params.len());
        for param in &signature.params {
            let ty = decayed(param);
            let size = slot_size(size_of(&ty, abi));
            let location = classifier.classify(&ty);
            slots.push(ArgSlot {
                ty: param.clone(),
                offset,
                size,
                location,
            });
            offset += size;
        }

        let return_size = size_of(&signature.ret, abi);
        let return_offset = offset;
        let buffer_size = offset + slot_size(return_size);

        Self {
            signature,
            abi,
            implicit_args,
            slots,
            return_offset,
            return_size,
            convention,
            variant,
            hidden_return,
            buffer_size,
        }
    }

    /// The signature this layout was built from
    pub fn signature(&self) -> &Rc<Signature> {
        &self.signature
    }

    /// Target ABI
    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Leading parameters filled by the bridge
    pub fn implicit_args(&self) -> usize {
        self.implicit_args
    }

    /// Number of parameters the caller supplies
    pub fn explicit_arg_count(&self) -> usize {
        self.slots.len().saturating_sub(self.implicit_args)
    }

    /// All argument slots, implicit ones first
    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    /// Slot of a caller-supplied argument
    pub fn explicit_slot(&self, index: usize) -> Option<&ArgSlot> {
        self.slots.get(self.implicit_args + index)
    }

    /// Return type
    pub fn return_type(&self) -> &TypeDescriptor {
        &self.signature.ret
    }

    /// Size of the return value
    pub fn return_size(&self) -> usize {
        self.return_size
    }

    /// Return convention
    pub fn convention(&self) -> ReturnConvention {
        self.convention
    }

    /// Message-send entry point
    pub fn msg_send_variant(&self) -> MsgSendVariant {
        self.variant
    }

    /// Location of the hidden return pointer for indirect returns
    pub fn hidden_return(&self) -> Option<ArgLocation> {
        self.hidden_return
    }

    pub(crate) fn return_offset(&self) -> usize {
        self.return_offset
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
