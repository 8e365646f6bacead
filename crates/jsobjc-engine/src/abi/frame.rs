//! Per-call argument storage

use std::cell::UnsafeCell;
use std::fmt;
use std::rc::Rc;

use super::CallLayout;

/// Storage for one in-flight call.
///
/// Every invocation builds its own frame on the caller's stack, so nested
/// and recursive calls never share argument buffers. Slots are 8-byte
/// aligned; implementations read arguments and write the return value
/// through raw slot pointers.
pub struct CallFrame {
    layout: Rc<CallLayout>,
    buffer: Box<[UnsafeCell<u64>]>,
}

impl CallFrame {
    /// Allocate a zeroed frame for `layout`
    pub fn new(layout: Rc<CallLayout>) -> Self {
        let words = layout.buffer_size() / 8;
        let buffer = (0..words).map(|_| UnsafeCell::new(0u64)).collect();
        Self { layout, buffer }
    }

    /// The layout this frame was built from
    pub fn layout(&self) -> &Rc<CallLayout> {
        &self.layout
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr()) as *mut u8
    }

    /// Pointer to the storage of parameter `index` (implicit parameters
    /// included). Panics if `index` is out of range.
    pub fn arg_ptr(&self, index: usize) -> *mut u8 {
        let slot = &self.layout.slots()[index];
        // SAFETY: slot offsets lie within the buffer by construction
        unsafe { self.base().add(slot.offset) }
    }

    /// Pointer to the storage of caller-supplied argument `index`
    pub fn explicit_arg_ptr(&self, index: usize) -> *mut u8 {
        self.arg_ptr(self.layout.implicit_args() + index)
    }

    /// Pointer to the return value storage
    pub fn return_ptr(&self) -> *mut u8 {
        // SAFETY: the return slot is the tail of the buffer
        unsafe { self.base().add(self.layout.return_offset()) }
    }

    /// Store a plain value into parameter `index`
    pub fn write_arg<T: Copy>(&self, index: usize, value: T) {
        debug_assert!(std::mem::size_of::<T>() <= self.layout.slots()[index].size);
        // SAFETY: the slot holds at least `size_of::<T>()` bytes
        unsafe { std::ptr::write_unaligned(self.arg_ptr(index) as *mut T, value) }
    }

    /// Load a plain value from parameter `index`
    pub fn read_arg<T: Copy>(&self, index: usize) -> T {
        debug_assert!(std::mem::size_of::<T>() <= self.layout.slots()[index].size);
        // SAFETY: as for `write_arg`
        unsafe { std::ptr::read_unaligned(self.arg_ptr(index) as *const T) }
    }

    /// Store the return value
    pub fn write_return<T: Copy>(&self, value: T) {
        debug_assert!(std::mem::size_of::<T>() <= self.layout.buffer_size() - self.layout.return_offset());
        // SAFETY: the return slot holds at least 8 bytes and the full return size
        unsafe { std::ptr::write_unaligned(self.return_ptr() as *mut T, value) }
    }

    /// Load the return value
    pub fn read_return<T: Copy>(&self) -> T {
        // SAFETY: as for `write_return`
        unsafe { std::ptr::read_unaligned(self.return_ptr() as *const T) }
    }

    /// Zero the return slot (message to nil)
    pub fn clear_return(&self) {
        let len = self.layout.buffer_size() - self.layout.return_offset();
        // SAFETY: the range is the return slot
        unsafe { std::ptr::write_bytes(self.return_ptr(), 0, len) }
    }
}

impl fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrame")
            .field("signature", &self.layout.signature().encode())
            .field("bytes", &self.layout.buffer_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{Abi, IntWidth, Signature, TypeDescriptor};

    #[test]
    fn test_frames_are_independent() {
        let layout = Rc::new(CallLayout::new(
            Rc::new(Signature {
                ret: TypeDescriptor::int(IntWidth::W32, true),
                params: vec![TypeDescriptor::int(IntWidth::W32, true)],
            }),
            0,
            Abi::host(),
        ));
        let outer = CallFrame::new(layout.clone());
        let inner = CallFrame::new(layout);
        outer.write_arg(0, 1i32);
        inner.write_arg(0, 2i32);
        outer.write_return(10i32);
        assert_eq!(outer.read_arg::<i32>(0), 1);
        assert_eq!(inner.read_arg::<i32>(0), 2);
        assert_eq!(outer.read_return::<i32>(), 10);
        assert_eq!(inner.read_return::<i32>(), 0);
        outer.clear_return();
        assert_eq!(outer.read_return::<i32>(), 0);
    }
}
