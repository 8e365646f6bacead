//! Native heap allocations

use std::fmt;
use std::ptr::NonNull;

use crate::error::{BridgeError, BridgeResult};

/// Allocate `size` zeroed bytes on the C heap. The caller frees the block
/// with [`free_raw`].
pub fn alloc_raw(size: usize) -> BridgeResult<*mut u8> {
    // SAFETY: calloc has no preconditions; a zero size still yields a
    // unique pointer because at least one byte is requested
    let ptr = unsafe { libc::calloc(size.max(1), 1) } as *mut u8;
    if ptr.is_null() {
        return Err(BridgeError::Marshal(format!(
            "Out of memory allocating {} bytes",
            size
        )));
    }
    Ok(ptr)
}

/// Free a block returned by [`alloc_raw`].
///
/// # Safety
///
/// `ptr` must come from [`alloc_raw`] (or be null) and not be freed twice.
pub unsafe fn free_raw(ptr: *mut u8) {
    libc::free(ptr as *mut libc::c_void)
}

/// A zeroed C-heap block freed on drop
pub struct NativeAllocation {
    ptr: NonNull<u8>,
    size: usize,
}

impl NativeAllocation {
    /// Allocate `size` zeroed bytes
    pub fn zeroed(size: usize) -> BridgeResult<Self> {
        let ptr = alloc_raw(size)?;
        let ptr = NonNull::new(ptr).ok_or_else(|| BridgeError::Marshal("Null allocation".to_string()))?;
        Ok(Self { ptr, size })
    }

    /// Allocate a copy of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let allocation = Self::zeroed(bytes.len())?;
        // SAFETY: the block holds at least `bytes.len()` bytes
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), allocation.as_ptr(), bytes.len()) };
        Ok(allocation)
    }

    /// Start of the block
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Give up ownership; the block must later go to [`free_raw`]
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NativeAllocation {
    fn drop(&mut self) {
        // SAFETY: the block came from alloc_raw and is owned by self
        unsafe { free_raw(self.ptr.as_ptr()) }
    }
}

impl fmt::Debug for NativeAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeAllocation({:p}, {} bytes)", self.ptr, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed_and_copyable() {
        let block = NativeAllocation::zeroed(16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 16) };
        assert!(bytes.iter().all(|b| *b == 0));

        let copy = NativeAllocation::from_bytes(b"abc\0").unwrap();
        assert_eq!(copy.size(), 4);
        let raw = copy.into_raw();
        assert_eq!(unsafe { *raw.add(1) }, b'b');
        unsafe { free_raw(raw) };
    }
}
