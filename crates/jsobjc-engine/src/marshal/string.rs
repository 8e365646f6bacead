//! C strings

use std::ffi::CStr;

use super::MarshalScope;
use crate::error::BridgeResult;

/// Copy `text` into scope-owned, NUL-terminated storage
pub fn c_string(scope: &mut MarshalScope, text: &str) -> BridgeResult<*mut u8> {
    let bytes = text.as_bytes();
    let ptr = scope.allocate(bytes.len() + 1)?;
    // SAFETY: the allocation holds len + 1 zeroed bytes
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    Ok(ptr)
}

/// Decode a native string. Without `length` the string runs to the first
/// NUL; with it, exactly `length` bytes are read, NULs included. Invalid
/// UTF-8 is replaced.
///
/// # Safety
///
/// `ptr` must be valid for `length` bytes, or NUL-terminated when `length`
/// is `None`.
pub unsafe fn read_c_string(ptr: *const u8, length: Option<usize>) -> String {
    match length {
        Some(len) => {
            let bytes = std::slice::from_raw_parts(ptr, len);
            String::from_utf8_lossy(bytes).into_owned()
        }
        None => CStr::from_ptr(ptr as *const libc::c_char)
            .to_string_lossy()
            .into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_string_is_terminated() {
        let mut scope = MarshalScope::new();
        let ptr = c_string(&mut scope, "abc").unwrap();
        assert_eq!(unsafe { *ptr.add(3) }, 0);
        assert_eq!(unsafe { read_c_string(ptr, None) }, "abc");
    }

    #[test]
    fn test_explicit_length_keeps_embedded_nul() {
        let bytes = b"te\0st";
        let text = unsafe { read_c_string(bytes.as_ptr(), Some(5)) };
        assert_eq!(text, "te\0st");
        assert_eq!(unsafe { read_c_string(b"te\0st\0".as_ptr(), None) }, "te");
    }
}
