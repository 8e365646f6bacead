//! Binary buffers passed where native code expects a pointer

use jsobjc_sdk::TypedArray;

use super::MarshalScope;
use crate::error::BridgeResult;

/// Address to pass for a typed array.
///
/// The view's own storage is used when it is large enough. A fixed-size
/// array parameter that wants more room than the view has gets a zeroed
/// temporary holding a copy of the view; native writes are copied back
/// into the view when the call finishes.
pub fn typed_array_argument(
    array: &TypedArray,
    element_size: usize,
    min_elements: usize,
    scope: &mut MarshalScope,
) -> BridgeResult<usize> {
    let needed = element_size * min_elements;
    if needed <= array.byte_length() {
        return Ok(array.as_mut_ptr() as usize);
    }
    tracing::debug!(
        have = array.byte_length(),
        needed,
        "typed array shorter than fixed-size parameter; passing a copy"
    );
    let temp = scope.allocate(needed)?;
    let current = array.buffer().read(array.byte_offset(), array.byte_length());
    // SAFETY: temp holds `needed` bytes, more than `current.len()`
    unsafe { std::ptr::copy_nonoverlapping(current.as_ptr(), temp, current.len()) };
    scope.write_back(array.clone(), temp, needed);
    Ok(temp as usize)
}
