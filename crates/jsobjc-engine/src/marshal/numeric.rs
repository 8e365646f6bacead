//! Integer and floating-point conversions

use jsobjc_sdk::value::MAX_SAFE_INTEGER;
use jsobjc_sdk::JsValue;

use super::describe;
use crate::encoding::{IntWidth, TypeDescriptor};
use crate::error::{BridgeError, BridgeResult};

fn mismatch(value: &JsValue, ty: &TypeDescriptor) -> BridgeError {
    BridgeError::Marshal(format!(
        "Cannot marshal {} to native type \"{}\"",
        describe(value),
        ty
    ))
}

/// 2^64. Doubles at or above it in magnitude keep no bits below 2^11, so
/// reducing by it is exact.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

fn range(width: IntWidth, signed: bool) -> (i128, i128) {
    let bits = width.bits();
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn out_of_range(value: &JsValue, width: IntWidth, signed: bool) -> BridgeError {
    let (min, max) = range(width, signed);
    BridgeError::Marshal(format!(
        "Value {} is out of range for native type \"{}\" ({}..{})",
        describe(value),
        TypeDescriptor::int(width, signed),
        min,
        max
    ))
}

/// Convert a script value to the bit pattern of a native integer.
///
/// Out-of-range values wrap modulo 2^width the way a C cast does. With
/// `strict` set they raise a marshal error instead. Single-character
/// strings are accepted for 8- and 16-bit types.
pub fn integer_bits(value: &JsValue, width: IntWidth, signed: bool, strict: bool) -> BridgeResult<u64> {
    let ty = TypeDescriptor::int(width, signed);
    let whole: i128 = match value {
        JsValue::Number(n) => {
            if !n.is_finite() {
                if strict {
                    return Err(BridgeError::Marshal(format!(
                        "{} is not representable as native type \"{}\"",
                        describe(value),
                        ty
                    )));
                }
                0
            } else if n.abs() >= TWO_POW_64 {
                // Only the low 64 bits survive into any native width
                if strict {
                    return Err(out_of_range(value, width, signed));
                }
                n.trunc().rem_euclid(TWO_POW_64) as i128
            } else {
                n.trunc() as i128
            }
        }
        JsValue::Bool(b) => i128::from(*b),
        JsValue::BigInt(i) => *i,
        JsValue::String(s) if width.bytes() <= 2 => {
            let mut units = s.encode_utf16();
            match (units.next(), units.next()) {
                (Some(unit), None) => i128::from(unit),
                _ => return Err(mismatch(value, &ty)),
            }
        }
        _ => return Err(mismatch(value, &ty)),
    };
    if strict {
        let (min, max) = range(width, signed);
        if whole < min || whole > max {
            return Err(out_of_range(value, width, signed));
        }
    }
    let mask: u128 = if width.bits() == 64 {
        u64::MAX as u128
    } else {
        (1u128 << width.bits()) - 1
    };
    Ok(((whole as u128) & mask) as u64)
}

/// Convert a script value to a double
pub fn float_value(value: &JsValue, ty: &TypeDescriptor) -> BridgeResult<f64> {
    match value {
        JsValue::Number(n) => Ok(*n),
        JsValue::Bool(b) => Ok(f64::from(u8::from(*b))),
        JsValue::BigInt(i) => Ok(*i as f64),
        _ => Err(mismatch(value, ty)),
    }
}

/// Store the low `width` bytes of `bits` at `dest`
///
/// # Safety
///
/// `dest` must be valid for `width` bytes.
pub unsafe fn write_int(dest: *mut u8, bits: u64, width: IntWidth) {
    match width {
        IntWidth::W8 => std::ptr::write_unaligned(dest, bits as u8),
        IntWidth::W16 => std::ptr::write_unaligned(dest as *mut u16, bits as u16),
        IntWidth::W32 => std::ptr::write_unaligned(dest as *mut u32, bits as u32),
        IntWidth::W64 => std::ptr::write_unaligned(dest as *mut u64, bits),
    }
}

/// Load a native integer
///
/// # Safety
///
/// `src` must be valid for `width` bytes.
pub unsafe fn read_int(src: *const u8, width: IntWidth, signed: bool) -> i128 {
    match (width, signed) {
        (IntWidth::W8, true) => i128::from(std::ptr::read_unaligned(src as *const i8)),
        (IntWidth::W8, false) => i128::from(std::ptr::read_unaligned(src)),
        (IntWidth::W16, true) => i128::from(std::ptr::read_unaligned(src as *const i16)),
        (IntWidth::W16, false) => i128::from(std::ptr::read_unaligned(src as *const u16)),
        (IntWidth::W32, true) => i128::from(std::ptr::read_unaligned(src as *const i32)),
        (IntWidth::W32, false) => i128::from(std::ptr::read_unaligned(src as *const u32)),
        (IntWidth::W64, true) => i128::from(std::ptr::read_unaligned(src as *const i64)),
        (IntWidth::W64, false) => i128::from(std::ptr::read_unaligned(src as *const u64)),
    }
}

/// A native integer as a script value: a number when it is exactly
/// representable, a BigInt otherwise
pub fn integer_value(value: i128) -> JsValue {
    if value.unsigned_abs() <= MAX_SAFE_INTEGER as u128 {
        JsValue::Number(value as f64)
    } else {
        JsValue::BigInt(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: f64, width: IntWidth, signed: bool) -> JsValue {
        let bits = integer_bits(&JsValue::Number(value), width, signed, false).unwrap();
        let mut slot = [0u8; 8];
        unsafe {
            write_int(slot.as_mut_ptr(), bits, width);
            integer_value(read_int(slot.as_ptr(), width, signed))
        }
    }

    #[test]
    fn test_boundaries_roundtrip() {
        for (width, signed) in [
            (IntWidth::W8, true),
            (IntWidth::W8, false),
            (IntWidth::W16, true),
            (IntWidth::W16, false),
            (IntWidth::W32, true),
            (IntWidth::W32, false),
        ] {
            let (min, max) = range(width, signed);
            assert_eq!(roundtrip(min as f64, width, signed), JsValue::Number(min as f64));
            assert_eq!(roundtrip(max as f64, width, signed), JsValue::Number(max as f64));
        }
    }

    #[test]
    fn test_overflow_wraps_twos_complement() {
        // 2 * max + 1
        assert_eq!(roundtrip(255.0, IntWidth::W8, true), JsValue::Number(-1.0));
        assert_eq!(roundtrip(511.0, IntWidth::W8, false), JsValue::Number(255.0));
        assert_eq!(roundtrip(4294967295.0, IntWidth::W32, true), JsValue::Number(-1.0));
        assert_eq!(roundtrip(-1.0, IntWidth::W16, false), JsValue::Number(65535.0));
    }

    #[test]
    fn test_huge_doubles_keep_their_low_bits() {
        // 2^70 + 2^20: the 2^70 term vanishes modulo every width
        let big = 2f64.powi(70) + 2f64.powi(20);
        assert_eq!(roundtrip(big, IntWidth::W32, false), JsValue::Number(1048576.0));
        assert_eq!(roundtrip(-big, IntWidth::W32, true), JsValue::Number(-1048576.0));
        assert_eq!(roundtrip(big, IntWidth::W64, true), JsValue::Number(1048576.0));
        // Past i128 a saturating cast would give all ones
        assert_eq!(roundtrip(2f64.powi(128), IntWidth::W32, true), JsValue::Number(0.0));
        assert_eq!(roundtrip(2f64.powi(200), IntWidth::W8, false), JsValue::Number(0.0));
        assert_eq!(roundtrip(f64::MAX, IntWidth::W64, false), JsValue::Number(0.0));
        let err = integer_bits(&JsValue::Number(big), IntWidth::W64, true, true).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_strict_mode_rejects_overflow() {
        let err = integer_bits(&JsValue::Number(300.0), IntWidth::W8, false, true).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(integer_bits(&JsValue::Number(255.0), IntWidth::W8, false, true).is_ok());
    }

    #[test]
    fn test_64_bit_values_beyond_safe_range_become_bigint() {
        let bits = integer_bits(&JsValue::BigInt(i64::MAX as i128), IntWidth::W64, true, false).unwrap();
        let mut slot = [0u8; 8];
        let value = unsafe {
            write_int(slot.as_mut_ptr(), bits, IntWidth::W64);
            integer_value(read_int(slot.as_ptr(), IntWidth::W64, true))
        };
        assert_eq!(value, JsValue::BigInt(i64::MAX as i128));
        assert_eq!(integer_value(42), JsValue::Number(42.0));
    }

    #[test]
    fn test_chars_and_mismatches() {
        let bits = integer_bits(&JsValue::from("A"), IntWidth::W16, false, false).unwrap();
        assert_eq!(bits, 65);
        assert!(integer_bits(&JsValue::from("AB"), IntWidth::W8, true, false).is_err());
        let err = integer_bits(&JsValue::Null, IntWidth::W32, true, false).unwrap_err();
        assert_eq!(err.error_name(), "MarshalError");
    }
}
