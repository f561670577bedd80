//! NaN-boxed value encoding.
//!
//! Every JS value flowing through a lowered circuit is a 64-bit word. Doubles
//! are stored as their raw IEEE-754 bits; everything else lives in the quiet
//! NaN space:
//!
//! ```text
//!   0x7FF8_0000_0000_0000  undefined
//!   0x7FF8_0000_0000_0001  null
//!   0x7FF8_0000_0000_0002  true
//!   0x7FF8_0000_0000_0003  false
//!   0x7FF8_0000_0000_0005  hole (absent element / deleted global)
//!   0x7FF8_0000_0000_0006  exception marker
//!   0x7FF8_0001_xxxx_xxxx  int32 payload in the low 32 bits
//!   0x7FFA_0000_0000_0000  canonical NaN
//!   0x7FFC_xxxx_xxxx_xxxx  heap reference, 48-bit address payload
//! ```

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Quiet NaN prefix. Values with `(bits & QUIET_NAN) == QUIET_NAN` are tags.
pub const QUIET_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Mask selecting the 16 tag bits of a heap reference.
pub const TAG_MASK: u64 = 0xFFFF_0000_0000_0000;

/// Mask selecting the 48-bit address payload of a heap reference.
pub const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// `undefined`.
pub const TAG_UNDEFINED: u64 = 0x7FF8_0000_0000_0000;

/// `null`.
pub const TAG_NULL: u64 = 0x7FF8_0000_0000_0001;

/// `true`.
pub const TAG_TRUE: u64 = 0x7FF8_0000_0000_0002;

/// `false`.
pub const TAG_FALSE: u64 = 0x7FF8_0000_0000_0003;

/// The hole: an absent array element or a deleted global binding.
///
/// Raw (int/double) element storage uses the same bit pattern for its holes.
pub const TAG_HOLE: u64 = 0x7FF8_0000_0000_0005;

/// Result produced by a helper that left a pending exception behind.
pub const TAG_EXCEPTION: u64 = 0x7FF8_0000_0000_0006;

/// Canonical NaN.
pub const TAG_NAN: u64 = 0x7FFA_0000_0000_0000;

/// Int32 tag in the high 32 bits.
pub const TAG_INT32: u64 = 0x7FF8_0001_0000_0000;

/// Mask isolating the high 32 bits of an int32 value.
pub const INT32_TAG_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Heap reference tag.
pub const TAG_POINTER: u64 = 0x7FFC_0000_0000_0000;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Box an int32.
#[inline]
pub const fn int(value: i32) -> u64 {
    TAG_INT32 | (value as u32 as u64)
}

/// Box a double, canonicalizing every NaN to [`TAG_NAN`].
#[inline]
pub fn double(value: f64) -> u64 {
    if value.is_nan() {
        TAG_NAN
    } else {
        value.to_bits()
    }
}

/// Box a boolean.
#[inline]
pub const fn boolean(value: bool) -> u64 {
    if value { TAG_TRUE } else { TAG_FALSE }
}

/// Box a heap address.
#[inline]
pub const fn pointer(addr: u64) -> u64 {
    TAG_POINTER | (addr & PAYLOAD_MASK)
}

/// Box an `f64` the way the interpreter does: integral values in int32 range
/// become ints, everything else a double.
pub fn number(value: f64) -> u64 {
    if value.fract() == 0.0
        && value >= i32::MIN as f64
        && value <= i32::MAX as f64
        && !(value == 0.0 && value.is_sign_negative())
    {
        int(value as i32)
    } else {
        double(value)
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Is this an int32?
#[inline]
pub const fn is_int(bits: u64) -> bool {
    bits & INT32_TAG_MASK == TAG_INT32
}

/// Is this a double (including canonical NaN)?
#[inline]
pub const fn is_double(bits: u64) -> bool {
    bits & QUIET_NAN != QUIET_NAN || bits == TAG_NAN
}

/// Is this any number representation?
#[inline]
pub const fn is_number(bits: u64) -> bool {
    is_int(bits) || is_double(bits)
}

/// Is this `true` or `false`?
#[inline]
pub const fn is_boolean(bits: u64) -> bool {
    bits == TAG_TRUE || bits == TAG_FALSE
}

/// Is this a heap reference?
#[inline]
pub const fn is_heap_object(bits: u64) -> bool {
    bits & TAG_MASK == TAG_POINTER
}

/// Int32 payload. Only meaningful after [`is_int`].
#[inline]
pub const fn to_int(bits: u64) -> i32 {
    bits as u32 as i32
}

/// Double payload. Only meaningful after [`is_double`].
#[inline]
pub fn to_double(bits: u64) -> f64 {
    if bits == TAG_NAN {
        f64::NAN
    } else {
        f64::from_bits(bits)
    }
}

/// Numeric value of an int or a double.
pub fn to_number(bits: u64) -> Option<f64> {
    if is_int(bits) {
        Some(to_int(bits) as f64)
    } else if is_double(bits) {
        Some(to_double(bits))
    } else {
        None
    }
}

/// Address payload of a heap reference.
#[inline]
pub const fn address(bits: u64) -> u64 {
    bits & PAYLOAD_MASK
}
