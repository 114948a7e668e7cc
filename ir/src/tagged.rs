//! Bit patterns of tagged language values as they appear in gate bitfields.
//!
//! The compiler core never interprets these beyond equality; they exist so
//! constants emitted by the frontend and the lowering passes agree with the
//! runtime's tagging scheme.

/// Tag of a small integer value.
pub const TAG_INT: u64 = 0xFFFF_0000_0000_0000;
/// Doubles are stored with this offset added to their raw bits.
pub const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;

pub const VALUE_UNDEFINED: u64 = 0x02;
pub const VALUE_NULL: u64 = 0x03;
pub const VALUE_HOLE: u64 = 0x05;
pub const VALUE_FALSE: u64 = 0x06;
pub const VALUE_TRUE: u64 = 0x07;
pub const VALUE_EXCEPTION: u64 = 0x08;

pub const fn tag_int(value: i32) -> u64 {
    (value as u32 as u64) | TAG_INT
}

pub fn tag_double(value: f64) -> u64 {
    value.to_bits().wrapping_add(DOUBLE_ENCODE_OFFSET)
}

pub const fn tag_bool(value: bool) -> u64 {
    if value {
        VALUE_TRUE
    } else {
        VALUE_FALSE
    }
}
