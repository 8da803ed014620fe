//! Bit-exact primitives for the standard protobuf wire encoding: tags,
//! LEB128 varints, zigzag transforms and little-endian fixed-width values.
//!
//! Decoding of streamed input lives in [`crate::input`]; the slice-level
//! helpers here back the unknown-field set's canonical re-encoding and the
//! fast-table tag precoding.

/// Maximum encoded size of a varint: 10 bytes of 7 payload bits covers u64.
pub const MAX_VARINT_BYTES: usize = 10;

/// Maximum valid field number, `2^29 - 1`.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// The low three bits of a tag: how the following payload is encoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WireType {
    /// Variable length integer: `int32/64`, `uint32/64`, `sint32/64`,
    /// `bool`, `enum`.
    Varint = 0,
    /// Little-endian 64-bit: `fixed64`, `sfixed64`, `double`.
    Fixed64 = 1,
    /// Length-delimited: `string`, `bytes`, submessages, packed repeats.
    Len = 2,
    /// Group start.
    StartGroup = 3,
    /// Group end.
    EndGroup = 4,
    /// Little-endian 32-bit: `fixed32`, `sfixed32`, `float`.
    Fixed32 = 5,
}

impl WireType {
    const MAX_VAL: u8 = WireType::Fixed32 as u8;

    /// Decode the low three bits of a tag; 6 and 7 are reserved.
    #[inline]
    pub const fn from_bits(value: u8) -> Option<Self> {
        if value <= Self::MAX_VAL {
            Some(match value {
                0 => WireType::Varint,
                1 => WireType::Fixed64,
                2 => WireType::Len,
                3 => WireType::StartGroup,
                4 => WireType::EndGroup,
                _ => WireType::Fixed32,
            })
        } else {
            None
        }
    }
}

/// Builds the `(field_number << 3) | wire_type` tag value.
#[inline]
pub const fn tag(field_number: u32, wire_type: WireType) -> u32 {
    (field_number << 3) | wire_type as u32
}

/// Re-encode a tag value in the fast table's 1-2 byte form: byte 0 in the
/// low half, byte 1 (with byte 0's continuation bit set) in the high half.
/// Returns `None` for tags needing three or more varint bytes.
#[inline]
pub(crate) const fn precode_tag(tag: u32) -> Option<u16> {
    if tag < 1 << 7 {
        Some(tag as u16)
    } else if tag < 1 << 14 {
        Some(((tag & 0x7F) | 0x80 | ((tag >> 7) << 8)) as u16)
    } else {
        None
    }
}

/// Inverse of [`precode_tag`].
#[inline]
pub(crate) const fn decode_precoded_tag(coded: u16) -> u32 {
    if coded < 1 << 8 {
        coded as u32
    } else {
        ((coded as u32) & 0x7F) | (((coded as u32) >> 8) << 7)
    }
}

// -- zigzag -----------------------------------------------------------------

/// Maps signed to unsigned so small magnitudes encode in few varint bytes.
#[inline]
pub const fn zigzag_encode32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

#[inline]
pub const fn zigzag_encode64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub const fn zigzag_decode32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

#[inline]
pub const fn zigzag_decode64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

// -- slice-level varints ----------------------------------------------------

/// Decode a varint from the front of `bytes`, returning the value and the
/// number of bytes consumed. `None` means truncated or over 10 bytes.
#[inline]
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    // Single-byte fast path; bools and small field values land here.
    if let Some(&b) = bytes.first() {
        if b < 0x80 {
            return Some((b as u64, 1));
        }
    } else {
        return None;
    }
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate().take(MAX_VARINT_BYTES) {
        value |= ((b & 0x7F) as u64) << (7 * i);
        if b < 0x80 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode `value` as a varint into a fixed buffer; returns the buffer and
/// the encoded length.
#[inline]
pub fn encode_varint(mut value: u64) -> ([u8; MAX_VARINT_BYTES], usize) {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return (buf, i + 1);
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Append a varint to `out`.
#[inline]
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    let (buf, len) = encode_varint(value);
    out.extend_from_slice(&buf[..len]);
}

/// Append a tag to `out`.
#[inline]
pub fn put_tag(out: &mut Vec<u8>, field_number: u32, wire_type: WireType) {
    put_varint(out, tag(field_number, wire_type) as u64);
}

#[cfg(test)]
#[path = "./wire_tests.rs"]
mod tests;
