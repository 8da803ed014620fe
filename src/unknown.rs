//! Unknown-field preservation.
//!
//! Fields the schema does not know are kept as a flat byte stream in wire
//! order, exactly as they appeared in the input (including non-canonical
//! varint encodings and group framing), so re-serializing a message emits
//! them byte-for-byte. The one exception is an out-of-range closed-enum
//! value, which arrives decoded and is re-encoded canonically.

use crate::arena::Arena;
use crate::repeated::RepeatedScalar;
use crate::wire::{self, WireType};

/// The retained bytes of every unrecognized field of one message.
#[derive(Default, Debug)]
pub struct UnknownFields<'a> {
    bytes: RepeatedScalar<'a, u8>,
}

impl<'a> UnknownFields<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The preserved fields as raw wire bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Append one input byte verbatim.
    #[inline]
    pub(crate) fn put_byte(&mut self, byte: u8, arena: &'a Arena) {
        self.bytes.push(byte, arena);
    }

    /// Append a span of input bytes verbatim.
    #[inline]
    pub(crate) fn put_raw(&mut self, raw: &[u8], arena: &'a Arena) {
        self.bytes.extend_from_slice(raw, arena);
    }

    /// Append a canonically encoded varint.
    pub(crate) fn put_varint(&mut self, value: u64, arena: &'a Arena) {
        let (buf, len) = wire::encode_varint(value);
        self.bytes.extend_from_slice(&buf[..len], arena);
    }

    /// Append a canonically encoded tag.
    pub(crate) fn put_tag(&mut self, field: u32, wire_type: WireType, arena: &'a Arena) {
        self.put_varint(wire::tag(field, wire_type) as u64, arena);
    }

    pub(crate) fn put_fixed32(&mut self, value: u32, arena: &'a Arena) {
        self.bytes.extend_from_slice(&value.to_le_bytes(), arena);
    }

    pub(crate) fn put_fixed64(&mut self, value: u64, arena: &'a Arena) {
        self.bytes.extend_from_slice(&value.to_le_bytes(), arena);
    }

    /// Append a whole length-delimited field: tag, length, payload.
    pub(crate) fn put_len_field(&mut self, field: u32, payload: &[u8], arena: &'a Arena) {
        self.put_tag(field, WireType::Len, arena);
        self.put_varint(payload.len() as u64, arena);
        self.bytes.extend_from_slice(payload, arena);
    }
}

#[cfg(test)]
#[path = "./unknown_tests.rs"]
mod tests;
