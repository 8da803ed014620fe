#![allow(unsafe_code)]

//! The table-driven decoder.
//!
//! Dispatch is two-tiered. The fast path peeks at the first tag byte and
//! probes the message's fast-dispatch array; a hit means the raw input
//! bytes equal the field's precoded canonical tag, and the value handler
//! runs with no varint decode and no field lookup. Everything else (bigger
//! field numbers, non-canonical tag encodings, unknown fields, groups,
//! maps) drops to the mini parse: decode the tag, consult the skipmap,
//! dispatch on the type card.
//!
//! Errors are reported through a zero-sized [`Fail`] sentinel; the real
//! [`Error`] with its absolute input offset is recorded on the decoder and
//! surfaced by the entry points.

use crate::arena::Arena;
use crate::error::{DecodeErrorKind, Error};
use crate::input::{Input, VarintError};
use crate::map::{Map, MapKey, MapValue};
use crate::message::{Message, MsgPtr, Slot};
use crate::minitable::{
    AuxData, Cardinality, FastSlot, FieldEntry, FieldKind, MapAux, MiniTable, Presence,
    TableHandle, Utf8Mode,
};
use crate::repeated::RepeatedScalar;
use crate::repeated_ptr::RepeatedPtr;
use crate::tables::TableSet;
use crate::unknown::UnknownFields;
use crate::wire::{self, WireType, MAX_VARINT_BYTES};

/// Maximum nesting of submessages and groups.
pub const DEPTH_LIMIT: u32 = 100;

/// Zero-sized error sentinel; the error itself lives on the decoder.
struct Fail;

/// Where the current message region ends.
#[derive(Copy, Clone)]
enum Limit {
    /// At end of input.
    Eof,
    /// At this absolute byte offset.
    Bytes(u64),
    /// At this end-group tag value, which must appear before the nearest
    /// enclosing byte limit (if any).
    Group { end_tag: u32, end: Option<u64> },
}

impl Limit {
    /// The nearest enclosing byte bound, inherited through group limits.
    fn byte_end(self) -> Option<u64> {
        match self {
            Limit::Eof => None,
            Limit::Bytes(end) => Some(end),
            Limit::Group { end, .. } => end,
        }
    }
}

/// Parse a message of the `handle` type from one contiguous buffer.
pub fn parse_slice<'a>(
    set: &TableSet,
    handle: TableHandle,
    bytes: &'a [u8],
    arena: &'a Arena,
) -> Result<MsgPtr<'a>, Error> {
    parse_message(set, handle, &[bytes], arena)
}

/// Parse a message of the `handle` type from a sequence of input chunks.
pub fn parse_message<'a>(
    set: &TableSet,
    handle: TableHandle,
    chunks: &[&'a [u8]],
    arena: &'a Arena,
) -> Result<MsgPtr<'a>, Error> {
    let target = MsgPtr::alloc(set.table(handle), handle, arena);
    parse_into(set, target, chunks, arena)?;
    Ok(target)
}

/// Parse into an existing message, merging with its current contents.
///
/// On error the target is left partially populated and must be discarded
/// (or cleared).
pub fn parse_into<'a>(
    set: &TableSet,
    target: MsgPtr<'a>,
    chunks: &[&'a [u8]],
    arena: &'a Arena,
) -> Result<(), Error> {
    // Safety: the parse holds the only live access to the message tree.
    let msg = unsafe { target.get_mut() };
    let table = set.table(msg.table_handle());
    let mut decoder = Decoder {
        set,
        input: Input::new(chunks),
        arena,
        error: None,
        depth: 0,
    };
    match decoder.parse_msg(msg, table, Limit::Eof) {
        Ok(()) => Ok(()),
        Err(Fail) => Err(decoder
            .error
            .take()
            .unwrap_or(Error {
                kind: DecodeErrorKind::Truncated,
                offset: 0,
            })),
    }
}

struct Decoder<'s, 'c, 'a> {
    set: &'s TableSet,
    input: Input<'c, 'a>,
    arena: &'a Arena,
    error: Option<Error>,
    depth: u32,
}

impl<'s, 'c, 'a> Decoder<'s, 'c, 'a> {
    #[cold]
    fn fail<T>(&mut self, kind: DecodeErrorKind, offset: u64) -> Result<T, Fail> {
        self.error = Some(Error { kind, offset });
        Err(Fail)
    }

    fn read_varint(&mut self) -> Result<u64, Fail> {
        let start = self.input.offset();
        match self.input.read_varint() {
            Ok(v) => Ok(v),
            Err(VarintError::Truncated) => {
                let off = self.input.offset();
                self.fail(DecodeErrorKind::Truncated, off)
            }
            Err(VarintError::Overflow) => self.fail(DecodeErrorKind::VarintOverflow, start),
        }
    }

    fn read_fixed32(&mut self) -> Result<u32, Fail> {
        match self.input.read_fixed32() {
            Some(v) => Ok(v),
            None => {
                let off = self.input.offset();
                self.fail(DecodeErrorKind::Truncated, off)
            }
        }
    }

    fn read_fixed64(&mut self) -> Result<u64, Fail> {
        match self.input.read_fixed64() {
            Some(v) => Ok(v),
            None => {
                let off = self.input.offset();
                self.fail(DecodeErrorKind::Truncated, off)
            }
        }
    }

    fn enter(&mut self, offset: u64) -> Result<(), Fail> {
        if self.depth >= DEPTH_LIMIT {
            return self.fail(DecodeErrorKind::DepthLimitExceeded, offset);
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_msg(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        limit: Limit,
    ) -> Result<(), Fail> {
        loop {
            let off = self.input.offset();
            match limit {
                Limit::Eof => {
                    if !self.input.has_more() {
                        return Ok(());
                    }
                }
                Limit::Bytes(end) => {
                    if off == end {
                        return Ok(());
                    }
                    if off > end {
                        return self.fail(DecodeErrorKind::LengthOverrun, off);
                    }
                }
                Limit::Group { end, .. } => {
                    // The end tag has to fit inside the enclosing region.
                    if end.map_or(false, |e| off >= e) {
                        return self.fail(DecodeErrorKind::UnterminatedGroup, off);
                    }
                    if !self.input.has_more() {
                        return self.fail(DecodeErrorKind::UnterminatedGroup, off);
                    }
                }
            }

            let Some(byte0) = self.input.peek_byte() else {
                return self.fail(DecodeErrorKind::Truncated, off);
            };

            // Fast dispatch: the stored precoded tag must equal the raw
            // input bytes, so a non-canonical encoding of the same tag
            // value falls through to the mini parse below.
            if let FastSlot::Field { tag, field } = table.fast_slot(byte0) {
                let matched = if tag <= 0x7F {
                    byte0 == tag as u8
                } else {
                    byte0 == (tag & 0xFF) as u8 && self.input.peek_second() == Some((tag >> 8) as u8)
                };
                if matched {
                    self.input.read_byte();
                    if tag > 0x7F {
                        self.input.read_byte();
                    }
                    let entry = &table.fields[field as usize];
                    let decoded = wire::decode_precoded_tag(tag);
                    let Some(wt) = WireType::from_bits((decoded & 7) as u8) else {
                        unreachable!("fast tags carry valid wire types");
                    };
                    let handled = self.parse_field(msg, table, entry, wt, off, limit)?;
                    debug_assert!(handled);
                    continue;
                }
            }

            // Mini parse. The tag's raw bytes are kept so an unknown field
            // can be preserved exactly as it appeared.
            let (tagv, raw, raw_len) = self.read_tag_raw()?;
            let number = tagv >> 3;
            if number == 0 {
                return self.fail(DecodeErrorKind::FieldNumberZero, off);
            }
            let bits = (tagv & 7) as u8;
            let Some(wt) = WireType::from_bits(bits) else {
                return self.fail(DecodeErrorKind::InvalidWireType(bits), off);
            };
            if wt == WireType::EndGroup {
                return match limit {
                    Limit::Group { end_tag, .. } if tagv == end_tag => Ok(()),
                    _ => self.fail(DecodeErrorKind::UnmatchedEndGroup, off),
                };
            }
            if let Some(entry) = table.find_field(number) {
                if self.parse_field(msg, table, entry, wt, off, limit)? {
                    continue;
                }
            }
            // Unknown field number, or a known field with the wrong wire
            // type: both are preserved, not errors.
            msg.unknown_mut().put_raw(&raw[..raw_len], self.arena);
            self.copy_unknown_value(msg.unknown_mut(), number, wt, limit)?;
        }
    }

    fn read_tag_raw(&mut self) -> Result<(u32, [u8; MAX_VARINT_BYTES], usize), Fail> {
        let start = self.input.offset();
        let mut raw = [0u8; MAX_VARINT_BYTES];
        let mut value = 0u64;
        for (i, slot) in raw.iter_mut().enumerate() {
            let Some(b) = self.input.read_byte() else {
                let off = self.input.offset();
                return self.fail(DecodeErrorKind::Truncated, off);
            };
            *slot = b;
            value |= ((b & 0x7F) as u64) << (7 * i);
            if b < 0x80 {
                if value > u32::MAX as u64 {
                    return self.fail(DecodeErrorKind::VarintOverflow, start);
                }
                return Ok((value as u32, raw, i + 1));
            }
        }
        self.fail(DecodeErrorKind::VarintOverflow, start)
    }

    /// Parse one known field after its tag. `Ok(false)` means the wire type
    /// does not fit the field; the value is left unread for the unknown
    /// path.
    fn parse_field(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        wt: WireType,
        tag_offset: u64,
        limit: Limit,
    ) -> Result<bool, Fail> {
        match entry.type_card.card {
            Cardinality::Map => {
                if wt != WireType::Len {
                    return Ok(false);
                }
                self.parse_map_field(msg, table, entry, limit)?;
                Ok(true)
            }
            Cardinality::Singular => self.parse_singular(msg, table, entry, wt, tag_offset, limit),
            Cardinality::Repeated => self.parse_repeated(msg, table, entry, wt, limit),
        }
    }

    fn parse_singular(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        wt: WireType,
        tag_offset: u64,
        limit: Limit,
    ) -> Result<bool, Fail> {
        let kind = entry.type_card.kind;
        match kind {
            FieldKind::Message => {
                if wt != WireType::Len {
                    return Ok(false);
                }
                let end = self.read_delimited_end(limit)?;
                self.parse_child(msg, table, entry, Limit::Bytes(end), tag_offset)?;
                Ok(true)
            }
            FieldKind::Group => {
                if wt != WireType::StartGroup {
                    return Ok(false);
                }
                let end_tag = wire::tag(entry.number, WireType::EndGroup);
                let child = Limit::Group {
                    end_tag,
                    end: limit.byte_end(),
                };
                self.parse_child(msg, table, entry, child, tag_offset)?;
                Ok(true)
            }
            FieldKind::String | FieldKind::Bytes => {
                if wt != WireType::Len {
                    return Ok(false);
                }
                let bytes = self.read_bytes_value(limit)?;
                self.check_utf8(bytes, entry.type_card.utf8, table.name(), entry.number)?;
                self.mark_present(msg, table, entry);
                *msg.slot_for_mut(entry, self.arena) = Slot::Bytes(bytes);
                Ok(true)
            }
            FieldKind::Enum => {
                if wt != WireType::Varint {
                    return Ok(false);
                }
                let v = self.read_varint()?;
                let AuxData::Enum(values) = table.aux_data(entry) else {
                    unreachable!();
                };
                if values.contains(v as u32 as i32) {
                    self.mark_present(msg, table, entry);
                    *msg.slot_for_mut(entry, self.arena) = Slot::S32(v as u32);
                } else {
                    // Out of range for a closed enum: keep the value, but in
                    // the unknown set.
                    let unknown = msg.unknown_mut();
                    unknown.put_tag(entry.number, WireType::Varint, self.arena);
                    unknown.put_varint(v, self.arena);
                }
                Ok(true)
            }
            _ => {
                if wt != kind.wire_type() {
                    return Ok(false);
                }
                let value = self.read_numeric(kind)?;
                self.mark_present(msg, table, entry);
                *msg.slot_for_mut(entry, self.arena) = value;
                Ok(true)
            }
        }
    }

    fn parse_repeated(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        wt: WireType,
        limit: Limit,
    ) -> Result<bool, Fail> {
        let kind = entry.type_card.kind;
        match kind {
            FieldKind::Message => {
                if wt != WireType::Len {
                    return Ok(false);
                }
                let precoded = wire::precode_tag(wire::tag(entry.number, WireType::Len));
                loop {
                    let end = self.read_delimited_end(limit)?;
                    self.parse_repeated_child(msg, table, entry, Limit::Bytes(end))?;
                    if !self.more_of_tag(precoded, limit) {
                        return Ok(true);
                    }
                }
            }
            FieldKind::Group => {
                if wt != WireType::StartGroup {
                    return Ok(false);
                }
                let end_tag = wire::tag(entry.number, WireType::EndGroup);
                let child = Limit::Group {
                    end_tag,
                    end: limit.byte_end(),
                };
                self.parse_repeated_child(msg, table, entry, child)?;
                Ok(true)
            }
            FieldKind::String | FieldKind::Bytes => {
                if wt != WireType::Len {
                    return Ok(false);
                }
                let precoded = wire::precode_tag(wire::tag(entry.number, WireType::Len));
                loop {
                    let bytes = self.read_bytes_value(limit)?;
                    self.check_utf8(bytes, entry.type_card.utf8, table.name(), entry.number)?;
                    let arena = self.arena;
                    rep_bytes(msg.slot_for_mut(entry, arena)).push(bytes, arena);
                    if !self.more_of_tag(precoded, limit) {
                        return Ok(true);
                    }
                }
            }
            _ => {
                // Numeric repeats accept both encodings, whichever the
                // schema declared: a Len payload is a packed run, the
                // element wire type is a single append.
                if wt == WireType::Len {
                    self.parse_packed(msg, table, entry, limit)?;
                    Ok(true)
                } else if wt == kind.wire_type() {
                    self.parse_repeated_numeric(msg, table, entry, wt, limit)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// One unpacked numeric element, then greedily as many more as repeat
    /// the identical canonical tag.
    fn parse_repeated_numeric(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        wt: WireType,
        limit: Limit,
    ) -> Result<(), Fail> {
        let kind = entry.type_card.kind;
        let precoded = wire::precode_tag(wire::tag(entry.number, wt));
        loop {
            self.parse_one_numeric(msg, table, entry, kind)?;
            if !self.more_of_tag(precoded, limit) {
                return Ok(());
            }
        }
    }

    /// Whether the next bytes repeat the same canonical tag inside the
    /// current region; consumes the tag when they do.
    fn more_of_tag(&mut self, precoded: Option<u16>, limit: Limit) -> bool {
        let Some(pre) = precoded else {
            return false;
        };
        if let Some(end) = limit.byte_end() {
            if self.input.offset() >= end {
                return false;
            }
        }
        if !self.peek_matches(pre) {
            return false;
        }
        self.consume_precoded(pre);
        true
    }

    fn parse_one_numeric(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        kind: FieldKind,
    ) -> Result<(), Fail> {
        if kind == FieldKind::Enum {
            let v = self.read_varint()?;
            let AuxData::Enum(values) = table.aux_data(entry) else {
                unreachable!();
            };
            if values.contains(v as u32 as i32) {
                self.push_numeric(msg, entry, Slot::S32(v as u32));
            } else {
                let unknown = msg.unknown_mut();
                unknown.put_tag(entry.number, WireType::Varint, self.arena);
                unknown.put_varint(v, self.arena);
            }
        } else {
            let value = self.read_numeric(kind)?;
            self.push_numeric(msg, entry, value);
        }
        Ok(())
    }

    fn push_numeric(&mut self, msg: &mut Message<'a>, entry: &FieldEntry, value: Slot<'a>) {
        let arena = self.arena;
        let slot = msg.slot_for_mut(entry, arena);
        match value {
            Slot::Bool(b) => rep_bool(slot).push(b, arena),
            Slot::S32(v) => rep32(slot).push(v, arena),
            Slot::S64(v) => rep64(slot).push(v, arena),
            _ => unreachable!(),
        }
    }

    fn parse_packed(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        limit: Limit,
    ) -> Result<(), Fail> {
        let kind = entry.type_card.kind;
        let end = self.read_delimited_end(limit)?;
        let declared = (end - self.input.offset()) as usize;
        let arena = self.arena;
        {
            // The capacity hint is clamped by read_delimited_end's bound on
            // the physical input, so a lying length cannot balloon memory.
            let min = kind.min_packed_bytes();
            let slot = msg.slot_for_mut(entry, arena);
            match kind {
                FieldKind::Bool => rep_bool(slot).reserve_packed(declared, min, declared, arena),
                k if k.wide() => rep64(slot).reserve_packed(declared, min, declared, arena),
                _ => rep32(slot).reserve_packed(declared, min, declared, arena),
            }
        }
        while self.input.offset() < end {
            self.parse_one_numeric(msg, table, entry, kind)?;
        }
        let off = self.input.offset();
        if off != end {
            // The last element ran past the declared payload.
            return self.fail(DecodeErrorKind::LengthOverrun, off);
        }
        Ok(())
    }

    fn read_numeric(&mut self, kind: FieldKind) -> Result<Slot<'a>, Fail> {
        Ok(match kind.wire_type() {
            WireType::Varint => {
                let v = self.read_varint()?;
                match kind {
                    FieldKind::Bool => Slot::Bool(v != 0),
                    FieldKind::SInt32 => Slot::S32(wire::zigzag_decode32(v as u32) as u32),
                    FieldKind::SInt64 => Slot::S64(wire::zigzag_decode64(v) as u64),
                    k if k.wide() => Slot::S64(v),
                    _ => Slot::S32(v as u32),
                }
            }
            WireType::Fixed32 => Slot::S32(self.read_fixed32()?),
            WireType::Fixed64 => Slot::S64(self.read_fixed64()?),
            _ => unreachable!("numeric kinds only"),
        })
    }

    fn mark_present(&mut self, msg: &mut Message<'a>, table: &MiniTable, entry: &FieldEntry) {
        match entry.presence {
            Presence::Hasbit(h) => msg.set_hasbit(h),
            Presence::Oneof(o) => msg.switch_oneof(table, o, entry.number, self.arena),
            Presence::None => {}
        }
    }

    /// Singular submessage or group: reuse (and merge into) an existing
    /// child, allocate on first sight.
    fn parse_child(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        limit: Limit,
        tag_offset: u64,
    ) -> Result<(), Fail> {
        self.enter(tag_offset)?;
        let AuxData::Message(handle) = table.aux_data(entry) else {
            unreachable!();
        };
        let handle = *handle;
        let set = self.set;
        let child_table = set.table(handle);
        self.mark_present(msg, table, entry);
        let arena = self.arena;
        let slot = msg.slot_for_mut(entry, arena);
        let child = match slot {
            Slot::Msg(p) => *p,
            _ => {
                let p = MsgPtr::alloc(child_table, handle, arena);
                *slot = Slot::Msg(p);
                p
            }
        };
        // Safety: the parser holds the only live access to the tree.
        let result = self.parse_msg(unsafe { child.get_mut() }, child_table, limit);
        self.depth -= 1;
        result
    }

    fn parse_repeated_child(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        limit: Limit,
    ) -> Result<(), Fail> {
        let tag_offset = self.input.offset();
        self.enter(tag_offset)?;
        let AuxData::Message(handle) = table.aux_data(entry) else {
            unreachable!();
        };
        let handle = *handle;
        let set = self.set;
        let child_table = set.table(handle);
        let arena = self.arena;
        let rep = rep_msg(msg.slot_for_mut(entry, arena));
        // A cleared element is revived and merged into; otherwise a fresh
        // message is allocated.
        let child = *rep.add_with(arena, || MsgPtr::alloc(child_table, handle, arena));
        // Safety: the parser holds the only live access to the tree.
        let result = self.parse_msg(unsafe { child.get_mut() }, child_table, limit);
        self.depth -= 1;
        result
    }

    /// Read a length prefix and return the absolute end offset of the
    /// payload, bounded by the enclosing region and the physical input.
    fn read_delimited_end(&mut self, limit: Limit) -> Result<u64, Fail> {
        let len_off = self.input.offset();
        let len = self.read_varint()?;
        let Some(end) = self.input.offset().checked_add(len) else {
            return self.fail(DecodeErrorKind::LengthOverrun, len_off);
        };
        if let Some(outer) = limit.byte_end() {
            if end > outer {
                return self.fail(DecodeErrorKind::LengthOverrun, len_off);
            }
        }
        if len > self.input.remaining() as u64 {
            return self.fail(DecodeErrorKind::Truncated, len_off);
        }
        Ok(end)
    }

    fn read_bytes_value(&mut self, limit: Limit) -> Result<&'a [u8], Fail> {
        let end = self.read_delimited_end(limit)?;
        let off = self.input.offset();
        let len = (end - off) as usize;
        match self.input.read_span(len, self.arena) {
            Some(span) => Ok(span),
            None => self.fail(DecodeErrorKind::Truncated, off),
        }
    }

    fn check_utf8(
        &mut self,
        bytes: &[u8],
        mode: Utf8Mode,
        message: &str,
        field: u32,
    ) -> Result<(), Fail> {
        if mode == Utf8Mode::None || std::str::from_utf8(bytes).is_ok() {
            return Ok(());
        }
        let offset = self.input.offset();
        match mode {
            Utf8Mode::Strict => {
                tracing::warn!(
                    message_type = message,
                    field,
                    offset,
                    "rejecting string field with invalid UTF-8"
                );
                self.fail(DecodeErrorKind::InvalidUtf8 { field }, offset)
            }
            Utf8Mode::Verify => {
                tracing::warn!(
                    message_type = message,
                    field,
                    offset,
                    "string field contains invalid UTF-8"
                );
                Ok(())
            }
            Utf8Mode::None => unreachable!(),
        }
    }

    #[inline]
    fn peek_matches(&mut self, pre: u16) -> bool {
        match self.input.peek_byte() {
            Some(b0) if b0 == (pre & 0xFF) as u8 => {
                pre <= 0x7F || self.input.peek_second() == Some((pre >> 8) as u8)
            }
            _ => false,
        }
    }

    #[inline]
    fn consume_precoded(&mut self, pre: u16) {
        self.input.read_byte();
        if pre > 0x7F {
            self.input.read_byte();
        }
    }

    // -- maps ---------------------------------------------------------------

    /// A map field is a run of length-delimited entry messages with the key
    /// in field 1 and the value in field 2. Each entry is captured as one
    /// contiguous span first, so an entry rejected for an out-of-range enum
    /// value can be preserved verbatim in the unknown set.
    fn parse_map_field(
        &mut self,
        msg: &mut Message<'a>,
        table: &MiniTable,
        entry: &FieldEntry,
        limit: Limit,
    ) -> Result<(), Fail> {
        let end = self.read_delimited_end(limit)?;
        let span_base = self.input.offset();
        let len = (end - span_base) as usize;
        let span = match self.input.read_span(len, self.arena) {
            Some(s) => s,
            None => return self.fail(DecodeErrorKind::Truncated, span_base),
        };
        let AuxData::Map(aux) = table.aux_data(entry) else {
            unreachable!();
        };
        match self.decode_map_entry(span, span_base, aux, table.name())? {
            Some((key, value)) => {
                let arena = self.arena;
                map_slot(msg.slot_for_mut(entry, arena)).insert(key, value, arena);
            }
            None => {
                msg.unknown_mut()
                    .put_len_field(entry.number, span, self.arena);
            }
        }
        Ok(())
    }

    /// `Ok(None)` means the entry carries an out-of-range closed-enum value
    /// and must be preserved whole.
    fn decode_map_entry(
        &mut self,
        bytes: &'a [u8],
        base: u64,
        aux: &MapAux,
        msg_name: &str,
    ) -> Result<Option<(MapKey<'a>, MapValue<'a>)>, Fail> {
        let mut pos = 0usize;
        let mut key: Option<MapKey<'a>> = None;
        let mut value: Option<MapValue<'a>> = None;
        while pos < bytes.len() {
            let tag_off = base + pos as u64;
            let (tagv, n) = self.entry_varint(bytes, pos, base)?;
            pos += n;
            if tagv > u32::MAX as u64 {
                return self.fail(DecodeErrorKind::VarintOverflow, tag_off);
            }
            let tagv = tagv as u32;
            let number = tagv >> 3;
            if number == 0 {
                return self.fail(DecodeErrorKind::FieldNumberZero, tag_off);
            }
            let bits = (tagv & 7) as u8;
            let Some(wt) = WireType::from_bits(bits) else {
                return self.fail(DecodeErrorKind::InvalidWireType(bits), tag_off);
            };
            if wt == WireType::EndGroup {
                return self.fail(DecodeErrorKind::UnmatchedEndGroup, tag_off);
            }
            if number == 1 && wt == aux.key_kind.wire_type() {
                let (k, next) = self.decode_entry_key(bytes, pos, base, aux, msg_name)?;
                key = Some(k);
                pos = next;
            } else if number == 2 && wt == aux.value_kind.wire_type() {
                let (v, next) = self.decode_entry_value(bytes, pos, base, aux, msg_name)?;
                match v {
                    Some(v) => {
                        value = Some(v);
                        pos = next;
                    }
                    None => return Ok(None),
                }
            } else {
                pos = self.skip_entry_field(bytes, pos, base, number, wt, 0)?;
            }
        }
        let key = key.unwrap_or_else(|| default_key(aux.key_kind));
        let value = match value {
            Some(v) => v,
            None => self.default_value(aux),
        };
        Ok(Some((key, value)))
    }

    fn decode_entry_key(
        &mut self,
        bytes: &'a [u8],
        pos: usize,
        base: u64,
        aux: &MapAux,
        msg_name: &str,
    ) -> Result<(MapKey<'a>, usize), Fail> {
        use FieldKind::*;
        match aux.key_kind {
            Bool | Int32 | SInt32 | UInt32 | Int64 | SInt64 | UInt64 => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                let key = match aux.key_kind {
                    Bool => MapKey::Bool(v != 0),
                    Int32 => MapKey::I32(v as u32 as i32),
                    SInt32 => MapKey::I32(wire::zigzag_decode32(v as u32)),
                    UInt32 => MapKey::U32(v as u32),
                    Int64 => MapKey::I64(v as i64),
                    SInt64 => MapKey::I64(wire::zigzag_decode64(v)),
                    UInt64 => MapKey::U64(v),
                    _ => unreachable!(),
                };
                Ok((key, pos + n))
            }
            Fixed32 => {
                let v = self.entry_fixed32(bytes, pos, base)?;
                Ok((MapKey::U32(v), pos + 4))
            }
            SFixed32 => {
                let v = self.entry_fixed32(bytes, pos, base)?;
                Ok((MapKey::I32(v as i32), pos + 4))
            }
            Fixed64 => {
                let v = self.entry_fixed64(bytes, pos, base)?;
                Ok((MapKey::U64(v), pos + 8))
            }
            SFixed64 => {
                let v = self.entry_fixed64(bytes, pos, base)?;
                Ok((MapKey::I64(v as i64), pos + 8))
            }
            String => {
                let (s, next) = self.entry_bytes(bytes, pos, base)?;
                self.check_utf8(s, aux.key_utf8, msg_name, 1)?;
                Ok((MapKey::Str(s), next))
            }
            _ => unreachable!("validated at table build"),
        }
    }

    fn decode_entry_value(
        &mut self,
        bytes: &'a [u8],
        pos: usize,
        base: u64,
        aux: &MapAux,
        msg_name: &str,
    ) -> Result<(Option<MapValue<'a>>, usize), Fail> {
        use FieldKind::*;
        match aux.value_kind {
            Enum => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                let Some(boxed) = &aux.value_aux else {
                    unreachable!();
                };
                let AuxData::Enum(values) = &**boxed else {
                    unreachable!();
                };
                if values.contains(v as u32 as i32) {
                    Ok((Some(MapValue::S32(v as u32)), pos + n))
                } else {
                    Ok((None, pos))
                }
            }
            Bool => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                Ok((Some(MapValue::Bool(v != 0)), pos + n))
            }
            Int32 | UInt32 => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                Ok((Some(MapValue::S32(v as u32)), pos + n))
            }
            SInt32 => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                Ok((
                    Some(MapValue::S32(wire::zigzag_decode32(v as u32) as u32)),
                    pos + n,
                ))
            }
            Int64 | UInt64 => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                Ok((Some(MapValue::S64(v)), pos + n))
            }
            SInt64 => {
                let (v, n) = self.entry_varint(bytes, pos, base)?;
                Ok((
                    Some(MapValue::S64(wire::zigzag_decode64(v) as u64)),
                    pos + n,
                ))
            }
            Fixed32 | SFixed32 | Float => {
                let v = self.entry_fixed32(bytes, pos, base)?;
                Ok((Some(MapValue::S32(v)), pos + 4))
            }
            Fixed64 | SFixed64 | Double => {
                let v = self.entry_fixed64(bytes, pos, base)?;
                Ok((Some(MapValue::S64(v)), pos + 8))
            }
            String | Bytes => {
                let (s, next) = self.entry_bytes(bytes, pos, base)?;
                self.check_utf8(s, aux.value_utf8, msg_name, 2)?;
                Ok((Some(MapValue::Bytes(s)), next))
            }
            Message => {
                let (payload, next) = self.entry_bytes(bytes, pos, base)?;
                let Some(boxed) = &aux.value_aux else {
                    unreachable!();
                };
                let AuxData::Message(handle) = &**boxed else {
                    unreachable!();
                };
                let payload_base = base + (next - payload.len()) as u64;
                let ptr = self.parse_detached(payload, payload_base, *handle)?;
                Ok((Some(MapValue::Msg(ptr)), next))
            }
            Group => unreachable!("groups cannot be map values"),
        }
    }

    /// Parse a fresh message of type `handle` from a captured span.
    fn parse_detached(
        &mut self,
        bytes: &'a [u8],
        base: u64,
        handle: TableHandle,
    ) -> Result<MsgPtr<'a>, Fail> {
        self.enter(base)?;
        let set = self.set;
        let table = set.table(handle);
        let target = MsgPtr::alloc(table, handle, self.arena);
        let chunks = [bytes];
        let mut sub = Decoder {
            set,
            input: Input::new_at(&chunks, base),
            arena: self.arena,
            error: None,
            depth: self.depth,
        };
        // Safety: the sub-decoder holds the only access to the fresh tree.
        let result = sub.parse_msg(unsafe { target.get_mut() }, table, Limit::Eof);
        self.error = sub.error;
        self.depth -= 1;
        result.map(|()| target)
    }

    fn default_value(&mut self, aux: &MapAux) -> MapValue<'a> {
        use FieldKind::*;
        match aux.value_kind {
            Bool => MapValue::Bool(false),
            String | Bytes => MapValue::Bytes(&[]),
            Message => {
                let Some(boxed) = &aux.value_aux else {
                    unreachable!();
                };
                let AuxData::Message(handle) = &**boxed else {
                    unreachable!();
                };
                let table = self.set.table(*handle);
                MapValue::Msg(MsgPtr::alloc(table, *handle, self.arena))
            }
            k if k.wide() => MapValue::S64(0),
            _ => MapValue::S32(0),
        }
    }

    fn entry_varint(&mut self, bytes: &[u8], pos: usize, base: u64) -> Result<(u64, usize), Fail> {
        match wire::decode_varint(&bytes[pos..]) {
            Some((v, n)) => Ok((v, n)),
            None if bytes.len() - pos >= MAX_VARINT_BYTES => {
                self.fail(DecodeErrorKind::VarintOverflow, base + pos as u64)
            }
            None => self.fail(DecodeErrorKind::Truncated, base + bytes.len() as u64),
        }
    }

    fn entry_fixed32(&mut self, bytes: &[u8], pos: usize, base: u64) -> Result<u32, Fail> {
        match bytes.get(pos..pos + 4) {
            Some(chunk) => Ok(u32::from_le_bytes(chunk.try_into().expect("length 4"))),
            None => self.fail(DecodeErrorKind::Truncated, base + bytes.len() as u64),
        }
    }

    fn entry_fixed64(&mut self, bytes: &[u8], pos: usize, base: u64) -> Result<u64, Fail> {
        match bytes.get(pos..pos + 8) {
            Some(chunk) => Ok(u64::from_le_bytes(chunk.try_into().expect("length 8"))),
            None => self.fail(DecodeErrorKind::Truncated, base + bytes.len() as u64),
        }
    }

    fn entry_bytes(
        &mut self,
        bytes: &'a [u8],
        pos: usize,
        base: u64,
    ) -> Result<(&'a [u8], usize), Fail> {
        let len_off = base + pos as u64;
        let (len, n) = self.entry_varint(bytes, pos, base)?;
        let start = pos + n;
        match (start as u64).checked_add(len) {
            Some(end) if end <= bytes.len() as u64 => {
                Ok((&bytes[start..end as usize], end as usize))
            }
            _ => self.fail(DecodeErrorKind::LengthOverrun, len_off),
        }
    }

    fn skip_entry_field(
        &mut self,
        bytes: &'a [u8],
        pos: usize,
        base: u64,
        number: u32,
        wt: WireType,
        depth: u32,
    ) -> Result<usize, Fail> {
        match wt {
            WireType::Varint => {
                let (_, n) = self.entry_varint(bytes, pos, base)?;
                Ok(pos + n)
            }
            WireType::Fixed32 => {
                self.entry_fixed32(bytes, pos, base)?;
                Ok(pos + 4)
            }
            WireType::Fixed64 => {
                self.entry_fixed64(bytes, pos, base)?;
                Ok(pos + 8)
            }
            WireType::Len => {
                let (_, next) = self.entry_bytes(bytes, pos, base)?;
                Ok(next)
            }
            WireType::StartGroup => self.skip_entry_group(bytes, pos, base, number, depth),
            WireType::EndGroup => unreachable!("filtered by the caller"),
        }
    }

    fn skip_entry_group(
        &mut self,
        bytes: &'a [u8],
        mut pos: usize,
        base: u64,
        group_number: u32,
        depth: u32,
    ) -> Result<usize, Fail> {
        if depth >= DEPTH_LIMIT {
            return self.fail(DecodeErrorKind::DepthLimitExceeded, base + pos as u64);
        }
        let end_tag = wire::tag(group_number, WireType::EndGroup);
        loop {
            let tag_off = base + pos as u64;
            if pos >= bytes.len() {
                return self.fail(DecodeErrorKind::UnterminatedGroup, tag_off);
            }
            let (tagv, n) = self.entry_varint(bytes, pos, base)?;
            pos += n;
            if tagv > u32::MAX as u64 {
                return self.fail(DecodeErrorKind::VarintOverflow, tag_off);
            }
            let tagv = tagv as u32;
            let number = tagv >> 3;
            if number == 0 {
                return self.fail(DecodeErrorKind::FieldNumberZero, tag_off);
            }
            let bits = (tagv & 7) as u8;
            let Some(wt) = WireType::from_bits(bits) else {
                return self.fail(DecodeErrorKind::InvalidWireType(bits), tag_off);
            };
            if wt == WireType::EndGroup {
                if tagv == end_tag {
                    return Ok(pos);
                }
                return self.fail(DecodeErrorKind::UnmatchedEndGroup, tag_off);
            }
            pos = self.skip_entry_field(bytes, pos, base, number, wt, depth + 1)?;
        }
    }

    // -- unknown fields -----------------------------------------------------

    /// Copy an unknown field's value to the unknown set exactly as it
    /// appears on the wire; the tag bytes were already appended.
    fn copy_unknown_value(
        &mut self,
        unknown: &mut UnknownFields<'a>,
        number: u32,
        wt: WireType,
        limit: Limit,
    ) -> Result<(), Fail> {
        match wt {
            WireType::Varint => {
                self.copy_varint(unknown)?;
                Ok(())
            }
            WireType::Fixed32 => {
                let v = self.read_fixed32()?;
                unknown.put_fixed32(v, self.arena);
                Ok(())
            }
            WireType::Fixed64 => {
                let v = self.read_fixed64()?;
                unknown.put_fixed64(v, self.arena);
                Ok(())
            }
            WireType::Len => {
                let len_off = self.input.offset();
                let len = self.copy_varint(unknown)?;
                if let Some(end) = limit.byte_end() {
                    let past = self
                        .input
                        .offset()
                        .checked_add(len)
                        .map_or(true, |payload_end| payload_end > end);
                    if past {
                        return self.fail(DecodeErrorKind::LengthOverrun, len_off);
                    }
                }
                if len > self.input.remaining() as u64 {
                    let off = self.input.offset();
                    return self.fail(DecodeErrorKind::Truncated, off);
                }
                self.copy_raw(unknown, len)
            }
            WireType::StartGroup => self.copy_unknown_group(unknown, number, limit),
            WireType::EndGroup => unreachable!("filtered by the caller"),
        }
    }

    /// Copy an entire unknown group, framing included, preserving nested
    /// content byte-for-byte.
    fn copy_unknown_group(
        &mut self,
        unknown: &mut UnknownFields<'a>,
        group_number: u32,
        limit: Limit,
    ) -> Result<(), Fail> {
        let start = self.input.offset();
        self.enter(start)?;
        let end_tag = wire::tag(group_number, WireType::EndGroup);
        let bound = limit.byte_end();
        loop {
            let tag_off = self.input.offset();
            if bound.map_or(false, |e| tag_off >= e) {
                return self.fail(DecodeErrorKind::UnterminatedGroup, tag_off);
            }
            if !self.input.has_more() {
                return self.fail(DecodeErrorKind::UnterminatedGroup, tag_off);
            }
            let tagv = self.copy_varint(unknown)?;
            if tagv > u32::MAX as u64 {
                return self.fail(DecodeErrorKind::VarintOverflow, tag_off);
            }
            let tagv = tagv as u32;
            let number = tagv >> 3;
            if number == 0 {
                return self.fail(DecodeErrorKind::FieldNumberZero, tag_off);
            }
            let bits = (tagv & 7) as u8;
            let Some(wt) = WireType::from_bits(bits) else {
                return self.fail(DecodeErrorKind::InvalidWireType(bits), tag_off);
            };
            if wt == WireType::EndGroup {
                if tagv == end_tag {
                    self.depth -= 1;
                    return Ok(());
                }
                return self.fail(DecodeErrorKind::UnmatchedEndGroup, tag_off);
            }
            self.copy_unknown_value(unknown, number, wt, limit)?;
        }
    }

    fn copy_varint(&mut self, unknown: &mut UnknownFields<'a>) -> Result<u64, Fail> {
        let arena = self.arena;
        let start = self.input.offset();
        let mut value = 0u64;
        for i in 0..MAX_VARINT_BYTES {
            let Some(b) = self.input.read_byte() else {
                let off = self.input.offset();
                return self.fail(DecodeErrorKind::Truncated, off);
            };
            unknown.put_byte(b, arena);
            value |= ((b & 0x7F) as u64) << (7 * i);
            if b < 0x80 {
                return Ok(value);
            }
        }
        self.fail(DecodeErrorKind::VarintOverflow, start)
    }

    fn copy_raw(&mut self, unknown: &mut UnknownFields<'a>, len: u64) -> Result<(), Fail> {
        let arena = self.arena;
        let mut rem = len;
        while rem > 0 {
            let want = rem.min(usize::MAX as u64) as usize;
            let Some(chunk) = self.input.take_chunk(want) else {
                let off = self.input.offset();
                return self.fail(DecodeErrorKind::Truncated, off);
            };
            unknown.put_raw(chunk, arena);
            rem -= chunk.len() as u64;
        }
        Ok(())
    }
}

fn rep32<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut RepeatedScalar<'a, u32> {
    if !matches!(slot, Slot::Rep32(_)) {
        *slot = Slot::Rep32(RepeatedScalar::new());
    }
    match slot {
        Slot::Rep32(rep) => rep,
        _ => unreachable!(),
    }
}

fn rep64<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut RepeatedScalar<'a, u64> {
    if !matches!(slot, Slot::Rep64(_)) {
        *slot = Slot::Rep64(RepeatedScalar::new());
    }
    match slot {
        Slot::Rep64(rep) => rep,
        _ => unreachable!(),
    }
}

fn rep_bool<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut RepeatedScalar<'a, bool> {
    if !matches!(slot, Slot::RepBool(_)) {
        *slot = Slot::RepBool(RepeatedScalar::new());
    }
    match slot {
        Slot::RepBool(rep) => rep,
        _ => unreachable!(),
    }
}

fn rep_bytes<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut RepeatedPtr<'a, &'a [u8]> {
    if !matches!(slot, Slot::RepBytes(_)) {
        *slot = Slot::RepBytes(RepeatedPtr::new());
    }
    match slot {
        Slot::RepBytes(rep) => rep,
        _ => unreachable!(),
    }
}

fn rep_msg<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut RepeatedPtr<'a, MsgPtr<'a>> {
    if !matches!(slot, Slot::RepMsg(_)) {
        *slot = Slot::RepMsg(RepeatedPtr::new());
    }
    match slot {
        Slot::RepMsg(rep) => rep,
        _ => unreachable!(),
    }
}

fn map_slot<'m, 'a>(slot: &'m mut Slot<'a>) -> &'m mut Map<'a> {
    if !matches!(slot, Slot::Map(_)) {
        *slot = Slot::Map(Map::new());
    }
    match slot {
        Slot::Map(map) => map,
        _ => unreachable!(),
    }
}

fn default_key(kind: FieldKind) -> MapKey<'static> {
    use FieldKind::*;
    match kind {
        Bool => MapKey::Bool(false),
        Int32 | SInt32 | SFixed32 => MapKey::I32(0),
        UInt32 | Fixed32 => MapKey::U32(0),
        Int64 | SInt64 | SFixed64 => MapKey::I64(0),
        UInt64 | Fixed64 => MapKey::U64(0),
        String => MapKey::Str(&[]),
        _ => unreachable!("validated at table build"),
    }
}

#[cfg(test)]
#[path = "./parser_tests.rs"]
mod tests;
