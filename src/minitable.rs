//! Compact per-message parse tables.
//!
//! A [`MiniTable`] is the immutable descriptor the parser drives on: one
//! entry per field (sorted by field number), a small fast-dispatch array
//! keyed by the low bits of the encoded tag, and a skipmap that resolves an
//! arbitrary field number to its entry without scanning. Tables reference
//! each other by [`TableHandle`] through the owning
//! [`TableSet`](crate::tables::TableSet), never by pointer, so recursive
//! schemas need no cycles and a built set is `Send + Sync`.

use crate::wire::WireType;

/// Index of a message table within its [`TableSet`](crate::tables::TableSet).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle(pub(crate) u32);

/// Declared field type, before cardinality.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int32,
    SInt32,
    UInt32,
    Int64,
    SInt64,
    UInt64,
    Fixed32,
    SFixed32,
    Float,
    Fixed64,
    SFixed64,
    Double,
    Enum,
    String,
    Bytes,
    Message,
    Group,
}

impl FieldKind {
    /// The wire type this kind encodes with (the packed representation is a
    /// separate decision carried on the type card).
    pub(crate) fn wire_type(self) -> WireType {
        use FieldKind::*;
        match self {
            Bool | Int32 | SInt32 | UInt32 | Int64 | SInt64 | UInt64 | Enum => WireType::Varint,
            Fixed32 | SFixed32 | Float => WireType::Fixed32,
            Fixed64 | SFixed64 | Double => WireType::Fixed64,
            String | Bytes | Message => WireType::Len,
            Group => WireType::StartGroup,
        }
    }

    /// Whether a repeated field of this kind may use the packed encoding.
    pub(crate) fn packable(self) -> bool {
        !matches!(
            self,
            FieldKind::String | FieldKind::Bytes | FieldKind::Message | FieldKind::Group
        )
    }

    /// Smallest possible encoded size of one packed element, used to bound
    /// capacity reservations.
    pub(crate) fn min_packed_bytes(self) -> usize {
        match self.wire_type() {
            WireType::Fixed32 => 4,
            WireType::Fixed64 => 8,
            _ => 1,
        }
    }

    /// Whether the decoded value lands in 64-bit normalized storage.
    pub(crate) fn wide(self) -> bool {
        use FieldKind::*;
        matches!(
            self,
            Int64 | SInt64 | UInt64 | Fixed64 | SFixed64 | Double
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cardinality {
    Singular,
    Repeated,
    Map,
}

/// UTF-8 handling for string fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Utf8Mode {
    /// No validation (bytes fields).
    #[default]
    None,
    /// Log and accept invalid data.
    Verify,
    /// Reject invalid data.
    Strict,
}

/// Field type, cardinality and the parse-relevant modifiers, packed into one
/// copyable descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TypeCard {
    pub kind: FieldKind,
    pub card: Cardinality,
    pub packed: bool,
    pub utf8: Utf8Mode,
    /// Stored in the lazily-allocated split block rather than the main
    /// slot array.
    pub split: bool,
}

/// How presence is tracked for a field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Implicit: present when the value is non-default.
    None,
    /// Explicit: index of the field's hasbit.
    Hasbit(u16),
    /// Member of a oneof: index of the oneof's case word.
    Oneof(u16),
}

/// One parsed-field descriptor. Entries live in `MiniTable::fields`, sorted
/// by field number.
#[derive(Debug, Clone)]
pub(crate) struct FieldEntry {
    pub number: u32,
    pub type_card: TypeCard,
    pub presence: Presence,
    /// Index into the message's slot array (or the split block when
    /// `type_card.split` is set).
    pub slot: u16,
    /// Index into `MiniTable::aux`, or `NO_AUX`.
    pub aux: u16,
}

pub(crate) const NO_AUX: u16 = u16::MAX;

/// Out-of-line data a field entry points at.
#[derive(Debug, Clone)]
pub(crate) enum AuxData {
    /// Submessage or group type.
    Message(TableHandle),
    /// Closed-enum value set for validation.
    Enum(EnumAux),
    /// Map entry description.
    Map(MapAux),
}

/// Valid values of an enum. Open enums accept everything; closed enums
/// check a bitmask for values 0..=63 and a sorted list for the rest.
#[derive(Debug, Clone)]
pub(crate) struct EnumAux {
    pub open: bool,
    pub mask: u64,
    pub others: Box<[i32]>,
}

impl EnumAux {
    pub(crate) fn contains(&self, value: i32) -> bool {
        if self.open {
            return true;
        }
        if (0..64).contains(&value) {
            return self.mask & (1 << value) != 0;
        }
        self.others.binary_search(&value).is_ok()
    }
}

/// Map entry layout: key is field 1, value is field 2 of the synthetic
/// entry message.
#[derive(Debug, Clone)]
pub(crate) struct MapAux {
    pub key_kind: FieldKind,
    pub key_utf8: Utf8Mode,
    pub value_kind: FieldKind,
    pub value_utf8: Utf8Mode,
    /// Submessage table or closed-enum set for the value, if any.
    pub value_aux: Option<Box<AuxData>>,
}

/// One slot of the fast-dispatch array.
///
/// `tag` is the precoded 1-2 byte wire encoding of the field's expected tag
/// (see [`crate::wire::precode_tag`]); the parser compares the raw peeked
/// bytes against it, so only the exact canonical encoding takes the fast
/// path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FastSlot {
    Miss,
    Field { tag: u16, field: u16 },
}

/// A run of the skipmap covering field numbers above 32. Each word covers
/// 16 consecutive numbers starting at `first`.
#[derive(Debug, Clone)]
pub(crate) struct SkipRun {
    pub first: u32,
    pub word_start: u32,
    pub word_count: u32,
    /// Index in `fields` of the first field in this run.
    pub field_index: u32,
}

/// Immutable parse table for one message type.
#[derive(Debug)]
pub struct MiniTable {
    /// Type name for diagnostics; empty when the schema did not give one.
    pub(crate) name: Box<str>,
    /// Sorted by field number.
    pub(crate) fields: Box<[FieldEntry]>,
    /// Presence bitmap for field numbers 1..=32; bit `n - 1` set means the
    /// message declares field `n`, and its entry index is the popcount of
    /// the lower bits.
    pub(crate) head_bits: u32,
    pub(crate) runs: Box<[SkipRun]>,
    pub(crate) run_words: Box<[u16]>,
    /// Power-of-two fast-dispatch array (possibly empty), indexed by
    /// `(first_tag_byte >> 3) & (len - 1)`.
    pub(crate) fast: Box<[FastSlot]>,
    pub(crate) aux: Box<[AuxData]>,
    pub(crate) slot_count: u16,
    pub(crate) split_slot_count: u16,
    pub(crate) hasbit_count: u16,
    pub(crate) oneof_count: u16,
}

impl MiniTable {
    /// The message type's name, or `""` when the schema left it unnamed.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fast-dispatch probe on the first tag byte.
    #[inline]
    pub(crate) fn fast_slot(&self, byte0: u8) -> FastSlot {
        if self.fast.is_empty() {
            return FastSlot::Miss;
        }
        self.fast[((byte0 >> 3) as usize) & (self.fast.len() - 1)]
    }

    /// Full field lookup by number; the slow path behind the fast array.
    pub(crate) fn find_field(&self, number: u32) -> Option<&FieldEntry> {
        if number == 0 {
            return None;
        }
        if number <= 32 {
            let bit = 1u32 << (number - 1);
            if self.head_bits & bit == 0 {
                return None;
            }
            let idx = (self.head_bits & (bit - 1)).count_ones() as usize;
            return Some(&self.fields[idx]);
        }
        let run_idx = match self.runs.binary_search_by(|r| r.first.cmp(&number)) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let run = &self.runs[run_idx];
        let offset = (number - run.first) as usize;
        let word = offset / 16;
        if word >= run.word_count as usize {
            return None;
        }
        let words = &self.run_words[run.word_start as usize..][..run.word_count as usize];
        let bit = 1u16 << (offset % 16);
        if words[word] & bit == 0 {
            return None;
        }
        let mut idx = run.field_index as usize;
        for w in &words[..word] {
            idx += w.count_ones() as usize;
        }
        idx += (words[word] & (bit - 1)).count_ones() as usize;
        Some(&self.fields[idx])
    }

    pub(crate) fn aux_data(&self, entry: &FieldEntry) -> &AuxData {
        &self.aux[entry.aux as usize]
    }
}
