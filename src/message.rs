#![allow(unsafe_code)]

//! Parsed message storage.
//!
//! A [`Message`] is a flat record laid out from its [`MiniTable`]: one
//! normalized [`Slot`] per field, a hasbit word array for explicit
//! presence, one case word per oneof, and the unknown-field byte stream.
//! Everything lives in the arena; messages carry no destructor and are
//! reached through copyable [`MsgPtr`] handles.
//!
//! Normalized storage keeps the wire-level value: 32-bit scalars (including
//! floats and zigzag-decoded sint32) as `u32` bits, 64-bit scalars as `u64`
//! bits. The field kind from the table reinterprets them on access.

use crate::arena::Arena;
use crate::map::Map;
use crate::minitable::{Cardinality, FieldEntry, FieldKind, MiniTable, Presence, TableHandle};
use crate::repeated::RepeatedScalar;
use crate::repeated_ptr::{RepeatedPtr, Reuse};
use crate::unknown::UnknownFields;
use std::ptr::NonNull;

/// Normalized storage for one field.
#[derive(Debug, Default)]
pub(crate) enum Slot<'a> {
    #[default]
    Empty,
    S32(u32),
    S64(u64),
    Bool(bool),
    Bytes(&'a [u8]),
    Msg(MsgPtr<'a>),
    Rep32(RepeatedScalar<'a, u32>),
    Rep64(RepeatedScalar<'a, u64>),
    RepBool(RepeatedScalar<'a, bool>),
    RepBytes(RepeatedPtr<'a, &'a [u8]>),
    RepMsg(RepeatedPtr<'a, MsgPtr<'a>>),
    Map(Map<'a>),
}

fn empty_slot<'s, 'a>() -> &'s Slot<'a> {
    const EMPTY: Slot<'static> = Slot::Empty;
    &EMPTY
}

/// A copyable handle to an arena-allocated message.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MsgPtr<'a>(NonNull<Message<'a>>);

impl<'a> MsgPtr<'a> {
    /// Allocate a fresh message for `table` in the arena.
    pub fn alloc(table: &MiniTable, handle: TableHandle, arena: &'a Arena) -> Self {
        let slot_count = table.slot_count;
        let slots = arena.alloc_array::<Slot<'a>>(slot_count as usize);
        for i in 0..slot_count as usize {
            // Safety: writing initial values into the fresh array.
            unsafe { slots.as_ptr().add(i).write(Slot::Empty) };
        }
        let hasbit_words = (table.hasbit_count as usize).div_ceil(32);
        let hasbits = arena.alloc_array::<u32>(hasbit_words);
        let oneofs = arena.alloc_array::<u32>(table.oneof_count as usize);
        // Safety: zeroing the fresh word arrays.
        unsafe {
            std::ptr::write_bytes(hasbits.as_ptr(), 0, hasbit_words);
            std::ptr::write_bytes(oneofs.as_ptr(), 0, table.oneof_count as usize);
        }
        let msg = arena.alloc_value(Message {
            table: handle,
            slots,
            slot_count,
            hasbits,
            hasbit_words: hasbit_words as u16,
            oneofs,
            oneof_count: table.oneof_count,
            split: None,
            split_count: table.split_slot_count,
            unknown: UnknownFields::new(),
        });
        MsgPtr(msg)
    }

    /// Shared access. The message borrows from the arena, so the reference
    /// lives as long as the handle's lifetime.
    #[inline]
    pub fn get(self) -> &'a Message<'a> {
        // Safety: the message is arena-allocated for 'a and never moved.
        unsafe { self.0.as_ref() }
    }

    /// Exclusive access through a copyable handle.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other reference to this message is live,
    /// which holds during a parse: the parser walks the message tree with
    /// exclusive ownership.
    #[inline]
    pub(crate) unsafe fn get_mut(mut self) -> &'a mut Message<'a> {
        // Safety: exclusivity is the caller's contract.
        unsafe { self.0.as_mut() }
    }
}

impl Reuse for MsgPtr<'_> {
    fn reuse(&mut self) {
        // Safety: reuse is called by containers that own the only live
        // handle during mutation.
        unsafe { self.get_mut() }.clear();
    }
}

impl std::fmt::Debug for MsgPtr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgPtr({:p})", self.0.as_ptr())
    }
}

/// A field value surfaced through the accessors, interpreted per the
/// field's declared kind.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value<'a> {
    /// Unset, unknown field number, or wrong-cardinality access.
    None,
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Bytes(&'a [u8]),
    Message(MsgPtr<'a>),
}

pub struct Message<'a> {
    table: TableHandle,
    slots: NonNull<Slot<'a>>,
    slot_count: u16,
    hasbits: NonNull<u32>,
    hasbit_words: u16,
    oneofs: NonNull<u32>,
    oneof_count: u16,
    /// Lazily allocated block for split fields.
    split: Option<NonNull<Slot<'a>>>,
    split_count: u16,
    unknown: UnknownFields<'a>,
}

impl<'a> Message<'a> {
    /// The table this message was parsed with.
    #[inline]
    pub fn table_handle(&self) -> TableHandle {
        self.table
    }

    #[inline]
    fn slots(&self) -> &[Slot<'a>] {
        // Safety: slot_count slots were initialized at allocation.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.slot_count as usize) }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Slot<'a>] {
        // Safety: initialized at allocation; &mut self is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.slots.as_ptr(), self.slot_count as usize) }
    }

    fn split_slots(&self) -> &[Slot<'a>] {
        match self.split {
            // Safety: the split block is fully initialized when allocated.
            Some(base) => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), self.split_count as usize)
            },
            None => &[],
        }
    }

    /// The split block, allocated on first touch.
    fn ensure_split(&mut self, arena: &'a Arena) -> &mut [Slot<'a>] {
        if self.split.is_none() {
            let base = arena.alloc_array::<Slot<'a>>(self.split_count as usize);
            for i in 0..self.split_count as usize {
                // Safety: writing initial values into the fresh block.
                unsafe { base.as_ptr().add(i).write(Slot::Empty) };
            }
            self.split = Some(base);
        }
        let base = self.split.unwrap();
        // Safety: just initialized (or previously); &mut self is exclusive.
        unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), self.split_count as usize) }
    }

    pub(crate) fn slot_for(&self, entry: &FieldEntry) -> &Slot<'a> {
        if entry.type_card.split {
            self.split_slots()
                .get(entry.slot as usize)
                .unwrap_or_else(|| empty_slot())
        } else {
            &self.slots()[entry.slot as usize]
        }
    }

    pub(crate) fn slot_for_mut(&mut self, entry: &FieldEntry, arena: &'a Arena) -> &mut Slot<'a> {
        if entry.type_card.split {
            &mut self.ensure_split(arena)[entry.slot as usize]
        } else {
            &mut self.slots_mut()[entry.slot as usize]
        }
    }

    #[inline]
    fn hasbit(&self, idx: u16) -> bool {
        debug_assert!(idx / 32 < self.hasbit_words);
        // Safety: the word index is within the allocated array.
        let word = unsafe { *self.hasbits.as_ptr().add(idx as usize / 32) };
        word & (1 << (idx % 32)) != 0
    }

    #[inline]
    pub(crate) fn set_hasbit(&mut self, idx: u16) {
        debug_assert!(idx / 32 < self.hasbit_words);
        // Safety: the word index is within the allocated array.
        unsafe { *self.hasbits.as_ptr().add(idx as usize / 32) |= 1 << (idx % 32) };
    }

    /// The field number currently set in the oneof, or `None`.
    pub fn oneof_case(&self, oneof: u16) -> Option<u32> {
        assert!(oneof < self.oneof_count, "oneof index out of range");
        // Safety: oneof < oneof_count.
        let case = unsafe { *self.oneofs.as_ptr().add(oneof as usize) };
        (case != 0).then_some(case)
    }

    /// Point the oneof at `number`, resetting the previously set member.
    pub(crate) fn switch_oneof(
        &mut self,
        table: &MiniTable,
        oneof: u16,
        number: u32,
        arena: &'a Arena,
    ) {
        debug_assert!(oneof < self.oneof_count);
        // Safety: oneof < oneof_count.
        let case = unsafe { *self.oneofs.as_ptr().add(oneof as usize) };
        if case != 0 && case != number {
            if let Some(old) = table.find_field(case) {
                *self.slot_for_mut(old, arena) = Slot::Empty;
            }
        }
        // Safety: same bound as above.
        unsafe { *self.oneofs.as_ptr().add(oneof as usize) = number };
    }

    /// Presence check.
    ///
    /// Explicit-presence fields answer from their hasbit (or oneof case);
    /// implicit-presence fields answer whether anything was stored, and
    /// repeated and map fields whether they are non-empty.
    pub fn has(&self, table: &MiniTable, number: u32) -> bool {
        let Some(entry) = table.find_field(number) else {
            return false;
        };
        match entry.presence {
            Presence::Hasbit(h) => self.hasbit(h),
            Presence::Oneof(o) => self.oneof_case(o) == Some(number),
            Presence::None => match self.slot_for(entry) {
                Slot::Empty => false,
                Slot::Rep32(r) => !r.is_empty(),
                Slot::Rep64(r) => !r.is_empty(),
                Slot::RepBool(r) => !r.is_empty(),
                Slot::RepBytes(r) => !r.is_empty(),
                Slot::RepMsg(r) => !r.is_empty(),
                Slot::Map(m) => !m.is_empty(),
                _ => true,
            },
        }
    }

    /// A singular field's value, or `Value::None` when unset.
    pub fn get(&self, table: &MiniTable, number: u32) -> Value<'a> {
        let Some(entry) = table.find_field(number) else {
            return Value::None;
        };
        if entry.type_card.card != Cardinality::Singular {
            return Value::None;
        }
        match entry.presence {
            Presence::Hasbit(h) if !self.hasbit(h) => return Value::None,
            Presence::Oneof(o) if self.oneof_case(o) != Some(number) => return Value::None,
            _ => {}
        }
        interpret(entry.type_card.kind, self.slot_for(entry))
    }

    /// Element count of a repeated field (0 when unset or not repeated).
    pub fn repeated_len(&self, table: &MiniTable, number: u32) -> usize {
        let Some(entry) = table.find_field(number) else {
            return 0;
        };
        match self.slot_for(entry) {
            Slot::Rep32(r) => r.len(),
            Slot::Rep64(r) => r.len(),
            Slot::RepBool(r) => r.len(),
            Slot::RepBytes(r) => r.len(),
            Slot::RepMsg(r) => r.len(),
            _ => 0,
        }
    }

    /// One element of a repeated field.
    pub fn repeated_get(&self, table: &MiniTable, number: u32, index: usize) -> Value<'a> {
        let Some(entry) = table.find_field(number) else {
            return Value::None;
        };
        let kind = entry.type_card.kind;
        match self.slot_for(entry) {
            Slot::Rep32(r) => r.get(index).map_or(Value::None, |v| narrow(kind, *v)),
            Slot::Rep64(r) => r.get(index).map_or(Value::None, |v| widen(kind, *v)),
            Slot::RepBool(r) => r.get(index).map_or(Value::None, |v| Value::Bool(*v)),
            Slot::RepBytes(r) => r.get(index).map_or(Value::None, |v| Value::Bytes(*v)),
            Slot::RepMsg(r) => r.get(index).map_or(Value::None, |v| Value::Message(*v)),
            _ => Value::None,
        }
    }

    /// The map of a map field, if anything was stored in it.
    pub fn map(&self, table: &MiniTable, number: u32) -> Option<&Map<'a>> {
        let entry = table.find_field(number)?;
        match self.slot_for(entry) {
            Slot::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Raw wire bytes of every field the table did not recognize.
    pub fn unknown_bytes(&self) -> &[u8] {
        self.unknown.as_bytes()
    }

    #[inline]
    pub(crate) fn unknown_mut(&mut self) -> &mut UnknownFields<'a> {
        &mut self.unknown
    }

    /// Reset to the freshly-allocated state, keeping every container's
    /// capacity and every submessage allocation for reuse.
    pub fn clear(&mut self) {
        for slot in self.slots_mut() {
            clear_slot(slot);
        }
        if let Some(base) = self.split {
            for i in 0..self.split_count as usize {
                // Safety: the split block is initialized when allocated.
                clear_slot(unsafe { &mut *base.as_ptr().add(i) });
            }
        }
        // Safety: word counts match the allocations.
        unsafe {
            std::ptr::write_bytes(self.hasbits.as_ptr(), 0, self.hasbit_words as usize);
            std::ptr::write_bytes(self.oneofs.as_ptr(), 0, self.oneof_count as usize);
        }
        self.unknown.clear();
    }
}

fn clear_slot(slot: &mut Slot<'_>) {
    match slot {
        Slot::Empty => {}
        // A kept submessage is cleared in place so a later parse merges
        // into reused storage instead of reallocating.
        Slot::Msg(p) => p.reuse(),
        Slot::Rep32(r) => r.clear(),
        Slot::Rep64(r) => r.clear(),
        Slot::RepBool(r) => r.clear(),
        Slot::RepBytes(r) => r.clear(),
        Slot::RepMsg(r) => r.clear(),
        Slot::Map(m) => m.clear(),
        _ => *slot = Slot::Empty,
    }
}

/// Interpret a singular slot through the declared kind.
fn interpret<'a>(kind: FieldKind, slot: &Slot<'a>) -> Value<'a> {
    match slot {
        Slot::Empty => Value::None,
        Slot::S32(v) => narrow(kind, *v),
        Slot::S64(v) => widen(kind, *v),
        Slot::Bool(b) => Value::Bool(*b),
        Slot::Bytes(b) => Value::Bytes(b),
        Slot::Msg(p) => Value::Message(*p),
        _ => Value::None,
    }
}

fn narrow(kind: FieldKind, bits: u32) -> Value<'static> {
    match kind {
        FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32 | FieldKind::Enum => {
            Value::I32(bits as i32)
        }
        FieldKind::UInt32 | FieldKind::Fixed32 => Value::U32(bits),
        FieldKind::Float => Value::F32(f32::from_bits(bits)),
        _ => Value::None,
    }
}

fn widen(kind: FieldKind, bits: u64) -> Value<'static> {
    match kind {
        FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64 => Value::I64(bits as i64),
        FieldKind::UInt64 | FieldKind::Fixed64 => Value::U64(bits),
        FieldKind::Double => Value::F64(f64::from_bits(bits)),
        _ => Value::None,
    }
}

#[cfg(test)]
#[path = "./message_tests.rs"]
mod tests;
