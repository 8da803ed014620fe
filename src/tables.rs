//! Table construction.
//!
//! A [`TableSet`] owns every [`MiniTable`] of a schema and hands out
//! [`TableHandle`]s for cross-references. Recursive message types are built
//! by reserving a handle first and defining it once its dependencies exist.
//!
//! Construction is programmer-facing setup code, so inconsistent schemas
//! panic rather than returning errors.

use crate::minitable::{
    AuxData, Cardinality, EnumAux, FastSlot, FieldEntry, FieldKind, MapAux, MiniTable, Presence,
    SkipRun, TableHandle, TypeCard, Utf8Mode, NO_AUX,
};
use crate::wire::{self, WireType, MAX_FIELD_NUMBER};
use smallvec::SmallVec;

/// Field numbers this far apart never share a skipmap run.
const RUN_GAP: u32 = 96;
/// log2 of the largest fast-dispatch array.
const MAX_FAST_LOG2: u32 = 5;

/// The set of valid values of an enum type.
pub struct EnumSchema {
    open: bool,
    values: Vec<i32>,
}

impl EnumSchema {
    /// An open enum: every varint is in range.
    pub fn open() -> Self {
        EnumSchema {
            open: true,
            values: Vec::new(),
        }
    }

    /// A closed enum accepting exactly `values`.
    pub fn closed(values: impl IntoIterator<Item = i32>) -> Self {
        EnumSchema {
            open: false,
            values: values.into_iter().collect(),
        }
    }

    fn build(&self) -> EnumAux {
        let mut mask = 0u64;
        let mut others = Vec::new();
        for &v in &self.values {
            if (0..64).contains(&v) {
                mask |= 1 << v;
            } else {
                others.push(v);
            }
        }
        others.sort_unstable();
        others.dedup();
        EnumAux {
            open: self.open,
            mask,
            others: others.into_boxed_slice(),
        }
    }
}

/// Key and value types of a map field.
pub struct MapSchema {
    key: FieldKind,
    value: FieldKind,
    value_message: Option<TableHandle>,
    value_enum: Option<EnumSchema>,
}

impl MapSchema {
    pub fn new(key: FieldKind, value: FieldKind) -> Self {
        assert!(
            !matches!(
                value,
                FieldKind::Message | FieldKind::Group | FieldKind::Enum
            ),
            "message and enum map values carry their own schema"
        );
        MapSchema {
            key,
            value,
            value_message: None,
            value_enum: None,
        }
    }

    pub fn message_value(key: FieldKind, value: TableHandle) -> Self {
        MapSchema {
            key,
            value: FieldKind::Message,
            value_message: Some(value),
            value_enum: None,
        }
    }

    pub fn enum_value(key: FieldKind, value: EnumSchema) -> Self {
        MapSchema {
            key,
            value: FieldKind::Enum,
            value_message: None,
            value_enum: Some(value),
        }
    }
}

/// One field declaration.
pub struct FieldSchema {
    number: u32,
    kind: FieldKind,
    card: Cardinality,
    packed: bool,
    explicit_presence: bool,
    oneof: Option<u16>,
    utf8: Utf8Mode,
    split: bool,
    message: Option<TableHandle>,
    enumeration: Option<EnumSchema>,
    map: Option<MapSchema>,
}

impl FieldSchema {
    /// A singular scalar, string or bytes field with implicit presence.
    pub fn scalar(number: u32, kind: FieldKind) -> Self {
        assert!(
            !matches!(kind, FieldKind::Message | FieldKind::Group | FieldKind::Enum),
            "use message(), group(), enumeration() or map() for this kind"
        );
        let utf8 = if kind == FieldKind::String {
            Utf8Mode::Strict
        } else {
            Utf8Mode::None
        };
        FieldSchema {
            number,
            kind,
            card: Cardinality::Singular,
            packed: false,
            explicit_presence: false,
            oneof: None,
            utf8,
            split: false,
            message: None,
            enumeration: None,
            map: None,
        }
    }

    pub fn message(number: u32, table: TableHandle) -> Self {
        FieldSchema {
            message: Some(table),
            ..Self::raw(number, FieldKind::Message)
        }
    }

    pub fn group(number: u32, table: TableHandle) -> Self {
        FieldSchema {
            message: Some(table),
            ..Self::raw(number, FieldKind::Group)
        }
    }

    pub fn enumeration(number: u32, values: EnumSchema) -> Self {
        FieldSchema {
            enumeration: Some(values),
            ..Self::raw(number, FieldKind::Enum)
        }
    }

    pub fn map(number: u32, entry: MapSchema) -> Self {
        FieldSchema {
            card: Cardinality::Map,
            map: Some(entry),
            ..Self::raw(number, FieldKind::Message)
        }
    }

    fn raw(number: u32, kind: FieldKind) -> Self {
        FieldSchema {
            number,
            kind,
            card: Cardinality::Singular,
            packed: false,
            explicit_presence: false,
            oneof: None,
            utf8: Utf8Mode::None,
            split: false,
            message: None,
            enumeration: None,
            map: None,
        }
    }

    /// Repeated cardinality. Packable kinds default to the packed encoding.
    pub fn repeated(mut self) -> Self {
        assert!(
            self.card != Cardinality::Map,
            "map fields are already repeated"
        );
        self.card = Cardinality::Repeated;
        self.packed = self.kind.packable();
        self
    }

    /// Repeated, but declared with the unpacked encoding.
    pub fn unpacked(mut self) -> Self {
        self = self.repeated();
        self.packed = false;
        self
    }

    /// Track presence explicitly with a hasbit.
    pub fn with_presence(mut self) -> Self {
        self.explicit_presence = true;
        self
    }

    /// Make this field a member of the oneof with the given index.
    pub fn in_oneof(mut self, oneof: u16) -> Self {
        self.oneof = Some(oneof);
        self
    }

    /// Log invalid UTF-8 instead of rejecting it.
    pub fn verify_utf8(mut self) -> Self {
        assert!(self.kind == FieldKind::String, "utf8 mode is for strings");
        self.utf8 = Utf8Mode::Verify;
        self
    }

    /// Store this field in the lazily-allocated split block.
    pub fn split(mut self) -> Self {
        self.split = true;
        self
    }
}

/// A message declaration: an unordered collection of fields.
#[derive(Default)]
pub struct MessageSchema {
    name: String,
    fields: Vec<FieldSchema>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// The message type's name, surfaced in diagnostics such as UTF-8
    /// validation events.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }
}

/// Owner of every built [`MiniTable`]. Handles index into it.
#[derive(Default)]
pub struct TableSet {
    tables: Vec<Option<MiniTable>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle without defining its table yet, for recursive and
    /// mutually-recursive schemas.
    pub fn reserve(&mut self) -> TableHandle {
        let handle = TableHandle(u32::try_from(self.tables.len()).expect("too many tables"));
        self.tables.push(None);
        handle
    }

    /// Define a previously reserved table.
    pub fn define(&mut self, handle: TableHandle, schema: MessageSchema) {
        let slot = self
            .tables
            .get_mut(handle.0 as usize)
            .expect("table handle out of range");
        assert!(slot.is_none(), "table already defined");
        *slot = Some(build_table(schema));
    }

    /// Reserve and define in one step.
    pub fn add(&mut self, schema: MessageSchema) -> TableHandle {
        let handle = self.reserve();
        self.define(handle, schema);
        handle
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The table for `handle`; panics if the handle was reserved but never
    /// defined.
    pub fn table(&self, handle: TableHandle) -> &MiniTable {
        self.tables[handle.0 as usize]
            .as_ref()
            .expect("table reserved but never defined")
    }
}

fn build_table(schema: MessageSchema) -> MiniTable {
    let mut fields = schema.fields;
    fields.sort_by_key(|f| f.number);
    for pair in fields.windows(2) {
        assert!(
            pair[0].number != pair[1].number,
            "duplicate field number {}",
            pair[0].number
        );
    }

    let mut aux: Vec<AuxData> = Vec::new();
    let mut entries: Vec<FieldEntry> = Vec::with_capacity(fields.len());
    let mut slot_count = 0u16;
    let mut split_slot_count = 0u16;
    let mut hasbit_count = 0u16;
    let mut oneof_count = 0u16;

    for f in &fields {
        validate_field(f);
        let aux_idx = match build_aux(f) {
            Some(data) => {
                let idx = u16::try_from(aux.len()).expect("too many aux entries");
                assert!(idx != NO_AUX, "too many aux entries");
                aux.push(data);
                idx
            }
            None => NO_AUX,
        };
        let presence = match f.oneof {
            Some(o) => {
                oneof_count = oneof_count.max(o + 1);
                Presence::Oneof(o)
            }
            None if f.explicit_presence => {
                let h = hasbit_count;
                hasbit_count += 1;
                Presence::Hasbit(h)
            }
            None => Presence::None,
        };
        let slot = if f.split {
            let s = split_slot_count;
            split_slot_count += 1;
            s
        } else {
            let s = slot_count;
            slot_count += 1;
            s
        };
        entries.push(FieldEntry {
            number: f.number,
            type_card: TypeCard {
                kind: f.kind,
                card: f.card,
                packed: f.packed,
                utf8: f.utf8,
                split: f.split,
            },
            presence,
            slot,
            aux: aux_idx,
        });
    }

    let (head_bits, runs, run_words) = build_skipmap(&entries);
    let fast = build_fast(&entries);

    MiniTable {
        name: schema.name.into_boxed_str(),
        fields: entries.into_boxed_slice(),
        head_bits,
        runs,
        run_words,
        fast,
        aux: aux.into_boxed_slice(),
        slot_count,
        split_slot_count,
        hasbit_count,
        oneof_count,
    }
}

fn validate_field(f: &FieldSchema) {
    assert!(
        f.number >= 1 && f.number <= MAX_FIELD_NUMBER,
        "field number {} out of range",
        f.number
    );
    assert!(
        !f.packed || f.kind.packable(),
        "field {} cannot use the packed encoding",
        f.number
    );
    if f.oneof.is_some() {
        assert!(
            f.card == Cardinality::Singular,
            "oneof member {} must be singular",
            f.number
        );
    }
    if let Some(map) = &f.map {
        assert!(
            matches!(
                map.key,
                FieldKind::Bool
                    | FieldKind::Int32
                    | FieldKind::SInt32
                    | FieldKind::UInt32
                    | FieldKind::Int64
                    | FieldKind::SInt64
                    | FieldKind::UInt64
                    | FieldKind::Fixed32
                    | FieldKind::SFixed32
                    | FieldKind::Fixed64
                    | FieldKind::SFixed64
                    | FieldKind::String
            ),
            "invalid map key kind for field {}",
            f.number
        );
        assert!(
            f.oneof.is_none(),
            "map field {} cannot be a oneof member",
            f.number
        );
    }
    if matches!(f.kind, FieldKind::Message | FieldKind::Group) && f.map.is_none() {
        assert!(
            f.message.is_some(),
            "message field {} is missing its table handle",
            f.number
        );
    }
}

fn build_aux(f: &FieldSchema) -> Option<AuxData> {
    if let Some(map) = &f.map {
        let value_aux = match (&map.value_message, &map.value_enum) {
            (Some(handle), None) => Some(Box::new(AuxData::Message(*handle))),
            (None, Some(values)) => Some(Box::new(AuxData::Enum(values.build()))),
            (None, None) => None,
            (Some(_), Some(_)) => unreachable!(),
        };
        return Some(AuxData::Map(MapAux {
            key_kind: map.key,
            key_utf8: if map.key == FieldKind::String {
                Utf8Mode::Strict
            } else {
                Utf8Mode::None
            },
            value_kind: map.value,
            value_utf8: if map.value == FieldKind::String {
                Utf8Mode::Strict
            } else {
                Utf8Mode::None
            },
            value_aux,
        }));
    }
    match f.kind {
        FieldKind::Message | FieldKind::Group => Some(AuxData::Message(f.message.unwrap())),
        FieldKind::Enum => Some(AuxData::Enum(
            f.enumeration.as_ref().expect("enum field without values").build(),
        )),
        _ => None,
    }
}

/// Build the presence structures: an inline bitmap for fields 1..=32 and
/// bitmap runs for everything above, merging fields into one run until the
/// gap between numbers exceeds `RUN_GAP`.
fn build_skipmap(entries: &[FieldEntry]) -> (u32, Box<[SkipRun]>, Box<[u16]>) {
    let mut head_bits = 0u32;
    let mut runs: Vec<SkipRun> = Vec::new();
    let mut words: SmallVec<[u16; 16]> = SmallVec::new();
    let mut prev_number = 0u32;

    for (i, e) in entries.iter().enumerate() {
        if e.number <= 32 {
            head_bits |= 1 << (e.number - 1);
            continue;
        }
        let start_new = match runs.last() {
            None => true,
            Some(_) => e.number - prev_number > RUN_GAP,
        };
        if start_new {
            runs.push(SkipRun {
                first: e.number,
                word_start: words.len() as u32,
                word_count: 0,
                field_index: i as u32,
            });
        }
        let run = runs.last_mut().unwrap();
        let offset = e.number - run.first;
        let word = offset / 16;
        while run.word_count <= word {
            words.push(0);
            run.word_count += 1;
        }
        words[(run.word_start + word) as usize] |= 1 << (offset % 16);
        prev_number = e.number;
    }

    (
        head_bits,
        runs.into_boxed_slice(),
        words.into_vec().into_boxed_slice(),
    )
}

/// Pick a fast-dispatch array size and populate it.
///
/// Candidate sizes are powers of two up to 32 slots, capped at the next
/// power of two above the eligible field count. Colliding candidates are
/// resolved by weight, with low field numbers preferred; the chosen size is
/// the smallest one reaching the best total weight.
fn build_fast(entries: &[FieldEntry]) -> Box<[FastSlot]> {
    struct Cand {
        precoded: u16,
        field: u16,
        weight: u8,
    }

    let mut cands: SmallVec<[Cand; 32]> = SmallVec::new();
    for (i, e) in entries.iter().enumerate() {
        // Groups need end-tag bookkeeping and maps parse a synthetic entry
        // message; both always take the mini-parse path. Split fields stay
        // slow so the fast path never touches the split block.
        if e.type_card.split
            || e.type_card.card == Cardinality::Map
            || e.type_card.kind == FieldKind::Group
        {
            continue;
        }
        let wt = if e.type_card.card == Cardinality::Repeated && e.type_card.packed {
            WireType::Len
        } else {
            e.type_card.kind.wire_type()
        };
        let Some(precoded) = wire::precode_tag(wire::tag(e.number, wt)) else {
            continue;
        };
        let weight = if e.number <= 16 { 2 } else { 1 };
        cands.push(Cand {
            precoded,
            field: i as u16,
            weight,
        });
    }
    if cands.is_empty() {
        return Box::new([]);
    }

    let cap_log2 = (cands.len() as u32)
        .next_power_of_two()
        .trailing_zeros()
        .min(MAX_FAST_LOG2);
    let slot_of = |precoded: u16, size: usize| ((precoded as u8 >> 3) as usize) & (size - 1);

    let mut best_log2 = 0;
    let mut best_score = 0u32;
    for log2 in 0..=cap_log2 {
        let size = 1usize << log2;
        let mut slot_best = [0u8; 32];
        for c in &cands {
            let idx = slot_of(c.precoded, size);
            slot_best[idx] = slot_best[idx].max(c.weight);
        }
        let score: u32 = slot_best[..size].iter().map(|&w| w as u32).sum();
        if score > best_score {
            best_score = score;
            best_log2 = log2;
        }
    }

    let size = 1usize << best_log2;
    let mut fast = vec![FastSlot::Miss; size];
    // Entries are number-sorted, so a stable sort by descending weight keeps
    // the low-number preference within equal weights.
    cands.sort_by(|a, b| b.weight.cmp(&a.weight));
    for c in &cands {
        let idx = slot_of(c.precoded, size);
        if fast[idx] == FastSlot::Miss {
            fast[idx] = FastSlot::Field {
                tag: c.precoded,
                field: c.field,
            };
        }
    }
    fast.into_boxed_slice()
}

#[cfg(test)]
#[path = "./tables_tests.rs"]
mod tests;
