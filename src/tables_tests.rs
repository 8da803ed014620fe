use super::*;
use crate::minitable::{FastSlot, Presence};
use crate::wire::tag;

fn single_table(schema: MessageSchema) -> TableSet {
    let mut set = TableSet::new();
    set.add(schema);
    set
}

#[test]
fn find_field_head_and_run() {
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32))
            .field(FieldSchema::scalar(2, FieldKind::Int64))
            .field(FieldSchema::scalar(3, FieldKind::Bool))
            .field(FieldSchema::scalar(40, FieldKind::Fixed32)),
    );
    let table = set.table(TableHandle(0));
    for n in [1, 2, 3, 40] {
        let entry = table.find_field(n).unwrap();
        assert_eq!(entry.number, n);
    }
    for n in [0, 4, 31, 32, 33, 39, 41, 1000] {
        assert!(table.find_field(n).is_none(), "field {n} should miss");
    }
}

#[test]
fn message_names_surface_on_the_table() {
    let mut set = TableSet::new();
    let named = set.add(
        MessageSchema::new()
            .name("api.Point")
            .field(FieldSchema::scalar(1, FieldKind::Int32)),
    );
    let anon = set.add(MessageSchema::new());
    assert_eq!(set.table(named).name(), "api.Point");
    assert_eq!(set.table(anon).name(), "");
}

#[test]
fn head_bitmap_popcount_indexing() {
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(31, FieldKind::Bool))
            .field(FieldSchema::scalar(2, FieldKind::Int32))
            .field(FieldSchema::scalar(7, FieldKind::UInt64)),
    );
    let table = set.table(TableHandle(0));
    // Fields are stored number-sorted; the bitmap popcount must agree.
    assert_eq!(table.find_field(2).unwrap().number, 2);
    assert_eq!(table.find_field(7).unwrap().number, 7);
    assert_eq!(table.find_field(31).unwrap().number, 31);
    assert_eq!(table.find_field(2).unwrap().type_card.kind, FieldKind::Int32);
}

#[test]
fn skipmap_merges_close_runs() {
    // Gap of 60: one run spanning both numbers.
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(40, FieldKind::Int32))
            .field(FieldSchema::scalar(100, FieldKind::Int32)),
    );
    let table = set.table(TableHandle(0));
    assert_eq!(table.runs.len(), 1);
    assert_eq!(table.runs[0].first, 40);
    assert_eq!(table.runs[0].word_count, 4);
    assert!(table.find_field(40).is_some());
    assert!(table.find_field(100).is_some());
    assert!(table.find_field(70).is_none());
}

#[test]
fn skipmap_splits_distant_runs() {
    // Gap of 160: two runs, no words wasted on the hole.
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(40, FieldKind::Int32))
            .field(FieldSchema::scalar(200, FieldKind::Int32)),
    );
    let table = set.table(TableHandle(0));
    assert_eq!(table.runs.len(), 2);
    assert_eq!(table.runs[0].first, 40);
    assert_eq!(table.runs[1].first, 200);
    assert_eq!(table.run_words.len(), 2);
    assert!(table.find_field(200).is_some());
    assert!(table.find_field(120).is_none());
}

#[test]
fn fast_table_covers_small_fields() {
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32))
            .field(FieldSchema::scalar(2, FieldKind::UInt32))
            .field(FieldSchema::scalar(3, FieldKind::Fixed64))
            .field(FieldSchema::scalar(4, FieldKind::Bool)),
    );
    let table = set.table(TableHandle(0));
    for (i, (n, wt)) in [
        (1u32, WireType::Varint),
        (2, WireType::Varint),
        (3, WireType::Fixed64),
        (4, WireType::Varint),
    ]
    .iter()
    .enumerate()
    {
        let byte0 = tag(*n, *wt) as u8;
        match table.fast_slot(byte0) {
            FastSlot::Field { tag: coded, field } => {
                assert_eq!(coded as u8, byte0);
                assert_eq!(field as usize, i);
            }
            FastSlot::Miss => panic!("field {n} missing from fast table"),
        }
    }
}

#[test]
fn fast_table_prefers_low_field_numbers_on_collision() {
    // Field 1 and field 33 share every slot index up to 32 entries; the
    // low-numbered field must win the slot.
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32))
            .field(FieldSchema::scalar(33, FieldKind::Int32)),
    );
    let table = set.table(TableHandle(0));
    let byte0 = tag(1, WireType::Varint) as u8;
    match table.fast_slot(byte0) {
        FastSlot::Field { tag: coded, field } => {
            assert_eq!(coded, 0x08);
            assert_eq!(field, 0);
        }
        FastSlot::Miss => panic!("field 1 missing from fast table"),
    }
}

#[test]
fn packed_repeated_fast_tag_is_length_delimited() {
    let set = single_table(
        MessageSchema::new().field(FieldSchema::scalar(1, FieldKind::Int32).repeated()),
    );
    let table = set.table(TableHandle(0));
    match table.fast_slot(tag(1, WireType::Len) as u8) {
        FastSlot::Field { tag: coded, .. } => assert_eq!(coded, 0x0A),
        FastSlot::Miss => panic!("packed field missing from fast table"),
    }
}

#[test]
fn groups_and_maps_stay_off_the_fast_path() {
    let mut set = TableSet::new();
    let empty = set.add(MessageSchema::new());
    let handle = set.add(
        MessageSchema::new()
            .field(FieldSchema::group(1, empty))
            .field(FieldSchema::map(
                2,
                MapSchema::new(FieldKind::Int32, FieldKind::Int32),
            )),
    );
    let table = set.table(handle);
    assert_eq!(table.fast_slot(tag(1, WireType::StartGroup) as u8), FastSlot::Miss);
    assert_eq!(table.fast_slot(tag(2, WireType::Len) as u8), FastSlot::Miss);
}

#[test]
fn recursive_message_via_reserved_handle() {
    let mut set = TableSet::new();
    let node = set.reserve();
    set.define(
        node,
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32))
            .field(FieldSchema::message(2, node).repeated()),
    );
    let table = set.table(node);
    let child = table.find_field(2).unwrap();
    match table.aux_data(child) {
        crate::minitable::AuxData::Message(h) => assert_eq!(*h, node),
        other => panic!("unexpected aux {other:?}"),
    }
}

#[test]
fn slot_hasbit_and_oneof_accounting() {
    let set = single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32).with_presence())
            .field(FieldSchema::scalar(2, FieldKind::Int64).with_presence())
            .field(FieldSchema::scalar(3, FieldKind::String).in_oneof(0))
            .field(FieldSchema::scalar(4, FieldKind::Bytes).in_oneof(0))
            .field(FieldSchema::scalar(5, FieldKind::Bool))
            .field(FieldSchema::scalar(6, FieldKind::Double).split()),
    );
    let table = set.table(TableHandle(0));
    assert_eq!(table.slot_count, 5);
    assert_eq!(table.split_slot_count, 1);
    assert_eq!(table.hasbit_count, 2);
    assert_eq!(table.oneof_count, 1);
    assert_eq!(table.find_field(1).unwrap().presence, Presence::Hasbit(0));
    assert_eq!(table.find_field(2).unwrap().presence, Presence::Hasbit(1));
    assert_eq!(table.find_field(3).unwrap().presence, Presence::Oneof(0));
    assert_eq!(table.find_field(5).unwrap().presence, Presence::None);
    // The split field gets its own slot numbering.
    assert_eq!(table.find_field(6).unwrap().slot, 0);
}

#[test]
fn closed_enum_values() {
    let set = single_table(MessageSchema::new().field(FieldSchema::enumeration(
        1,
        EnumSchema::closed([0, 1, 2, 70, -3]),
    )));
    let table = set.table(TableHandle(0));
    let entry = table.find_field(1).unwrap();
    let crate::minitable::AuxData::Enum(values) = table.aux_data(entry) else {
        panic!("missing enum aux");
    };
    for v in [0, 1, 2, 70, -3] {
        assert!(values.contains(v), "{v} should be in range");
    }
    for v in [3, 63, 64, 71, -1, i32::MIN] {
        assert!(!values.contains(v), "{v} should be out of range");
    }
    let open = EnumSchema::open().build();
    assert!(open.contains(12345));
    assert!(open.contains(-1));
}

#[test]
#[should_panic(expected = "duplicate field number")]
fn duplicate_field_number_panics() {
    single_table(
        MessageSchema::new()
            .field(FieldSchema::scalar(1, FieldKind::Int32))
            .field(FieldSchema::scalar(1, FieldKind::Int64)),
    );
}

#[test]
#[should_panic(expected = "out of range")]
fn field_number_zero_panics() {
    single_table(MessageSchema::new().field(FieldSchema::scalar(0, FieldKind::Int32)));
}

#[test]
#[should_panic(expected = "must be singular")]
fn repeated_oneof_member_panics() {
    single_table(
        MessageSchema::new().field(FieldSchema::scalar(1, FieldKind::Int32).repeated().in_oneof(0)),
    );
}

#[test]
#[should_panic(expected = "invalid map key kind")]
fn float_map_key_panics() {
    single_table(MessageSchema::new().field(FieldSchema::map(
        1,
        MapSchema::new(FieldKind::Float, FieldKind::Int32),
    )));
}

#[test]
#[should_panic(expected = "already defined")]
fn double_define_panics() {
    let mut set = TableSet::new();
    let h = set.reserve();
    set.define(h, MessageSchema::new());
    set.define(h, MessageSchema::new());
}

#[test]
#[should_panic(expected = "never defined")]
fn undefined_table_panics() {
    let mut set = TableSet::new();
    let h = set.reserve();
    set.table(h);
}
