use super::*;

#[test]
fn wire_type_from_bits_covers_all_values() {
    for v in 0u8..=255 {
        match (v, WireType::from_bits(v)) {
            (0, Some(WireType::Varint))
            | (1, Some(WireType::Fixed64))
            | (2, Some(WireType::Len))
            | (3, Some(WireType::StartGroup))
            | (4, Some(WireType::EndGroup))
            | (5, Some(WireType::Fixed32)) => {}
            (6.., None) => {}
            other => panic!("unexpected mapping {other:?}"),
        }
    }
}

#[test]
fn tag_layout() {
    assert_eq!(tag(1, WireType::Varint), 0x08);
    assert_eq!(tag(1, WireType::Len), 0x0A);
    assert_eq!(tag(2, WireType::Fixed32), 0x15);
    assert_eq!(tag(16, WireType::Varint), 0x80);
}

#[test]
fn varint_roundtrip() {
    for v in [
        0u64,
        1,
        127,
        128,
        300,
        16383,
        16384,
        u32::MAX as u64,
        u64::MAX - 1,
        u64::MAX,
    ] {
        let (buf, len) = encode_varint(v);
        let (decoded, consumed) = decode_varint(&buf[..len]).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, len);
    }
}

#[test]
fn varint_single_byte_boundary() {
    assert_eq!(encode_varint(127).1, 1);
    assert_eq!(encode_varint(128).1, 2);
    assert_eq!(encode_varint(u64::MAX).1, 10);
}

#[test]
fn varint_truncated() {
    assert_eq!(decode_varint(&[]), None);
    assert_eq!(decode_varint(&[0x80]), None);
    assert_eq!(decode_varint(&[0xFF, 0xFF]), None);
}

#[test]
fn varint_eleven_byte_rejected() {
    // Ten continuation bytes followed by a terminator: one byte too many.
    let bytes = [0x80u8; 11];
    assert_eq!(decode_varint(&bytes), None);
    let mut bytes = [0x80u8; 11];
    bytes[10] = 0x01;
    assert_eq!(decode_varint(&bytes), None);
}

#[test]
fn varint_non_canonical_accepted() {
    // 1 encoded with a redundant continuation byte still decodes to 1.
    let (v, n) = decode_varint(&[0x81, 0x00]).unwrap();
    assert_eq!((v, n), (1, 2));
}

#[test]
fn zigzag_roundtrip() {
    for v in [0i32, -1, 1, -2, 2, i32::MIN, i32::MAX] {
        assert_eq!(zigzag_decode32(zigzag_encode32(v)), v);
    }
    for v in [0i64, -1, 1, i64::MIN, i64::MAX] {
        assert_eq!(zigzag_decode64(zigzag_encode64(v)), v);
    }
    // Known encodings from the wire-format documentation.
    assert_eq!(zigzag_encode32(0), 0);
    assert_eq!(zigzag_encode32(-1), 1);
    assert_eq!(zigzag_encode32(1), 2);
    assert_eq!(zigzag_encode32(-2), 3);
}

#[test]
fn precode_roundtrip() {
    for field in [1u32, 2, 15, 16, 100, 2047] {
        for wt in [WireType::Varint, WireType::Len, WireType::Fixed64] {
            let t = tag(field, wt);
            let coded = precode_tag(t).unwrap();
            assert_eq!(decode_precoded_tag(coded), t);
            // The precoded form is the literal first (and second) wire bytes.
            let (buf, len) = encode_varint(t as u64);
            assert_eq!(coded as u8, buf[0]);
            if len == 2 {
                assert_eq!((coded >> 8) as u8, buf[1]);
            } else {
                assert_eq!(coded >> 8, 0);
            }
        }
    }
}

#[test]
fn precode_rejects_large_tags() {
    assert_eq!(precode_tag(tag(2048, WireType::Varint)), None);
    assert_eq!(precode_tag(tag(MAX_FIELD_NUMBER, WireType::Len)), None);
}
