use super::*;
use crate::arena::Arena;

#[test]
fn empty_input() {
    let mut input = Input::new(&[]);
    assert!(!input.has_more());
    assert_eq!(input.read_byte(), None);
    assert_eq!(input.offset(), 0);
}

#[test]
fn reads_across_chunks() {
    let chunks: [&[u8]; 3] = [b"ab", b"", b"cd"];
    let mut input = Input::new(&chunks);
    let mut out = Vec::new();
    while let Some(b) = input.read_byte() {
        out.push(b);
    }
    assert_eq!(out, b"abcd");
    assert_eq!(input.offset(), 4);
}

#[test]
fn offset_is_absolute_across_chunks() {
    let chunks: [&[u8]; 2] = [b"abc", b"def"];
    let mut input = Input::new(&chunks);
    input.skip(4);
    assert_eq!(input.offset(), 4);
}

#[test]
fn peek_does_not_advance() {
    let chunks: [&[u8]; 1] = [b"xy"];
    let mut input = Input::new(&chunks);
    assert_eq!(input.peek_byte(), Some(b'x'));
    assert_eq!(input.peek_byte(), Some(b'x'));
    assert_eq!(input.read_byte(), Some(b'x'));
}

#[test]
fn peek_second_crosses_chunk_boundary() {
    let chunks: [&[u8]; 3] = [b"a", b"", b"b"];
    let mut input = Input::new(&chunks);
    assert_eq!(input.peek_byte(), Some(b'a'));
    assert_eq!(input.peek_second(), Some(b'b'));
    assert_eq!(input.offset(), 0);
}

#[test]
fn skip_past_end_reports_failure() {
    let chunks: [&[u8]; 2] = [b"ab", b"c"];
    let mut input = Input::new(&chunks);
    assert!(input.skip(3));
    assert!(!input.skip(1));
    let mut input = Input::new(&chunks);
    assert!(!input.skip(10));
}

#[test]
fn varint_within_chunk() {
    let chunks: [&[u8]; 1] = [&[0xAC, 0x02, 0x07]];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_varint(), Ok(300));
    assert_eq!(input.read_varint(), Ok(7));
}

#[test]
fn varint_across_chunk_boundary() {
    let chunks: [&[u8]; 2] = [&[0xAC], &[0x02]];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_varint(), Ok(300));
}

#[test]
fn varint_truncated() {
    let chunks: [&[u8]; 1] = [&[0x80]];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_varint(), Err(VarintError::Truncated));
}

#[test]
fn varint_overflow() {
    let bytes = [0x80u8; 11];
    let chunks: [&[u8]; 1] = [&bytes];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_varint(), Err(VarintError::Overflow));

    // Same bytes, one per chunk, exercises the slow path.
    let split: Vec<&[u8]> = bytes.chunks(1).collect();
    let mut input = Input::new(&split);
    assert_eq!(input.read_varint(), Err(VarintError::Overflow));
}

#[test]
fn fixed_reads() {
    let chunks: [&[u8]; 1] = [&[1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_fixed32(), Some(1));
    assert_eq!(input.read_fixed64(), Some(2));
    assert_eq!(input.read_fixed32(), None);

    // Split one byte per chunk to cover the slow path.
    let bytes = 0x0807_0605_0403_0201u64.to_le_bytes();
    let split: Vec<&[u8]> = bytes.chunks(1).collect();
    let mut input = Input::new(&split);
    assert_eq!(input.read_fixed64(), Some(0x0807_0605_0403_0201));
}

#[test]
fn take_chunk_and_remaining() {
    let chunks: [&[u8]; 2] = [b"abc", b"de"];
    let mut input = Input::new(&chunks);
    assert_eq!(input.remaining(), 5);
    assert_eq!(input.take_chunk(2), Some(b"ab".as_slice()));
    assert_eq!(input.take_chunk(10), Some(b"c".as_slice()));
    assert_eq!(input.take_chunk(10), Some(b"de".as_slice()));
    assert_eq!(input.take_chunk(10), None);
    assert_eq!(input.remaining(), 0);
}

#[test]
fn base_offset_applies() {
    let chunks: [&[u8]; 1] = [b"xy"];
    let mut input = Input::new_at(&chunks, 100);
    assert_eq!(input.offset(), 100);
    input.read_byte();
    assert_eq!(input.offset(), 101);
}

#[test]
fn span_within_chunk_is_borrowed() {
    let arena = Arena::new();
    let data = b"hello world";
    let chunks: [&[u8]; 1] = [data];
    let mut input = Input::new(&chunks);
    let span = input.read_span(5, &arena).unwrap();
    assert_eq!(span, b"hello");
    // Zero-copy: the span points into the original buffer.
    assert_eq!(span.as_ptr(), data.as_ptr());
}

#[test]
fn span_across_chunks_is_copied() {
    let arena = Arena::new();
    let chunks: [&[u8]; 3] = [b"he", b"llo wo", b"rld"];
    let mut input = Input::new(&chunks);
    let span = input.read_span(11, &arena).unwrap();
    assert_eq!(span, b"hello world");
    assert_eq!(input.offset(), 11);
}

#[test]
fn span_truncated() {
    let arena = Arena::new();
    let chunks: [&[u8]; 2] = [b"ab", b"cd"];
    let mut input = Input::new(&chunks);
    assert_eq!(input.read_span(5, &arena), None);
}
