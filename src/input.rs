//! Chunked zero-copy input cursor.
//!
//! The parser never assumes the whole message sits in one contiguous buffer:
//! input arrives as a sequence of byte chunks. Spans that lie inside the
//! current chunk are borrowed directly (zero-copy); spans straddling a chunk
//! boundary are committed into the arena. All positions are absolute byte
//! offsets, which is what message/group limits are tracked in.

use crate::arena::Arena;

/// Why a varint could not be read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum VarintError {
    /// Input ended while a continuation bit was set.
    Truncated,
    /// Continuation bits past the 10-byte maximum.
    Overflow,
}

/// Cursor over a sequence of input chunks.
///
/// `'a` is the lifetime of the chunk data (and of any borrowed span the
/// cursor hands out); `'c` is the shorter lifetime of the chunk list itself.
pub struct Input<'c, 'a> {
    cur: &'a [u8],
    pos: usize,
    rest: &'c [&'a [u8]],
    /// Absolute offset of `cur[0]` within the whole stream.
    base: u64,
}

impl<'c, 'a> Input<'c, 'a> {
    pub fn new(chunks: &'c [&'a [u8]]) -> Self {
        Self::new_at(chunks, 0)
    }

    /// A cursor whose first byte sits at absolute offset `base`, for
    /// re-parsing a span captured from a larger stream with faithful error
    /// offsets.
    pub(crate) fn new_at(chunks: &'c [&'a [u8]], base: u64) -> Self {
        let (cur, rest) = match chunks.split_first() {
            Some((first, rest)) => (*first, rest),
            None => (&[][..], &[][..]),
        };
        Input {
            cur,
            pos: 0,
            rest,
            base,
        }
    }

    /// Absolute offset of the next unread byte.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Move to the next non-empty chunk if the current one is exhausted.
    #[inline]
    fn refill(&mut self) {
        while self.pos == self.cur.len() {
            let Some((next, rest)) = self.rest.split_first() else {
                return;
            };
            self.base += self.cur.len() as u64;
            self.cur = next;
            self.pos = 0;
            self.rest = rest;
        }
    }

    /// Returns `true` if at least one more byte can be read.
    #[inline]
    pub fn has_more(&mut self) -> bool {
        self.refill();
        self.pos < self.cur.len()
    }

    #[inline]
    pub(crate) fn peek_byte(&mut self) -> Option<u8> {
        self.refill();
        self.cur.get(self.pos).copied()
    }

    /// Peek one byte past the next one, crossing a chunk boundary if needed.
    #[inline]
    pub(crate) fn peek_second(&mut self) -> Option<u8> {
        self.refill();
        if let Some(&b) = self.cur.get(self.pos + 1) {
            return Some(b);
        }
        for chunk in self.rest {
            if let Some(&b) = chunk.first() {
                return Some(b);
            }
        }
        None
    }

    #[inline]
    pub(crate) fn read_byte(&mut self) -> Option<u8> {
        self.refill();
        let b = self.cur.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    /// Consume `n` bytes, crossing chunk boundaries. Returns `false` (with
    /// the cursor at end of input) if fewer than `n` bytes remain.
    pub(crate) fn skip(&mut self, mut n: usize) -> bool {
        loop {
            self.refill();
            let avail = self.cur.len() - self.pos;
            if n <= avail {
                self.pos += n;
                return true;
            }
            if self.rest.is_empty() {
                self.pos = self.cur.len();
                return false;
            }
            self.pos = self.cur.len();
            n -= avail;
        }
    }

    /// Read a varint, with a slice fast path when the current chunk holds
    /// enough bytes to decode without boundary checks per byte.
    pub(crate) fn read_varint(&mut self) -> Result<u64, VarintError> {
        self.refill();
        let chunk = &self.cur[self.pos..];
        if let Some(&b) = chunk.first() {
            if b < 0x80 {
                self.pos += 1;
                return Ok(b as u64);
            }
            if chunk.len() >= crate::wire::MAX_VARINT_BYTES {
                return match crate::wire::decode_varint(chunk) {
                    Some((value, len)) => {
                        self.pos += len;
                        Ok(value)
                    }
                    None => Err(VarintError::Overflow),
                };
            }
        }
        self.read_varint_slow()
    }

    #[cold]
    fn read_varint_slow(&mut self) -> Result<u64, VarintError> {
        let mut value = 0u64;
        for i in 0..crate::wire::MAX_VARINT_BYTES {
            let Some(b) = self.read_byte() else {
                return Err(VarintError::Truncated);
            };
            value |= ((b & 0x7F) as u64) << (7 * i);
            if b < 0x80 {
                return Ok(value);
            }
        }
        Err(VarintError::Overflow)
    }

    /// Total unread bytes across every remaining chunk.
    pub(crate) fn remaining(&self) -> usize {
        self.cur.len() - self.pos + self.rest.iter().map(|c| c.len()).sum::<usize>()
    }

    /// Take up to `max` bytes from the current chunk as a borrowed slice.
    /// Returns `None` at end of input; never returns an empty slice.
    pub(crate) fn take_chunk(&mut self, max: usize) -> Option<&'a [u8]> {
        self.refill();
        if self.pos == self.cur.len() || max == 0 {
            return None;
        }
        let take = max.min(self.cur.len() - self.pos);
        let slice = &self.cur[self.pos..self.pos + take];
        self.pos += take;
        Some(slice)
    }

    /// Read a little-endian u32. `None` means the input ended early.
    pub(crate) fn read_fixed32(&mut self) -> Option<u32> {
        self.refill();
        if self.cur.len() - self.pos >= 4 {
            let bytes: [u8; 4] = self.cur[self.pos..self.pos + 4].try_into().unwrap();
            self.pos += 4;
            return Some(u32::from_le_bytes(bytes));
        }
        let mut value = 0u32;
        for i in 0..4 {
            value |= (self.read_byte()? as u32) << (8 * i);
        }
        Some(value)
    }

    /// Read a little-endian u64. `None` means the input ended early.
    pub(crate) fn read_fixed64(&mut self) -> Option<u64> {
        self.refill();
        if self.cur.len() - self.pos >= 8 {
            let bytes: [u8; 8] = self.cur[self.pos..self.pos + 8].try_into().unwrap();
            self.pos += 8;
            return Some(u64::from_le_bytes(bytes));
        }
        let mut value = 0u64;
        for i in 0..8 {
            value |= (self.read_byte()? as u64) << (8 * i);
        }
        Some(value)
    }

    /// Read exactly `n` bytes as a contiguous span: borrowed from the current
    /// chunk when possible, otherwise copied into the arena. `None` means the
    /// input ended early.
    pub(crate) fn read_span(&mut self, n: usize, arena: &'a Arena) -> Option<&'a [u8]> {
        self.refill();
        if n <= self.cur.len() - self.pos {
            let span = &self.cur[self.pos..self.pos + n];
            self.pos += n;
            return Some(span);
        }
        self.read_span_spliced(n, arena)
    }

    #[cold]
    fn read_span_spliced(&mut self, n: usize, arena: &'a Arena) -> Option<&'a [u8]> {
        // Bounded by the bytes actually present: count first so a corrupt
        // declared length cannot trigger a huge allocation.
        let mut available = self.cur.len() - self.pos;
        for chunk in self.rest {
            if available >= n {
                break;
            }
            available += chunk.len();
        }
        if available < n {
            self.skip(n);
            return None;
        }

        let dst = arena.alloc_array::<u8>(n);
        let mut filled = 0;
        while filled < n {
            self.refill();
            let take = (n - filled).min(self.cur.len() - self.pos);
            // Safety: dst has room for n bytes; take bytes are in bounds of
            // the current chunk.
            #[allow(unsafe_code)]
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.cur.as_ptr().add(self.pos),
                    dst.as_ptr().add(filled),
                    take,
                );
            }
            self.pos += take;
            filled += take;
        }
        // Safety: all n bytes were just written.
        #[allow(unsafe_code)]
        Some(unsafe { std::slice::from_raw_parts(dst.as_ptr(), n) })
    }
}

#[cfg(test)]
#[path = "./input_tests.rs"]
mod tests;
