use std::fmt::{self, Debug, Display};

/// Error produced when decoding wire-format input fails.
///
/// Only genuinely malformed input is an error: truncation, varints past the
/// 10-byte cap, unmatched group tags, depth overflow and strict-mode UTF-8
/// violations. Unknown field numbers, wire-type mismatches and out-of-range
/// closed-enum values are *not* errors; they are preserved in the target
/// message's unknown-field set.
///
/// A failed parse leaves the target message partially populated; callers
/// must discard it.
#[derive(Debug, Clone)]
pub struct Error {
    /// The error kind.
    pub kind: DecodeErrorKind,
    /// Absolute byte offset in the input stream where decoding stopped.
    pub offset: u64,
}

impl std::error::Error for Error {}

impl From<(DecodeErrorKind, u64)> for Error {
    fn from((kind, offset): (DecodeErrorKind, u64)) -> Self {
        Self { kind, offset }
    }
}

/// The ways wire-format input can be malformed.
#[derive(Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Input ended in the middle of a field, or before a declared
    /// length-delimited payload was complete.
    Truncated,

    /// A varint had continuation bits past the tenth byte.
    VarintOverflow,

    /// A tag carried a reserved wire type (6 or 7).
    InvalidWireType(u8),

    /// A tag carried field number zero.
    FieldNumberZero,

    /// An end-group tag appeared with no matching open group.
    UnmatchedEndGroup,

    /// A group was still open when its enclosing region ended.
    UnterminatedGroup,

    /// A length-delimited payload claimed more bytes than its enclosing
    /// message or group has left.
    LengthOverrun,

    /// Submessage/group nesting exceeded the recursion limit.
    DepthLimitExceeded,

    /// A string field with strict UTF-8 checking received invalid bytes.
    InvalidUtf8 {
        /// Number of the offending field.
        field: u32,
    },
}

impl Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Truncated => "truncated",
            Self::VarintOverflow => "varint-overflow",
            Self::InvalidWireType(..) => "invalid-wire-type",
            Self::FieldNumberZero => "field-number-zero",
            Self::UnmatchedEndGroup => "unmatched-end-group",
            Self::UnterminatedGroup => "unterminated-group",
            Self::LengthOverrun => "length-overrun",
            Self::DepthLimitExceeded => "depth-limit-exceeded",
            Self::InvalidUtf8 { .. } => "invalid-utf8",
        };
        f.write_str(text)
    }
}

impl Debug for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DecodeErrorKind::Truncated => f.write_str("input truncated mid-field")?,
            DecodeErrorKind::VarintOverflow => {
                f.write_str("varint continues past the maximum of 10 bytes")?
            }
            DecodeErrorKind::InvalidWireType(wt) => {
                write!(f, "reserved wire type {wt}")?;
            }
            DecodeErrorKind::FieldNumberZero => f.write_str("tag with field number zero")?,
            DecodeErrorKind::UnmatchedEndGroup => {
                f.write_str("end-group tag without a matching start-group")?
            }
            DecodeErrorKind::UnterminatedGroup => {
                f.write_str("group still open at end of enclosing region")?
            }
            DecodeErrorKind::LengthOverrun => {
                f.write_str("declared length exceeds the enclosing region")?
            }
            DecodeErrorKind::DepthLimitExceeded => {
                f.write_str("message nesting exceeds the depth limit")?
            }
            DecodeErrorKind::InvalidUtf8 { field } => {
                write!(f, "invalid UTF-8 in string field {field}")?;
            }
        }
        write!(f, " (at byte {})", self.offset)
    }
}
