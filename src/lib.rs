//! A table-driven parser runtime for the protobuf wire format.
//!
//! Message schemas are built at runtime into compact [`MiniTable`]s owned by
//! a [`TableSet`]; the parser drives on those tables with a byte-level fast
//! path for small field numbers and a skipmap lookup for everything else.
//! Parsed messages live in a caller-supplied [`Arena`] and are reached
//! through copyable [`MsgPtr`] handles; string and bytes fields are
//! zero-copy, borrowing from the input buffer where they lie contiguous.
//!
//! Unknown fields, wire-type mismatches and out-of-range closed-enum values
//! are never errors: they are preserved byte-for-byte in the message's
//! unknown-field set.
//!
//! # Examples
//!
//! ```
//! use tailwire::{Arena, FieldKind, FieldSchema, MessageSchema, TableSet, Value};
//!
//! // message Point { int32 x = 1; int32 y = 2; string label = 3; }
//! let mut set = TableSet::new();
//! let point = set.add(
//!     MessageSchema::new()
//!         .field(FieldSchema::scalar(1, FieldKind::Int32))
//!         .field(FieldSchema::scalar(2, FieldKind::Int32))
//!         .field(FieldSchema::scalar(3, FieldKind::String)),
//! );
//!
//! let bytes = [
//!     0x08, 3, // x = 3
//!     0x10, 4, // y = 4
//!     0x1A, 6, b'o', b'r', b'i', b'g', b'i', b'n', // label = "origin"
//! ];
//! let arena = Arena::new();
//! let msg = tailwire::parse_slice(&set, point, &bytes, &arena)?.get();
//!
//! let table = set.table(point);
//! assert_eq!(msg.get(table, 1), Value::I32(3));
//! assert_eq!(msg.get(table, 2), Value::I32(4));
//! assert_eq!(msg.get(table, 3), Value::Bytes(b"origin".as_slice()));
//! # Ok::<(), tailwire::Error>(())
//! ```

mod arena;
mod error;
mod input;
mod map;
mod message;
mod minitable;
mod parser;
mod repeated;
mod repeated_ptr;
mod tables;
mod unknown;
pub mod wire;

pub use arena::Arena;
pub use error::{DecodeErrorKind, Error};
pub use map::{Map, MapIter, MapKey, MapValue};
pub use message::{Message, MsgPtr, Value};
pub use minitable::{Cardinality, FieldKind, MiniTable, Presence, TableHandle, Utf8Mode};
pub use parser::{parse_into, parse_message, parse_slice, DEPTH_LIMIT};
pub use tables::{EnumSchema, FieldSchema, MapSchema, MessageSchema, TableSet};
pub use unknown::UnknownFields;
