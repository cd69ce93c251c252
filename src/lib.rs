//! A multi-format wire serialization engine.
//!
//! Structured values are rendered to, and reconstructed from, byte
//! buffers in two interoperable encodings: a human-readable YAML-like
//! text dialect and a compact self-describing binary form. Records are
//! framed as size-prefixed documents so many independent records can
//! share one buffer, and independent writers can share a buffer through
//! a compare-and-swap header protocol.
//!
//! The writer surface is [`ValueOut`]/[`FieldOut`], the reader surface
//! is [`ValueIn`]/[`FieldIn`]; both are implemented by every encoding.
//! [`WireConfig`] builds a configured [`Wire`] over any [`WireBuffer`].
//! Typed records go through the [`record`] marshaller and its
//! [`wire_record!`] macro; dynamically-typed values use [`Value`] and
//! the strategy table.

#![deny(missing_docs)]

pub mod buffer;
pub mod cell;
pub mod common;
pub mod compression;
pub mod decoding;
pub mod dump;
pub mod encoding;
pub mod error;
pub mod framing;
pub mod record;
pub mod value;
pub mod wire;

pub use buffer::{ElasticBuffer, SharedBuffer, WireBuffer};
pub use cell::{Int32Ref, Int64ArrayRef, Int64Ref};
pub use compression::CompressionCodec;
pub use decoding::{BinaryIn, FieldIn, FieldKey, TextIn, ValueIn, copy_fields, copy_value};
pub use dump::documents_to_text;
pub use encoding::text::TextDialect;
pub use encoding::{BinaryOut, FieldOut, TextOut, ValueOut};
pub use error::{WireError, WireResult};
pub use framing::DocumentsIn;
pub use record::{Descriptor, FieldAccessor, WireField, WireRecord, deep_copy, records_equal};
pub use value::Value;
pub use wire::{DocumentIn, Wire, WireConfig, WireOptions};
