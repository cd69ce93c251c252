//! The uniform writer surface and its two encodings.

pub mod binary;
pub mod text;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::cell::{Int32Ref, Int64ArrayRef, Int64Ref};
use crate::error::WireResult;
use crate::value::Value;

pub use binary::BinaryOut;
pub use text::TextOut;

/// The uniform value writer.
///
/// Every encoding implements this contract; producers and the reflective
/// marshaller drive it through `&mut dyn ValueOut`. Scalar emitters are
/// total over their domains. A value written after [`type_prefix`] is
/// decoded as that typed variant; without a prefix it is untyped and
/// decoded by its structural form.
///
/// [`type_prefix`]: ValueOut::type_prefix
pub trait ValueOut {
    /// Writes a boolean.
    fn write_bool(&mut self, v: bool) -> WireResult<()>;
    /// Writes an `i8`.
    fn write_i8(&mut self, v: i8) -> WireResult<()>;
    /// Writes a `u8`.
    fn write_u8(&mut self, v: u8) -> WireResult<()>;
    /// Writes an `i16`.
    fn write_i16(&mut self, v: i16) -> WireResult<()>;
    /// Writes a `u16`.
    fn write_u16(&mut self, v: u16) -> WireResult<()>;
    /// Writes an `i32`.
    fn write_i32(&mut self, v: i32) -> WireResult<()>;
    /// Writes a `u32`.
    fn write_u32(&mut self, v: u32) -> WireResult<()>;
    /// Writes an `i64`.
    fn write_i64(&mut self, v: i64) -> WireResult<()>;
    /// Writes a `u64`.
    fn write_u64(&mut self, v: u64) -> WireResult<()>;
    /// Writes an `f32`.
    fn write_f32(&mut self, v: f32) -> WireResult<()>;
    /// Writes an `f64`.
    fn write_f64(&mut self, v: f64) -> WireResult<()>;
    /// Writes UTF-8 text.
    fn write_text(&mut self, v: &str) -> WireResult<()>;
    /// Writes an opaque byte sequence.
    fn write_bytes(&mut self, v: &[u8]) -> WireResult<()>;
    /// Writes a byte sequence that came from a byte-array-typed field,
    /// which carries an extra array tag in the text encoding.
    fn write_byte_array(&mut self, v: &[u8]) -> WireResult<()>;
    /// Writes a wall-clock time.
    fn write_time(&mut self, v: NaiveTime) -> WireResult<()>;
    /// Writes a calendar date.
    fn write_date(&mut self, v: NaiveDate) -> WireResult<()>;
    /// Writes a date and time without a zone.
    fn write_date_time(&mut self, v: NaiveDateTime) -> WireResult<()>;
    /// Writes a date and time with a fixed UTC offset.
    fn write_zoned_date_time(&mut self, v: &DateTime<FixedOffset>) -> WireResult<()>;
    /// Writes a UUID.
    fn write_uuid(&mut self, v: Uuid) -> WireResult<()>;
    /// Writes a reference to a type by name.
    fn write_type_literal(&mut self, name: &str) -> WireResult<()>;
    /// Writes the null sentinel.
    fn write_null(&mut self) -> WireResult<()>;

    /// Attaches a type tag to the next value.
    fn type_prefix(&mut self, tag: &str) -> WireResult<&mut dyn ValueOut>;

    /// Asks the encoding to inline the next composite on a single line
    /// when practical.
    fn leaf(&mut self) -> &mut dyn ValueOut;

    /// Writes an ordered sequence; `body` emits the items.
    fn write_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueOut) -> WireResult<()>,
    ) -> WireResult<()>;

    /// Writes a named-field composite; `body` emits the fields. Nested
    /// indentation and separator state is stacked, so `body` may freely
    /// recurse.
    fn write_record(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()>;

    /// Writes an unordered map as field pairs.
    fn write_map(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()>;

    /// Polymorphic dispatch: inspects `v` and selects the narrowest
    /// emitter, falling back to the structural forms for composites.
    fn write_value(&mut self, v: &Value) -> WireResult<()>;

    /// Reserves an updatable 32-bit integer slot holding `v`.
    fn write_i32_ref(&mut self, v: i32) -> WireResult<Int32Ref>;

    /// Reserves an updatable 64-bit integer slot holding `v`.
    fn write_i64_ref(&mut self, v: i64) -> WireResult<Int64Ref>;

    /// Reserves an updatable array of 64-bit integer slots.
    fn write_i64_array_ref(&mut self, vs: &[i64]) -> WireResult<Int64ArrayRef>;

    /// Wraps `payload` in a compressed sub-blob tagged with the codec
    /// name, which must be resolvable in the compression registry.
    fn write_compressed(&mut self, codec: &str, payload: &[u8]) -> WireResult<()>;
}

/// The named-field surface of a writer.
pub trait FieldOut {
    /// Begins a field; the returned writer emits its value.
    fn field(&mut self, name: &str) -> WireResult<&mut dyn ValueOut>;

    /// Begins a field carrying a numeric id; wires configured for
    /// numeric ids emit the id instead of the name.
    fn field_id(&mut self, id: u64, name: &str) -> WireResult<&mut dyn ValueOut>;

    /// Writes a comment, invisible to readers.
    fn comment(&mut self, text: &str) -> WireResult<()>;
}
