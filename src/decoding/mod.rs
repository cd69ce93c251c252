//! The uniform reader surface and its two encodings.

pub mod binary;
pub mod text;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::cell::{Int32Ref, Int64ArrayRef, Int64Ref};
use crate::encoding::{FieldOut, ValueOut};
use crate::error::WireResult;
use crate::value::Value;

pub use binary::BinaryIn;
pub use text::TextIn;

/// How a field was identified in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKey {
    /// Identified by name.
    Name(String),
    /// Identified by numeric id.
    Id(u64),
    /// Field-less stream: identified by position.
    Position(usize),
}

impl FieldKey {
    /// The name, when the key carries one.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            FieldKey::Name(name) => Some(name),
            _ => None,
        }
    }

    /// The ordinal for id- or position-keyed fields.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            FieldKey::Id(id) => usize::try_from(*id).ok(),
            FieldKey::Position(at) => Some(*at),
            FieldKey::Name(_) => None,
        }
    }
}

/// The uniform value reader, dual of [`ValueOut`].
///
/// Integer pullers validate range and fail with `range-violation` when
/// the stored value does not fit the requested width, leaving the cursor
/// unchanged. Composite pulls clip a read limit to the measured length
/// of the composite, so an over-read surfaces as `truncation` instead of
/// running into a sibling value.
pub trait ValueIn {
    /// Pulls a boolean.
    fn read_bool(&mut self) -> WireResult<bool>;
    /// Pulls an `i8`.
    fn read_i8(&mut self) -> WireResult<i8>;
    /// Pulls a `u8`.
    fn read_u8(&mut self) -> WireResult<u8>;
    /// Pulls an `i16`.
    fn read_i16(&mut self) -> WireResult<i16>;
    /// Pulls a `u16`.
    fn read_u16(&mut self) -> WireResult<u16>;
    /// Pulls an `i32`.
    fn read_i32(&mut self) -> WireResult<i32>;
    /// Pulls a `u32`.
    fn read_u32(&mut self) -> WireResult<u32>;
    /// Pulls an `i64`.
    fn read_i64(&mut self) -> WireResult<i64>;
    /// Pulls a `u64`.
    fn read_u64(&mut self) -> WireResult<u64>;
    /// Pulls an `f32`.
    fn read_f32(&mut self) -> WireResult<f32>;
    /// Pulls an `f64`; integer forms widen losslessly.
    fn read_f64(&mut self) -> WireResult<f64>;
    /// Pulls text.
    fn read_text(&mut self) -> WireResult<String>;
    /// Pulls an opaque byte sequence.
    fn read_bytes(&mut self) -> WireResult<Vec<u8>>;
    /// Pulls a wall-clock time.
    fn read_time(&mut self) -> WireResult<NaiveTime>;
    /// Pulls a calendar date.
    fn read_date(&mut self) -> WireResult<NaiveDate>;
    /// Pulls a date and time without a zone.
    fn read_date_time(&mut self) -> WireResult<NaiveDateTime>;
    /// Pulls a date and time with a fixed UTC offset.
    fn read_zoned_date_time(&mut self) -> WireResult<DateTime<FixedOffset>>;
    /// Pulls a UUID.
    fn read_uuid(&mut self) -> WireResult<Uuid>;
    /// Pulls a type literal.
    fn read_type_literal(&mut self) -> WireResult<String>;

    /// Consumes and returns the type prefix of the next value, when one
    /// is present.
    fn read_type_prefix(&mut self) -> WireResult<Option<String>>;

    /// Tests the next value for null, consuming the sentinel when found.
    fn is_null(&mut self) -> WireResult<bool>;

    /// Measures the byte span the next value occupies without advancing
    /// the cursor.
    fn read_length(&mut self) -> WireResult<usize>;

    /// Skips the next value.
    fn skip_value(&mut self) -> WireResult<()>;

    /// Inside a sequence: true while items remain before the
    /// terminator.
    fn has_next(&mut self) -> WireResult<bool>;

    /// Pulls a sequence; `body` consumes items, using [`has_next`] as
    /// its predicate.
    ///
    /// [`has_next`]: ValueIn::has_next
    fn read_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueIn) -> WireResult<()>,
    ) -> WireResult<()>;

    /// Pulls a record; `body` consumes inner fields under a read limit
    /// clipped to the record's measured length.
    fn read_record(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldIn) -> WireResult<()>,
    ) -> WireResult<()>;

    /// Pulls whatever value comes next, routing through the strategy
    /// table for typed and structural forms.
    fn read_value(&mut self) -> WireResult<Value>;

    /// Pulls a compressed sub-blob and inflates it through the named
    /// codec.
    fn read_compressed(&mut self) -> WireResult<Vec<u8>>;

    /// Binds to a 32-bit reference slot, returning its handle and
    /// advancing past it.
    fn read_i32_ref(&mut self) -> WireResult<Int32Ref>;

    /// Binds to a 64-bit reference slot.
    fn read_i64_ref(&mut self) -> WireResult<Int64Ref>;

    /// Binds to an array of 64-bit reference slots.
    fn read_i64_array_ref(&mut self) -> WireResult<Int64ArrayRef>;
}

/// The named-field surface of a reader.
pub trait FieldIn {
    /// Advances to the next field and returns its key, or `None` at the
    /// end of the enclosing scope.
    fn next_field(&mut self) -> WireResult<Option<FieldKey>>;

    /// Positions the value cursor on the named field, searching past
    /// intervening fields (which are saved for later match) and through
    /// previously saved ones. Returns `None` when the field is absent
    /// from the scope.
    fn read_field(&mut self, name: &str) -> WireResult<Option<&mut dyn ValueIn>>;

    /// The value reader positioned after [`next_field`].
    ///
    /// [`next_field`]: FieldIn::next_field
    fn value(&mut self) -> &mut dyn ValueIn;

    /// True while fields remain in the enclosing scope.
    fn has_more_fields(&mut self) -> WireResult<bool>;
}

/// Copies the next value from one wire to another, preserving scalar
/// semantics while adopting the destination's layout.
pub fn copy_value(src: &mut dyn ValueIn, dst: &mut dyn ValueOut) -> WireResult<()> {
    let value = src.read_value()?;
    dst.write_value(&value)
}

/// Copies every remaining field of a document payload across encodings.
pub fn copy_fields(src: &mut dyn FieldIn, dst: &mut dyn FieldOut) -> WireResult<()> {
    while let Some(key) = src.next_field()? {
        let out = match &key {
            FieldKey::Name(name) => dst.field(name)?,
            FieldKey::Id(id) => dst.field_id(*id, "")?,
            FieldKey::Position(_) => dst.field("")?,
        };
        copy_value(src.value(), out)?;
    }
    Ok(())
}
