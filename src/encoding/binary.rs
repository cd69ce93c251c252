//! Writer half of the tagged binary encoding.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FieldOut, ValueOut};
use crate::cell::{CellForm, Int32Ref, Int64ArrayRef, Int64Ref};
use crate::common::codes;
use crate::compression;
use crate::error::{WireError, WireResult};
use crate::value::Value;

/// Options shared by the binary writer and reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryOptions {
    /// Elide field-name codes entirely; fields are positional.
    #[serde(default)]
    pub field_less: bool,

    /// Emit numeric field ids instead of names.
    #[serde(default)]
    pub numeric_id: bool,

    /// Emit 8-bit text instead of UTF-8 when every char fits one byte.
    #[serde(default)]
    pub use_8bit_text: bool,
}

/// Width of the padded record-length varint; bodies are patched in
/// place once their size is known.
const RECORD_LEN_BYTES: usize = 4;
/// Largest record body the padded varint can carry.
const RECORD_LEN_MAX: usize = (1 << (7 * RECORD_LEN_BYTES)) - 1;

/// Writes the binary encoding into a growable scratch buffer.
///
/// `base` is the absolute buffer offset the payload will land at, so
/// reference cells can be alignment-padded and capture their final
/// position at write time.
#[derive(Debug)]
pub struct BinaryOut {
    out: BytesMut,
    base: usize,
    opts: BinaryOptions,
}

impl BinaryOut {
    /// Creates a writer for a payload that will start at `base`.
    pub fn new(opts: BinaryOptions, base: usize) -> Self {
        Self {
            out: BytesMut::new(),
            base,
            opts,
        }
    }

    /// The rendered payload.
    pub fn finish(self) -> Bytes {
        self.out.freeze()
    }

    fn put_string_form(&mut self, s: &str) {
        if self.opts.use_8bit_text && s.chars().all(|c| (c as u32) < 0x100) {
            self.out.put_u8(codes::STRING_8BIT);
            codes::put_varint(&mut self.out, s.chars().count() as u64);
            for c in s.chars() {
                self.out.put_u8(c as u32 as u8);
            }
            return;
        }
        let bytes = s.as_bytes();
        if bytes.len() <= codes::STR_INLINE_MAX {
            self.out.put_u8(codes::STR_BASE + bytes.len() as u8);
        } else {
            self.out.put_u8(codes::STRING_ANY);
            codes::put_varint(&mut self.out, bytes.len() as u64);
        }
        self.out.put_slice(bytes);
    }

    fn put_field_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        if bytes.len() <= codes::FIELD_INLINE_MAX {
            self.out.put_u8(codes::FIELD_BASE + bytes.len() as u8);
        } else {
            self.out.put_u8(codes::FIELD_ANY);
            codes::put_varint(&mut self.out, bytes.len() as u64);
        }
        self.out.put_slice(bytes);
    }

    /// Pads with filler bytes until the value that will follow `lead`
    /// lead bytes lands on an `align`-byte boundary.
    fn align_for(&mut self, lead: usize, align: usize) {
        while (self.base + self.out.len() + lead) % align != 0 {
            self.out.put_u8(codes::PADDING);
        }
    }

    fn put_i64_scalar(&mut self, v: i64) {
        if (0..=i64::from(codes::SMALL_INT_MAX)).contains(&v) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::INT64);
            self.out.put_i64_le(v);
        }
    }
}

impl ValueOut for BinaryOut {
    fn write_bool(&mut self, v: bool) -> WireResult<()> {
        self.out.put_u8(if v { codes::TRUE } else { codes::FALSE });
        Ok(())
    }

    fn write_i8(&mut self, v: i8) -> WireResult<()> {
        if v >= 0 {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::INT8);
            self.out.put_i8(v);
        }
        Ok(())
    }

    fn write_u8(&mut self, v: u8) -> WireResult<()> {
        if v <= codes::SMALL_INT_MAX {
            self.out.put_u8(v);
        } else {
            self.out.put_u8(codes::UINT8);
            self.out.put_u8(v);
        }
        Ok(())
    }

    fn write_i16(&mut self, v: i16) -> WireResult<()> {
        if (0..=i16::from(codes::SMALL_INT_MAX)).contains(&v) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::INT16);
            self.out.put_i16_le(v);
        }
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> WireResult<()> {
        if v <= u16::from(codes::SMALL_INT_MAX) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::UINT16);
            self.out.put_u16_le(v);
        }
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> WireResult<()> {
        if (0..=i32::from(codes::SMALL_INT_MAX)).contains(&v) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::INT32);
            self.out.put_i32_le(v);
        }
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> WireResult<()> {
        if v <= u32::from(codes::SMALL_INT_MAX) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::UINT32);
            self.out.put_u32_le(v);
        }
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> WireResult<()> {
        self.put_i64_scalar(v);
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> WireResult<()> {
        if v <= u64::from(codes::SMALL_INT_MAX) {
            self.out.put_u8(v as u8);
        } else {
            self.out.put_u8(codes::UINT64);
            self.out.put_u64_le(v);
        }
        Ok(())
    }

    fn write_f32(&mut self, v: f32) -> WireResult<()> {
        self.out.put_u8(codes::FLOAT32);
        self.out.put_f32_le(v);
        Ok(())
    }

    fn write_f64(&mut self, v: f64) -> WireResult<()> {
        self.out.put_u8(codes::FLOAT64);
        self.out.put_f64_le(v);
        Ok(())
    }

    fn write_text(&mut self, v: &str) -> WireResult<()> {
        self.put_string_form(v);
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> WireResult<()> {
        self.out.put_u8(codes::BYTES);
        codes::put_varint(&mut self.out, v.len() as u64);
        self.out.put_slice(v);
        Ok(())
    }

    fn write_byte_array(&mut self, v: &[u8]) -> WireResult<()> {
        // The array tag only matters in the text form.
        self.write_bytes(v)
    }

    fn write_time(&mut self, v: NaiveTime) -> WireResult<()> {
        self.out.put_u8(codes::TIME);
        self.put_string_form(&v.to_string());
        Ok(())
    }

    fn write_date(&mut self, v: NaiveDate) -> WireResult<()> {
        self.out.put_u8(codes::DATE);
        self.put_string_form(&v.to_string());
        Ok(())
    }

    fn write_date_time(&mut self, v: NaiveDateTime) -> WireResult<()> {
        self.out.put_u8(codes::DATE_TIME);
        self.put_string_form(&v.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
        Ok(())
    }

    fn write_zoned_date_time(&mut self, v: &DateTime<FixedOffset>) -> WireResult<()> {
        self.out.put_u8(codes::ZONED_DATE_TIME);
        self.put_string_form(&v.to_rfc3339());
        Ok(())
    }

    fn write_uuid(&mut self, v: Uuid) -> WireResult<()> {
        self.out.put_u8(codes::UUID);
        self.out.put_slice(v.as_bytes());
        Ok(())
    }

    fn write_type_literal(&mut self, name: &str) -> WireResult<()> {
        self.out.put_u8(codes::TYPE_LITERAL);
        self.put_string_form(name);
        Ok(())
    }

    fn write_null(&mut self) -> WireResult<()> {
        self.out.put_u8(codes::NULL);
        Ok(())
    }

    fn type_prefix(&mut self, tag: &str) -> WireResult<&mut dyn ValueOut> {
        self.out.put_u8(codes::TYPE_PREFIX);
        self.put_string_form(tag);
        Ok(self)
    }

    fn leaf(&mut self) -> &mut dyn ValueOut {
        // Layout hints have no binary form.
        self
    }

    fn write_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueOut) -> WireResult<()>,
    ) -> WireResult<()> {
        self.out.put_u8(codes::SEQUENCE_START);
        let result = body(self);
        self.out.put_u8(codes::SEQUENCE_END);
        result
    }

    fn write_record(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()> {
        self.out.put_u8(codes::RECORD);
        let len_at = self.out.len();
        // Padded varint, patched once the body length is known.
        self.out.put_slice(&[0x80; RECORD_LEN_BYTES]);
        let body_at = self.out.len();
        let result = body(self);
        let body_len = self.out.len() - body_at;
        if body_len > RECORD_LEN_MAX {
            return Err(WireError::PayloadTooLarge {
                length: body_len as u64,
                offset: (self.base + len_at) as u64,
            });
        }
        let mut len = body_len;
        for i in 0..RECORD_LEN_BYTES {
            let continuation = if i + 1 < RECORD_LEN_BYTES { 0x80 } else { 0 };
            self.out[len_at + i] = (len & 0x7f) as u8 | continuation;
            len >>= 7;
        }
        result
    }

    fn write_map(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()> {
        self.write_record(body)
    }

    fn write_value(&mut self, v: &Value) -> WireResult<()> {
        match v {
            Value::Null => self.write_null(),
            Value::Bool(b) => self.write_bool(*b),
            Value::I64(n) => {
                // The narrowest emitter that holds the value.
                let n = *n;
                if let Ok(v) = i8::try_from(n) {
                    self.write_i8(v)
                } else if let Ok(v) = i16::try_from(n) {
                    self.write_i16(v)
                } else if let Ok(v) = i32::try_from(n) {
                    self.write_i32(v)
                } else {
                    self.write_i64(n)
                }
            }
            Value::U64(n) => self.write_u64(*n),
            Value::F64(n) => self.write_f64(n.into_inner()),
            Value::Text(s) => self.write_text(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Time(t) => self.write_time(*t),
            Value::Date(d) => self.write_date(*d),
            Value::DateTime(dt) => self.write_date_time(*dt),
            Value::ZonedDateTime(zdt) => self.write_zoned_date_time(zdt),
            Value::Uuid(u) => self.write_uuid(*u),
            Value::TypeLiteral(name) => self.write_type_literal(name),
            Value::Sequence(items) => self.write_sequence(&mut |out| {
                for item in items {
                    out.write_value(item)?;
                }
                Ok(())
            }),
            Value::Map(map) => self.write_record(&mut |fields| {
                for (key, item) in map {
                    fields.field(key)?.write_value(item)?;
                }
                Ok(())
            }),
            Value::Typed(tag, inner) => {
                let tag = tag.clone();
                self.type_prefix(&tag)?.write_value(inner)
            }
        }
    }

    fn write_i32_ref(&mut self, v: i32) -> WireResult<Int32Ref> {
        self.align_for(1, 4);
        self.out.put_u8(codes::INT32);
        let offset = self.base + self.out.len();
        self.out.put_i32_le(v);
        Ok(Int32Ref::new(offset, CellForm::Binary))
    }

    fn write_i64_ref(&mut self, v: i64) -> WireResult<Int64Ref> {
        self.align_for(1, 8);
        self.out.put_u8(codes::INT64);
        let offset = self.base + self.out.len();
        self.out.put_i64_le(v);
        Ok(Int64Ref::new(offset, CellForm::Binary))
    }

    fn write_i64_array_ref(&mut self, vs: &[i64]) -> WireResult<Int64ArrayRef> {
        let lead = 1 + codes::varint_len(vs.len() as u64);
        self.align_for(lead, 8);
        self.out.put_u8(codes::I64_ARRAY);
        codes::put_varint(&mut self.out, vs.len() as u64);
        let first = self.base + self.out.len();
        for v in vs {
            self.out.put_i64_le(*v);
        }
        Ok(Int64ArrayRef::new(first, vs.len(), CellForm::Binary))
    }

    fn write_compressed(&mut self, codec: &str, payload: &[u8]) -> WireResult<()> {
        let packed = compression::compress(codec, payload)?;
        self.out.put_u8(codes::COMPRESSED);
        self.put_string_form(codec);
        codes::put_varint(&mut self.out, payload.len() as u64);
        codes::put_varint(&mut self.out, packed.len() as u64);
        self.out.put_slice(&packed);
        Ok(())
    }
}

impl FieldOut for BinaryOut {
    fn field(&mut self, name: &str) -> WireResult<&mut dyn ValueOut> {
        if !self.opts.field_less {
            self.put_field_name(name);
        }
        Ok(self)
    }

    fn field_id(&mut self, id: u64, name: &str) -> WireResult<&mut dyn ValueOut> {
        if self.opts.field_less {
            return Ok(self);
        }
        if self.opts.numeric_id {
            self.out.put_u8(codes::FIELD_NUMBER);
            codes::put_varint(&mut self.out, id);
            return Ok(self);
        }
        self.field(name)
    }

    fn comment(&mut self, text: &str) -> WireResult<()> {
        self.out.put_u8(codes::COMMENT);
        self.put_string_form(text);
        Ok(())
    }
}
