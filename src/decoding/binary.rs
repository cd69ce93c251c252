//! Reader half of the tagged binary encoding.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use tracing::trace;
use uuid::Uuid;

use super::{FieldIn, FieldKey, ValueIn};
use crate::cell::{CellForm, Int32Ref, Int64ArrayRef, Int64Ref};
use crate::common::codes;
use crate::compression;
use crate::encoding::binary::BinaryOptions;
use crate::error::{WireError, WireResult, excerpt_around};
use crate::record::strategy;
use crate::value::{Value, narrow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Top,
    Record,
    Sequence,
}

#[derive(Debug)]
struct SavedField {
    key: FieldKey,
    start: usize,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Exclusive end of the scope's content; sequences extend to the
    /// terminator code, records to their measured length.
    limit: usize,
    saved: Vec<SavedField>,
    ordinal: usize,
}

/// Reads the binary encoding from a document payload.
#[derive(Debug)]
pub struct BinaryIn {
    data: Bytes,
    pos: usize,
    base: usize,
    opts: BinaryOptions,
    scopes: Vec<Scope>,
    resume_at: Option<usize>,
}

impl BinaryIn {
    /// Creates a reader over a payload that starts at buffer offset
    /// `base`.
    pub fn new(opts: BinaryOptions, data: Bytes, base: usize) -> Self {
        let limit = data.len();
        Self {
            data,
            pos: 0,
            base,
            opts,
            scopes: vec![Scope {
                kind: ScopeKind::Top,
                limit,
                saved: Vec::new(),
                ordinal: 0,
            }],
            resume_at: None,
        }
    }

    fn limit(&self) -> usize {
        self.scopes.last().expect("scope stack never empty").limit
    }

    fn at(&self, pos: usize) -> Option<u8> {
        if pos < self.limit() {
            self.data.get(pos).copied()
        } else {
            None
        }
    }

    fn mismatch(&self, expected: &'static str, at: usize) -> WireError {
        let found = match self.data.get(at) {
            Some(&code) => format!("{} ({code:#04x})", codes::name_of(code)),
            None => "end of input".to_owned(),
        };
        WireError::TypeMismatch {
            expected,
            found,
            offset: (self.base + at) as u64,
            excerpt: excerpt_around(&self.data, at),
        }
    }

    fn truncated(&self, at: usize, needed: usize) -> WireError {
        WireError::Truncation {
            needed,
            available: self.limit().saturating_sub(at),
            offset: (self.base + at) as u64,
            excerpt: excerpt_around(&self.data, at),
        }
    }

    fn take(&self, at: usize, len: usize) -> WireResult<&[u8]> {
        if at + len > self.limit() {
            return Err(self.truncated(at, len));
        }
        Ok(&self.data[at..at + len])
    }

    /// Advances past padding and comments.
    fn prepare(&mut self) {
        loop {
            match self.at(self.pos) {
                Some(codes::PADDING) => self.pos += 1,
                Some(codes::COMMENT) => {
                    if let Ok((_, next)) = self.string_form(self.pos + 1) {
                        self.pos = next;
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn finish_value(&mut self) {
        if let Some(back) = self.resume_at.take() {
            self.pos = back;
        }
    }

    fn committing<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> WireResult<T>,
    ) -> WireResult<T> {
        let entry = self.pos;
        let resume = self.resume_at;
        match read(self) {
            Ok(value) => {
                self.finish_value();
                Ok(value)
            }
            Err(error) => {
                self.pos = entry;
                self.resume_at = resume;
                Err(error)
            }
        }
    }

    /// Decodes the string form at `at`, returning the text and the
    /// position past it.
    fn string_form(&self, at: usize) -> WireResult<(String, usize)> {
        let code = self.at(at).ok_or_else(|| self.truncated(at, 1))?;
        match code {
            codes::STR_BASE..=0xbf => {
                let len = (code & 0x3f) as usize;
                let raw = self.take(at + 1, len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| self.mismatch("UTF-8 text", at))?
                    .to_owned();
                Ok((text, at + 1 + len))
            }
            codes::STRING_ANY => {
                let (len, data_at) = codes::get_varint(&self.data[..self.limit()], at + 1)?;
                let raw = self.take(data_at, len as usize)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| self.mismatch("UTF-8 text", at))?
                    .to_owned();
                Ok((text, data_at + len as usize))
            }
            codes::STRING_8BIT => {
                let (len, data_at) = codes::get_varint(&self.data[..self.limit()], at + 1)?;
                let raw = self.take(data_at, len as usize)?;
                let text = raw.iter().map(|b| *b as char).collect();
                Ok((text, data_at + len as usize))
            }
            _ => Err(self.mismatch("string", at)),
        }
    }

    /// Decodes the integer at `at`, widened to `i128`.
    fn int_form(&self, at: usize) -> WireResult<(i128, usize)> {
        let code = self.at(at).ok_or_else(|| self.truncated(at, 1))?;
        let le = |len: usize| self.take(at + 1, len);
        match code {
            0x00..=codes::SMALL_INT_MAX => Ok((i128::from(code), at + 1)),
            codes::INT8 => Ok((i128::from(le(1)?[0] as i8), at + 2)),
            codes::UINT8 => Ok((i128::from(le(1)?[0]), at + 2)),
            codes::INT16 => {
                let raw: [u8; 2] = le(2)?.try_into().expect("sized slice");
                Ok((i128::from(i16::from_le_bytes(raw)), at + 3))
            }
            codes::UINT16 => {
                let raw: [u8; 2] = le(2)?.try_into().expect("sized slice");
                Ok((i128::from(u16::from_le_bytes(raw)), at + 3))
            }
            codes::INT32 => {
                let raw: [u8; 4] = le(4)?.try_into().expect("sized slice");
                Ok((i128::from(i32::from_le_bytes(raw)), at + 5))
            }
            codes::UINT32 => {
                let raw: [u8; 4] = le(4)?.try_into().expect("sized slice");
                Ok((i128::from(u32::from_le_bytes(raw)), at + 5))
            }
            codes::INT64 => {
                let raw: [u8; 8] = le(8)?.try_into().expect("sized slice");
                Ok((i128::from(i64::from_le_bytes(raw)), at + 9))
            }
            codes::UINT64 => {
                let raw: [u8; 8] = le(8)?.try_into().expect("sized slice");
                Ok((i128::from(u64::from_le_bytes(raw)), at + 9))
            }
            _ => Err(self.mismatch("integer", at)),
        }
    }

    fn read_int<T: TryFrom<i128>>(&mut self, target: &'static str) -> WireResult<T> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            let (value, next) = r.int_form(at)?;
            let narrowed = narrow::<T>(value, target, (r.base + at) as u64)?;
            r.pos = next;
            Ok(narrowed)
        })
    }

    fn skip_any_prefix(&mut self) -> WireResult<()> {
        if self.at(self.pos) == Some(codes::TYPE_PREFIX) {
            let (_, next) = self.string_form(self.pos + 1)?;
            self.pos = next;
        }
        Ok(())
    }

    fn read_time_form<T>(
        &mut self,
        code: u8,
        expected: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> WireResult<T> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            if r.at(at) != Some(code) {
                return Err(r.mismatch(expected, at));
            }
            let (text, next) = r.string_form(at + 1)?;
            let value = parse(&text).ok_or_else(|| r.mismatch(expected, at))?;
            r.pos = next;
            Ok(value)
        })
    }

    /// Position just past the value starting at `at`; padding and
    /// comments before it are included in the span.
    fn value_span(&self, at: usize) -> WireResult<usize> {
        let code = self.at(at).ok_or_else(|| self.truncated(at, 1))?;
        match code {
            codes::PADDING => self.value_span(at + 1),
            codes::COMMENT => {
                let (_, next) = self.string_form(at + 1)?;
                self.value_span(next)
            }
            0x00..=codes::SMALL_INT_MAX | codes::TRUE | codes::FALSE | codes::NULL => Ok(at + 1),
            codes::INT8 | codes::UINT8 => Ok(at + 2),
            codes::INT16 | codes::UINT16 => Ok(at + 3),
            codes::INT32 | codes::UINT32 | codes::FLOAT32 => Ok(at + 5),
            codes::INT64 | codes::UINT64 | codes::FLOAT64 => Ok(at + 9),
            codes::STR_BASE..=0xbf | codes::STRING_ANY | codes::STRING_8BIT => {
                Ok(self.string_form(at)?.1)
            }
            codes::BYTES => {
                let (len, data_at) = codes::get_varint(&self.data[..self.limit()], at + 1)?;
                Ok(data_at + len as usize)
            }
            codes::TYPE_PREFIX => {
                let (_, next) = self.string_form(at + 1)?;
                self.value_span(next)
            }
            codes::TYPE_LITERAL | codes::TIME | codes::DATE | codes::DATE_TIME
            | codes::ZONED_DATE_TIME => Ok(self.string_form(at + 1)?.1),
            codes::UUID => Ok(at + 17),
            codes::SEQUENCE_START => {
                let mut item = at + 1;
                loop {
                    match self.at(item) {
                        None => {
                            return Err(WireError::UnterminatedRecord {
                                what: "sequence",
                                offset: (self.base + at) as u64,
                                excerpt: excerpt_around(&self.data, at),
                            });
                        }
                        Some(codes::SEQUENCE_END) => return Ok(item + 1),
                        Some(_) => item = self.value_span(item)?,
                    }
                }
            }
            codes::RECORD => {
                let (len, body_at) = codes::get_varint(&self.data[..self.limit()], at + 1)?;
                Ok(body_at + len as usize)
            }
            codes::COMPRESSED => {
                let (_, lengths_at) = self.string_form(at + 1)?;
                let (_, clen_at) = codes::get_varint(&self.data[..self.limit()], lengths_at)?;
                let (clen, data_at) = codes::get_varint(&self.data[..self.limit()], clen_at)?;
                Ok(data_at + clen as usize)
            }
            codes::I64_ARRAY => {
                let (count, data_at) = codes::get_varint(&self.data[..self.limit()], at + 1)?;
                Ok(data_at + count as usize * 8)
            }
            codes::FIELD_BASE..=0xdf | codes::FIELD_ANY | codes::FIELD_NUMBER => {
                Err(self.mismatch("value", at))
            }
            codes::SEQUENCE_END => Err(self.mismatch("value", at)),
        }
    }

    fn next_field_key(&mut self) -> WireResult<Option<(FieldKey, usize)>> {
        self.prepare();
        let scope_end = match self.scopes.last().expect("scope stack never empty").kind {
            ScopeKind::Sequence => return Ok(None),
            _ => self.limit(),
        };
        if self.pos >= scope_end {
            return Ok(None);
        }
        let code = self.data[self.pos];
        if self.opts.field_less || !codes::is_field_code(code) {
            let scope = self.scopes.last_mut().expect("scope stack never empty");
            let ordinal = scope.ordinal;
            scope.ordinal += 1;
            return Ok(Some((FieldKey::Position(ordinal), self.pos)));
        }
        match code {
            codes::FIELD_BASE..=0xdf => {
                let len = (code & 0x1f) as usize;
                let raw = self.take(self.pos + 1, len)?;
                let name = std::str::from_utf8(raw)
                    .map_err(|_| self.mismatch("field name", self.pos))?
                    .to_owned();
                Ok(Some((FieldKey::Name(name), self.pos + 1 + len)))
            }
            codes::FIELD_ANY => {
                let (len, data_at) =
                    codes::get_varint(&self.data[..self.limit()], self.pos + 1)?;
                let raw = self.take(data_at, len as usize)?;
                let name = std::str::from_utf8(raw)
                    .map_err(|_| self.mismatch("field name", self.pos))?
                    .to_owned();
                Ok(Some((FieldKey::Name(name), data_at + len as usize)))
            }
            _ => {
                let (id, next) = codes::get_varint(&self.data[..self.limit()], self.pos + 1)?;
                Ok(Some((FieldKey::Id(id), next)))
            }
        }
    }

    fn read_map_value(&mut self) -> WireResult<Value> {
        let mut map = IndexMap::new();
        self.read_record(&mut |fields| {
            while let Some(key) = fields.next_field()? {
                let name = match key {
                    FieldKey::Name(name) => name,
                    FieldKey::Id(id) => id.to_string(),
                    FieldKey::Position(at) => at.to_string(),
                };
                let value = fields.value().read_value()?;
                map.insert(name, value);
            }
            Ok(())
        })?;
        Ok(Value::Map(map))
    }
}

impl ValueIn for BinaryIn {
    fn read_bool(&mut self) -> WireResult<bool> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            match r.at(r.pos) {
                Some(codes::TRUE) => {
                    r.pos += 1;
                    Ok(true)
                }
                Some(codes::FALSE) => {
                    r.pos += 1;
                    Ok(false)
                }
                _ => Err(r.mismatch("bool", r.pos)),
            }
        })
    }

    fn read_i8(&mut self) -> WireResult<i8> {
        self.read_int("i8")
    }

    fn read_u8(&mut self) -> WireResult<u8> {
        self.read_int("u8")
    }

    fn read_i16(&mut self) -> WireResult<i16> {
        self.read_int("i16")
    }

    fn read_u16(&mut self) -> WireResult<u16> {
        self.read_int("u16")
    }

    fn read_i32(&mut self) -> WireResult<i32> {
        self.read_int("i32")
    }

    fn read_u32(&mut self) -> WireResult<u32> {
        self.read_int("u32")
    }

    fn read_i64(&mut self) -> WireResult<i64> {
        self.read_int("i64")
    }

    fn read_u64(&mut self) -> WireResult<u64> {
        self.read_int("u64")
    }

    fn read_f32(&mut self) -> WireResult<f32> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            match r.at(at) {
                Some(codes::FLOAT32) => {
                    let raw: [u8; 4] = r.take(at + 1, 4)?.try_into().expect("sized slice");
                    r.pos = at + 5;
                    Ok(f32::from_le_bytes(raw))
                }
                Some(codes::FLOAT64) => {
                    let raw: [u8; 8] = r.take(at + 1, 8)?.try_into().expect("sized slice");
                    r.pos = at + 9;
                    Ok(f64::from_le_bytes(raw) as f32)
                }
                _ => {
                    let (value, next) = r.int_form(at)?;
                    r.pos = next;
                    Ok(value as f32)
                }
            }
        })
    }

    fn read_f64(&mut self) -> WireResult<f64> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            match r.at(at) {
                Some(codes::FLOAT64) => {
                    let raw: [u8; 8] = r.take(at + 1, 8)?.try_into().expect("sized slice");
                    r.pos = at + 9;
                    Ok(f64::from_le_bytes(raw))
                }
                Some(codes::FLOAT32) => {
                    let raw: [u8; 4] = r.take(at + 1, 4)?.try_into().expect("sized slice");
                    r.pos = at + 5;
                    Ok(f64::from(f32::from_le_bytes(raw)))
                }
                _ => {
                    let (value, next) = r.int_form(at)?;
                    r.pos = next;
                    Ok(value as f64)
                }
            }
        })
    }

    fn read_text(&mut self) -> WireResult<String> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let (text, next) = r.string_form(r.pos)?;
            r.pos = next;
            Ok(text)
        })
    }

    fn read_bytes(&mut self) -> WireResult<Vec<u8>> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            if r.at(at) != Some(codes::BYTES) {
                return Err(r.mismatch("bytes", at));
            }
            let (len, data_at) = codes::get_varint(&r.data[..r.limit()], at + 1)?;
            let raw = r.take(data_at, len as usize)?.to_vec();
            r.pos = data_at + len as usize;
            Ok(raw)
        })
    }

    fn read_time(&mut self) -> WireResult<NaiveTime> {
        self.read_time_form(codes::TIME, "time", |s| s.parse().ok())
    }

    fn read_date(&mut self) -> WireResult<NaiveDate> {
        self.read_time_form(codes::DATE, "date", |s| s.parse().ok())
    }

    fn read_date_time(&mut self) -> WireResult<NaiveDateTime> {
        self.read_time_form(codes::DATE_TIME, "date-time", |s| s.parse().ok())
    }

    fn read_zoned_date_time(&mut self) -> WireResult<DateTime<FixedOffset>> {
        self.read_time_form(codes::ZONED_DATE_TIME, "zoned-date-time", |s| {
            DateTime::parse_from_rfc3339(s).ok()
        })
    }

    fn read_uuid(&mut self) -> WireResult<Uuid> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            let at = r.pos;
            if r.at(at) != Some(codes::UUID) {
                return Err(r.mismatch("uuid", at));
            }
            let raw: [u8; 16] = r.take(at + 1, 16)?.try_into().expect("sized slice");
            r.pos = at + 17;
            Ok(Uuid::from_bytes(raw))
        })
    }

    fn read_type_literal(&mut self) -> WireResult<String> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(at) != Some(codes::TYPE_LITERAL) {
                return Err(r.mismatch("type literal", at));
            }
            let (name, next) = r.string_form(at + 1)?;
            r.pos = next;
            Ok(name)
        })
    }

    fn read_type_prefix(&mut self) -> WireResult<Option<String>> {
        self.prepare();
        if self.at(self.pos) != Some(codes::TYPE_PREFIX) {
            return Ok(None);
        }
        let (tag, next) = self.string_form(self.pos + 1)?;
        self.pos = next;
        Ok(Some(tag))
    }

    fn is_null(&mut self) -> WireResult<bool> {
        self.prepare();
        if self.at(self.pos) == Some(codes::NULL) {
            self.pos += 1;
            self.finish_value();
            return Ok(true);
        }
        Ok(false)
    }

    fn read_length(&mut self) -> WireResult<usize> {
        self.prepare();
        Ok(self.value_span(self.pos)? - self.pos)
    }

    fn skip_value(&mut self) -> WireResult<()> {
        self.prepare();
        self.pos = self.value_span(self.pos)?;
        self.finish_value();
        Ok(())
    }

    fn has_next(&mut self) -> WireResult<bool> {
        self.prepare();
        match self.at(self.pos) {
            None => Ok(false),
            Some(codes::SEQUENCE_END) => Ok(false),
            Some(_) => Ok(true),
        }
    }

    fn read_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueIn) -> WireResult<()>,
    ) -> WireResult<()> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            if r.at(r.pos) != Some(codes::SEQUENCE_START) {
                return Err(r.mismatch("sequence", r.pos));
            }
            let end = r.value_span(r.pos)?;
            r.scopes.push(Scope {
                kind: ScopeKind::Sequence,
                limit: end - 1,
                saved: Vec::new(),
                ordinal: 0,
            });
            r.pos += 1;
            let result = body(r);
            r.scopes.pop();
            result?;
            r.pos = end;
            Ok(())
        })
    }

    fn read_record(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldIn) -> WireResult<()>,
    ) -> WireResult<()> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix()?;
            if r.at(r.pos) != Some(codes::RECORD) {
                return Err(r.mismatch("record", r.pos));
            }
            let (len, body_at) = codes::get_varint(&r.data[..r.limit()], r.pos + 1)?;
            let end = body_at + len as usize;
            if end > r.limit() {
                return Err(r.truncated(r.pos, end - r.pos));
            }
            r.scopes.push(Scope {
                kind: ScopeKind::Record,
                limit: end,
                saved: Vec::new(),
                ordinal: 0,
            });
            r.pos = body_at;
            let result = body(r);
            r.scopes.pop();
            result?;
            r.pos = end;
            Ok(())
        })
    }

    fn read_value(&mut self) -> WireResult<Value> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let code = r.at(at).ok_or_else(|| r.truncated(at, 1))?;
            match code {
                codes::NULL => {
                    r.pos = at + 1;
                    Ok(Value::Null)
                }
                codes::TRUE => {
                    r.pos = at + 1;
                    Ok(Value::Bool(true))
                }
                codes::FALSE => {
                    r.pos = at + 1;
                    Ok(Value::Bool(false))
                }
                0x00..=codes::SMALL_INT_MAX
                | codes::INT8
                | codes::UINT8
                | codes::INT16
                | codes::UINT16
                | codes::INT32
                | codes::UINT32
                | codes::INT64
                | codes::UINT64 => {
                    let (value, next) = r.int_form(at)?;
                    r.pos = next;
                    if let Ok(v) = i64::try_from(value) {
                        Ok(Value::I64(v))
                    } else {
                        Ok(Value::U64(u64::try_from(value).map_err(|_| {
                            r.mismatch("integer", at)
                        })?))
                    }
                }
                codes::FLOAT32 | codes::FLOAT64 => Ok(Value::from_f64(r.read_f64()?)),
                codes::STR_BASE..=0xbf | codes::STRING_ANY | codes::STRING_8BIT => {
                    Ok(Value::Text(r.read_text()?))
                }
                codes::BYTES => Ok(Value::Bytes(Bytes::from(r.read_bytes()?))),
                codes::TIME => Ok(Value::Time(r.read_time()?)),
                codes::DATE => Ok(Value::Date(r.read_date()?)),
                codes::DATE_TIME => Ok(Value::DateTime(r.read_date_time()?)),
                codes::ZONED_DATE_TIME => Ok(Value::ZonedDateTime(r.read_zoned_date_time()?)),
                codes::UUID => Ok(Value::Uuid(r.read_uuid()?)),
                codes::TYPE_LITERAL => Ok(Value::TypeLiteral(r.read_type_literal()?)),
                codes::TYPE_PREFIX => {
                    let (tag, next) = r.string_form(at + 1)?;
                    r.pos = next;
                    let inner = r.read_value()?;
                    strategy::resolve_typed(tag, inner, (r.base + at) as u64)
                }
                codes::SEQUENCE_START => {
                    let mut items = Vec::new();
                    r.read_sequence(&mut |seq| {
                        while seq.has_next()? {
                            items.push(seq.read_value()?);
                        }
                        Ok(())
                    })?;
                    Ok(Value::Sequence(items))
                }
                codes::RECORD => r.read_map_value(),
                codes::COMPRESSED => Ok(Value::Bytes(Bytes::from(r.read_compressed()?))),
                codes::I64_ARRAY => {
                    let (count, data_at) = codes::get_varint(&r.data[..r.limit()], at + 1)?;
                    let mut items = Vec::with_capacity(count as usize);
                    for i in 0..count as usize {
                        let raw: [u8; 8] =
                            r.take(data_at + i * 8, 8)?.try_into().expect("sized slice");
                        items.push(Value::I64(i64::from_le_bytes(raw)));
                    }
                    r.pos = data_at + count as usize * 8;
                    Ok(Value::Sequence(items))
                }
                _ => Err(r.mismatch("value", at)),
            }
        })
    }

    fn read_compressed(&mut self) -> WireResult<Vec<u8>> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(at) != Some(codes::COMPRESSED) {
                return Err(r.mismatch("compressed blob", at));
            }
            let (codec, lengths_at) = r.string_form(at + 1)?;
            let (ulen, clen_at) = codes::get_varint(&r.data[..r.limit()], lengths_at)?;
            let (clen, data_at) = codes::get_varint(&r.data[..r.limit()], clen_at)?;
            let packed = r.take(data_at, clen as usize)?;
            let unpacked = compression::decompress(&codec, packed)?;
            if unpacked.len() as u64 != ulen {
                return Err(r.mismatch("compressed blob", at));
            }
            r.pos = data_at + clen as usize;
            Ok(unpacked)
        })
    }

    fn read_i32_ref(&mut self) -> WireResult<Int32Ref> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(at) != Some(codes::INT32) {
                return Err(r.mismatch("i32 cell", at));
            }
            r.take(at + 1, 4)?;
            r.pos = at + 5;
            Ok(Int32Ref::new(r.base + at + 1, CellForm::Binary))
        })
    }

    fn read_i64_ref(&mut self) -> WireResult<Int64Ref> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(at) != Some(codes::INT64) {
                return Err(r.mismatch("i64 cell", at));
            }
            r.take(at + 1, 8)?;
            r.pos = at + 9;
            Ok(Int64Ref::new(r.base + at + 1, CellForm::Binary))
        })
    }

    fn read_i64_array_ref(&mut self) -> WireResult<Int64ArrayRef> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(at) != Some(codes::I64_ARRAY) {
                return Err(r.mismatch("i64 array cell", at));
            }
            let (count, data_at) = codes::get_varint(&r.data[..r.limit()], at + 1)?;
            r.take(data_at, count as usize * 8)?;
            r.pos = data_at + count as usize * 8;
            Ok(Int64ArrayRef::new(
                r.base + data_at,
                count as usize,
                CellForm::Binary,
            ))
        })
    }
}

impl FieldIn for BinaryIn {
    fn next_field(&mut self) -> WireResult<Option<FieldKey>> {
        match self.next_field_key()? {
            None => Ok(None),
            Some((key, value_at)) => {
                self.pos = value_at;
                Ok(Some(key))
            }
        }
    }

    fn read_field(&mut self, name: &str) -> WireResult<Option<&mut dyn ValueIn>> {
        let scope_index = self.scopes.len() - 1;
        if let Some(found) = self.scopes[scope_index]
            .saved
            .iter()
            .position(|s| s.key.as_name() == Some(name))
        {
            let saved = self.scopes[scope_index].saved.remove(found);
            self.resume_at = Some(self.pos);
            self.pos = saved.start;
            return Ok(Some(self));
        }
        loop {
            let Some((key, value_at)) = self.next_field_key()? else {
                return Ok(None);
            };
            if key.as_name() == Some(name) {
                self.pos = value_at;
                return Ok(Some(self));
            }
            let span_end = self.value_span(value_at)?;
            trace!(?key, "saving unexpected field");
            self.scopes[scope_index].saved.push(SavedField {
                key,
                start: value_at,
            });
            self.pos = span_end;
        }
    }

    fn value(&mut self) -> &mut dyn ValueIn {
        self
    }

    fn has_more_fields(&mut self) -> WireResult<bool> {
        self.prepare();
        Ok(self.pos < self.limit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{BinaryOut, FieldOut as _, ValueOut as _};

    fn written(build: impl FnOnce(&mut BinaryOut) -> WireResult<()>) -> BinaryIn {
        let mut out = BinaryOut::new(BinaryOptions::default(), 0);
        build(&mut out).expect("write");
        BinaryIn::new(BinaryOptions::default(), out.finish(), 0)
    }

    #[test]
    fn scalars_round_trip() {
        let mut input = written(|o| {
            o.field("a")?.write_i32(-40_000)?;
            o.field("b")?.write_bool(true)?;
            o.field("c")?.write_text("Hello World")?;
            o.field("d")?.write_f64(123.456)?;
            Ok(())
        });
        let v = input.read_field("a").expect("a").expect("present");
        assert_eq!(v.read_i32().expect("i32"), -40_000);
        let v = input.read_field("b").expect("b").expect("present");
        assert!(v.read_bool().expect("bool"));
        let v = input.read_field("c").expect("c").expect("present");
        assert_eq!(v.read_text().expect("text"), "Hello World");
        let v = input.read_field("d").expect("d").expect("present");
        assert_eq!(v.read_f64().expect("f64"), 123.456);
    }

    #[test]
    fn out_of_order_fields_match_from_saved_positions() {
        let mut input = written(|o| {
            o.field("x")?.write_i32(1)?;
            o.field("y")?.write_i32(2)?;
            Ok(())
        });
        let v = input.read_field("y").expect("y").expect("present");
        assert_eq!(v.read_i32().expect("i32"), 2);
        let v = input.read_field("x").expect("x").expect("present");
        assert_eq!(v.read_i32().expect("i32"), 1);
    }

    #[test]
    fn range_violation_leaves_cursor_unchanged() {
        let mut input = written(|o| o.write_i64(i64::MAX));
        let err = input.read_i16().expect_err("too wide");
        assert!(matches!(err, WireError::RangeViolation { .. }));
        assert_eq!(input.read_i64().expect("i64"), i64::MAX);
    }

    #[test]
    fn records_nest_and_clip() {
        let mut input = written(|o| {
            o.field("rec")?.write_record(&mut |f| {
                f.field("one")?.write_i32(1)?;
                f.field("two")?.write_record(&mut |inner| {
                    inner.field("deep")?.write_text("yes")?;
                    Ok(())
                })?;
                Ok(())
            })
        });
        let v = input.read_field("rec").expect("rec").expect("present");
        v.read_record(&mut |fields| {
            assert_eq!(fields.read_field("one")?.expect("one").read_i32()?, 1);
            let two = fields.read_field("two")?.expect("two");
            two.read_record(&mut |inner| {
                assert_eq!(inner.read_field("deep")?.expect("deep").read_text()?, "yes");
                Ok(())
            })?;
            assert!(!fields.has_more_fields()?);
            Ok(())
        })
        .expect("record");
    }

    #[test]
    fn sequences_terminate_with_has_next() {
        let mut input = written(|o| {
            o.write_sequence(&mut |items| {
                items.write_i32(1)?;
                items.write_i32(2)?;
                Ok(())
            })
        });
        let mut seen = Vec::new();
        input
            .read_sequence(&mut |seq| {
                while seq.has_next()? {
                    seen.push(seq.read_i32()?);
                }
                Ok(())
            })
            .expect("sequence");
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn typed_null_and_values() {
        let mut input = written(|o| {
            o.field("n")?.write_null()?;
            o.field("t")?.type_prefix("Dto")?.write_i32(5)?;
            Ok(())
        });
        let v = input.read_field("n").expect("n").expect("present");
        assert!(v.is_null().expect("null"));
        let v = input.read_field("t").expect("t").expect("present");
        assert_eq!(v.read_type_prefix().expect("prefix").as_deref(), Some("Dto"));
        assert_eq!(v.read_i32().expect("i32"), 5);
    }

    #[test]
    fn unknown_fields_skip_by_measured_length() {
        let mut input = written(|o| {
            o.field("big")?.write_record(&mut |f| {
                f.field("x")?.write_text(&"y".repeat(100))?;
                Ok(())
            })?;
            o.field("keep")?.write_i32(7)?;
            Ok(())
        });
        // Skip the record wholesale, then land on the next field.
        let key = input.next_field().expect("field").expect("present");
        assert_eq!(key.as_name(), Some("big"));
        let span = input.read_length().expect("length");
        assert!(span > 100);
        input.skip_value().expect("skip");
        let v = input.read_field("keep").expect("keep").expect("present");
        assert_eq!(v.read_i32().expect("i32"), 7);
    }

    #[test]
    fn eight_bit_text_reads_back() {
        let opts = BinaryOptions {
            use_8bit_text: true,
            ..Default::default()
        };
        let mut out = BinaryOut::new(opts, 0);
        out.write_text("caf\u{e9}").expect("text");
        let mut input = BinaryIn::new(opts, out.finish(), 0);
        assert_eq!(input.read_text().expect("text"), "caf\u{e9}");
    }

    #[test]
    fn compressed_blob_round_trips() {
        let payload = vec![7u8; 400];
        let mut input = written(|o| o.write_compressed("gzip", &payload));
        assert_eq!(input.read_compressed().expect("inflate"), payload);
    }
}
