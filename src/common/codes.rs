//! Lead-code table of the binary encoding, plus the LEB128 varints used
//! for out-of-line lengths.
//!
//! A single lead byte classifies the next element:
//!
//! * `0x00..=0x7f` — the byte itself is a small non-negative integer.
//! * `0x80..=0xbf` — inline UTF-8 string, length in the low 6 bits.
//! * `0xc0..=0xdf` — inline field name, length in the low 5 bits.
//! * `0xe0..=0xff` — the fixed codes below.
//!
//! Records are length-prefixed ([`RECORD`] followed by a varint byte
//! length) so that a reader can clip its limit to the measured length;
//! sequences are delimited by [`SEQUENCE_START`]/[`SEQUENCE_END`] and
//! item presence is a peek for the terminator.

use bytes::{BufMut, BytesMut};

use crate::error::{WireError, WireResult, excerpt_around};

/// Largest integer carried inline in the lead byte.
pub const SMALL_INT_MAX: u8 = 0x7f;
/// Base of the inline-string range.
pub const STR_BASE: u8 = 0x80;
/// Longest string carried with its length in the lead byte.
pub const STR_INLINE_MAX: usize = 0x3f;
/// Base of the inline-field-name range.
pub const FIELD_BASE: u8 = 0xc0;
/// Longest field name carried with its length in the lead byte.
pub const FIELD_INLINE_MAX: usize = 0x1f;

/// `i8` scalar.
pub const INT8: u8 = 0xe0;
/// `i16` scalar, little-endian.
pub const INT16: u8 = 0xe1;
/// `i32` scalar, little-endian.
pub const INT32: u8 = 0xe2;
/// `i64` scalar, little-endian.
pub const INT64: u8 = 0xe3;
/// `u8` scalar.
pub const UINT8: u8 = 0xe4;
/// `u16` scalar, little-endian.
pub const UINT16: u8 = 0xe5;
/// `u32` scalar, little-endian.
pub const UINT32: u8 = 0xe6;
/// `u64` scalar, little-endian.
pub const UINT64: u8 = 0xe7;
/// `f32` scalar, little-endian.
pub const FLOAT32: u8 = 0xe8;
/// `f64` scalar, little-endian.
pub const FLOAT64: u8 = 0xe9;
/// Boolean `false`.
pub const FALSE: u8 = 0xea;
/// Boolean `true`.
pub const TRUE: u8 = 0xeb;
/// The null sentinel.
pub const NULL: u8 = 0xec;
/// Out-of-line UTF-8 string: varint length, then bytes.
pub const STRING_ANY: u8 = 0xed;
/// Out-of-line 8-bit (Latin-1) string: varint length, then bytes.
pub const STRING_8BIT: u8 = 0xee;
/// Opaque bytes: varint length, then bytes.
pub const BYTES: u8 = 0xef;
/// Type prefix: a string form follows, then the tagged value.
pub const TYPE_PREFIX: u8 = 0xf0;
/// Type literal: a string form follows.
pub const TYPE_LITERAL: u8 = 0xf1;
/// Out-of-line field name: varint length, then bytes.
pub const FIELD_ANY: u8 = 0xf2;
/// Numeric field id: varint id.
pub const FIELD_NUMBER: u8 = 0xf3;
/// Wall-clock time: a string form in ISO-8601 follows.
pub const TIME: u8 = 0xf4;
/// Calendar date: a string form in ISO-8601 follows.
pub const DATE: u8 = 0xf5;
/// Date and time: a string form in ISO-8601 follows.
pub const DATE_TIME: u8 = 0xf6;
/// Zoned date and time: a string form in RFC 3339 follows.
pub const ZONED_DATE_TIME: u8 = 0xf7;
/// UUID: 16 raw bytes follow.
pub const UUID: u8 = 0xf8;
/// Opens a sequence.
pub const SEQUENCE_START: u8 = 0xf9;
/// Closes a sequence.
pub const SEQUENCE_END: u8 = 0xfa;
/// Record: varint byte length, then the fields.
pub const RECORD: u8 = 0xfb;
/// Compressed blob: codec name string form, varint uncompressed length,
/// varint compressed length, then the compressed bytes.
pub const COMPRESSED: u8 = 0xfc;
/// Array of `i64`: varint count, then count little-endian words.
pub const I64_ARRAY: u8 = 0xfd;
/// Comment: a string form follows; readers skip it.
pub const COMMENT: u8 = 0xfe;
/// Single filler byte, used for alignment.
pub const PADDING: u8 = 0xff;

/// Human-readable name of a lead code, for dumps and errors.
pub fn name_of(code: u8) -> &'static str {
    match code {
        0x00..=SMALL_INT_MAX => "small-int",
        STR_BASE..=0xbf => "string",
        FIELD_BASE..=0xdf => "field",
        INT8 => "i8",
        INT16 => "i16",
        INT32 => "i32",
        INT64 => "i64",
        UINT8 => "u8",
        UINT16 => "u16",
        UINT32 => "u32",
        UINT64 => "u64",
        FLOAT32 => "f32",
        FLOAT64 => "f64",
        FALSE => "false",
        TRUE => "true",
        NULL => "null",
        STRING_ANY => "string",
        STRING_8BIT => "string-8bit",
        BYTES => "bytes",
        TYPE_PREFIX => "type-prefix",
        TYPE_LITERAL => "type-literal",
        FIELD_ANY => "field",
        FIELD_NUMBER => "field-number",
        TIME => "time",
        DATE => "date",
        DATE_TIME => "date-time",
        ZONED_DATE_TIME => "zoned-date-time",
        UUID => "uuid",
        SEQUENCE_START => "sequence-start",
        SEQUENCE_END => "sequence-end",
        RECORD => "record",
        COMPRESSED => "compressed",
        I64_ARRAY => "i64-array",
        COMMENT => "comment",
        PADDING => "padding",
    }
}

/// True when `code` begins a field name in any of its three forms.
pub fn is_field_code(code: u8) -> bool {
    (FIELD_BASE..=0xdf).contains(&code) || code == FIELD_ANY || code == FIELD_NUMBER
}

/// Appends an unsigned LEB128 varint.
pub fn put_varint(out: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

/// Number of bytes [`put_varint`] would append.
pub fn varint_len(value: u64) -> usize {
    (64 - (value | 1).leading_zeros()).div_ceil(7) as usize
}

/// Reads an unsigned LEB128 varint at `pos`, returning the value and the
/// position just past it.
pub fn get_varint(data: &[u8], pos: usize) -> WireResult<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut at = pos;
    loop {
        let byte = *data.get(at).ok_or_else(|| WireError::Truncation {
            needed: at - pos + 1,
            available: data.len().saturating_sub(pos),
            offset: pos as u64,
            excerpt: excerpt_around(data, pos),
        })?;
        if shift >= 64 {
            return Err(WireError::TypeMismatch {
                expected: "varint",
                found: "varint longer than 10 bytes".into(),
                offset: pos as u64,
                excerpt: excerpt_around(data, pos),
            });
        }
        value |= u64::from(byte & 0x7f) << shift;
        at += 1;
        if byte & 0x80 == 0 {
            return Ok((value, at));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut out = BytesMut::new();
            put_varint(&mut out, value);
            assert_eq!(out.len(), varint_len(value), "length of {value}");
            let (read, next) = get_varint(&out, 0).expect("read");
            assert_eq!(read, value);
            assert_eq!(next, out.len());
        }
    }

    #[test]
    fn varint_truncation_is_reported() {
        let err = get_varint(&[0x80], 0).expect_err("short");
        assert!(matches!(err, WireError::Truncation { .. }));
    }

    #[test]
    fn fixed_codes_cover_the_top_range_exactly_once() {
        let mut seen = std::collections::HashSet::new();
        for code in [
            INT8, INT16, INT32, INT64, UINT8, UINT16, UINT32, UINT64, FLOAT32, FLOAT64, FALSE,
            TRUE, NULL, STRING_ANY, STRING_8BIT, BYTES, TYPE_PREFIX, TYPE_LITERAL, FIELD_ANY,
            FIELD_NUMBER, TIME, DATE, DATE_TIME, ZONED_DATE_TIME, UUID, SEQUENCE_START,
            SEQUENCE_END, RECORD, COMPRESSED, I64_ARRAY, COMMENT, PADDING,
        ] {
            assert!(code >= 0xe0);
            assert!(seen.insert(code), "duplicate code {code:#x}");
        }
        assert_eq!(seen.len(), 32);
    }
}
