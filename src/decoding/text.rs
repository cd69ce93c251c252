//! Reader half of the YAML-dialect text encoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use tracing::trace;
use uuid::Uuid;

use super::{FieldIn, FieldKey, ValueIn};
use crate::cell::{CellForm, Int32Ref, Int64ArrayRef, Int64Ref};
use crate::compression;
use crate::encoding::text::TextDialect;
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
    name: String,
    start: usize,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Exclusive end of the scope's content: the closing bracket, or the
    /// payload end for the top scope.
    limit: usize,
    /// Fields skipped while searching by name, kept for later match.
    saved: Vec<SavedField>,
    /// Position counter for field-less profiles.
    ordinal: usize,
}

/// Reads the text encoding from a document payload.
///
/// `base` is the absolute buffer offset of the payload's first byte, so
/// reference-cell handles and error offsets are buffer-absolute.
#[derive(Debug)]
pub struct TextIn {
    data: Bytes,
    pos: usize,
    base: usize,
    dialect: TextDialect,
    scopes: Vec<Scope>,
    resume_at: Option<usize>,
}

impl TextIn {
    /// Creates a reader over a payload that starts at buffer offset
    /// `base`.
    pub fn new(dialect: TextDialect, data: Bytes, base: usize) -> Self {
        let limit = data.len();
        Self {
            data,
            pos: 0,
            base,
            dialect,
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
            Some(&b) => format!("{:?}", b as char),
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

    /// Advances past separators and comments within the current scope.
    fn prepare(&mut self) {
        loop {
            match self.at(self.pos) {
                Some(b' ' | b'\t' | b'\r' | b'\n' | b',') => self.pos += 1,
                Some(b'#') => {
                    while let Some(b) = self.at(self.pos) {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    /// Like [`prepare`], but probing from an arbitrary position without
    /// touching the cursor.
    fn skip_blanks(&self, mut at: usize) -> usize {
        loop {
            match self.at(at) {
                Some(b' ' | b'\t' | b'\r' | b'\n' | b',') => at += 1,
                Some(b'#') => {
                    while let Some(b) = self.at(at) {
                        at += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => return at,
            }
        }
    }

    fn finish_value(&mut self) {
        if let Some(back) = self.resume_at.take() {
            self.pos = back;
        }
    }

    /// Runs a read, restoring the cursor and any pending out-of-order
    /// return position when it fails.
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

    /// End of the bare token starting at `from`.
    fn bare_token_end(&self, from: usize) -> usize {
        let mut at = from;
        while let Some(b) = self.at(at) {
            if matches!(b, b',' | b'\n' | b'\r' | b'}' | b']' | b'#') {
                break;
            }
            at += 1;
        }
        at
    }

    /// The bare token starting at `from`, trailing whitespace trimmed.
    fn bare_token(&self, from: usize) -> (&str, usize) {
        let end = self.bare_token_end(from);
        let raw = &self.data[from..end];
        let text = std::str::from_utf8(raw).unwrap_or("");
        (text.trim_end_matches([' ', '\t']), end)
    }

    /// Position just past the quoted string opening at `from`.
    fn quoted_span(&self, from: usize) -> WireResult<usize> {
        let quote = self.data[from];
        let mut at = from + 1;
        while let Some(b) = self.at(at) {
            if b == b'\\' && quote == b'"' {
                at += 2;
                continue;
            }
            if b == quote {
                if quote == b'\'' && self.at(at + 1) == Some(b'\'') {
                    at += 2;
                    continue;
                }
                return Ok(at + 1);
            }
            at += 1;
        }
        Err(self.truncated(from, self.limit() - from + 1))
    }

    /// Decodes the quoted string opening at `from`.
    fn unquote(&self, from: usize) -> WireResult<(String, usize)> {
        let end = self.quoted_span(from)?;
        let inner = &self.data[from + 1..end - 1];
        if self.data[from] == b'\'' {
            let text = std::str::from_utf8(inner)
                .map_err(|_| self.mismatch("UTF-8 text", from + 1))?;
            // The doubled delimiter collapses.
            return Ok((text.replace("''", "'"), end));
        }
        let mut out = String::with_capacity(inner.len());
        let mut i = 0;
        while i < inner.len() {
            let b = inner[i];
            if b != b'\\' {
                let rest = std::str::from_utf8(&inner[i..]).map_err(|_| {
                    self.mismatch("UTF-8 text", from + 1 + i)
                })?;
                let c = rest.chars().next().expect("non-empty remainder");
                out.push(c);
                i += c.len_utf8();
                continue;
            }
            i += 1;
            let escape = *inner.get(i).ok_or_else(|| self.truncated(from + i, 1))?;
            i += 1;
            match escape {
                b'b' => out.push('\u{8}'),
                b'r' => out.push('\r'),
                b'n' => out.push('\n'),
                b't' => out.push('\t'),
                b'\\' => out.push('\\'),
                b'"' => out.push('"'),
                b'\'' => out.push('\''),
                b'0' => out.push('\0'),
                b'x' => {
                    let hex = inner
                        .get(i..i + 2)
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or_else(|| self.mismatch("\\xHH escape", from + i))?;
                    out.push(hex as char);
                    i += 2;
                }
                b'u' => {
                    let code = inner
                        .get(i..i + 4)
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .and_then(|h| u32::from_str_radix(h, 16).ok())
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.mismatch("\\uHHHH escape", from + i))?;
                    out.push(code);
                    i += 4;
                }
                other => out.push(other as char),
            }
        }
        Ok((out, end))
    }

    /// The tag token (without `!`) opening at `from`, and the position
    /// of the tagged value after it.
    fn tag_at(&self, from: usize) -> (String, usize) {
        let mut at = from + 1;
        while let Some(b) = self.at(at) {
            if matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b',' | b'}' | b']') {
                break;
            }
            at += 1;
        }
        let tag = String::from_utf8_lossy(&self.data[from + 1..at]).into_owned();
        while matches!(self.at(at), Some(b' ' | b'\t')) {
            at += 1;
        }
        (tag, at)
    }

    /// Position just past the composite opening at `from`.
    fn matching_bracket(&self, from: usize) -> WireResult<usize> {
        let (open, close) = match self.data[from] {
            b'{' => (b'{', b'}'),
            b'[' => (b'[', b']'),
            _ => return Err(self.mismatch("composite", from)),
        };
        let mut depth = 0usize;
        let mut at = from;
        while let Some(b) = self.at(at) {
            match b {
                b'"' | b'\'' => {
                    at = self.quoted_span(at)?;
                    continue;
                }
                b'#' => {
                    while let Some(c) = self.at(at) {
                        at += 1;
                        if c == b'\n' {
                            break;
                        }
                    }
                    continue;
                }
                b if b == open => depth += 1,
                b if b == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(at + 1);
                    }
                }
                _ => {}
            }
            at += 1;
        }
        Err(WireError::UnterminatedRecord {
            what: if open == b'{' { "record" } else { "sequence" },
            offset: (self.base + from) as u64,
            excerpt: excerpt_around(&self.data, from),
        })
    }

    /// Position just past the value starting at `from`.
    fn value_span(&self, from: usize) -> WireResult<usize> {
        match self.at(from) {
            None => Err(self.truncated(from, 1)),
            Some(b'{' | b'[') => self.matching_bracket(from),
            Some(b'"' | b'\'') => self.quoted_span(from),
            Some(b'!') => {
                let (_, next) = self.tag_at(from);
                // `!!null ""` and friends: the tag is followed by its value.
                match self.at(next) {
                    None => Ok(next),
                    Some(_) => self.value_span(next),
                }
            }
            Some(_) => Ok(self.bare_token_end(from)),
        }
    }

    /// Consumes a leading type prefix when the next token is a
    /// non-reserved tag.
    fn skip_any_prefix(&mut self) {
        self.prepare();
        if self.at(self.pos) == Some(b'!') {
            let (tag, next) = self.tag_at(self.pos);
            if !is_reserved_tag(&tag) {
                self.pos = next;
            }
        }
    }

    /// Reads a scalar token: quoted or bare, prefixes skipped.
    fn scalar_token(&mut self) -> WireResult<String> {
        self.prepare();
        self.skip_any_prefix();
        match self.at(self.pos) {
            None => Err(self.truncated(self.pos, 1)),
            Some(b'"' | b'\'') => {
                let (text, end) = self.unquote(self.pos)?;
                self.pos = end;
                Ok(text)
            }
            Some(b'{' | b'[') => Err(self.mismatch("scalar", self.pos)),
            Some(_) => {
                let (text, end) = self.bare_token(self.pos);
                let text = text.to_owned();
                self.pos = end;
                Ok(text)
            }
        }
    }

    fn read_int<T: TryFrom<i128>>(&mut self, target: &'static str) -> WireResult<T> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let token = r.scalar_token()?;
            let value = parse_int(&token).ok_or_else(|| r.mismatch(target, at))?;
            narrow::<T>(value, target, (r.base + at) as u64)
        })
    }

    fn read_float(&mut self) -> WireResult<f64> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let token = r.scalar_token()?;
            if let Some(int) = parse_int(&token) {
                return Ok(int as f64);
            }
            token
                .parse::<f64>()
                .map_err(|_| r.mismatch("float", at))
        })
    }

    fn read_parsed<T: std::str::FromStr>(&mut self, expected: &'static str) -> WireResult<T> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let token = r.scalar_token()?;
            token.parse::<T>().map_err(|_| r.mismatch(expected, at))
        })
    }

    /// Reads the fields of the current scope into a map.
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

    fn next_field_key(&mut self) -> WireResult<Option<(FieldKey, usize)>> {
        self.prepare();
        match self.at(self.pos) {
            None | Some(b'}') => return Ok(None),
            Some(_) => {}
        }
        if self.dialect == TextDialect::Csv {
            let scope = self.scopes.last_mut().expect("scope stack never empty");
            let ordinal = scope.ordinal;
            scope.ordinal += 1;
            return Ok(Some((FieldKey::Position(ordinal), self.pos)));
        }
        let (name, value_at) = self.field_name_at(self.pos)?;
        Ok(Some((FieldKey::Name(name), value_at)))
    }

    /// Parses `name: ` at `from`, returning the name and the position of
    /// its value.
    fn field_name_at(&self, from: usize) -> WireResult<(String, usize)> {
        let (name, mut at) = match self.data.get(from) {
            Some(b'"' | b'\'') => {
                let (name, end) = self.unquote(from)?;
                (name, end)
            }
            _ => {
                let mut end = from;
                while let Some(b) = self.at(end) {
                    if matches!(b, b':' | b'\n' | b'}' | b',') {
                        break;
                    }
                    end += 1;
                }
                let name = std::str::from_utf8(&self.data[from..end])
                    .map_err(|_| self.mismatch("field name", from))?
                    .trim_end()
                    .to_owned();
                (name, end)
            }
        };
        while matches!(self.at(at), Some(b' ' | b'\t')) {
            at += 1;
        }
        if self.at(at) != Some(b':') {
            return Err(self.mismatch("':' after field name", at));
        }
        at += 1;
        while matches!(self.at(at), Some(b' ' | b'\t')) {
            at += 1;
        }
        Ok((name, at))
    }
}

/// Tags with fixed lexical meaning, never type prefixes.
fn is_reserved_tag(tag: &str) -> bool {
    tag.starts_with('!') || matches!(tag, "type" | "binary" | "byte[]")
}

/// Decimal, underscore-separated or hex integer.
fn parse_int(token: &str) -> Option<i128> {
    if token.is_empty() {
        return None;
    }
    let cleaned: String = token.chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else {
        if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.is_empty() {
            return None;
        }
        digits.parse::<i128>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

impl ValueIn for TextIn {
    fn read_bool(&mut self) -> WireResult<bool> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let token = r.scalar_token()?;
            if token.eq_ignore_ascii_case("true") {
                Ok(true)
            } else if token.eq_ignore_ascii_case("false") {
                Ok(false)
            } else {
                Err(r.mismatch("bool", at))
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
        Ok(self.read_float()? as f32)
    }

    fn read_f64(&mut self) -> WireResult<f64> {
        self.read_float()
    }

    fn read_text(&mut self) -> WireResult<String> {
        self.committing(|r| r.scalar_token())
    }

    fn read_bytes(&mut self) -> WireResult<Vec<u8>> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            // Optional `!byte[]` array tag, then `!binary`.
            if r.at(r.pos) == Some(b'!') {
                let (tag, next) = r.tag_at(r.pos);
                if tag == "byte[]" {
                    r.pos = next;
                }
            }
            if r.at(r.pos) == Some(b'!') {
                let (tag, next) = r.tag_at(r.pos);
                if tag != "binary" {
                    return Err(r.mismatch("!binary blob", at));
                }
                r.pos = next;
            }
            let token = r.scalar_token()?;
            BASE64
                .decode(token.as_bytes())
                .map_err(|_| r.mismatch("base64 payload", at))
        })
    }

    fn read_time(&mut self) -> WireResult<NaiveTime> {
        self.read_parsed("time")
    }

    fn read_date(&mut self) -> WireResult<NaiveDate> {
        self.read_parsed("date")
    }

    fn read_date_time(&mut self) -> WireResult<NaiveDateTime> {
        self.read_parsed("date-time")
    }

    fn read_zoned_date_time(&mut self) -> WireResult<DateTime<FixedOffset>> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let token = r.scalar_token()?;
            DateTime::parse_from_rfc3339(&token).map_err(|_| r.mismatch("zoned-date-time", at))
        })
    }

    fn read_uuid(&mut self) -> WireResult<Uuid> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(r.pos) == Some(b'!') {
                let (tag, next) = r.tag_at(r.pos);
                if tag == "!uuid" {
                    r.pos = next;
                }
            }
            let token = r.scalar_token()?;
            Uuid::parse_str(&token).map_err(|_| r.mismatch("uuid", at))
        })
    }

    fn read_type_literal(&mut self) -> WireResult<String> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.dialect == TextDialect::Json {
                return r.scalar_token();
            }
            if r.at(r.pos) != Some(b'!') {
                return Err(r.mismatch("!type literal", at));
            }
            let (tag, next) = r.tag_at(r.pos);
            if tag != "type" {
                return Err(r.mismatch("!type literal", at));
            }
            r.pos = next;
            r.scalar_token()
        })
    }

    fn read_type_prefix(&mut self) -> WireResult<Option<String>> {
        self.prepare();
        if self.at(self.pos) != Some(b'!') {
            return Ok(None);
        }
        let (tag, next) = self.tag_at(self.pos);
        if is_reserved_tag(&tag) {
            return Ok(None);
        }
        self.pos = next;
        Ok(Some(tag))
    }

    fn is_null(&mut self) -> WireResult<bool> {
        self.prepare();
        if self.dialect == TextDialect::Json {
            let (token, end) = self.bare_token(self.pos);
            if token == "null" {
                self.pos = end;
                self.finish_value();
                return Ok(true);
            }
            return Ok(false);
        }
        if self.at(self.pos) != Some(b'!') {
            return Ok(false);
        }
        let (tag, next) = self.tag_at(self.pos);
        if tag != "!null" {
            return Ok(false);
        }
        self.pos = next;
        // The sentinel's value is the empty string.
        if self.at(self.pos) == Some(b'"') {
            self.pos = self.quoted_span(self.pos)?;
        }
        self.finish_value();
        Ok(true)
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
        Ok(!matches!(self.at(self.pos), None | Some(b']') | Some(b'}')))
    }

    fn read_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueIn) -> WireResult<()>,
    ) -> WireResult<()> {
        self.committing(|r| {
            r.prepare();
            r.skip_any_prefix();
            if r.at(r.pos) != Some(b'[') {
                return Err(r.mismatch("sequence", r.pos));
            }
            let end = r.matching_bracket(r.pos)?;
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
            r.skip_any_prefix();
            if r.at(r.pos) != Some(b'{') {
                return Err(r.mismatch("record", r.pos));
            }
            let end = r.matching_bracket(r.pos)?;
            r.scopes.push(Scope {
                kind: ScopeKind::Record,
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

    fn read_value(&mut self) -> WireResult<Value> {
        self.committing(|r| {
            r.prepare();
            match r.at(r.pos) {
                None => Err(r.truncated(r.pos, 1)),
                Some(b'{') => r.read_map_value(),
                Some(b'[') => {
                    let mut items = Vec::new();
                    r.read_sequence(&mut |seq| {
                        while seq.has_next()? {
                            items.push(seq.read_value()?);
                        }
                        Ok(())
                    })?;
                    Ok(Value::Sequence(items))
                }
                Some(b'"' | b'\'') => {
                    let (text, end) = r.unquote(r.pos)?;
                    r.pos = end;
                    Ok(Value::Text(text))
                }
                Some(b'!') => {
                    let at = r.pos;
                    let (tag, next) = r.tag_at(r.pos);
                    match tag.as_str() {
                        "!null" => {
                            r.is_null()?;
                            Ok(Value::Null)
                        }
                        "!uuid" => Ok(Value::Uuid(r.read_uuid()?)),
                        "type" => Ok(Value::TypeLiteral(r.read_type_literal()?)),
                        "binary" | "byte[]" => Ok(Value::Bytes(Bytes::from(r.read_bytes()?))),
                        _ if compression::lookup(&tag).is_ok() => {
                            Ok(Value::Bytes(Bytes::from(r.read_compressed()?)))
                        }
                        _ => {
                            r.pos = next;
                            let inner = r.read_value()?;
                            strategy::resolve_typed(tag, inner, (r.base + at) as u64)
                        }
                    }
                }
                Some(_) => {
                    let at = r.pos;
                    let token = r.scalar_token()?;
                    Ok(classify_token(&token, r.dialect == TextDialect::Json)
                        .unwrap_or_else(|| {
                            trace!(offset = r.base + at, "token fell through to text");
                            Value::Text(token)
                        }))
                }
            }
        })
    }

    fn read_compressed(&mut self) -> WireResult<Vec<u8>> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(r.pos) != Some(b'!') {
                return Err(r.mismatch("compressed blob", at));
            }
            let (codec, next) = r.tag_at(r.pos);
            if is_reserved_tag(&codec) {
                return Err(r.mismatch("compressed blob", at));
            }
            r.pos = next;
            let packed = r.read_bytes()?;
            compression::decompress(&codec, &packed)
        })
    }

    fn read_i32_ref(&mut self) -> WireResult<Int32Ref> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let (token, end) = r.bare_token(r.pos);
            token
                .trim()
                .parse::<i32>()
                .map_err(|_| r.mismatch("i32 cell", at))?;
            r.pos = end;
            Ok(Int32Ref::new(r.base + at, CellForm::Text))
        })
    }

    fn read_i64_ref(&mut self) -> WireResult<Int64Ref> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            let (token, end) = r.bare_token(r.pos);
            token
                .trim()
                .parse::<i64>()
                .map_err(|_| r.mismatch("i64 cell", at))?;
            r.pos = end;
            Ok(Int64Ref::new(r.base + at, CellForm::Text))
        })
    }

    fn read_i64_array_ref(&mut self) -> WireResult<Int64ArrayRef> {
        self.committing(|r| {
            r.prepare();
            let at = r.pos;
            if r.at(r.pos) != Some(b'[') {
                return Err(r.mismatch("i64 array cell", at));
            }
            let end = r.matching_bracket(r.pos)?;
            let inner = &r.data[r.pos + 1..end - 1];
            let text = std::str::from_utf8(inner).map_err(|_| r.mismatch("i64 array cell", at))?;
            let count = text
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .count();
            // Elements start after the fixed `[ ` opener.
            let first = r.base + r.pos + 2;
            r.pos = end;
            Ok(Int64ArrayRef::new(first, count, CellForm::Text))
        })
    }
}

/// The fallback chain for bare tokens: bool, integer, float, time, date,
/// date-time, zoned-date-time; `None` means plain text.
fn classify_token(token: &str, json: bool) -> Option<Value> {
    if json && token == "null" {
        return Some(Value::Null);
    }
    if token.eq_ignore_ascii_case("true") {
        return Some(Value::Bool(true));
    }
    if token.eq_ignore_ascii_case("false") {
        return Some(Value::Bool(false));
    }
    if let Some(int) = parse_int(token) {
        if let Ok(v) = i64::try_from(int) {
            return Some(Value::I64(v));
        }
        if let Ok(v) = u64::try_from(int) {
            return Some(Value::U64(v));
        }
        return None;
    }
    // Floats must look numeric so that arbitrary words stay text; the
    // writer's special forms are matched exactly.
    if matches!(token, "Infinity" | "-Infinity" | "NaN") {
        return Some(Value::from_f64(token.parse::<f64>().ok()?));
    }
    if token
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_digit() || b == b'-' || b == b'+' || b == b'.')
        && let Ok(v) = token.parse::<f64>()
    {
        return Some(Value::from_f64(v));
    }
    if let Ok(v) = token.parse::<NaiveTime>() {
        return Some(Value::Time(v));
    }
    if let Ok(v) = token.parse::<NaiveDate>() {
        return Some(Value::Date(v));
    }
    if let Ok(v) = token.parse::<NaiveDateTime>() {
        return Some(Value::DateTime(v));
    }
    if let Ok(v) = DateTime::parse_from_rfc3339(token) {
        return Some(Value::ZonedDateTime(v));
    }
    None
}

impl FieldIn for TextIn {
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
        // A previously skipped field matches first.
        let scope_index = self.scopes.len() - 1;
        if let Some(found) = self.scopes[scope_index]
            .saved
            .iter()
            .position(|s| s.name == name)
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
            let matched = key.as_name() == Some(name);
            if matched {
                self.pos = value_at;
                return Ok(Some(self));
            }
            // Not the one: remember it for a later out-of-order match.
            let value_start = self.skip_blanks(value_at);
            let span_end = self.value_span(value_start)?;
            if let FieldKey::Name(other) = key {
                trace!(field = %other, "saving unexpected field");
                self.scopes[scope_index].saved.push(SavedField {
                    name: other,
                    start: value_start,
                });
            }
            self.pos = span_end;
        }
    }

    fn value(&mut self) -> &mut dyn ValueIn {
        self
    }

    fn has_more_fields(&mut self) -> WireResult<bool> {
        self.prepare();
        Ok(!matches!(self.at(self.pos), None | Some(b'}')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(text: &str) -> TextIn {
        TextIn::new(TextDialect::Yaml, Bytes::copy_from_slice(text.as_bytes()), 0)
    }

    #[test]
    fn scalars_pull_by_name() {
        let mut input = reader("a: 1\nb: true\nc: Hello World\n");
        let v = input.read_field("a").expect("a").expect("present");
        assert_eq!(v.read_i32().expect("int"), 1);
        let v = input.read_field("b").expect("b").expect("present");
        assert!(v.read_bool().expect("bool"));
        let v = input.read_field("c").expect("c").expect("present");
        assert_eq!(v.read_text().expect("text"), "Hello World");
    }

    #[test]
    fn out_of_order_fields_match_from_saved_positions() {
        let mut input = reader("x: 1\ny: 2\nz: 3\n");
        let v = input.read_field("z").expect("z").expect("present");
        assert_eq!(v.read_i32().expect("int"), 3);
        // x and y were saved while scanning; both still readable.
        let v = input.read_field("y").expect("y").expect("present");
        assert_eq!(v.read_i32().expect("int"), 2);
        let v = input.read_field("x").expect("x").expect("present");
        assert_eq!(v.read_i32().expect("int"), 1);
        assert!(input.read_field("w").expect("w").is_none());
    }

    #[test]
    fn range_violation_leaves_cursor_unchanged() {
        let mut input = reader("VALUE: 9223372036854775807\n");
        let v = input.read_field("VALUE").expect("field").expect("present");
        let err = v.read_i16().expect_err("too wide");
        assert!(matches!(err, WireError::RangeViolation { .. }));
        // The same pull at the same cursor succeeds at the right width.
        assert_eq!(v.read_i64().expect("i64"), i64::MAX);
    }

    #[test]
    fn nested_record_reads_with_limit() {
        let mut input = reader("A: {\n  one: 1,\n  two: 2\n}\n");
        let v = input.read_field("A").expect("A").expect("present");
        v.read_record(&mut |fields| {
            let one = fields.read_field("one")?.expect("one");
            assert_eq!(one.read_i32()?, 1);
            let two = fields.read_field("two")?.expect("two");
            assert_eq!(two.read_i32()?, 2);
            assert!(!fields.has_more_fields()?);
            Ok(())
        })
        .expect("record");
    }

    #[test]
    fn sequences_iterate_with_has_next() {
        let mut input = reader("s: [ 1, 2, 3 ]\n");
        let v = input.read_field("s").expect("s").expect("present");
        let mut items = Vec::new();
        v.read_sequence(&mut |seq| {
            while seq.has_next()? {
                items.push(seq.read_i32()?);
            }
            Ok(())
        })
        .expect("sequence");
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn null_and_typed_values() {
        let mut input = reader("n: !!null \"\"\nv: !Dto { one: 1 }\n");
        let v = input.read_field("n").expect("n").expect("present");
        assert!(v.is_null().expect("null"));
        let v = input.read_field("v").expect("v").expect("present");
        assert_eq!(v.read_type_prefix().expect("prefix").as_deref(), Some("Dto"));
        v.read_record(&mut |fields| {
            assert_eq!(fields.read_field("one")?.expect("one").read_i32()?, 1);
            Ok(())
        })
        .expect("record");
    }

    #[test]
    fn quoted_strings_unescape() {
        let mut input = reader("a: \"line\\nbreak\"\nb: 'say \"hi\"'\nc: \"\\x41\\u0042\"\n");
        assert_eq!(
            input.read_field("a").expect("a").expect("present").read_text().expect("text"),
            "line\nbreak"
        );
        assert_eq!(
            input.read_field("b").expect("b").expect("present").read_text().expect("text"),
            "say \"hi\""
        );
        assert_eq!(
            input.read_field("c").expect("c").expect("present").read_text().expect("text"),
            "AB"
        );
    }

    #[test]
    fn bytes_and_comments() {
        let mut input = reader("# leading note\nb: !binary aGk=\n");
        let v = input.read_field("b").expect("b").expect("present");
        assert_eq!(v.read_bytes().expect("bytes"), b"hi");
    }

    #[test]
    fn value_fallback_chain() {
        let cases = [
            ("i: 42\n", Value::I64(42)),
            ("i: 1_000\n", Value::I64(1000)),
            ("i: 0x1a\n", Value::I64(26)),
            ("f: 123.456\n", Value::from_f64(123.456)),
            ("t: 12:34:56\n", Value::Time("12:34:56".parse().expect("time"))),
            ("d: 2021-06-01\n", Value::Date("2021-06-01".parse().expect("date"))),
            ("s: plain text\n", Value::Text("plain text".into())),
        ];
        for (text, expected) in cases {
            let mut input = reader(text);
            let key = input.next_field().expect("field").expect("present");
            assert!(matches!(key, FieldKey::Name(_)));
            assert_eq!(input.read_value().expect("value"), expected, "input {text:?}");
        }
    }

    #[test]
    fn read_length_measures_without_consuming() {
        let mut input = reader("m: { a: 1 }\nn: 5\n");
        input.next_field().expect("field").expect("m");
        let span = input.read_length().expect("length");
        assert_eq!(span, "{ a: 1 }".len());
        // Still readable after measuring.
        assert!(matches!(input.read_value().expect("value"), Value::Map(_)));
    }

    #[test]
    fn unterminated_record_is_reported() {
        let mut input = reader("m: { a: 1\n");
        input.next_field().expect("field").expect("m");
        let err = input.read_value().expect_err("unterminated");
        assert!(matches!(err, WireError::UnterminatedRecord { what: "record", .. }));
    }
}
