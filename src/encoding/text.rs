//! Writer half of the YAML-dialect text encoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FieldOut, ValueOut};
use crate::cell::{self, CellForm, Int32Ref, Int64ArrayRef, Int64Ref};
use crate::compression;
use crate::error::{WireError, WireResult};
use crate::value::Value;

/// Profile of the text dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextDialect {
    /// The YAML-like dialect with type tags and bare scalars.
    #[default]
    Yaml,
    /// JSON profile: quoted keys and strings, `null`, no type tags.
    Json,
    /// CSV profile: row-oriented, field names elided.
    Csv,
}

/// Characters that force quoting when they appear at position 0. A
/// leading double quote is in the set too: left bare, the reader would
/// lex the scalar as a quoted string.
const STARTS_QUOTE: &[u8] = b"?0123456789+- \t',#:{}[]|>!\0\x08\\\"";
/// Characters that force quoting anywhere after position 0; an interior
/// double quote stays bare.
const MUST_QUOTE: &[u8] = b"?,#:{}[]|>\0\x08\\";

fn needs_quoting(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.first() {
        None => return true,
        Some(first) if STARTS_QUOTE.contains(first) => return true,
        Some(_) => {}
    }
    if bytes.last().is_some_and(|b| *b == b' ' || *b == b'\t') {
        return true;
    }
    bytes
        .iter()
        .any(|b| MUST_QUOTE.contains(b) || *b < 0x20)
}

fn push_double_quoted(out: &mut BytesMut, s: &str) {
    out.put_u8(b'"');
    for c in s.chars() {
        match c {
            '\\' => out.put_slice(b"\\\\"),
            '"' => out.put_slice(b"\\\""),
            '\u{8}' => out.put_slice(b"\\b"),
            '\r' => out.put_slice(b"\\r"),
            '\n' => out.put_slice(b"\\n"),
            '\t' => out.put_slice(b"\\t"),
            '\0' => out.put_slice(b"\\0"),
            c if (c as u32) < 0x20 => {
                out.put_slice(format!("\\x{:02x}", c as u32).as_bytes());
            }
            c => {
                let mut tmp = [0u8; 4];
                out.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
    out.put_u8(b'"');
}

fn float_token(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_owned()
    } else if v == f64::INFINITY {
        "Infinity".to_owned()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_owned()
    } else {
        v.to_string()
    }
}

fn push_single_quoted(out: &mut BytesMut, s: &str) {
    out.put_u8(b'\'');
    for c in s.chars() {
        if c == '\'' {
            out.put_slice(b"''");
        } else {
            let mut tmp = [0u8; 4];
            out.put_slice(c.encode_utf8(&mut tmp).as_bytes());
        }
    }
    out.put_u8(b'\'');
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Top,
    Record,
    Sequence,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    leaf: bool,
    first: bool,
    sep_done: bool,
}

/// Writes the text encoding into a growable scratch buffer.
///
/// `base` is the absolute buffer offset the payload will land at, so
/// reference cells can capture their final position at write time.
#[derive(Debug)]
pub struct TextOut {
    out: BytesMut,
    base: usize,
    dialect: TextDialect,
    scopes: Vec<Scope>,
    pending_leaf: bool,
    pending_comments: Vec<String>,
}

impl TextOut {
    /// Creates a writer for a payload that will start at `base`.
    pub fn new(dialect: TextDialect, base: usize) -> Self {
        Self {
            out: BytesMut::new(),
            base,
            dialect,
            scopes: vec![Scope {
                kind: ScopeKind::Top,
                leaf: false,
                first: true,
                sep_done: false,
            }],
            pending_leaf: false,
            pending_comments: Vec::new(),
        }
    }

    /// The rendered payload.
    pub fn finish(mut self) -> Bytes {
        if self.dialect == TextDialect::Csv && !self.out.is_empty() {
            self.out.put_u8(b'\n');
        }
        self.out.freeze()
    }

    fn indent_level(&self) -> usize {
        self.scopes
            .iter()
            .filter(|s| s.kind != ScopeKind::Top && !s.leaf)
            .count()
    }

    fn push_indent(&mut self) {
        for _ in 0..self.indent_level() {
            self.out.put_slice(b"  ");
        }
    }

    fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack never empty")
    }

    fn begin_value(&mut self) {
        let scope = self.scopes.last().expect("scope stack never empty");
        if scope.sep_done || scope.kind != ScopeKind::Sequence {
            self.scope_mut().sep_done = true;
            return;
        }
        let (leaf, first) = (scope.leaf, scope.first);
        if leaf {
            self.out.put_slice(if first { b" " } else { b", " });
        } else {
            self.out.put_slice(if first { b"\n" } else { b",\n" });
            self.push_indent();
        }
        let scope = self.scope_mut();
        scope.first = false;
        scope.sep_done = true;
    }

    fn value_done(&mut self) {
        let top_level = {
            let scope = self.scope_mut();
            scope.sep_done = false;
            scope.first = false;
            scope.kind == ScopeKind::Top
        };
        if top_level && self.dialect != TextDialect::Csv {
            self.out.put_u8(b'\n');
        }
    }

    fn push_scalar(&mut self, token: &str) {
        self.begin_value();
        self.out.put_slice(token.as_bytes());
        self.value_done();
    }

    fn push_string(&mut self, s: &str) {
        self.begin_value();
        if self.dialect == TextDialect::Json {
            push_double_quoted(&mut self.out, s);
        } else if !needs_quoting(s) {
            self.out.put_slice(s.as_bytes());
        } else if s.contains('"') {
            push_single_quoted(&mut self.out, s);
        } else {
            push_double_quoted(&mut self.out, s);
        }
        self.value_done();
    }

    fn push_name(&mut self, name: &str) {
        if self.dialect == TextDialect::Json {
            push_double_quoted(&mut self.out, name);
        } else if needs_quoting(name) {
            push_double_quoted(&mut self.out, name);
        } else {
            self.out.put_slice(name.as_bytes());
        }
        self.out.put_slice(b": ");
    }

    /// Opens a composite, returning whether it renders as a leaf.
    fn open_composite(&mut self, kind: ScopeKind, bracket: u8) -> bool {
        self.begin_value();
        let inherited = self
            .scopes
            .last()
            .map(|s| s.leaf && s.kind != ScopeKind::Top)
            .unwrap_or(false);
        let leaf = self.pending_leaf || inherited || self.dialect == TextDialect::Csv;
        self.pending_leaf = false;
        self.out.put_u8(bracket);
        self.scopes.push(Scope {
            kind,
            leaf,
            first: true,
            sep_done: false,
        });
        leaf
    }

    fn close_composite(&mut self, bracket: u8) {
        let scope = self.scopes.pop().expect("scope stack never empty");
        if !scope.leaf && !self.pending_comments.is_empty() {
            let comments = std::mem::take(&mut self.pending_comments);
            for comment in comments {
                self.out.put_slice(if scope.first { b"\n" } else { b",\n" });
                self.push_indent();
                self.out.put_slice(b"  # ");
                self.out.put_slice(comment.as_bytes());
            }
        } else {
            self.pending_comments.clear();
        }
        if scope.first {
            self.out.put_u8(b' ');
        } else if scope.leaf {
            self.out.put_u8(b' ');
        } else {
            self.out.put_u8(b'\n');
            self.push_indent();
        }
        self.out.put_u8(bracket);
        self.value_done();
    }

    fn field_start(&mut self, name: &str) -> WireResult<()> {
        let kind = self.scopes.last().expect("scope stack never empty").kind;
        match kind {
            ScopeKind::Sequence => Err(WireError::TypeMismatch {
                expected: "record scope",
                found: "sequence scope".into(),
                offset: (self.base + self.out.len()) as u64,
                excerpt: String::new(),
            }),
            ScopeKind::Top => {
                let comments = std::mem::take(&mut self.pending_comments);
                if self.dialect == TextDialect::Csv {
                    if !self.scopes[0].first {
                        self.out.put_slice(b", ");
                    }
                } else {
                    for comment in comments {
                        self.out.put_slice(b"# ");
                        self.out.put_slice(comment.as_bytes());
                        self.out.put_u8(b'\n');
                    }
                    self.push_name(name);
                }
                let scope = self.scope_mut();
                scope.first = false;
                scope.sep_done = true;
                Ok(())
            }
            ScopeKind::Record => {
                let (leaf, first) = {
                    let scope = self.scopes.last().expect("scope stack never empty");
                    (scope.leaf, scope.first)
                };
                if leaf {
                    self.out.put_slice(if first { b" " } else { b", " });
                    self.pending_comments.clear();
                } else {
                    self.out.put_slice(if first { b"\n" } else { b",\n" });
                    let comments = std::mem::take(&mut self.pending_comments);
                    for comment in comments {
                        self.push_indent();
                        self.out.put_slice(b"# ");
                        self.out.put_slice(comment.as_bytes());
                        self.out.put_u8(b'\n');
                    }
                    self.push_indent();
                }
                if self.dialect != TextDialect::Csv {
                    self.push_name(name);
                }
                let scope = self.scope_mut();
                scope.first = false;
                scope.sep_done = true;
                Ok(())
            }
        }
    }
}

impl ValueOut for TextOut {
    fn write_bool(&mut self, v: bool) -> WireResult<()> {
        self.push_scalar(if v { "true" } else { "false" });
        Ok(())
    }

    fn write_i8(&mut self, v: i8) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_u8(&mut self, v: u8) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_i16(&mut self, v: i16) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> WireResult<()> {
        self.push_scalar(&v.to_string());
        Ok(())
    }

    fn write_f32(&mut self, v: f32) -> WireResult<()> {
        let token = if v.is_finite() {
            v.to_string()
        } else {
            float_token(f64::from(v))
        };
        self.push_scalar(&token);
        Ok(())
    }

    fn write_f64(&mut self, v: f64) -> WireResult<()> {
        self.push_scalar(&float_token(v));
        Ok(())
    }

    fn write_text(&mut self, v: &str) -> WireResult<()> {
        self.push_string(v);
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> WireResult<()> {
        let encoded = BASE64.encode(v);
        if self.dialect == TextDialect::Json {
            self.push_string(&encoded);
        } else {
            self.push_scalar(&format!("!binary {encoded}"));
        }
        Ok(())
    }

    fn write_byte_array(&mut self, v: &[u8]) -> WireResult<()> {
        if self.dialect == TextDialect::Json {
            return self.write_bytes(v);
        }
        self.push_scalar(&format!("!byte[] !binary {}", BASE64.encode(v)));
        Ok(())
    }

    fn write_time(&mut self, v: NaiveTime) -> WireResult<()> {
        let token = v.to_string();
        if self.dialect == TextDialect::Json {
            self.push_string(&token);
        } else {
            self.push_scalar(&token);
        }
        Ok(())
    }

    fn write_date(&mut self, v: NaiveDate) -> WireResult<()> {
        let token = v.to_string();
        if self.dialect == TextDialect::Json {
            self.push_string(&token);
        } else {
            self.push_scalar(&token);
        }
        Ok(())
    }

    fn write_date_time(&mut self, v: NaiveDateTime) -> WireResult<()> {
        let token = v.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
        if self.dialect == TextDialect::Json {
            self.push_string(&token);
        } else {
            self.push_scalar(&token);
        }
        Ok(())
    }

    fn write_zoned_date_time(&mut self, v: &DateTime<FixedOffset>) -> WireResult<()> {
        let token = v.to_rfc3339();
        if self.dialect == TextDialect::Json {
            self.push_string(&token);
        } else {
            self.push_scalar(&token);
        }
        Ok(())
    }

    fn write_uuid(&mut self, v: Uuid) -> WireResult<()> {
        if self.dialect == TextDialect::Json {
            self.push_string(&v.to_string());
        } else {
            self.push_scalar(&format!("!!uuid {v}"));
        }
        Ok(())
    }

    fn write_type_literal(&mut self, name: &str) -> WireResult<()> {
        if self.dialect == TextDialect::Json {
            self.push_string(name);
        } else {
            self.push_scalar(&format!("!type {name}"));
        }
        Ok(())
    }

    fn write_null(&mut self) -> WireResult<()> {
        if self.dialect == TextDialect::Json {
            self.push_scalar("null");
        } else {
            self.push_scalar("!!null \"\"");
        }
        Ok(())
    }

    fn type_prefix(&mut self, tag: &str) -> WireResult<&mut dyn ValueOut> {
        if self.dialect != TextDialect::Json {
            self.begin_value();
            self.out.put_u8(b'!');
            self.out.put_slice(tag.as_bytes());
            self.out.put_u8(b' ');
        }
        Ok(self)
    }

    fn leaf(&mut self) -> &mut dyn ValueOut {
        self.pending_leaf = true;
        self
    }

    fn write_sequence(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ValueOut) -> WireResult<()>,
    ) -> WireResult<()> {
        self.open_composite(ScopeKind::Sequence, b'[');
        let result = body(self);
        self.close_composite(b']');
        result
    }

    fn write_record(
        &mut self,
        body: &mut dyn FnMut(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()> {
        self.open_composite(ScopeKind::Record, b'{');
        let result = body(self);
        self.close_composite(b'}');
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
            Value::I64(n) => self.write_i64(*n),
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
        self.begin_value();
        let offset = self.base + self.out.len();
        self.out
            .put_slice(format!("{v:<width$}", width = cell::I32_TEXT_WIDTH).as_bytes());
        self.value_done();
        Ok(Int32Ref::new(offset, CellForm::Text))
    }

    fn write_i64_ref(&mut self, v: i64) -> WireResult<Int64Ref> {
        self.begin_value();
        let offset = self.base + self.out.len();
        self.out
            .put_slice(format!("{v:<width$}", width = cell::I64_TEXT_WIDTH).as_bytes());
        self.value_done();
        Ok(Int64Ref::new(offset, CellForm::Text))
    }

    fn write_i64_array_ref(&mut self, vs: &[i64]) -> WireResult<Int64ArrayRef> {
        self.begin_value();
        self.out.put_slice(b"[ ");
        let first = self.base + self.out.len();
        for (i, v) in vs.iter().enumerate() {
            if i > 0 {
                self.out.put_slice(b", ");
            }
            self.out
                .put_slice(format!("{v:<width$}", width = cell::I64_TEXT_WIDTH).as_bytes());
        }
        self.out.put_slice(b" ]");
        self.value_done();
        Ok(Int64ArrayRef::new(first, vs.len(), CellForm::Text))
    }

    fn write_compressed(&mut self, codec: &str, payload: &[u8]) -> WireResult<()> {
        let compressed = compression::compress(codec, payload)?;
        self.push_scalar(&format!("!{codec} !binary {}", BASE64.encode(&compressed)));
        Ok(())
    }
}

impl FieldOut for TextOut {
    fn field(&mut self, name: &str) -> WireResult<&mut dyn ValueOut> {
        self.field_start(name)?;
        Ok(self)
    }

    fn field_id(&mut self, _id: u64, name: &str) -> WireResult<&mut dyn ValueOut> {
        // The text encoding always carries names.
        self.field(name)
    }

    fn comment(&mut self, text: &str) -> WireResult<()> {
        if self.dialect == TextDialect::Yaml {
            self.pending_comments.push(text.to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn render(build: impl FnOnce(&mut TextOut) -> WireResult<()>) -> String {
        let mut out = TextOut::new(TextDialect::Yaml, 0);
        build(&mut out).expect("write");
        String::from_utf8(out.finish().to_vec()).expect("utf8")
    }

    #[test]
    fn multi_line_record() {
        let text = render(|out| {
            out.field("A")?.write_record(&mut |fields| {
                fields.field("B_FLAG")?.write_bool(true)?;
                fields.field("TEXT")?.write_text("Hello World")
            })
        });
        assert_eq!(
            text,
            indoc! {"
                A: {
                  B_FLAG: true,
                  TEXT: Hello World
                }
            "}
        );
    }

    #[test]
    fn leaf_record_is_single_line() {
        let text = render(|out| {
            out.field("m")?.leaf().write_record(&mut |fields| {
                fields.field("a")?.write_i32(1)?;
                fields.field("b")?.write_i32(2)
            })
        });
        assert_eq!(text, "m: { a: 1, b: 2 }\n");
    }

    #[test]
    fn empty_record_is_braced_pair() {
        let text = render(|out| out.field("m")?.leaf().write_record(&mut |_| Ok(())));
        assert_eq!(text, "m: { }\n");
    }

    #[test]
    fn nested_sequences_indent() {
        let text = render(|out| {
            out.field("s")?.write_sequence(&mut |items| {
                items.write_i32(1)?;
                items.leaf().write_sequence(&mut |inner| {
                    inner.write_i32(2)?;
                    inner.write_i32(3)
                })
            })
        });
        assert_eq!(
            text,
            indoc! {"
                s: [
                  1,
                  [ 2, 3 ]
                ]
            "}
        );
    }

    #[test]
    fn strings_quote_only_when_needed() {
        assert_eq!(render(|o| o.field("t")?.write_text("plain")), "t: plain\n");
        assert_eq!(render(|o| o.field("t")?.write_text("")), "t: \"\"\n");
        assert_eq!(
            render(|o| o.field("t")?.write_text("0 leads")),
            "t: \"0 leads\"\n"
        );
        assert_eq!(
            render(|o| o.field("t")?.write_text("a:b")),
            "t: \"a:b\"\n"
        );
        // An interior double quote is not in the must-quote class.
        assert_eq!(
            render(|o| o.field("t")?.write_text("say \"hi\"")),
            "t: say \"hi\"\n"
        );
        // A leading one is, and forces the single-quoted style.
        assert_eq!(
            render(|o| o.field("t")?.write_text("\"lead")),
            "t: '\"lead'\n"
        );
        assert_eq!(
            render(|o| o.field("t")?.write_text("line\nbreak")),
            "t: \"line\\nbreak\"\n"
        );
    }

    #[test]
    fn tagged_and_null_forms() {
        assert_eq!(render(|o| o.field("n")?.write_null()), "n: !!null \"\"\n");
        assert_eq!(
            render(|o| o.field("v")?.type_prefix("Dto")?.write_i32(5)),
            "v: !Dto 5\n"
        );
        assert_eq!(
            render(|o| o.field("c")?.write_type_literal("Dto")),
            "c: !type Dto\n"
        );
        assert_eq!(
            render(|o| o.field("b")?.write_bytes(b"hi")),
            "b: !binary aGk=\n"
        );
        assert_eq!(
            render(|o| o.field("b")?.write_byte_array(b"hi")),
            "b: !byte[] !binary aGk=\n"
        );
    }

    #[test]
    fn reference_cells_are_fixed_width() {
        let mut out = TextOut::new(TextDialect::Yaml, 0);
        out.field("lock").expect("field");
        let cell = out.write_i32_ref(7).expect("cell");
        let text = String::from_utf8(out.finish().to_vec()).expect("utf8");
        assert_eq!(text, format!("lock: {:<11}\n", 7));
        assert_eq!(cell.offset(), "lock: ".len());
    }

    #[test]
    fn json_profile_quotes_keys_and_strings() {
        let mut out = TextOut::new(TextDialect::Json, 0);
        out.field("m")
            .expect("field")
            .leaf()
            .write_record(&mut |fields| {
                fields.field("a")?.write_text("x")?;
                fields.field("n")?.write_null()
            })
            .expect("record");
        let text = String::from_utf8(out.finish().to_vec()).expect("utf8");
        assert_eq!(text, "\"m\": { \"a\": \"x\", \"n\": null }\n");
    }

    #[test]
    fn csv_profile_is_row_oriented() {
        let mut out = TextOut::new(TextDialect::Csv, 0);
        out.field("a").expect("field").write_i32(1).expect("value");
        out.field("b").expect("field").write_text("x,y").expect("value");
        let text = String::from_utf8(out.finish().to_vec()).expect("utf8");
        assert_eq!(text, "1, \"x,y\"\n");
    }
}
