//! Diagnostic rendering of framed streams.

use crate::buffer::WireBuffer;
use crate::common::codes;
use crate::framing::DocumentsIn;

/// Renders every complete document in a buffer, each behind its
/// `--- !!data` or `--- !!meta-data` separator line. Text payloads are
/// rendered verbatim; binary payloads are annotated element by element.
pub fn documents_to_text<B: WireBuffer>(buffer: &B) -> String {
    let mut out = String::new();
    let walker = DocumentsIn::new(buffer);
    let docs: Vec<_> = DocumentsIn::new(buffer).collect();
    for doc in docs {
        out.push_str(if doc.meta { "--- !!meta-data\n" } else { "--- !!data\n" });
        let Ok(payload) = walker.payload(&doc) else {
            continue;
        };
        if looks_binary(&payload) {
            out.push_str(&dump_binary(&payload));
        } else {
            out.push_str(&String::from_utf8_lossy(&payload));
        }
    }
    out
}

fn looks_binary(payload: &[u8]) -> bool {
    payload
        .first()
        .is_some_and(|b| *b >= 0x80 || (*b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')))
}

/// Annotates a binary payload element by element: offset, lead-code
/// name, and a short value preview.
pub fn dump_binary(payload: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0usize;
    let mut indent = 0usize;
    while pos < payload.len() {
        let code = payload[pos];
        if matches!(code, codes::SEQUENCE_END) && indent > 0 {
            indent -= 1;
        }
        out.push_str(&format!("{pos:06x} "));
        for _ in 0..indent {
            out.push_str("  ");
        }
        pos = annotate(payload, pos, &mut out).unwrap_or(payload.len());
        out.push('\n');
        if matches!(code, codes::SEQUENCE_START) {
            indent += 1;
        }
    }
    out
}

fn string_at(payload: &[u8], at: usize) -> Option<(String, usize)> {
    let code = *payload.get(at)?;
    let (len, data_at) = match code {
        codes::STR_BASE..=0xbf => ((code & 0x3f) as usize, at + 1),
        codes::STRING_ANY | codes::STRING_8BIT => {
            let (len, next) = codes::get_varint(payload, at + 1).ok()?;
            (len as usize, next)
        }
        _ => return None,
    };
    let raw = payload.get(data_at..data_at + len)?;
    let text = if code == codes::STRING_8BIT {
        raw.iter().map(|b| *b as char).collect()
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    Some((text, data_at + len))
}

/// Writes one element's annotation, returning the position past it.
fn annotate(payload: &[u8], at: usize, out: &mut String) -> Option<usize> {
    let code = *payload.get(at)?;
    let name = codes::name_of(code);
    match code {
        0x00..=codes::SMALL_INT_MAX => {
            out.push_str(&format!("{name} {code}"));
            Some(at + 1)
        }
        codes::STR_BASE..=0xbf | codes::STRING_ANY | codes::STRING_8BIT => {
            let (text, next) = string_at(payload, at)?;
            out.push_str(&format!("{name} {text:?}"));
            Some(next)
        }
        codes::FIELD_BASE..=0xdf => {
            let len = (code & 0x1f) as usize;
            let raw = payload.get(at + 1..at + 1 + len)?;
            out.push_str(&format!("{name} {:?}", String::from_utf8_lossy(raw)));
            Some(at + 1 + len)
        }
        codes::FIELD_ANY => {
            let (len, data_at) = codes::get_varint(payload, at + 1).ok()?;
            let raw = payload.get(data_at..data_at + len as usize)?;
            out.push_str(&format!("{name} {:?}", String::from_utf8_lossy(raw)));
            Some(data_at + len as usize)
        }
        codes::FIELD_NUMBER => {
            let (id, next) = codes::get_varint(payload, at + 1).ok()?;
            out.push_str(&format!("{name} {id}"));
            Some(next)
        }
        codes::INT8 => {
            out.push_str(&format!("{name} {}", *payload.get(at + 1)? as i8));
            Some(at + 2)
        }
        codes::UINT8 => {
            out.push_str(&format!("{name} {}", payload.get(at + 1)?));
            Some(at + 2)
        }
        codes::INT16 | codes::UINT16 => {
            let raw: [u8; 2] = payload.get(at + 1..at + 3)?.try_into().ok()?;
            let value = i16::from_le_bytes(raw);
            out.push_str(&format!("{name} {value}"));
            Some(at + 3)
        }
        codes::INT32 | codes::UINT32 => {
            let raw: [u8; 4] = payload.get(at + 1..at + 5)?.try_into().ok()?;
            out.push_str(&format!("{name} {}", i32::from_le_bytes(raw)));
            Some(at + 5)
        }
        codes::INT64 | codes::UINT64 => {
            let raw: [u8; 8] = payload.get(at + 1..at + 9)?.try_into().ok()?;
            out.push_str(&format!("{name} {}", i64::from_le_bytes(raw)));
            Some(at + 9)
        }
        codes::FLOAT32 => {
            let raw: [u8; 4] = payload.get(at + 1..at + 5)?.try_into().ok()?;
            out.push_str(&format!("{name} {}", f32::from_le_bytes(raw)));
            Some(at + 5)
        }
        codes::FLOAT64 => {
            let raw: [u8; 8] = payload.get(at + 1..at + 9)?.try_into().ok()?;
            out.push_str(&format!("{name} {}", f64::from_le_bytes(raw)));
            Some(at + 9)
        }
        codes::TRUE | codes::FALSE | codes::NULL | codes::SEQUENCE_START | codes::SEQUENCE_END
        | codes::PADDING => {
            out.push_str(name);
            Some(at + 1)
        }
        codes::TYPE_PREFIX | codes::TYPE_LITERAL | codes::COMMENT | codes::TIME | codes::DATE
        | codes::DATE_TIME | codes::ZONED_DATE_TIME => {
            let (text, next) = string_at(payload, at + 1)?;
            out.push_str(&format!("{name} {text}"));
            Some(next)
        }
        codes::UUID => {
            let raw: [u8; 16] = payload.get(at + 1..at + 17)?.try_into().ok()?;
            out.push_str(&format!("{name} {}", uuid::Uuid::from_bytes(raw)));
            Some(at + 17)
        }
        codes::BYTES => {
            let (len, data_at) = codes::get_varint(payload, at + 1).ok()?;
            out.push_str(&format!("{name} {len} bytes"));
            Some(data_at + len as usize)
        }
        codes::RECORD => {
            let (len, body_at) = codes::get_varint(payload, at + 1).ok()?;
            out.push_str(&format!("{name} {len} bytes"));
            Some(body_at)
        }
        codes::COMPRESSED => {
            let (codec, lengths_at) = string_at(payload, at + 1)?;
            let (ulen, clen_at) = codes::get_varint(payload, lengths_at).ok()?;
            let (clen, data_at) = codes::get_varint(payload, clen_at).ok()?;
            out.push_str(&format!("{name} {codec} {clen} -> {ulen} bytes"));
            Some(data_at + clen as usize)
        }
        codes::I64_ARRAY => {
            let (count, data_at) = codes::get_varint(payload, at + 1).ok()?;
            out.push_str(&format!("{name} [{count}]"));
            Some(data_at + count as usize * 8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElasticBuffer;
    use crate::encoding::{FieldOut as _, ValueOut as _};
    use crate::wire::WireConfig;

    #[test]
    fn text_documents_render_behind_separators() {
        let mut wire = WireConfig::Text.build(ElasticBuffer::new());
        wire.write_document(false, |doc| doc.field("a")?.write_i32(1))
            .expect("data");
        wire.write_document(true, |doc| doc.field("note")?.write_text("meta"))
            .expect("meta");
        let rendered = documents_to_text(wire.buffer());
        assert_eq!(rendered, "--- !!data\na: 1\n--- !!meta-data\nnote: meta\n");
    }

    #[test]
    fn binary_documents_render_annotated() {
        let mut wire = WireConfig::Binary.build(ElasticBuffer::new());
        wire.write_document(false, |doc| doc.field("n")?.write_i32(300))
            .expect("data");
        let rendered = documents_to_text(wire.buffer());
        assert!(rendered.starts_with("--- !!data\n"));
        assert!(rendered.contains("field \"n\""));
        assert!(rendered.contains("i32 300"));
    }
}
