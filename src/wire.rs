//! The wire-type registry: one configured encoder/decoder pair bound to
//! a buffer.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::WireBuffer;
use crate::compression::CompressionCodec;
use crate::decoding::{BinaryIn, FieldIn, TextIn, copy_fields};
use crate::encoding::binary::BinaryOptions;
use crate::encoding::text::TextDialect;
use crate::encoding::{BinaryOut, FieldOut, TextOut};
use crate::error::{WireError, WireResult};
use crate::framing::{
    self, HEADER_BYTES, acquire_slot, is_meta, is_ready, length_of, next_header, seal_slot,
};

/// Selects one of the available wire types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "wire", rename_all = "snake_case")]
pub enum WireConfig {
    /// The YAML-dialect text encoding.
    #[default]
    Text,
    /// The tagged binary encoding.
    Binary,
    /// Binary without field-name codes; fields are positional.
    BinaryFieldless,
    /// Binary with automatic compression above the configured
    /// threshold.
    CompressedBinary,
    /// Binary without framing, for fixed-layout payloads.
    Raw,
    /// JSON profile of the text dialect.
    Json,
    /// Row-oriented CSV profile of the text dialect.
    Csv,
    /// Reader-only wire that sniffs each document to pick text or
    /// binary.
    ReadAny,
}

impl WireConfig {
    /// Builds a wire over `buffer` with default options.
    pub fn build<B: WireBuffer>(&self, buffer: B) -> Wire<B> {
        self.build_with(buffer, WireOptions::default())
    }

    /// Builds a wire over `buffer`.
    pub fn build_with<B: WireBuffer>(&self, buffer: B, options: WireOptions) -> Wire<B> {
        Wire {
            buffer,
            config: *self,
            options,
            read_pos: 0,
            read_data_count: 0,
            write_pos: 0,
            data_before_write: 0,
        }
    }

    /// True when documents are size-prefixed on this wire.
    pub const fn framed(&self) -> bool {
        !matches!(self, WireConfig::Raw | WireConfig::Csv)
    }

    fn text_dialect(&self) -> Option<TextDialect> {
        match self {
            WireConfig::Text => Some(TextDialect::Yaml),
            WireConfig::Json => Some(TextDialect::Json),
            WireConfig::Csv => Some(TextDialect::Csv),
            _ => None,
        }
    }
}

/// Tunables shared by every wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOptions {
    /// Elide field-name codes in the binary encoding.
    #[serde(default)]
    pub field_less: bool,

    /// Emit numeric field ids instead of names in the binary encoding.
    #[serde(default)]
    pub numeric_id: bool,

    /// Emit 8-bit text instead of UTF-8 when every char fits one byte.
    #[serde(default)]
    pub use_8bit_text: bool,

    /// Payload size above which a compressed-binary wire compresses,
    /// in bytes.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Codec used by the compressed-binary wire.
    #[serde(default)]
    pub compression_codec: CompressionCodec,

    /// Bound on the spin for a contended document header, in
    /// milliseconds.
    #[serde(default = "default_header_timeout_ms")]
    pub header_timeout_ms: u64,
}

const fn default_compression_threshold() -> usize {
    128
}

const fn default_header_timeout_ms() -> u64 {
    5_000
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            field_less: false,
            numeric_id: false,
            use_8bit_text: false,
            compression_threshold: default_compression_threshold(),
            compression_codec: CompressionCodec::default(),
            header_timeout_ms: default_header_timeout_ms(),
        }
    }
}

impl WireOptions {
    fn binary(&self, field_less: bool) -> BinaryOptions {
        BinaryOptions {
            field_less: self.field_less || field_less,
            numeric_id: self.numeric_id,
            use_8bit_text: self.use_8bit_text,
        }
    }

    fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }
}

enum Writer {
    Text(TextOut),
    Binary(BinaryOut),
}

enum Reader {
    Text(TextIn),
    Binary(BinaryIn),
}

/// One configured encoder/decoder pair bound to a buffer.
///
/// A wire owns its read and write cursors and must not be shared across
/// threads; independent wires may share one buffer and coordinate
/// through the header protocol.
#[derive(Debug)]
pub struct Wire<B> {
    buffer: B,
    config: WireConfig,
    options: WireOptions,
    read_pos: usize,
    read_data_count: u64,
    write_pos: usize,
    data_before_write: u64,
}

impl<B: WireBuffer> Wire<B> {
    /// The underlying buffer, e.g. for reference-cell operations.
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// The wire type this wire was built from.
    pub fn config(&self) -> WireConfig {
        self.config
    }

    /// Snapshot of everything written so far.
    pub fn bytes(&self) -> Bytes {
        self.buffer.snapshot()
    }

    /// Resets the read cursor to the start of the buffer.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
        self.read_data_count = 0;
    }

    fn make_writer(&self, base: usize) -> WireResult<Writer> {
        if let Some(dialect) = self.config.text_dialect() {
            return Ok(Writer::Text(TextOut::new(dialect, base)));
        }
        match self.config {
            WireConfig::Binary | WireConfig::CompressedBinary | WireConfig::Raw => Ok(
                Writer::Binary(BinaryOut::new(self.options.binary(false), base)),
            ),
            WireConfig::BinaryFieldless => {
                Ok(Writer::Binary(BinaryOut::new(self.options.binary(true), base)))
            }
            _ => Err(WireError::IoFailure {
                reason: "read-any wires are read-only".into(),
                offset: base as u64,
            }),
        }
    }

    fn encode_payload(
        &self,
        base: usize,
        body: impl FnOnce(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<Bytes> {
        let mut writer = self.make_writer(base)?;
        match &mut writer {
            Writer::Text(out) => body(out)?,
            Writer::Binary(out) => body(out)?,
        }
        Ok(match writer {
            Writer::Text(out) => out.finish(),
            Writer::Binary(out) => out.finish(),
        })
    }

    /// Writes one framed document; the payload is rendered by `body`
    /// and the header is back-patched with the final length on exit.
    /// An error from `body` abandons the slot with the not-complete bit
    /// set, so readers never observe a half-written document.
    pub fn write_document(
        &mut self,
        meta: bool,
        body: impl FnOnce(&mut dyn FieldOut) -> WireResult<()>,
    ) -> WireResult<()> {
        if !self.config.framed() {
            let base = self.write_pos;
            let payload = self.encode_payload(base, body)?;
            self.buffer.write_at(base, &payload)?;
            self.write_pos = base + payload.len();
            return Ok(());
        }
        let slot = acquire_slot(
            &self.buffer,
            self.write_pos,
            self.data_before_write,
            meta,
            self.options.header_timeout(),
        )?;
        let payload = self.encode_payload(slot.payload, body)?;
        let payload = self.maybe_compress(slot.payload, payload)?;
        self.buffer.write_at(slot.payload, &payload)?;
        seal_slot(&self.buffer, slot.header, payload.len(), meta)?;
        self.write_pos = next_header(slot.payload + payload.len());
        if let Some(number) = slot.number {
            self.data_before_write = number + 1;
            debug!(number, "wrote data document");
        }
        Ok(())
    }

    /// The compression hook: oversized compressed-binary payloads are
    /// wrapped in a compressed sub-blob tagged by codec name.
    fn maybe_compress(&self, base: usize, payload: Bytes) -> WireResult<Bytes> {
        if self.config != WireConfig::CompressedBinary
            || payload.len() <= self.options.compression_threshold
        {
            return Ok(payload);
        }
        use crate::encoding::ValueOut as _;
        let mut out = BinaryOut::new(self.options.binary(false), base);
        out.write_compressed(self.options.compression_codec.name(), &payload)?;
        Ok(out.finish())
    }

    /// Writes the well-known end-of-stream marker at the next free
    /// header slot.
    pub fn write_end_of_stream(&mut self) -> WireResult<()> {
        if !self.config.framed() {
            return Ok(());
        }
        let deadline = std::time::Instant::now() + self.options.header_timeout();
        let mut pos = self.write_pos;
        loop {
            let header = if pos + HEADER_BYTES > self.buffer.len() {
                framing::NOT_INITIALIZED
            } else {
                self.buffer.load_u32(pos)?
            };
            if header == framing::NOT_INITIALIZED {
                if self
                    .buffer
                    .cas_u32(pos, framing::NOT_INITIALIZED, framing::END_OF_STREAM)?
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if framing::is_in_progress(header) {
                if std::time::Instant::now() >= deadline {
                    return Err(WireError::HeaderAcquireTimeout { offset: pos as u64 });
                }
                std::thread::yield_now();
                continue;
            }
            pos = next_header(pos + HEADER_BYTES + length_of(header));
        }
    }

    fn payload_bytes(&self, start: usize, end: usize) -> WireResult<Bytes> {
        let mut data = vec![0u8; end - start];
        self.buffer.read_at(start, &mut data)?;
        Ok(Bytes::from(data))
    }

    fn make_reader(&self, payload: Bytes, base: usize) -> WireResult<Reader> {
        if let Some(dialect) = self.config.text_dialect() {
            return Ok(Reader::Text(TextIn::new(dialect, payload, base)));
        }
        match self.config {
            WireConfig::Binary | WireConfig::CompressedBinary | WireConfig::Raw => Ok(
                Reader::Binary(BinaryIn::new(self.options.binary(false), payload, base)),
            ),
            WireConfig::BinaryFieldless => Ok(Reader::Binary(BinaryIn::new(
                self.options.binary(true),
                payload,
                base,
            ))),
            _ => {
                // Read-any: sniff the leading byte. Inline string and
                // field codes, small ints and fixed codes all fall
                // outside printable ASCII; text payloads start with a
                // printable char or whitespace.
                let lead = payload.first().copied().unwrap_or(0);
                if lead >= 0x80 || (lead < 0x20 && !matches!(lead, b'\t' | b'\n' | b'\r')) {
                    Ok(Reader::Binary(BinaryIn::new(
                        self.options.binary(false),
                        payload,
                        base,
                    )))
                } else {
                    Ok(Reader::Text(TextIn::new(TextDialect::Yaml, payload, base)))
                }
            }
        }
    }

    /// Inflates a compressed-binary payload when the compression hook
    /// fired at write time.
    fn maybe_decompress(&self, payload: Bytes, base: usize) -> WireResult<Bytes> {
        if self.config.text_dialect().is_some()
            || payload.first() != Some(&crate::common::codes::COMPRESSED)
        {
            return Ok(payload);
        }
        use crate::decoding::ValueIn as _;
        let mut reader = BinaryIn::new(self.options.binary(false), payload, base);
        Ok(Bytes::from(reader.read_compressed()?))
    }

    /// Binds to the next framed document for reading. `is_present` on
    /// the returned context tells whether a fully-written document was
    /// available; on drop the cursor advances past the document
    /// regardless of how much was consumed.
    pub fn read_document(&mut self) -> WireResult<DocumentIn<'_, B>> {
        if !self.config.framed() {
            return self.read_unframed();
        }
        let at = self.read_pos;
        if at + HEADER_BYTES > self.buffer.len() {
            return Ok(DocumentIn::absent(self));
        }
        let header = self.buffer.load_u32(at)?;
        if !is_ready(header) {
            return Ok(DocumentIn::absent(self));
        }
        let meta = is_meta(header);
        let start = at + HEADER_BYTES;
        let end = start + length_of(header);
        let payload = self.payload_bytes(start, end)?;
        let payload = self.maybe_decompress(payload, start)?;
        let reader = self.make_reader(payload, start)?;
        let number = (!meta).then_some(self.read_data_count);
        Ok(DocumentIn {
            present: true,
            meta,
            number,
            end,
            reader: Some(reader),
            wire: self,
        })
    }

    fn read_unframed(&mut self) -> WireResult<DocumentIn<'_, B>> {
        let start = self.read_pos;
        let available = self.buffer.len();
        if start >= available {
            return Ok(DocumentIn::absent(self));
        }
        let end = if self.config == WireConfig::Csv {
            let data = self.payload_bytes(start, available)?;
            match memchr::memchr(b'\n', &data) {
                Some(at) => start + at + 1,
                None => available,
            }
        } else {
            available
        };
        let payload = self.payload_bytes(start, end)?;
        let reader = self.make_reader(payload, start)?;
        Ok(DocumentIn {
            present: true,
            meta: false,
            number: Some(self.read_data_count),
            end,
            reader: Some(reader),
            wire: self,
        })
    }

    /// Copies the next document to another wire, preserving logical
    /// values while adopting the destination's encoding. Returns false
    /// when no document was available.
    pub fn copy_document_to<B2: WireBuffer>(&mut self, dst: &mut Wire<B2>) -> WireResult<bool> {
        let mut doc = self.read_document()?;
        if !doc.is_present() {
            return Ok(false);
        }
        let meta = doc.is_meta();
        let fields = doc.fields()?;
        dst.write_document(meta, |out| copy_fields(fields, out))?;
        Ok(true)
    }
}

/// A scoped binding to one readable document.
pub struct DocumentIn<'w, B: WireBuffer> {
    wire: &'w mut Wire<B>,
    present: bool,
    meta: bool,
    number: Option<u64>,
    end: usize,
    reader: Option<Reader>,
}

impl<'w, B: WireBuffer> DocumentIn<'w, B> {
    fn absent(wire: &'w mut Wire<B>) -> Self {
        Self {
            wire,
            present: false,
            meta: false,
            number: None,
            end: 0,
            reader: None,
        }
    }

    /// True when a fully-written document was available.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// True for metadata documents.
    pub fn is_meta(&self) -> bool {
        self.meta
    }

    /// True for data documents.
    pub fn is_data(&self) -> bool {
        self.present && !self.meta
    }

    /// The document's sequence number among data documents.
    pub fn number(&self) -> Option<u64> {
        self.number
    }

    /// The named-field surface of the payload.
    pub fn fields(&mut self) -> WireResult<&mut dyn FieldIn> {
        match self.reader.as_mut() {
            Some(Reader::Text(reader)) => Ok(reader),
            Some(Reader::Binary(reader)) => Ok(reader),
            None => Err(WireError::IoFailure {
                reason: "document not present".into(),
                offset: 0,
            }),
        }
    }

    /// The value surface of the payload, for documents that carry a
    /// bare value stream.
    pub fn content(&mut self) -> WireResult<&mut dyn crate::decoding::ValueIn> {
        match self.reader.as_mut() {
            Some(Reader::Text(reader)) => Ok(reader),
            Some(Reader::Binary(reader)) => Ok(reader),
            None => Err(WireError::IoFailure {
                reason: "document not present".into(),
                offset: 0,
            }),
        }
    }
}

impl<B: WireBuffer> Drop for DocumentIn<'_, B> {
    fn drop(&mut self) {
        if self.present {
            // Re-synchronize past the document however much was read.
            self.wire.read_pos = if self.wire.config.framed() {
                next_header(self.end)
            } else {
                self.end
            };
            if self.number.is_some() {
                self.wire.read_data_count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElasticBuffer;
    use crate::decoding::{FieldKey, ValueIn as _};
    use crate::encoding::ValueOut as _;

    #[test]
    fn framed_text_documents_round_trip() {
        let mut wire = WireConfig::Text.build(ElasticBuffer::new());
        wire.write_document(false, |doc| doc.field("a")?.write_i32(1))
            .expect("write");
        wire.write_document(false, |doc| doc.field("b")?.write_i32(2))
            .expect("write");

        let mut doc = wire.read_document().expect("read");
        assert!(doc.is_data());
        assert_eq!(doc.number(), Some(0));
        let fields = doc.fields().expect("fields");
        let v = fields.read_field("a").expect("a").expect("present");
        assert_eq!(v.read_i32().expect("i32"), 1);
        drop(doc);

        let mut doc = wire.read_document().expect("read");
        assert_eq!(doc.number(), Some(1));
        let fields = doc.fields().expect("fields");
        assert_eq!(
            fields.read_field("b").expect("b").expect("present").read_i32().expect("i32"),
            2
        );
        drop(doc);

        let doc = wire.read_document().expect("read");
        assert!(!doc.is_present());
    }

    #[test]
    fn meta_documents_are_transparent_to_numbering() {
        let mut wire = WireConfig::Binary.build(ElasticBuffer::new());
        wire.write_document(true, |doc| doc.field("h")?.write_text("header"))
            .expect("meta");
        wire.write_document(false, |doc| doc.field("x")?.write_i32(9))
            .expect("data");

        let doc = wire.read_document().expect("read");
        assert!(doc.is_meta());
        assert_eq!(doc.number(), None);
        drop(doc);
        let doc = wire.read_document().expect("read");
        assert!(doc.is_data());
        assert_eq!(doc.number(), Some(0));
    }

    #[test]
    fn abandoned_document_reads_as_absent() {
        let mut wire = WireConfig::Binary.build(ElasticBuffer::new());
        let err = wire
            .write_document(false, |doc| {
                doc.field("x")?.write_i32(1)?;
                Err(WireError::IoFailure {
                    reason: "boom".into(),
                    offset: 0,
                })
            })
            .expect_err("body fails");
        assert!(matches!(err, WireError::IoFailure { .. }));
        let doc = wire.read_document().expect("read");
        assert!(!doc.is_present());
    }

    #[test]
    fn cross_encoding_copy_preserves_values() {
        let mut text = WireConfig::Text.build(ElasticBuffer::new());
        text.write_document(false, |doc| {
            doc.field("count")?.write_i32(3)?;
            doc.field("label")?.write_text("hello")?;
            Ok(())
        })
        .expect("write");

        let mut binary = WireConfig::Binary.build(ElasticBuffer::new());
        assert!(text.copy_document_to(&mut binary).expect("copy"));

        let mut doc = binary.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        assert_eq!(
            fields.read_field("count").expect("count").expect("present").read_i64().expect("int"),
            3
        );
        assert_eq!(
            fields.read_field("label").expect("label").expect("present").read_text().expect("text"),
            "hello"
        );
    }

    #[test]
    fn compressed_binary_inflates_transparently() {
        let mut wire = WireConfig::CompressedBinary.build(ElasticBuffer::new());
        let long = "x".repeat(600);
        wire.write_document(false, |doc| doc.field("body")?.write_text(&long))
            .expect("write");

        // The framed payload is the compressed envelope, not the text.
        let raw = wire.bytes();
        assert_eq!(raw[HEADER_BYTES], crate::common::codes::COMPRESSED);
        assert!(raw.len() < long.len());

        let mut doc = wire.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        assert_eq!(
            fields.read_field("body").expect("body").expect("present").read_text().expect("text"),
            long
        );
    }

    #[test]
    fn read_any_sniffs_per_document() {
        let mut text = WireConfig::Text.build(ElasticBuffer::new());
        text.write_document(false, |doc| doc.field("kind")?.write_text("text"))
            .expect("write");
        let mut binary = WireConfig::Binary.build(ElasticBuffer::from_vec(
            text.bytes().to_vec(),
        ));
        binary.write_pos = text.write_pos;
        binary.data_before_write = 1;
        binary
            .write_document(false, |doc| doc.field("kind")?.write_text("binary"))
            .expect("write");

        let mut any = WireConfig::ReadAny.build(ElasticBuffer::from_vec(binary.bytes().to_vec()));
        for expected in ["text", "binary"] {
            let mut doc = any.read_document().expect("read");
            assert!(doc.is_present());
            let fields = doc.fields().expect("fields");
            assert_eq!(
                fields.read_field("kind").expect("kind").expect("present").read_text().expect("text"),
                expected
            );
        }
    }

    #[test]
    fn csv_rows_are_positional_documents() {
        let mut wire = WireConfig::Csv.build(ElasticBuffer::new());
        wire.write_document(false, |doc| {
            doc.field("a")?.write_i32(1)?;
            doc.field("b")?.write_text("two")?;
            Ok(())
        })
        .expect("row 1");
        wire.write_document(false, |doc| {
            doc.field("a")?.write_i32(3)?;
            doc.field("b")?.write_text("four")?;
            Ok(())
        })
        .expect("row 2");

        let mut doc = wire.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        assert_eq!(fields.next_field().expect("field"), Some(FieldKey::Position(0)));
        assert_eq!(fields.value().read_i32().expect("i32"), 1);
        assert_eq!(fields.next_field().expect("field"), Some(FieldKey::Position(1)));
        assert_eq!(fields.value().read_text().expect("text"), "two");
        drop(doc);

        let mut doc = wire.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        fields.next_field().expect("field").expect("present");
        assert_eq!(fields.value().read_i32().expect("i32"), 3);
    }
}
