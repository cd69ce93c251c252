//! Error types shared by every layer of the engine.

use snafu::Snafu;

/// Longest byte excerpt attached to an error, before quoting.
pub const MAX_EXCERPT: usize = 256;

/// An error raised while writing or reading wire data.
///
/// Every variant carries the byte offset at which the problem was detected
/// and a short quoted excerpt of the surrounding bytes so that a failure in
/// the middle of a large buffer can be located without a hex dump.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    /// A stored integer does not fit the requested width.
    #[snafu(display("value {value} does not fit {target} at offset {offset}: {excerpt}"))]
    RangeViolation {
        /// Name of the requested width, e.g. `"i16"`.
        target: &'static str,
        /// The out-of-range value as stored.
        value: i128,
        /// Byte offset of the value.
        offset: u64,
        /// Quoted excerpt of the surrounding bytes.
        excerpt: String,
    },

    /// A scalar token cannot be coerced to the requested type.
    #[snafu(display("expected {expected} but found {found} at offset {offset}: {excerpt}"))]
    TypeMismatch {
        /// Name of the requested type.
        expected: &'static str,
        /// Short description of what was found instead.
        found: String,
        /// Byte offset of the offending token.
        offset: u64,
        /// Quoted excerpt of the surrounding bytes.
        excerpt: String,
    },

    /// Fewer bytes are available than a measured value requires.
    #[snafu(display(
        "needed {needed} bytes but only {available} available at offset {offset}: {excerpt}"
    ))]
    Truncation {
        /// Bytes the value requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
        /// Byte offset at which the shortfall was detected.
        offset: u64,
        /// Quoted excerpt of the surrounding bytes.
        excerpt: String,
    },

    /// A closing brace or bracket is missing.
    #[snafu(display("unterminated {what} starting at offset {offset}: {excerpt}"))]
    UnterminatedRecord {
        /// `"record"` or `"sequence"`.
        what: &'static str,
        /// Byte offset of the opening token.
        offset: u64,
        /// The partially-read bytes, for diagnostics.
        excerpt: String,
    },

    /// A type tag could not be resolved through the alias registry.
    #[snafu(display("unknown type tag {tag:?} at offset {offset}: {excerpt}"))]
    UnknownTypeTag {
        /// The unresolvable tag as read.
        tag: String,
        /// Byte offset of the tag.
        offset: u64,
        /// Quoted excerpt of the surrounding bytes.
        excerpt: String,
    },

    /// A document payload exceeds the 30-bit framing length limit.
    #[snafu(display("document payload of {length} bytes exceeds the 30-bit limit"))]
    PayloadTooLarge {
        /// The payload length that overflowed.
        length: u64,
        /// Byte offset of the document header.
        offset: u64,
    },

    /// A contended document header could not be acquired in time.
    #[snafu(display("timed out acquiring document header at offset {offset}"))]
    HeaderAcquireTimeout {
        /// Byte offset of the contended header word.
        offset: u64,
    },

    /// The underlying buffer failed.
    #[snafu(display("buffer failure at offset {offset}: {reason}"))]
    IoFailure {
        /// What the buffer reported.
        reason: String,
        /// Byte offset of the access.
        offset: u64,
    },
}

/// Convenience alias used throughout the crate.
pub type WireResult<T> = Result<T, WireError>;

/// Quote up to [`MAX_EXCERPT`] bytes around `offset` for attachment to an
/// error. Non-printable bytes are rendered as `\xHH` escapes.
pub(crate) fn excerpt_around(data: &[u8], offset: usize) -> String {
    let start = offset.saturating_sub(MAX_EXCERPT / 2).min(data.len());
    let end = (start + MAX_EXCERPT).min(data.len());
    excerpt_of(&data[start..end])
}

/// Quote a byte slice, bounded to [`MAX_EXCERPT`] bytes.
pub(crate) fn excerpt_of(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().min(MAX_EXCERPT) + 2);
    out.push('"');
    for &b in data.iter().take(MAX_EXCERPT) {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str(&format!("\\x{b:02x}"));
            }
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_quotes_printable_and_escapes_the_rest() {
        assert_eq!(excerpt_of(b"abc"), r#""abc""#);
        assert_eq!(excerpt_of(b"a\nb"), r#""a\nb""#);
        assert_eq!(excerpt_of(&[0x00, 0xff]), r#""\x00\xff""#);
    }

    #[test]
    fn excerpt_is_bounded() {
        let data = vec![b'x'; 4 * MAX_EXCERPT];
        let quoted = excerpt_around(&data, 2 * MAX_EXCERPT);
        assert!(quoted.len() <= MAX_EXCERPT + 2);
    }

    #[test]
    fn errors_display_offset_and_excerpt() {
        let err = WireError::TypeMismatch {
            expected: "bool",
            found: "tru".into(),
            offset: 7,
            excerpt: excerpt_of(b"tru"),
        };
        let text = err.to_string();
        assert!(text.contains("bool"));
        assert!(text.contains("offset 7"));
    }
}
