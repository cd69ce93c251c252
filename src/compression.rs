//! Compression codecs, looked up by name.
//!
//! The engine treats codecs as external collaborators: a compressed
//! sub-blob is tagged with the codec name and the registry resolves the
//! name at read time. Gzip, LZW and Snappy are registered out of the
//! box; callers may add their own.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, LazyLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};

/// A byte-blob compressor resolvable by name.
pub trait Compressor: Send + Sync {
    /// The registry name, e.g. `"gzip"`.
    fn name(&self) -> &'static str;

    /// Compresses `data`.
    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>>;

    /// Inflates `data` back to the original bytes.
    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>>;
}

/// Codec selector used in wire configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    /// DEFLATE with a gzip envelope.
    Gzip,
    /// LZW, the default of the compressed-binary wire.
    #[default]
    Lzw,
    /// Snappy raw blocks.
    Snappy,
}

impl CompressionCodec {
    /// The registry name of the selected codec.
    pub const fn name(&self) -> &'static str {
        match self {
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Lzw => "lzw",
            CompressionCodec::Snappy => "snappy",
        }
    }
}

fn codec_failure(name: &str, detail: impl std::fmt::Display) -> WireError {
    WireError::IoFailure {
        reason: format!("codec {name}: {detail}"),
        offset: 0,
    }
}

struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|()| encoder.finish())
            .map_err(|e| codec_failure("gzip", e))
    }

    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| codec_failure("gzip", e))?;
        Ok(out)
    }
}

struct Lzw;

impl Compressor for Lzw {
    fn name(&self) -> &'static str {
        "lzw"
    }

    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        weezl::encode::Encoder::new(weezl::BitOrder::Msb, 8)
            .encode(data)
            .map_err(|e| codec_failure("lzw", e))
    }

    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8)
            .decode(data)
            .map_err(|e| codec_failure("lzw", e))
    }
}

struct Snappy;

impl Compressor for Snappy {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| codec_failure("snappy", e))
    }

    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| codec_failure("snappy", e))
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<&'static str, Arc<dyn Compressor>>>> =
    LazyLock::new(|| {
        let mut map: HashMap<&'static str, Arc<dyn Compressor>> = HashMap::new();
        for codec in [
            Arc::new(Gzip) as Arc<dyn Compressor>,
            Arc::new(Lzw),
            Arc::new(Snappy),
        ] {
            map.insert(codec.name(), codec);
        }
        RwLock::new(map)
    });

/// Registers a codec; later registrations shadow earlier ones.
pub fn register(codec: Arc<dyn Compressor>) {
    REGISTRY
        .write()
        .expect("compression registry poisoned")
        .insert(codec.name(), codec);
}

/// Resolves a codec by name.
pub fn lookup(name: &str) -> WireResult<Arc<dyn Compressor>> {
    REGISTRY
        .read()
        .expect("compression registry poisoned")
        .get(name)
        .cloned()
        .ok_or_else(|| WireError::UnknownTypeTag {
            tag: name.to_owned(),
            offset: 0,
            excerpt: String::new(),
        })
}

/// Compresses through the named codec.
pub fn compress(name: &str, data: &[u8]) -> WireResult<Vec<u8>> {
    lookup(name)?.compress(data)
}

/// Inflates through the named codec.
pub fn decompress(name: &str, data: &[u8]) -> WireResult<Vec<u8>> {
    lookup(name)?.decompress(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_builtin_codecs_round_trip() {
        let data: Vec<u8> = b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(1024)
            .copied()
            .collect();
        for codec in ["gzip", "lzw", "snappy"] {
            let packed = compress(codec, &data).expect("compress");
            assert_ne!(packed, data, "{codec} should transform the data");
            assert_eq!(decompress(codec, &packed).expect("decompress"), data);
        }
    }

    #[test]
    fn unknown_codec_is_an_unknown_tag() {
        let err = compress("zstd", b"x").expect_err("unknown");
        assert!(matches!(err, WireError::UnknownTypeTag { tag, .. } if tag == "zstd"));
    }
}
