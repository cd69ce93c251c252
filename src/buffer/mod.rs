//! The byte-buffer abstraction the engine reads and writes through.
//!
//! Two implementations are provided: [`ElasticBuffer`], a growable
//! single-threaded buffer, and [`SharedBuffer`], a fixed-capacity buffer
//! whose words are atomics so that independent wires on separate threads
//! can coordinate through header compare-and-swap.

mod shared;

use std::cell::RefCell;
use std::sync::Arc;

use bytes::Bytes;

pub use shared::SharedBuffer;

use crate::error::{WireError, WireResult};

/// Byte storage addressed by absolute offset.
///
/// All access goes through `&self`; implementations provide interior
/// mutability. The compare-and-swap operations return `Ok(prev)` on
/// success and `Err(actual)` when the current value did not match.
pub trait WireBuffer {
    /// Bytes readable from offset zero.
    fn len(&self) -> usize;

    /// True when nothing has been written.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound on `len()`, `usize::MAX` when growable.
    fn capacity(&self) -> usize;

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> WireResult<()>;

    /// Writes `src` starting at `offset`, growing the buffer if it can.
    fn write_at(&self, offset: usize, src: &[u8]) -> WireResult<()>;

    /// Loads the little-endian `u32` at a 4-byte-aligned `offset`.
    fn load_u32(&self, offset: usize) -> WireResult<u32>;

    /// Stores a little-endian `u32` at a 4-byte-aligned `offset`.
    fn store_u32(&self, offset: usize, value: u32) -> WireResult<()>;

    /// Atomically replaces the `u32` at `offset` if it equals `current`.
    fn cas_u32(&self, offset: usize, current: u32, new: u32) -> WireResult<Result<u32, u32>>;

    /// Loads the little-endian `u64` at an 8-byte-aligned `offset`.
    fn load_u64(&self, offset: usize) -> WireResult<u64>;

    /// Stores a little-endian `u64` at an 8-byte-aligned `offset`.
    fn store_u64(&self, offset: usize, value: u64) -> WireResult<()>;

    /// Atomically replaces the `u64` at `offset` if it equals `current`.
    fn cas_u64(&self, offset: usize, current: u64, new: u64) -> WireResult<Result<u64, u64>>;

    /// Copies the readable extent out as `Bytes`.
    fn snapshot(&self) -> Bytes {
        let mut data = vec![0u8; self.len()];
        // The extent cannot shrink, so this read is always in range.
        if self.read_at(0, &mut data).is_ok() {
            Bytes::from(data)
        } else {
            Bytes::new()
        }
    }
}

impl<T: WireBuffer + ?Sized> WireBuffer for Arc<T> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> WireResult<()> {
        (**self).read_at(offset, dst)
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> WireResult<()> {
        (**self).write_at(offset, src)
    }

    fn load_u32(&self, offset: usize) -> WireResult<u32> {
        (**self).load_u32(offset)
    }

    fn store_u32(&self, offset: usize, value: u32) -> WireResult<()> {
        (**self).store_u32(offset, value)
    }

    fn cas_u32(&self, offset: usize, current: u32, new: u32) -> WireResult<Result<u32, u32>> {
        (**self).cas_u32(offset, current, new)
    }

    fn load_u64(&self, offset: usize) -> WireResult<u64> {
        (**self).load_u64(offset)
    }

    fn store_u64(&self, offset: usize, value: u64) -> WireResult<()> {
        (**self).store_u64(offset, value)
    }

    fn cas_u64(&self, offset: usize, current: u64, new: u64) -> WireResult<Result<u64, u64>> {
        (**self).cas_u64(offset, current, new)
    }
}

/// A growable, single-threaded buffer.
///
/// This is the default backing store for one-writer wires. It is
/// deliberately `!Sync`; multi-writer coordination requires a
/// [`SharedBuffer`].
#[derive(Debug, Default)]
pub struct ElasticBuffer {
    data: RefCell<Vec<u8>>,
}

impl ElasticBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: RefCell::new(Vec::with_capacity(capacity)),
        }
    }

    /// Creates a buffer seeded with `data`, e.g. bytes read from a file.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RefCell::new(data),
        }
    }

    fn short_read(&self, offset: usize, needed: usize) -> WireError {
        let available = self.len().saturating_sub(offset);
        WireError::Truncation {
            needed,
            available,
            offset: offset as u64,
            excerpt: String::new(),
        }
    }
}

impl WireBuffer for ElasticBuffer {
    fn len(&self) -> usize {
        self.data.borrow().len()
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> WireResult<()> {
        let data = self.data.borrow();
        let end = offset + dst.len();
        if end > data.len() {
            return Err(self.short_read(offset, dst.len()));
        }
        dst.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> WireResult<()> {
        let mut data = self.data.borrow_mut();
        let end = offset + src.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(src);
        Ok(())
    }

    fn load_u32(&self, offset: usize) -> WireResult<u32> {
        let mut word = [0u8; 4];
        self.read_at(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn store_u32(&self, offset: usize, value: u32) -> WireResult<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    fn cas_u32(&self, offset: usize, current: u32, new: u32) -> WireResult<Result<u32, u32>> {
        // Single-threaded buffer: plain compare-then-store.
        let have = if offset + 4 <= self.len() {
            self.load_u32(offset)?
        } else {
            0
        };
        if have != current {
            return Ok(Err(have));
        }
        self.store_u32(offset, new)?;
        Ok(Ok(current))
    }

    fn load_u64(&self, offset: usize) -> WireResult<u64> {
        let mut word = [0u8; 8];
        self.read_at(offset, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    fn store_u64(&self, offset: usize, value: u64) -> WireResult<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    fn cas_u64(&self, offset: usize, current: u64, new: u64) -> WireResult<Result<u64, u64>> {
        let have = if offset + 8 <= self.len() {
            self.load_u64(offset)?
        } else {
            0
        };
        if have != current {
            return Ok(Err(have));
        }
        self.store_u64(offset, new)?;
        Ok(Ok(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elastic_grows_on_write() {
        let buf = ElasticBuffer::new();
        buf.write_at(4, b"abc").expect("write");
        assert_eq!(buf.len(), 7);
        let mut out = [0u8; 7];
        buf.read_at(0, &mut out).expect("read");
        assert_eq!(&out, b"\0\0\0\0abc");
    }

    #[test]
    fn elastic_read_past_end_is_truncation() {
        let buf = ElasticBuffer::from_vec(vec![1, 2, 3]);
        let mut out = [0u8; 4];
        let err = buf.read_at(1, &mut out).expect_err("short");
        assert!(matches!(err, WireError::Truncation { needed: 4, available: 2, .. }));
    }

    #[test]
    fn elastic_cas_observes_mismatch() {
        let buf = ElasticBuffer::new();
        buf.store_u32(0, 7).expect("store");
        assert_eq!(buf.cas_u32(0, 7, 9).expect("cas"), Ok(7));
        assert_eq!(buf.cas_u32(0, 7, 11).expect("cas"), Err(9));
        assert_eq!(buf.load_u32(0).expect("load"), 9);
    }

    #[test]
    fn elastic_cas_against_unwritten_header_sees_zero() {
        let buf = ElasticBuffer::new();
        assert_eq!(buf.cas_u32(0, 0, 5).expect("cas"), Ok(0));
        assert_eq!(buf.load_u32(0).expect("load"), 5);
    }
}
