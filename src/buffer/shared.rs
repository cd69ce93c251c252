//! Fixed-capacity buffer with atomic word access for multi-writer use.

use std::sync::atomic::{AtomicU64, Ordering};

use super::WireBuffer;
use crate::error::{WireError, WireResult};

/// A fixed-capacity buffer whose storage is an array of atomic 64-bit
/// words, so independent wires on separate threads can write disjoint
/// regions and race on document headers with compare-and-swap.
///
/// Logical byte `i` lives in word `i / 8` at little-endian lane
/// `i % 8`. Partial-word writes merge through a CAS loop so that two
/// writers touching different bytes of the same boundary word cannot
/// clobber each other.
#[derive(Debug)]
pub struct SharedBuffer {
    words: Box<[AtomicU64]>,
    capacity: usize,
}

impl SharedBuffer {
    /// Allocates a zero-filled buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let word_count = capacity.div_ceil(8);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, capacity }
    }

    fn word(&self, index: usize) -> WireResult<&AtomicU64> {
        self.words.get(index).ok_or_else(|| WireError::IoFailure {
            reason: format!("offset beyond capacity {}", self.capacity),
            offset: (index * 8) as u64,
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> WireResult<()> {
        if offset + len > self.capacity {
            return Err(WireError::IoFailure {
                reason: format!(
                    "range {}..{} beyond capacity {}",
                    offset,
                    offset + len,
                    self.capacity
                ),
                offset: offset as u64,
            });
        }
        Ok(())
    }

    fn check_aligned(&self, offset: usize, align: usize) -> WireResult<()> {
        if offset % align != 0 {
            return Err(WireError::IoFailure {
                reason: format!("offset not {align}-byte aligned"),
                offset: offset as u64,
            });
        }
        Ok(())
    }

    /// Merges `len` bytes of `value` into the word at `index`, starting at
    /// byte `lane`, without disturbing the other lanes.
    fn merge_lanes(&self, index: usize, lane: usize, value: u64, len: usize) -> WireResult<()> {
        let word = self.word(index)?;
        let mask = if len == 8 {
            u64::MAX
        } else {
            ((1u64 << (len * 8)) - 1) << (lane * 8)
        };
        let bits = (value << (lane * 8)) & mask;
        let mut current = word.load(Ordering::SeqCst);
        loop {
            let next = (current & !mask) | bits;
            match word.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl WireBuffer for SharedBuffer {
    fn len(&self) -> usize {
        self.capacity
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> WireResult<()> {
        self.check_range(offset, dst.len())?;
        for (i, out) in dst.iter_mut().enumerate() {
            let at = offset + i;
            let word = self.word(at / 8)?.load(Ordering::SeqCst);
            *out = (word >> ((at % 8) * 8)) as u8;
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> WireResult<()> {
        self.check_range(offset, src.len())?;
        let mut at = offset;
        let mut rest = src;
        while !rest.is_empty() {
            let lane = at % 8;
            let take = (8 - lane).min(rest.len());
            let mut value = 0u64;
            for (i, &b) in rest[..take].iter().enumerate() {
                value |= u64::from(b) << (i * 8);
            }
            self.merge_lanes(at / 8, lane, value, take)?;
            at += take;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn load_u32(&self, offset: usize) -> WireResult<u32> {
        self.check_aligned(offset, 4)?;
        self.check_range(offset, 4)?;
        let word = self.word(offset / 8)?.load(Ordering::SeqCst);
        Ok((word >> ((offset % 8) * 8)) as u32)
    }

    fn store_u32(&self, offset: usize, value: u32) -> WireResult<()> {
        self.check_aligned(offset, 4)?;
        self.check_range(offset, 4)?;
        self.merge_lanes(offset / 8, offset % 8, u64::from(value), 4)
    }

    fn cas_u32(&self, offset: usize, current: u32, new: u32) -> WireResult<Result<u32, u32>> {
        self.check_aligned(offset, 4)?;
        self.check_range(offset, 4)?;
        let word = self.word(offset / 8)?;
        let shift = (offset % 8) * 8;
        let mask = 0xffff_ffffu64 << shift;
        let mut have = word.load(Ordering::SeqCst);
        loop {
            let lane = ((have & mask) >> shift) as u32;
            if lane != current {
                return Ok(Err(lane));
            }
            let next = (have & !mask) | (u64::from(new) << shift);
            match word.compare_exchange_weak(have, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(Ok(current)),
                Err(actual) => have = actual,
            }
        }
    }

    fn load_u64(&self, offset: usize) -> WireResult<u64> {
        self.check_aligned(offset, 8)?;
        self.check_range(offset, 8)?;
        Ok(self.word(offset / 8)?.load(Ordering::SeqCst))
    }

    fn store_u64(&self, offset: usize, value: u64) -> WireResult<()> {
        self.check_aligned(offset, 8)?;
        self.check_range(offset, 8)?;
        self.word(offset / 8)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn cas_u64(&self, offset: usize, current: u64, new: u64) -> WireResult<Result<u64, u64>> {
        self.check_aligned(offset, 8)?;
        self.check_range(offset, 8)?;
        match self.word(offset / 8)?.compare_exchange(
            current,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(prev) => Ok(Ok(prev)),
            Err(actual) => Ok(Err(actual)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn bytes_round_trip_through_words() {
        let buf = SharedBuffer::new(32);
        buf.write_at(3, b"hello world").expect("write");
        let mut out = [0u8; 11];
        buf.read_at(3, &mut out).expect("read");
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn u32_lanes_are_independent() {
        let buf = SharedBuffer::new(16);
        buf.store_u32(0, 0xaabbccdd).expect("store");
        buf.store_u32(4, 0x11223344).expect("store");
        assert_eq!(buf.load_u32(0).expect("load"), 0xaabbccdd);
        assert_eq!(buf.load_u32(4).expect("load"), 0x11223344);
    }

    #[test]
    fn cas_u32_only_touches_its_lane() {
        let buf = SharedBuffer::new(8);
        buf.store_u32(4, 9).expect("store");
        assert_eq!(buf.cas_u32(0, 0, 77).expect("cas"), Ok(0));
        assert_eq!(buf.load_u32(4).expect("load"), 9);
        assert_eq!(buf.cas_u32(0, 1, 88).expect("cas"), Err(77));
    }

    #[test]
    fn unaligned_word_access_is_rejected() {
        let buf = SharedBuffer::new(16);
        assert!(buf.load_u32(2).is_err());
        assert!(buf.cas_u64(4, 0, 1).is_err());
    }

    #[test]
    fn contended_header_word_admits_exactly_one_winner() {
        let buf = Arc::new(SharedBuffer::new(64));
        let mut handles = Vec::new();
        for id in 1..=4u32 {
            let buf = Arc::clone(&buf);
            handles.push(std::thread::spawn(move || {
                buf.cas_u32(0, 0, id).expect("cas").is_ok()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
