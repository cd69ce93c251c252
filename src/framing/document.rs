//! Header acquisition and document cursoring over a buffer.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{
    HEADER_BYTES, LENGTH_MASK, META_DATA, NOT_COMPLETE, NOT_INITIALIZED, is_in_progress, is_meta,
    is_ready, length_of, next_header,
};
use crate::buffer::WireBuffer;
use crate::error::{WireError, WireResult};

/// A claimed document slot: the header position, where the payload
/// begins, and the sequence number when the document is data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    /// Offset of the header word.
    pub header: usize,
    /// Offset of the first payload byte.
    pub payload: usize,
    /// Sequence number among data documents; `None` for metadata.
    pub number: Option<u64>,
}

/// Reads a header word, treating the unwritten tail of a growable buffer
/// as [`NOT_INITIALIZED`].
fn header_at<B: WireBuffer>(buffer: &B, pos: usize) -> WireResult<u32> {
    if pos + HEADER_BYTES > buffer.len() {
        if pos + HEADER_BYTES > buffer.capacity() {
            return Err(WireError::IoFailure {
                reason: "no room for a document header".into(),
                offset: pos as u64,
            });
        }
        return Ok(NOT_INITIALIZED);
    }
    buffer.load_u32(pos)
}

/// Claims the next free document slot at or after `from`.
///
/// Complete documents are walked over; a slot another writer holds is
/// spun on until it seals or `timeout` elapses. Only one writer can win
/// the `NOT_INITIALIZED` → `NOT_COMPLETE` transition on any slot.
/// `data_before` is the number of data documents known to precede
/// `from`; the claimed slot's own number is derived from it.
pub fn acquire_slot<B: WireBuffer>(
    buffer: &B,
    from: usize,
    data_before: u64,
    meta: bool,
    timeout: Duration,
) -> WireResult<AcquiredSlot> {
    let claim = NOT_COMPLETE | if meta { META_DATA } else { 0 };
    let deadline = Instant::now() + timeout;
    let mut pos = from;
    let mut number = data_before;
    loop {
        let header = header_at(buffer, pos)?;
        if header == NOT_INITIALIZED {
            match buffer.cas_u32(pos, NOT_INITIALIZED, claim)? {
                Ok(_) => {
                    debug!(header = pos, meta, "acquired document slot");
                    return Ok(AcquiredSlot {
                        header: pos,
                        payload: pos + HEADER_BYTES,
                        number: (!meta).then_some(number),
                    });
                }
                // Lost the race; the winner's header is visible now.
                Err(_) => continue,
            }
        }
        if is_in_progress(header) {
            if Instant::now() >= deadline {
                return Err(WireError::HeaderAcquireTimeout { offset: pos as u64 });
            }
            std::thread::yield_now();
            continue;
        }
        if !is_meta(header) {
            number += 1;
        }
        pos = next_header(pos + HEADER_BYTES + length_of(header));
    }
}

/// Seals a claimed slot with the final payload length, clearing the
/// not-complete bit. Fails with `payload-too-large` when the length does
/// not fit the 30-bit field, leaving the slot abandoned.
pub fn seal_slot<B: WireBuffer>(
    buffer: &B,
    header: usize,
    payload_len: usize,
    meta: bool,
) -> WireResult<()> {
    if payload_len > LENGTH_MASK as usize {
        return Err(WireError::PayloadTooLarge {
            length: payload_len as u64,
            offset: header as u64,
        });
    }
    let word = (payload_len as u32) | if meta { META_DATA } else { 0 };
    buffer.store_u32(header, word)?;
    debug!(header, payload_len, meta, "sealed document");
    Ok(())
}

/// Walks the complete documents in a buffer, front to back.
///
/// Iteration stops at the first unclaimed or still-in-progress header,
/// which includes the end-of-stream marker.
#[derive(Debug)]
pub struct DocumentsIn<'a, B> {
    buffer: &'a B,
    pos: usize,
    next_number: u64,
}

/// One complete document located by [`DocumentsIn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Sequence number among data documents; `None` for metadata.
    pub number: Option<u64>,
    /// True when the document is metadata.
    pub meta: bool,
    /// Payload range within the buffer.
    pub start: usize,
    /// End of the payload, exclusive.
    pub end: usize,
}

impl<'a, B: WireBuffer> DocumentsIn<'a, B> {
    /// Starts walking from offset zero.
    pub fn new(buffer: &'a B) -> Self {
        Self {
            buffer,
            pos: 0,
            next_number: 0,
        }
    }

    /// Copies the payload of a located document out of the buffer.
    pub fn payload(&self, doc: &DocumentRef) -> WireResult<Vec<u8>> {
        let mut data = vec![0u8; doc.end - doc.start];
        self.buffer.read_at(doc.start, &mut data)?;
        Ok(data)
    }
}

impl<B: WireBuffer> Iterator for DocumentsIn<'_, B> {
    type Item = DocumentRef;

    fn next(&mut self) -> Option<DocumentRef> {
        let header = header_at(self.buffer, self.pos).ok()?;
        if !is_ready(header) {
            return None;
        }
        let meta = is_meta(header);
        let start = self.pos + HEADER_BYTES;
        let end = start + length_of(header);
        let number = if meta {
            None
        } else {
            let n = self.next_number;
            self.next_number += 1;
            Some(n)
        };
        self.pos = next_header(end);
        trace!(start, end, meta, "located document");
        Some(DocumentRef {
            number,
            meta,
            start,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElasticBuffer;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn acquire_seal_walk() {
        let buf = ElasticBuffer::new();

        let first = acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");
        assert_eq!(first.header, 0);
        assert_eq!(first.number, Some(0));
        buf.write_at(first.payload, b"hello").expect("payload");
        seal_slot(&buf, first.header, 5, false).expect("seal");

        // Next slot lands on the following 4-byte boundary.
        let second = acquire_slot(&buf, 0, 0, true, TIMEOUT).expect("acquire");
        assert_eq!(second.header, next_header(first.payload + 5));
        assert_eq!(second.number, None);
        seal_slot(&buf, second.header, 0, true).expect("seal");

        let third = acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");
        assert_eq!(third.number, Some(1));
        seal_slot(&buf, third.header, 0, false).expect("seal");

        let docs: Vec<_> = DocumentsIn::new(&buf).collect();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].number, Some(0));
        assert_eq!(docs[0].end - docs[0].start, 5);
        assert_eq!(docs[1].number, None);
        assert!(docs[1].meta);
        assert_eq!(docs[2].number, Some(1));
    }

    #[test]
    fn in_progress_slot_times_out() {
        let buf = ElasticBuffer::new();
        let slot = acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");
        // The slot is never sealed; a second acquisition must time out.
        let err = acquire_slot(&buf, 0, 0, false, Duration::from_millis(10)).expect_err("contended");
        assert!(matches!(err, WireError::HeaderAcquireTimeout { offset } if offset == slot.header as u64));
    }

    #[test]
    fn walker_stops_at_incomplete_document() {
        let buf = ElasticBuffer::new();
        let first = acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");
        seal_slot(&buf, first.header, 0, false).expect("seal");
        acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");

        let docs: Vec<_> = DocumentsIn::new(&buf).collect();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let buf = ElasticBuffer::new();
        let slot = acquire_slot(&buf, 0, 0, false, TIMEOUT).expect("acquire");
        let err = seal_slot(&buf, slot.header, LENGTH_MASK as usize + 1, false).expect_err("big");
        assert!(matches!(err, WireError::PayloadTooLarge { .. }));
        // The slot stays abandoned: readers see nothing.
        assert_eq!(DocumentsIn::new(&buf).count(), 0);
    }
}
