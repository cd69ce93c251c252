//! In-place reference cells.
//!
//! A reference cell is a fixed-width slot reserved inside a document at
//! write time. The handle stores only the absolute buffer offset and the
//! slot form; all storage access goes through the [`WireBuffer`] trait,
//! so the cell stays usable after the document seals and mutation is
//! visible to any reader whose buffer window covers the slot.
//!
//! Binary slots are alignment-padded by the writer so that shared
//! buffers can use native word compare-and-swap. Text slots are decimal
//! literals padded with trailing spaces to a fixed width, so an update
//! never changes the document length.

use crate::buffer::WireBuffer;
use crate::error::{WireError, WireResult, excerpt_of};

/// Printed width of the widest `i32`, `"-2147483648"`.
pub(crate) const I32_TEXT_WIDTH: usize = 11;
/// Printed width of the widest `i64`, `"-9223372036854775808"`.
pub(crate) const I64_TEXT_WIDTH: usize = 20;
/// Byte stride between text-form array elements (width plus `", "`).
pub(crate) const I64_TEXT_STRIDE: usize = I64_TEXT_WIDTH + 2;

/// How a cell is laid out in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellForm {
    /// Little-endian machine word, naturally aligned.
    Binary,
    /// Space-padded decimal literal of fixed width.
    Text,
}

fn read_text_int<B: WireBuffer>(buffer: &B, offset: usize, width: usize) -> WireResult<i64> {
    let mut raw = vec![0u8; width];
    buffer.read_at(offset, &mut raw)?;
    let text = std::str::from_utf8(&raw)
        .map_err(|_| WireError::TypeMismatch {
            expected: "decimal literal",
            found: "non-UTF-8 bytes".into(),
            offset: offset as u64,
            excerpt: excerpt_of(&raw),
        })?
        .trim();
    text.parse::<i64>().map_err(|_| WireError::TypeMismatch {
        expected: "decimal literal",
        found: format!("{text:?}"),
        offset: offset as u64,
        excerpt: excerpt_of(&raw),
    })
}

fn write_text_int<B: WireBuffer>(
    buffer: &B,
    offset: usize,
    width: usize,
    value: i64,
) -> WireResult<()> {
    buffer.write_at(offset, format!("{value:<width$}").as_bytes())
}

/// Handle to a 32-bit integer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int32Ref {
    offset: usize,
    form: CellForm,
}

impl Int32Ref {
    pub(crate) fn new(offset: usize, form: CellForm) -> Self {
        Self { offset, form }
    }

    /// Absolute buffer offset of the slot.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Loads the stored value.
    pub fn get<B: WireBuffer>(&self, buffer: &B) -> WireResult<i32> {
        match self.form {
            CellForm::Binary => Ok(buffer.load_u32(self.offset)? as i32),
            CellForm::Text => {
                let wide = read_text_int(buffer, self.offset, I32_TEXT_WIDTH)?;
                i32::try_from(wide).map_err(|_| WireError::RangeViolation {
                    target: "i32",
                    value: i128::from(wide),
                    offset: self.offset as u64,
                    excerpt: String::new(),
                })
            }
        }
    }

    /// Stores a value unconditionally.
    pub fn set<B: WireBuffer>(&self, buffer: &B, value: i32) -> WireResult<()> {
        match self.form {
            CellForm::Binary => buffer.store_u32(self.offset, value as u32),
            CellForm::Text => write_text_int(buffer, self.offset, I32_TEXT_WIDTH, i64::from(value)),
        }
    }

    /// Replaces the stored value if it equals `current`; a failed
    /// exchange returns the value actually found and leaves the slot
    /// unchanged.
    pub fn compare_exchange<B: WireBuffer>(
        &self,
        buffer: &B,
        current: i32,
        new: i32,
    ) -> WireResult<Result<i32, i32>> {
        match self.form {
            CellForm::Binary => Ok(buffer
                .cas_u32(self.offset, current as u32, new as u32)?
                .map(|prev| prev as i32)
                .map_err(|actual| actual as i32)),
            CellForm::Text => {
                let have = self.get(buffer)?;
                if have != current {
                    return Ok(Err(have));
                }
                self.set(buffer, new)?;
                Ok(Ok(current))
            }
        }
    }

    /// Adds `delta` to the stored value, returning the previous value.
    pub fn fetch_add<B: WireBuffer>(&self, buffer: &B, delta: i32) -> WireResult<i32> {
        loop {
            let current = self.get(buffer)?;
            if self
                .compare_exchange(buffer, current, current.wrapping_add(delta))?
                .is_ok()
            {
                return Ok(current);
            }
        }
    }
}

/// Handle to a 64-bit integer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int64Ref {
    offset: usize,
    form: CellForm,
}

impl Int64Ref {
    pub(crate) fn new(offset: usize, form: CellForm) -> Self {
        Self { offset, form }
    }

    /// Absolute buffer offset of the slot.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Loads the stored value.
    pub fn get<B: WireBuffer>(&self, buffer: &B) -> WireResult<i64> {
        match self.form {
            CellForm::Binary => Ok(buffer.load_u64(self.offset)? as i64),
            CellForm::Text => read_text_int(buffer, self.offset, I64_TEXT_WIDTH),
        }
    }

    /// Stores a value unconditionally.
    pub fn set<B: WireBuffer>(&self, buffer: &B, value: i64) -> WireResult<()> {
        match self.form {
            CellForm::Binary => buffer.store_u64(self.offset, value as u64),
            CellForm::Text => write_text_int(buffer, self.offset, I64_TEXT_WIDTH, value),
        }
    }

    /// Replaces the stored value if it equals `current`.
    pub fn compare_exchange<B: WireBuffer>(
        &self,
        buffer: &B,
        current: i64,
        new: i64,
    ) -> WireResult<Result<i64, i64>> {
        match self.form {
            CellForm::Binary => Ok(buffer
                .cas_u64(self.offset, current as u64, new as u64)?
                .map(|prev| prev as i64)
                .map_err(|actual| actual as i64)),
            CellForm::Text => {
                let have = self.get(buffer)?;
                if have != current {
                    return Ok(Err(have));
                }
                self.set(buffer, new)?;
                Ok(Ok(current))
            }
        }
    }

    /// Adds `delta` to the stored value, returning the previous value.
    pub fn fetch_add<B: WireBuffer>(&self, buffer: &B, delta: i64) -> WireResult<i64> {
        loop {
            let current = self.get(buffer)?;
            if self
                .compare_exchange(buffer, current, current.wrapping_add(delta))?
                .is_ok()
            {
                return Ok(current);
            }
        }
    }
}

/// Handle to a fixed-length array of 64-bit integer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int64ArrayRef {
    first: usize,
    len: usize,
    form: CellForm,
}

impl Int64ArrayRef {
    pub(crate) fn new(first: usize, len: usize, form: CellForm) -> Self {
        Self { first, len, form }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn element(&self, index: usize) -> WireResult<Int64Ref> {
        if index >= self.len {
            return Err(WireError::IoFailure {
                reason: format!("index {index} out of {} elements", self.len),
                offset: self.first as u64,
            });
        }
        let stride = match self.form {
            CellForm::Binary => 8,
            CellForm::Text => I64_TEXT_STRIDE,
        };
        Ok(Int64Ref::new(self.first + index * stride, self.form))
    }

    /// Loads element `index`.
    pub fn get<B: WireBuffer>(&self, buffer: &B, index: usize) -> WireResult<i64> {
        self.element(index)?.get(buffer)
    }

    /// Stores element `index` unconditionally.
    pub fn set<B: WireBuffer>(&self, buffer: &B, index: usize, value: i64) -> WireResult<()> {
        self.element(index)?.set(buffer, value)
    }

    /// Compare-and-swap on element `index`.
    pub fn compare_exchange<B: WireBuffer>(
        &self,
        buffer: &B,
        index: usize,
        current: i64,
        new: i64,
    ) -> WireResult<Result<i64, i64>> {
        self.element(index)?.compare_exchange(buffer, current, new)
    }
}
