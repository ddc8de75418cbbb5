//! Variable-length and fixed-length string containers.
//!
//! `StringColumn` stores all row bytes back to back in `chars`, with
//! `offsets[i]` = one past the last byte of row `i` (so row `i` occupies
//! `chars[offsets[i-1] .. offsets[i]]`, with an implicit `offsets[-1] = 0`).
//! Both buffers are rebuilt together in one pass by every mutating
//! operation; they are never allowed to diverge.

use std::cmp::Ordering;

use strata_error::{Result, StrataError};

use crate::vec_ops::permuted_len;

/// Variable-length byte strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringColumn {
    chars: Vec<u8>,
    offsets: Vec<u64>,
}

impl StringColumn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parts. The offsets must be non-decreasing and end at
    /// `chars.len()`; used by deserialization.
    pub fn from_parts(chars: Vec<u8>, offsets: Vec<u64>) -> Result<Self> {
        let mut prev = 0_u64;
        for &off in &offsets {
            if off < prev {
                return Err(StrataError::CorruptedData {
                    detail: "string offsets are not monotonic".into(),
                });
            }
            prev = off;
        }
        if prev != chars.len() as u64 {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "string offsets end at {prev}, chars buffer has {} bytes",
                    chars.len()
                ),
            });
        }
        Ok(Self { chars, offsets })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.chars.len() + self.offsets.len() * 8
    }

    #[inline]
    fn start(&self, i: usize) -> usize {
        if i == 0 {
            0
        } else {
            self.offsets[i - 1] as usize
        }
    }

    #[inline]
    #[must_use]
    pub fn value_at(&self, i: usize) -> &[u8] {
        &self.chars[self.start(i)..self.offsets[i] as usize]
    }

    pub fn push(&mut self, value: &[u8]) {
        self.chars.extend_from_slice(value);
        self.offsets.push(self.chars.len() as u64);
    }

    pub fn reserve(&mut self, rows: usize, bytes: usize) {
        self.offsets.reserve(rows);
        self.chars.reserve(bytes);
    }

    #[must_use]
    pub fn compare_at(&self, i: usize, other: &Self, j: usize) -> Ordering {
        self.value_at(i).cmp(other.value_at(j))
    }

    /// Raw buffers, for bulk serialization.
    #[must_use]
    pub fn parts(&self) -> (&[u8], &[u64]) {
        (&self.chars, &self.offsets)
    }

    pub fn cut(&self, start: usize, length: usize) -> Self {
        let end = start + length;
        let byte_start = self.start(start);
        let byte_end = if end == 0 { 0 } else { self.offsets[end - 1] as usize };
        let chars = self.chars[byte_start..byte_end].to_vec();
        let offsets = self.offsets[start..end]
            .iter()
            .map(|&o| o - byte_start as u64)
            .collect();
        Self { chars, offsets }
    }

    pub fn filter(&self, mask: &[u8]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and filter",
                left: self.len(),
                right: mask.len(),
            });
        }
        let mut out = Self::new();
        out.offsets.reserve(mask.iter().filter(|&&m| m != 0).count());
        for (i, &m) in mask.iter().enumerate() {
            if m != 0 {
                out.push(self.value_at(i));
            }
        }
        Ok(out)
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Self> {
        let out_len = permuted_len(self.len(), perm, limit)?;
        let mut out = Self::new();
        out.offsets.reserve(out_len);
        for &p in &perm[..out_len] {
            out.push(self.value_at(p));
        }
        Ok(out)
    }

    pub fn replicate(&self, offsets: &[u64]) -> Result<Self> {
        if offsets.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and replicate offsets",
                left: self.len(),
                right: offsets.len(),
            });
        }
        let mut out = Self::new();
        let mut prev = 0_u64;
        for (i, &off) in offsets.iter().enumerate() {
            let value = self.value_at(i);
            for _ in prev..off {
                out.push(value);
            }
            prev = off;
        }
        Ok(out)
    }
}

/// Fixed-width byte strings: `width` bytes per row, no offsets buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedStringColumn {
    width: usize,
    data: Vec<u8>,
}

impl FixedStringColumn {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    pub fn from_parts(width: usize, data: Vec<u8>) -> Result<Self> {
        if width == 0 || data.len() % width != 0 {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "fixed string buffer of {} bytes is not a multiple of width {width}",
                    data.len()
                ),
            });
        }
        Ok(Self { width, data })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / self.width
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn value_at(&self, i: usize) -> &[u8] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Append, zero-padding short values; longer values are a contract
    /// violation.
    pub fn push(&mut self, value: &[u8]) -> Result<()> {
        if value.len() > self.width {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!(
                    "value of {} bytes does not fit FixedString({})",
                    value.len(),
                    self.width
                ),
            });
        }
        self.data.extend_from_slice(value);
        self.data.extend(std::iter::repeat(0).take(self.width - value.len()));
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.data.extend(std::iter::repeat(0).take(self.width));
    }

    pub fn reserve(&mut self, rows: usize) {
        self.data.reserve(rows * self.width);
    }

    #[must_use]
    pub fn compare_at(&self, i: usize, other: &Self, j: usize) -> Ordering {
        self.value_at(i).cmp(other.value_at(j))
    }

    pub fn cut(&self, start: usize, length: usize) -> Self {
        Self {
            width: self.width,
            data: self.data[start * self.width..(start + length) * self.width].to_vec(),
        }
    }

    pub fn filter(&self, mask: &[u8]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and filter",
                left: self.len(),
                right: mask.len(),
            });
        }
        let mut out = Self::new(self.width);
        for (i, &m) in mask.iter().enumerate() {
            if m != 0 {
                out.data.extend_from_slice(self.value_at(i));
            }
        }
        Ok(out)
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Self> {
        let out_len = permuted_len(self.len(), perm, limit)?;
        let mut out = Self::new(self.width);
        out.reserve(out_len);
        for &p in &perm[..out_len] {
            out.data.extend_from_slice(self.value_at(p));
        }
        Ok(out)
    }

    pub fn replicate(&self, offsets: &[u64]) -> Result<Self> {
        if offsets.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and replicate offsets",
                left: self.len(),
                right: offsets.len(),
            });
        }
        let mut out = Self::new(self.width);
        let mut prev = 0_u64;
        for (i, &off) in offsets.iter().enumerate() {
            for _ in prev..off {
                out.data.extend_from_slice(self.value_at(i));
            }
            prev = off;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StringColumn {
        let mut col = StringColumn::new();
        col.push(b"alpha");
        col.push(b"");
        col.push(b"beta");
        col
    }

    #[test]
    fn test_offsets_invariant() {
        let col = sample();
        assert_eq!(col.len(), 3);
        assert_eq!(col.value_at(0), b"alpha");
        assert_eq!(col.value_at(1), b"");
        assert_eq!(col.value_at(2), b"beta");
        let (chars, offsets) = col.parts();
        assert_eq!(offsets, &[5, 5, 9]);
        assert_eq!(chars.len(), 9);
    }

    #[test]
    fn test_cut_rebases_offsets() {
        let col = sample().cut(1, 2);
        assert_eq!(col.len(), 2);
        assert_eq!(col.value_at(0), b"");
        assert_eq!(col.value_at(1), b"beta");
    }

    #[test]
    fn test_filter_and_permute_keep_buffers_consistent() {
        let col = sample();
        let filtered = col.filter(&[1, 0, 1]).expect("filter");
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.value_at(1), b"beta");

        let permuted = col.permute(&[2, 0, 1], 0).expect("permute");
        assert_eq!(permuted.value_at(0), b"beta");
        assert_eq!(permuted.value_at(2), b"");
    }

    #[test]
    fn test_replicate() {
        let col = sample();
        let out = col.replicate(&[0, 2, 3]).expect("replicate");
        assert_eq!(out.len(), 3);
        assert_eq!(out.value_at(0), b"");
        assert_eq!(out.value_at(2), b"beta");
    }

    #[test]
    fn test_from_parts_rejects_bad_offsets() {
        assert!(StringColumn::from_parts(vec![1, 2], vec![3, 1]).is_err());
        assert!(StringColumn::from_parts(vec![1, 2], vec![1]).is_err());
    }

    #[test]
    fn test_fixed_string_padding() {
        let mut col = FixedStringColumn::new(4);
        col.push(b"ab").expect("push");
        col.push(b"cdef").expect("push");
        assert!(col.push(b"toolong").is_err());
        assert_eq!(col.value_at(0), b"ab\0\0");
        assert_eq!(col.value_at(1), b"cdef");
    }
}
