//! Array column: a values column plus row offsets.
//!
//! `offsets[i]` is one past the last element of row `i` within `values`,
//! with an implicit `offsets[-1] = 0`. The two buffers move together
//! under every operation.

use std::cmp::Ordering;

use strata_error::{Result, StrataError};
use strata_types::Field;

use crate::column::Column;
use crate::vec_ops::permuted_len;

#[derive(Debug, Clone)]
pub struct ArrayColumn {
    values: Column,
    offsets: Vec<u64>,
}

impl ArrayColumn {
    #[must_use]
    pub fn new(values: Column) -> Self {
        Self {
            values,
            offsets: Vec::new(),
        }
    }

    pub fn from_parts(values: Column, offsets: Vec<u64>) -> Result<Self> {
        let mut prev = 0_u64;
        for &off in &offsets {
            if off < prev {
                return Err(StrataError::CorruptedData {
                    detail: "array offsets are not monotonic".into(),
                });
            }
            prev = off;
        }
        if prev != values.len() as u64 {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "array offsets end at {prev}, values column has {} rows",
                    values.len()
                ),
            });
        }
        Ok(Self { values, offsets })
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
        self.values.byte_size() + self.offsets.len() * 8
    }

    #[must_use]
    pub fn values(&self) -> &Column {
        &self.values
    }

    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
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
    fn row_len(&self, i: usize) -> usize {
        self.offsets[i] as usize - self.start(i)
    }

    #[must_use]
    pub fn field_at(&self, i: usize) -> Field {
        let start = self.start(i);
        let items = (start..self.offsets[i] as usize)
            .map(|row| self.values.field_at(row))
            .collect();
        Field::Array(items)
    }

    /// Append one row copied from `src` row `i`.
    pub fn insert_from(&mut self, src: &Self, i: usize) -> Result<()> {
        self.values
            .insert_range_from(&src.values, src.start(i), src.row_len(i))?;
        self.offsets.push(self.values.len() as u64);
        Ok(())
    }

    pub fn insert_field(&mut self, field: &Field) -> Result<()> {
        let Field::Array(items) = field else {
            return Err(StrataError::IllegalTypeOfArgument {
                function: "ArrayColumn::insert_field".into(),
                type_name: format!("{field}"),
            });
        };
        for item in items {
            self.values.insert_field(item)?;
        }
        self.offsets.push(self.values.len() as u64);
        Ok(())
    }

    pub fn insert_default(&mut self) {
        self.offsets.push(self.values.len() as u64);
    }

    pub fn reserve(&mut self, rows: usize) {
        self.offsets.reserve(rows);
    }

    #[must_use]
    pub fn compare_at(&self, i: usize, other: &Self, j: usize, nan_hint: i8) -> Ordering {
        let (a_start, a_len) = (self.start(i), self.row_len(i));
        let (b_start, b_len) = (other.start(j), other.row_len(j));
        for k in 0..a_len.min(b_len) {
            let ord = self
                .values
                .compare_at(a_start + k, &other.values, b_start + k, nan_hint);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a_len.cmp(&b_len)
    }

    pub fn cut(&self, start: usize, length: usize) -> Result<Self> {
        let end = start + length;
        let elem_start = self.start(start);
        let elem_end = if end == 0 { 0 } else { self.offsets[end - 1] as usize };
        let values = self.values.cut(elem_start, elem_end - elem_start)?;
        let offsets = self.offsets[start..end]
            .iter()
            .map(|&o| o - elem_start as u64)
            .collect();
        Ok(Self { values, offsets })
    }

    pub fn filter(&self, mask: &[u8]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and filter",
                left: self.len(),
                right: mask.len(),
            });
        }
        // One expanded pass over the element mask keeps values and offsets
        // in lock step without per-row temporaries.
        let mut elem_mask = vec![0_u8; self.values.len()];
        let mut offsets = Vec::new();
        let mut kept_elems = 0_u64;
        for (i, &m) in mask.iter().enumerate() {
            if m != 0 {
                let (start, len) = (self.start(i), self.row_len(i));
                elem_mask[start..start + len].fill(1);
                kept_elems += len as u64;
                offsets.push(kept_elems);
            }
        }
        let values = self.values.filter(&elem_mask)?;
        Ok(Self { values, offsets })
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Self> {
        let out_len = permuted_len(self.len(), perm, limit)?;
        let mut values = self.values.empty_like();
        let mut offsets = Vec::with_capacity(out_len);
        for &p in &perm[..out_len] {
            values.insert_range_from(&self.values, self.start(p), self.row_len(p))?;
            offsets.push(values.len() as u64);
        }
        Ok(Self { values, offsets })
    }

    pub fn replicate(&self, rep_offsets: &[u64]) -> Result<Self> {
        if rep_offsets.len() != self.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and replicate offsets",
                left: self.len(),
                right: rep_offsets.len(),
            });
        }
        let mut values = self.values.empty_like();
        let mut offsets = Vec::new();
        let mut prev = 0_u64;
        for (i, &off) in rep_offsets.iter().enumerate() {
            for _ in prev..off {
                values.insert_range_from(&self.values, self.start(i), self.row_len(i))?;
                offsets.push(values.len() as u64);
            }
            prev = off;
        }
        Ok(Self { values, offsets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArrayColumn {
        // [[1, 2], [], [3]]
        ArrayColumn::from_parts(Column::UInt64(vec![1, 2, 3]), vec![2, 2, 3]).expect("parts")
    }

    #[test]
    fn test_field_at() {
        let col = sample();
        assert_eq!(
            col.field_at(0),
            Field::Array(vec![Field::UInt64(1), Field::UInt64(2)])
        );
        assert_eq!(col.field_at(1), Field::Array(vec![]));
    }

    #[test]
    fn test_filter_rebuilds_both_buffers() {
        let col = sample();
        let out = col.filter(&[1, 0, 1]).expect("filter");
        assert_eq!(out.len(), 2);
        assert_eq!(out.offsets(), &[2, 3]);
        assert_eq!(out.values().len(), 3);
    }

    #[test]
    fn test_permute_and_cut() {
        let col = sample();
        let out = col.permute(&[2, 0], 0).expect("permute");
        assert_eq!(out.field_at(0), Field::Array(vec![Field::UInt64(3)]));

        let cut = col.cut(1, 2).expect("cut");
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.offsets(), &[0, 1]);
    }

    #[test]
    fn test_compare_lexicographic() {
        let col = sample();
        // [1,2] vs [] — longer wins when prefix equal.
        assert_eq!(col.compare_at(0, &col, 1, 1), Ordering::Greater);
        // [1,2] vs [3] — element decides.
        assert_eq!(col.compare_at(0, &col, 2, 1), Ordering::Less);
    }

    #[test]
    fn test_from_parts_validation() {
        assert!(ArrayColumn::from_parts(Column::UInt64(vec![1]), vec![2]).is_err());
        assert!(ArrayColumn::from_parts(Column::UInt64(vec![1, 2]), vec![2, 1]).is_err());
    }
}
