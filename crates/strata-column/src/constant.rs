//! Constant column: one value plus a row count.

use std::cmp::Ordering;

use strata_error::Result;
use strata_types::{DataType, Field};

use crate::column::Column;
use crate::vec_ops::permuted_len;

#[derive(Debug, Clone)]
pub struct ConstColumn {
    data_type: DataType,
    value: Field,
    len: usize,
}

impl ConstColumn {
    #[must_use]
    pub fn new(data_type: DataType, value: Field, len: usize) -> Self {
        Self {
            data_type,
            value,
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn value(&self) -> &Field {
        &self.value
    }

    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    #[must_use]
    pub fn with_len(&self, len: usize) -> Self {
        Self {
            data_type: self.data_type.clone(),
            value: self.value.clone(),
            len,
        }
    }

    #[must_use]
    pub fn compare_at(&self, other: &Self, nan_hint: i8) -> Ordering {
        self.value.cmp_with_nan_hint(&other.value, nan_hint)
    }

    pub fn filter(&self, mask: &[u8]) -> Result<Self> {
        if mask.len() != self.len {
            return Err(strata_error::StrataError::SizesMismatch {
                what: "column and filter",
                left: self.len,
                right: mask.len(),
            });
        }
        Ok(self.with_len(mask.iter().filter(|&&m| m != 0).count()))
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Self> {
        let out_len = permuted_len(self.len, perm, limit)?;
        Ok(self.with_len(out_len))
    }

    pub fn replicate(&self, offsets: &[u64]) -> Result<Self> {
        if offsets.len() != self.len {
            return Err(strata_error::StrataError::SizesMismatch {
                what: "column and replicate offsets",
                left: self.len,
                right: offsets.len(),
            });
        }
        Ok(self.with_len(offsets.last().copied().unwrap_or(0) as usize))
    }

    /// Materialize into a full column of `len` copies.
    pub fn to_full(&self) -> Result<Column> {
        let mut out = Column::empty_of(&self.data_type)?;
        out.reserve(self.len);
        for _ in 0..self.len {
            out.insert_field(&self.value)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_filter_and_materialize() {
        let col = ConstColumn::new(DataType::UInt64, Field::UInt64(7), 4);
        let filtered = col.filter(&[1, 0, 0, 1]).expect("filter");
        assert_eq!(filtered.len(), 2);

        let full = filtered.to_full().expect("materialize");
        assert_eq!(full.len(), 2);
        assert_eq!(full.field_at(0), Field::UInt64(7));
    }
}
