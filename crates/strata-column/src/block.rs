//! Blocks: the unit of pipeline flow.

use std::collections::HashMap;

use strata_error::{Result, StrataError};
use strata_types::{DataType, NameAndType, Names, NamesAndTypes};

use crate::column::{Column, Filter, Permutation};

/// One named, typed column inside a block.
#[derive(Debug, Clone)]
pub struct ColumnWithTypeAndName {
    pub name: String,
    pub data_type: DataType,
    pub column: Column,
}

impl ColumnWithTypeAndName {
    pub fn new(name: impl Into<String>, data_type: DataType, column: Column) -> Self {
        Self {
            name: name.into(),
            data_type,
            column,
        }
    }

    /// Same name and type, empty column.
    pub fn clone_empty(&self) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            data_type: self.data_type.clone(),
            column: Column::empty_of(&self.data_type)?,
        })
    }
}

/// An ordered bag of named columns sharing one row count.
///
/// Column order is meaningful: some operators address columns by
/// position. Names are unique. The empty block (no columns) is the
/// end-of-stream sentinel.
#[derive(Debug, Clone, Default)]
pub struct Block {
    data: Vec<ColumnWithTypeAndName>,
    index_by_name: HashMap<String, usize>,
}

impl Block {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from columns, validating names and lengths.
    pub fn from_columns(columns: Vec<ColumnWithTypeAndName>) -> Result<Self> {
        let mut block = Self::new();
        for col in columns {
            block.insert(col)?;
        }
        Ok(block)
    }

    /// No columns at all — the end-of-stream sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of columns.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.data.len()
    }

    /// Number of rows (zero for the sentinel).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.first().map_or(0, |c| c.column.len())
    }

    /// Heap footprint of all columns.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data.iter().map(|c| c.column.byte_size()).sum()
    }

    /// Append a column; its length must match the block's row count.
    pub fn insert(&mut self, col: ColumnWithTypeAndName) -> Result<()> {
        if self.index_by_name.contains_key(&col.name) {
            return Err(StrataError::DuplicateColumn {
                name: col.name.clone(),
            });
        }
        if !self.data.is_empty() && col.column.len() != self.rows() {
            return Err(StrataError::SizesMismatch {
                what: "columns in block",
                left: self.rows(),
                right: col.column.len(),
            });
        }
        self.index_by_name.insert(col.name.clone(), self.data.len());
        self.data.push(col);
        Ok(())
    }

    pub fn position_by_name(&self, name: &str) -> Result<usize> {
        self.index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| StrataError::NoSuchColumn {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.index_by_name.contains_key(name)
    }

    #[must_use]
    pub fn by_position(&self, i: usize) -> &ColumnWithTypeAndName {
        &self.data[i]
    }

    #[must_use]
    pub fn by_position_mut(&mut self, i: usize) -> &mut ColumnWithTypeAndName {
        &mut self.data[i]
    }

    pub fn by_name(&self, name: &str) -> Result<&ColumnWithTypeAndName> {
        Ok(&self.data[self.position_by_name(name)?])
    }

    pub fn by_name_mut(&mut self, name: &str) -> Result<&mut ColumnWithTypeAndName> {
        let pos = self.position_by_name(name)?;
        Ok(&mut self.data[pos])
    }

    /// Remove a column by name.
    pub fn erase(&mut self, name: &str) -> Result<ColumnWithTypeAndName> {
        let pos = self.position_by_name(name)?;
        let removed = self.data.remove(pos);
        self.rebuild_index();
        Ok(removed)
    }

    fn rebuild_index(&mut self) {
        self.index_by_name.clear();
        for (i, col) in self.data.iter().enumerate() {
            self.index_by_name.insert(col.name.clone(), i);
        }
    }

    /// Iterate columns in order.
    pub fn iter(&self) -> impl Iterator<Item = &ColumnWithTypeAndName> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ColumnWithTypeAndName> {
        self.data.iter_mut()
    }

    #[must_use]
    pub fn names(&self) -> Names {
        self.data.iter().map(|c| c.name.clone()).collect()
    }

    #[must_use]
    pub fn schema(&self) -> NamesAndTypes {
        self.data
            .iter()
            .map(|c| NameAndType::new(c.name.clone(), c.data_type.clone()))
            .collect()
    }

    /// Same names and types, zero rows.
    pub fn clone_empty(&self) -> Result<Block> {
        let cols: Result<Vec<ColumnWithTypeAndName>> =
            self.data.iter().map(ColumnWithTypeAndName::clone_empty).collect();
        Block::from_columns(cols?)
    }

    /// A copy of rows `start .. start + length` of every column.
    pub fn cut(&self, start: usize, length: usize) -> Result<Block> {
        let mut out = Block::new();
        for col in &self.data {
            out.insert(ColumnWithTypeAndName::new(
                col.name.clone(),
                col.data_type.clone(),
                col.column.cut(start, length)?,
            ))?;
        }
        Ok(out)
    }

    /// Apply one filter mask to every column.
    pub fn filter_rows(&self, mask: &Filter) -> Result<Block> {
        let mut out = Block::new();
        for col in &self.data {
            out.insert(ColumnWithTypeAndName::new(
                col.name.clone(),
                col.data_type.clone(),
                col.column.filter(mask)?,
            ))?;
        }
        Ok(out)
    }

    /// Apply one permutation to every column.
    pub fn permute_rows(&self, perm: &Permutation, limit: usize) -> Result<Block> {
        let mut out = Block::new();
        for col in &self.data {
            out.insert(ColumnWithTypeAndName::new(
                col.name.clone(),
                col.data_type.clone(),
                col.column.permute(perm, limit)?,
            ))?;
        }
        Ok(out)
    }

    /// Verify the same-length invariant across all columns.
    pub fn check_sane(&self) -> Result<()> {
        let rows = self.rows();
        for col in &self.data {
            if col.column.len() != rows {
                return Err(StrataError::SizesMismatch {
                    what: "columns in block",
                    left: rows,
                    right: col.column.len(),
                });
            }
        }
        Ok(())
    }

    /// Append all rows of `other`, which must have the same schema.
    pub fn append(&mut self, other: &Block) -> Result<()> {
        if self.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if self.columns() != other.columns() {
            return Err(StrataError::SizesMismatch {
                what: "column counts of appended blocks",
                left: self.columns(),
                right: other.columns(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(other.iter()) {
            if dst.name != src.name {
                return Err(StrataError::NoSuchColumn {
                    name: src.name.clone(),
                });
            }
            // Constants from different blocks may disagree; a grown
            // block is a full column.
            if dst.column.is_const() {
                dst.column = std::mem::replace(&mut dst.column, Column::UInt8(Vec::new()))
                    .materialized()?;
            }
            dst.column.insert_range_from(&src.column, 0, src.column.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::Field;

    fn sample() -> Block {
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("n", DataType::UInt64, Column::UInt64(vec![3, 1, 2])),
            ColumnWithTypeAndName::new("s", DataType::String, {
                let mut s = crate::string::StringColumn::new();
                s.push(b"c");
                s.push(b"a");
                s.push(b"b");
                Column::String(s)
            }),
        ])
        .expect("block")
    }

    #[test]
    fn test_unique_names_and_lengths() {
        let mut block = sample();
        let dup = ColumnWithTypeAndName::new("n", DataType::UInt64, Column::UInt64(vec![0, 0, 0]));
        assert!(block.insert(dup).is_err());

        let short = ColumnWithTypeAndName::new("t", DataType::UInt64, Column::UInt64(vec![0]));
        assert!(block.insert(short).is_err());
    }

    #[test]
    fn test_lookup_and_erase() {
        let mut block = sample();
        assert_eq!(block.position_by_name("s").expect("pos"), 1);
        block.erase("n").expect("erase");
        assert_eq!(block.columns(), 1);
        assert_eq!(block.position_by_name("s").expect("pos"), 0);
        assert!(block.by_name("n").is_err());
    }

    #[test]
    fn test_filter_applies_to_all_columns() {
        let block = sample();
        let out = block.filter_rows(&vec![1, 0, 1]).expect("filter");
        assert_eq!(out.rows(), 2);
        assert_eq!(out.by_position(0).column.field_at(1), Field::UInt64(2));
        assert_eq!(out.by_position(1).column.field_at(1), Field::from("b"));
    }

    #[test]
    fn test_append_checks_schema() {
        let mut block = sample();
        let other = sample();
        block.append(&other).expect("append");
        assert_eq!(block.rows(), 6);

        let mut wrong = Block::new();
        wrong
            .insert(ColumnWithTypeAndName::new(
                "x",
                DataType::UInt64,
                Column::UInt64(vec![1]),
            ))
            .expect("insert");
        assert!(block.append(&wrong).is_err());
    }

    #[test]
    fn test_empty_block_is_sentinel() {
        let block = Block::new();
        assert!(block.is_empty());
        assert_eq!(block.rows(), 0);
    }
}
