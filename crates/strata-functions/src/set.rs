//! Row sets for `IN` / `NOT IN` and DISTINCT.
//!
//! A [`Set`] holds serialized key rows. Each row is encoded with
//! length-prefixed fields so variable-length values cannot collide
//! across column boundaries.

use std::collections::HashSet;

use strata_column::{Block, Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_types::codec::write_varuint;
use strata_types::{DataType, OverflowMode};

use crate::function::Function;

/// Size bounds for a set, with the policy applied on overflow.
#[derive(Debug, Clone, Copy)]
pub struct SetLimits {
    /// Zero = unlimited.
    pub max_rows: u64,
    /// Zero = unlimited.
    pub max_bytes: u64,
    pub overflow_mode: OverflowMode,
}

impl Default for SetLimits {
    fn default() -> Self {
        Self {
            max_rows: 0,
            max_bytes: 0,
            overflow_mode: OverflowMode::Throw,
        }
    }
}

/// Outcome of feeding one block into a bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetInsertOutcome {
    /// All rows admitted (or deduplicated).
    Ok,
    /// A bound was hit under `Break`: stop feeding, keep the set usable.
    Stop,
}

/// Outcome of inserting one row into a bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRowOutcome {
    Inserted,
    /// Already present.
    Exists,
    /// Bound hit under `Any`: the row is dropped, the set stays usable.
    Rejected,
    /// Bound hit under `Break`: the caller should stop feeding.
    Stop,
}

#[derive(Debug, Default)]
pub struct Set {
    rows: HashSet<Vec<u8>>,
    bytes: u64,
    limits: SetLimits,
    /// Under `Any`, once a bound is hit only lookups of existing rows
    /// succeed; nothing new is admitted.
    no_more_rows: bool,
}

impl Set {
    #[must_use]
    pub fn new(limits: SetLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Serialize row `i` of the key columns into a collision-free key.
    pub fn serialize_row(columns: &[&Column], i: usize, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        for col in columns {
            match col {
                Column::Const(c) => {
                    let mut tmp = Vec::new();
                    strata_types::codec::write_field(&mut tmp, c.value(), c.data_type())?;
                    write_varuint(out, tmp.len() as u64)?;
                    out.extend_from_slice(&tmp);
                }
                _ => {
                    let value = col.data_at(i);
                    write_varuint(out, value.len() as u64)?;
                    out.extend_from_slice(value);
                }
            }
        }
        Ok(())
    }

    /// Insert one row; the scratch buffer is reused across calls.
    pub fn insert_row(
        &mut self,
        columns: &[&Column],
        i: usize,
        scratch: &mut Vec<u8>,
    ) -> Result<SetRowOutcome> {
        Self::serialize_row(columns, i, scratch)?;
        if self.rows.contains(scratch) {
            return Ok(SetRowOutcome::Exists);
        }
        if self.no_more_rows {
            return Ok(SetRowOutcome::Rejected);
        }
        if self.over_budget(scratch.len()) {
            return match self.limits.overflow_mode {
                OverflowMode::Throw => Err(StrataError::SetSizeLimitExceeded {
                    detail: format!("{} rows, {} bytes", self.rows.len(), self.bytes),
                }),
                OverflowMode::Break => Ok(SetRowOutcome::Stop),
                OverflowMode::Any => {
                    self.no_more_rows = true;
                    Ok(SetRowOutcome::Rejected)
                }
            };
        }
        self.bytes += scratch.len() as u64;
        self.rows.insert(std::mem::take(scratch));
        Ok(SetRowOutcome::Inserted)
    }

    /// Insert every row of the key columns; bounds decide the outcome.
    pub fn insert_block(&mut self, columns: &[&Column], rows: usize) -> Result<SetInsertOutcome> {
        let mut key = Vec::new();
        for i in 0..rows {
            if self.insert_row(columns, i, &mut key)? == SetRowOutcome::Stop {
                return Ok(SetInsertOutcome::Stop);
            }
        }
        Ok(SetInsertOutcome::Ok)
    }

    fn over_budget(&self, incoming: usize) -> bool {
        (self.limits.max_rows != 0 && self.rows.len() as u64 + 1 > self.limits.max_rows)
            || (self.limits.max_bytes != 0
                && self.bytes + incoming as u64 > self.limits.max_bytes)
    }

    /// Membership test for one row; the scratch buffer is reused across
    /// calls.
    pub fn contains_row(
        &self,
        columns: &[&Column],
        i: usize,
        scratch: &mut Vec<u8>,
    ) -> Result<bool> {
        Self::serialize_row(columns, i, scratch)?;
        Ok(self.rows.contains(scratch))
    }
}

/// The `in` / `notIn` operator over a prepared [`Set`].
pub struct InSet {
    set: std::sync::Arc<Set>,
    negated: bool,
}

impl InSet {
    #[must_use]
    pub fn new(set: std::sync::Arc<Set>, negated: bool) -> Self {
        Self { set, negated }
    }
}

impl Function for InSet {
    fn name(&self) -> &str {
        if self.negated {
            "notIn"
        } else {
            "in"
        }
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.is_empty() {
            return Err(StrataError::ParameterOutOfBound {
                detail: "in expects at least one argument".into(),
            });
        }
        Ok(DataType::UInt8)
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let columns: Vec<&Column> = args.iter().map(|a| &a.column).collect();
        let mut mask = Vec::with_capacity(rows);
        let mut scratch = Vec::new();
        for i in 0..rows {
            let found = self.set.contains_row(&columns, i, &mut scratch)?;
            mask.push(u8::from(found != self.negated));
        }
        Ok(Column::UInt8(mask))
    }
}

/// Build a set from whole blocks (the materialized right-hand side of
/// `IN`, or the running DISTINCT state).
pub fn set_from_block(block: &Block, limits: SetLimits) -> Result<Set> {
    let mut set = Set::new(limits);
    let columns: Vec<&Column> = block.iter().map(|c| &c.column).collect();
    set.insert_block(&columns, block.rows())?;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::StringColumn;
    use strata_types::Field;

    fn string_col(values: &[&[u8]]) -> Column {
        let mut s = StringColumn::new();
        for v in values {
            s.push(v);
        }
        Column::String(s)
    }

    #[test]
    fn test_no_cross_column_collisions() {
        // ("ab", "c") must differ from ("a", "bc").
        let a1 = string_col(&[b"ab"]);
        let b1 = string_col(&[b"c"]);
        let a2 = string_col(&[b"a"]);
        let b2 = string_col(&[b"bc"]);

        let mut set = Set::new(SetLimits::default());
        set.insert_block(&[&a1, &b1], 1).expect("insert");
        let mut scratch = Vec::new();
        assert!(set.contains_row(&[&a1, &b1], 0, &mut scratch).expect("contains"));
        assert!(!set.contains_row(&[&a2, &b2], 0, &mut scratch).expect("contains"));
    }

    #[test]
    fn test_row_limit_modes() {
        let col = Column::UInt64(vec![1, 2, 3, 4]);
        let limits = SetLimits {
            max_rows: 2,
            max_bytes: 0,
            overflow_mode: OverflowMode::Throw,
        };
        let mut set = Set::new(limits);
        assert!(set.insert_block(&[&col], 4).is_err());

        let mut set = Set::new(SetLimits {
            overflow_mode: OverflowMode::Break,
            ..limits
        });
        assert_eq!(
            set.insert_block(&[&col], 4).expect("insert"),
            SetInsertOutcome::Stop
        );
        assert_eq!(set.len(), 2);

        let mut set = Set::new(SetLimits {
            overflow_mode: OverflowMode::Any,
            ..limits
        });
        assert_eq!(
            set.insert_block(&[&col], 4).expect("insert"),
            SetInsertOutcome::Ok
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_in_function_mask() {
        let needle = Column::UInt64(vec![1, 5, 2, 9]);
        let haystack = Column::UInt64(vec![1, 2, 3]);
        let mut set = Set::new(SetLimits::default());
        set.insert_block(&[&haystack], 3).expect("insert");

        let arg = ColumnWithTypeAndName::new("x", DataType::UInt64, needle);
        let in_fn = InSet::new(std::sync::Arc::new(set), false);
        let mask = in_fn.execute(&[&arg], 4).expect("in");
        assert_eq!(mask.field_at(0), Field::UInt64(1));
        assert_eq!(mask.field_at(1), Field::UInt64(0));
        assert_eq!(mask.field_at(2), Field::UInt64(1));
        assert_eq!(mask.field_at(3), Field::UInt64(0));
    }
}
