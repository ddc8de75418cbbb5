//! Summing scan over an already-merged sorted stream.
//!
//! Rows sharing a sort key collapse into one row whose integral and
//! floating non-key columns hold the group sums; Date/DateTime, string
//! and other non-summable columns keep the first row's value.

use std::sync::Arc;

use strata_column::{Block, Column};
use strata_error::Result;
use strata_types::{Field, SortDescription};

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct SummingSortedInputStream {
    child: Box<dyn BlockInputStream>,
    description: SortDescription,
    max_block_size: usize,
    current_key: Option<Vec<Field>>,
    /// One accumulated field per column.
    current_row: Vec<Field>,
    pending: Option<Block>,
    template: Option<Block>,
    done: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl SummingSortedInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        description: SortDescription,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            description,
            max_block_size,
            current_key: None,
            current_row: Vec::new(),
            pending: None,
            template: None,
            done: false,
            control,
            profile: ProfileInfo::new(),
        }
    }

    fn is_key_column(&self, name: &str) -> bool {
        self.description.iter().any(|d| d.name == name)
    }

    fn summable(column: &Column) -> bool {
        matches!(
            column,
            Column::UInt8(_)
                | Column::UInt16(_)
                | Column::UInt32(_)
                | Column::UInt64(_)
                | Column::Int8(_)
                | Column::Int16(_)
                | Column::Int32(_)
                | Column::Int64(_)
                | Column::Float32(_)
                | Column::Float64(_)
        )
    }

    fn flush_group(&mut self) -> Result<()> {
        if self.current_key.is_none() {
            return Ok(());
        }
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| strata_error::StrataError::logical("summing flush without template"))?;
        let mut row_block = template.clone_empty()?;
        for (col, field) in row_block.iter_mut().zip(self.current_row.iter()) {
            col.column.insert_field(field)?;
        }
        match &mut self.pending {
            None => self.pending = Some(row_block),
            Some(pending) => pending.append(&row_block)?,
        }
        self.current_key = None;
        self.current_row.clear();
        Ok(())
    }

    fn add_field(acc: &mut Field, value: &Field) {
        match (acc, value) {
            (Field::UInt64(a), Field::UInt64(b)) => *a = a.wrapping_add(*b),
            (Field::Int64(a), Field::Int64(b)) => *a = a.wrapping_add(*b),
            (Field::Float64(a), Field::Float64(b)) => *a += *b,
            _ => {}
        }
    }

    fn take_pending(&mut self) -> Block {
        self.pending.take().unwrap_or_default()
    }
}

impl BlockInputStream for SummingSortedInputStream {
    fn name(&self) -> &'static str {
        "SummingSorted"
    }

    fn control(&self) -> &Arc<ExecControl> {
        &self.control
    }

    fn profile(&self) -> &ProfileInfo {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut ProfileInfo {
        &mut self.profile
    }

    fn children_mut(&mut self) -> Vec<&mut dyn BlockInputStream> {
        vec![self.child.as_mut()]
    }

    fn read_impl(&mut self) -> Result<Block> {
        loop {
            if self.done {
                return Ok(self.take_pending());
            }
            let block = self.child.read()?;
            if block.is_empty() {
                self.flush_group()?;
                self.done = true;
                return Ok(self.take_pending());
            }
            if self.template.is_none() {
                self.template = Some(block.clone_empty()?);
            }

            let key_positions: Result<Vec<usize>> = self
                .description
                .iter()
                .map(|d| block.position_by_name(&d.name))
                .collect();
            let key_positions = key_positions?;

            for row in 0..block.rows() {
                let key: Vec<Field> = key_positions
                    .iter()
                    .map(|&p| block.by_position(p).column.field_at(row))
                    .collect();
                if self.current_key.as_ref() == Some(&key) {
                    for (c, col) in block.iter().enumerate() {
                        if !self.is_key_column(&col.name) && Self::summable(&col.column) {
                            let value = col.column.field_at(row);
                            Self::add_field(&mut self.current_row[c], &value);
                        }
                    }
                } else {
                    self.flush_group()?;
                    self.current_key = Some(key);
                    self.current_row = (0..block.columns())
                        .map(|c| block.by_position(c).column.field_at(row))
                        .collect();
                }
            }

            if self
                .pending
                .as_ref()
                .is_some_and(|p| p.rows() >= self.max_block_size)
            {
                return Ok(self.take_pending());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::one_block::BlocksListInputStream;
    use crate::stream::read_all;
    use strata_column::ColumnWithTypeAndName;
    use strata_types::{DataType, SortColumnDescription};

    #[test]
    fn test_sums_non_key_numeric_columns() {
        let control = ExecControl::unlimited();
        let block = Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(vec![1, 1, 2])),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(vec![10, 5, 7])),
            ColumnWithTypeAndName::new("d", DataType::Date, Column::Date(vec![100, 200, 300])),
        ])
        .expect("block");
        let child = Box::new(BlocksListInputStream::new(
            vec![block],
            Arc::clone(&control),
        ));
        let mut summing = SummingSortedInputStream::new(
            child,
            vec![SortColumnDescription::ascending("k")],
            1024,
            Arc::clone(&control),
        );
        let out = read_all(&mut summing).expect("read");
        assert_eq!(out.rows(), 2);
        assert_eq!(out.by_name("v").expect("v").column.field_at(0), Field::UInt64(15));
        // Date is not summable; the first row of the group wins.
        assert_eq!(out.by_name("d").expect("d").column.field_at(0), Field::UInt64(100));
        assert_eq!(out.by_name("v").expect("v").column.field_at(1), Field::UInt64(7));
    }
}
