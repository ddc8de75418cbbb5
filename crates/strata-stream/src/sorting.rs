//! ORDER BY building blocks: per-block partial sort and the full-input
//! sorting stage.

use std::sync::Arc;

use strata_column::{sort_block, Block};
use strata_error::Result;
use strata_types::SortDescription;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

/// Sorts each block independently. Upstream of a merge stage this turns
/// arbitrary input into locally-sorted runs.
pub struct PartialSortingBlockInputStream {
    child: Box<dyn BlockInputStream>,
    description: SortDescription,
    /// Rows beyond this count per block are dropped (0 = keep all).
    limit: usize,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl PartialSortingBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        description: SortDescription,
        limit: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            description,
            limit,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for PartialSortingBlockInputStream {
    fn name(&self) -> &'static str {
        "PartialSorting"
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
        let block = self.child.read()?;
        if block.is_empty() {
            return Ok(block);
        }
        sort_block(&block, &self.description, self.limit)
    }
}

/// Accumulates the whole input, sorts it once, and emits the result.
///
/// The input must fit in memory; external sorting is out of scope.
pub struct MergeSortingBlockInputStream {
    child: Box<dyn BlockInputStream>,
    description: SortDescription,
    limit: usize,
    accumulated: Option<Block>,
    emitted: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl MergeSortingBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        description: SortDescription,
        limit: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            description,
            limit,
            accumulated: None,
            emitted: false,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for MergeSortingBlockInputStream {
    fn name(&self) -> &'static str {
        "MergeSorting"
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
        if self.emitted {
            return Ok(Block::new());
        }
        loop {
            if self.control().is_cancelled() {
                return Ok(Block::new());
            }
            let block = self.child.read()?;
            if block.is_empty() {
                break;
            }
            match &mut self.accumulated {
                None => self.accumulated = Some(block),
                Some(acc) => acc.append(&block)?,
            }
        }
        self.emitted = true;
        match self.accumulated.take() {
            None => Ok(Block::new()),
            Some(all) => sort_block(&all, &self.description, self.limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::one_block::BlocksListInputStream;
    use crate::stream::read_all;
    use strata_column::{Column, ColumnWithTypeAndName};
    use strata_types::{DataType, Field, SortColumnDescription};

    fn source(control: &Arc<ExecControl>) -> Box<dyn BlockInputStream> {
        let blocks: Vec<Block> = vec![vec![5_u64, 1], vec![4, 2, 3]]
            .into_iter()
            .map(|values| {
                Block::from_columns(vec![ColumnWithTypeAndName::new(
                    "x",
                    DataType::UInt64,
                    Column::UInt64(values),
                )])
                .expect("block")
            })
            .collect();
        Box::new(BlocksListInputStream::new(blocks, Arc::clone(control)))
    }

    #[test]
    fn test_full_sort_across_blocks() {
        let control = ExecControl::unlimited();
        let mut stream = MergeSortingBlockInputStream::new(
            source(&control),
            vec![SortColumnDescription::ascending("x")],
            0,
            Arc::clone(&control),
        );
        let out = read_all(&mut stream).expect("read");
        assert_eq!(out.rows(), 5);
        for i in 0..5 {
            assert_eq!(
                out.by_position(0).column.field_at(i),
                Field::UInt64(i as u64 + 1)
            );
        }
    }

    #[test]
    fn test_partial_sort_is_per_block() {
        let control = ExecControl::unlimited();
        let mut stream = PartialSortingBlockInputStream::new(
            source(&control),
            vec![SortColumnDescription::ascending("x")],
            0,
            Arc::clone(&control),
        );
        let first = stream.read().expect("read");
        assert_eq!(first.rows(), 2);
        assert_eq!(first.by_position(0).column.field_at(0), Field::UInt64(1));
        assert_eq!(first.by_position(0).column.field_at(1), Field::UInt64(5));
    }
}
