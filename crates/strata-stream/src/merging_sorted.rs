//! K-way merge of sorted streams, and the collapsing variant.

use std::cmp::Ordering;
use std::sync::Arc;

use strata_column::Block;
use strata_error::{Result, StrataError};
use strata_types::{Field, SortDescription};
use tracing::warn;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

/// One child's current block and position within it.
struct Cursor {
    block: Block,
    key_positions: Vec<usize>,
    row: usize,
}

impl Cursor {
    fn new(block: Block, description: &SortDescription) -> Result<Self> {
        let key_positions: Result<Vec<usize>> = description
            .iter()
            .map(|d| block.position_by_name(&d.name))
            .collect();
        Ok(Self {
            block,
            key_positions: key_positions?,
            row: 0,
        })
    }

    fn exhausted(&self) -> bool {
        self.row >= self.block.rows()
    }

    fn cmp_with(&self, other: &Self, description: &SortDescription) -> Ordering {
        for (k, desc) in description.iter().enumerate() {
            let a = &self.block.by_position(self.key_positions[k]).column;
            let b = &other.block.by_position(other.key_positions[k]).column;
            let ord = desc
                .direction
                .apply(a.compare_at(self.row, b, other.row, desc.nan_direction_hint));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Merges children that are each sorted by `description` into one
/// sorted stream. All children must share the same column layout.
pub struct MergingSortedInputStream {
    children: Vec<Box<dyn BlockInputStream>>,
    description: SortDescription,
    max_block_size: usize,
    cursors: Vec<Option<Cursor>>,
    template: Option<Block>,
    initialized: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl MergingSortedInputStream {
    #[must_use]
    pub fn new(
        children: Vec<Box<dyn BlockInputStream>>,
        description: SortDescription,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        let count = children.len();
        Self {
            children,
            description,
            max_block_size,
            cursors: (0..count).map(|_| None).collect(),
            template: None,
            initialized: false,
            control,
            profile: ProfileInfo::new(),
        }
    }

    /// Next non-empty block of child `i`, as a cursor.
    fn advance(&mut self, i: usize) -> Result<Option<Cursor>> {
        loop {
            let block = self.children[i].read()?;
            if block.is_empty() {
                return Ok(None);
            }
            if block.rows() == 0 {
                continue;
            }
            return Ok(Some(Cursor::new(block, &self.description)?));
        }
    }

    fn initialize(&mut self) -> Result<()> {
        for i in 0..self.children.len() {
            self.cursors[i] = self.advance(i)?;
            if self.template.is_none() {
                if let Some(cursor) = &self.cursors[i] {
                    self.template = Some(cursor.block.clone_empty()?);
                }
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Index of the cursor with the least current row; ties go to the
    /// earlier child, keeping the merge stable.
    fn min_cursor(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, slot) in self.cursors.iter().enumerate() {
            let Some(cursor) = slot else { continue };
            match best.and_then(|b| self.cursors[b].as_ref()) {
                None => best = Some(i),
                Some(best_cursor) => {
                    if cursor.cmp_with(best_cursor, &self.description) == Ordering::Less {
                        best = Some(i);
                    }
                }
            }
        }
        best
    }
}

impl BlockInputStream for MergingSortedInputStream {
    fn name(&self) -> &'static str {
        "MergingSorted"
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
        self.children.iter_mut().map(|c| c.as_mut() as _).collect()
    }

    fn read_impl(&mut self) -> Result<Block> {
        if !self.initialized {
            self.initialize()?;
        }
        let Some(template) = &self.template else {
            return Ok(Block::new());
        };
        let mut out = template.clone_empty()?;
        let columns = out.columns();

        while out.rows() < self.max_block_size {
            if self.control.is_cancelled() {
                break;
            }
            let Some(i) = self.min_cursor() else { break };
            {
                let cursor = self.cursors[i].as_ref().ok_or_else(|| {
                    StrataError::logical("min_cursor returned an empty slot")
                })?;
                for c in 0..columns {
                    let src = &cursor.block.by_position(c).column;
                    out.by_position_mut(c).column.insert_from(src, cursor.row)?;
                }
            }
            let exhausted = {
                let cursor = self.cursors[i]
                    .as_mut()
                    .ok_or_else(|| StrataError::logical("cursor vanished mid-merge"))?;
                cursor.row += 1;
                cursor.exhausted()
            };
            if exhausted {
                self.cursors[i] = self.advance(i)?;
            }
        }

        if out.rows() == 0 {
            return Ok(Block::new());
        }
        Ok(out)
    }
}

/// Collapsing scan over an already-merged sorted stream.
///
/// Rows sharing a sort key form a group; within a group, rows with sign
/// `+1` and `-1` cancel pairwise. The residual is the last positive row
/// (when positives outnumber negatives) or the first negative row. A
/// group that nets to more than one unmatched row of either sign is
/// malformed input and is logged.
pub struct CollapsingSortedInputStream {
    child: Box<dyn BlockInputStream>,
    description: SortDescription,
    sign_column: String,
    max_block_size: usize,
    current_key: Option<Vec<Field>>,
    positive_count: u64,
    negative_count: u64,
    first_negative: Option<Block>,
    last_positive: Option<Block>,
    pending: Option<Block>,
    done: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl CollapsingSortedInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        description: SortDescription,
        sign_column: impl Into<String>,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            description,
            sign_column: sign_column.into(),
            max_block_size,
            current_key: None,
            positive_count: 0,
            negative_count: 0,
            first_negative: None,
            last_positive: None,
            pending: None,
            done: false,
            control,
            profile: ProfileInfo::new(),
        }
    }

    fn flush_group(&mut self) -> Result<()> {
        let residual = match self.positive_count.cmp(&self.negative_count) {
            Ordering::Greater => self.last_positive.take(),
            Ordering::Less => self.first_negative.take(),
            Ordering::Equal => None,
        };
        let imbalance = self.positive_count.abs_diff(self.negative_count);
        if imbalance > 1 {
            warn!(
                positive = self.positive_count,
                negative = self.negative_count,
                "collapsing group with more than one unmatched row"
            );
        }
        if let Some(row) = residual {
            match &mut self.pending {
                None => self.pending = Some(row),
                Some(pending) => pending.append(&row)?,
            }
        }
        self.positive_count = 0;
        self.negative_count = 0;
        self.first_negative = None;
        self.last_positive = None;
        Ok(())
    }

    fn key_of(&self, block: &Block, row: usize) -> Result<Vec<Field>> {
        let mut key = Vec::with_capacity(self.description.len());
        for desc in &self.description {
            key.push(block.by_name(&desc.name)?.column.field_at(row));
        }
        Ok(key)
    }

    fn take_pending(&mut self) -> Block {
        self.pending.take().unwrap_or_default()
    }
}

impl BlockInputStream for CollapsingSortedInputStream {
    fn name(&self) -> &'static str {
        "CollapsingSorted"
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

            let sign_pos = block.position_by_name(&self.sign_column)?;
            for row in 0..block.rows() {
                let key = self.key_of(&block, row)?;
                if self.current_key.as_ref() != Some(&key) {
                    self.flush_group()?;
                    self.current_key = Some(key);
                }
                let sign = block.by_position(sign_pos).column.field_at(row);
                let positive = !matches!(sign, Field::Int64(v) if v < 0);
                let snapshot = block.cut(row, 1)?;
                if positive {
                    self.positive_count += 1;
                    self.last_positive = Some(snapshot);
                } else {
                    self.negative_count += 1;
                    if self.first_negative.is_none() {
                        self.first_negative = Some(snapshot);
                    }
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
    use strata_column::{Column, ColumnWithTypeAndName};
    use strata_types::{DataType, SortColumnDescription};

    fn sorted_block(keys: Vec<u64>, values: Vec<u64>) -> Block {
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(keys)),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
        ])
        .expect("block")
    }

    fn stream_of(control: &Arc<ExecControl>, block: Block) -> Box<dyn BlockInputStream> {
        Box::new(BlocksListInputStream::new(vec![block], Arc::clone(control)))
    }

    #[test]
    fn test_merge_two_sorted_streams() {
        let control = ExecControl::unlimited();
        let a = stream_of(&control, sorted_block(vec![1, 3, 5], vec![10, 30, 50]));
        let b = stream_of(&control, sorted_block(vec![2, 3, 6], vec![20, 31, 60]));
        let mut merged = MergingSortedInputStream::new(
            vec![a, b],
            vec![SortColumnDescription::ascending("k")],
            1024,
            Arc::clone(&control),
        );
        let out = read_all(&mut merged).expect("read");
        assert_eq!(out.rows(), 6);
        let keys: Vec<Field> = (0..6).map(|i| out.by_position(0).column.field_at(i)).collect();
        assert_eq!(
            keys,
            vec![
                Field::UInt64(1),
                Field::UInt64(2),
                Field::UInt64(3),
                Field::UInt64(3),
                Field::UInt64(5),
                Field::UInt64(6)
            ]
        );
        // Stability: on the key tie, the first child's row comes first.
        assert_eq!(out.by_position(1).column.field_at(2), Field::UInt64(30));
        assert_eq!(out.by_position(1).column.field_at(3), Field::UInt64(31));
    }

    #[test]
    fn test_collapsing_cancels_pairs() {
        let control = ExecControl::unlimited();
        let block = Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(vec![1, 1, 2, 3, 3, 3])),
            ColumnWithTypeAndName::new(
                "sign",
                DataType::Int8,
                Column::Int8(vec![1, -1, 1, 1, -1, 1]),
            ),
        ])
        .expect("block");
        let child = stream_of(&control, block);
        let mut collapsing = CollapsingSortedInputStream::new(
            child,
            vec![SortColumnDescription::ascending("k")],
            "sign",
            1024,
            Arc::clone(&control),
        );
        let out = read_all(&mut collapsing).expect("read");
        // Key 1 cancels out, key 2 stays, key 3 nets to one positive.
        assert_eq!(out.rows(), 2);
        assert_eq!(out.by_position(0).column.field_at(0), Field::UInt64(2));
        assert_eq!(out.by_position(0).column.field_at(1), Field::UInt64(3));
    }
}
