//! Per-stream profiling state maintained by the provided `read`.

use std::time::Duration;

use strata_column::Block;
use strata_error::Result;

/// Counters and flags one stream accumulates while being read.
#[derive(Debug, Default)]
pub struct ProfileInfo {
    pub rows: u64,
    pub bytes: u64,
    pub blocks: u64,
    pub total_time: Duration,
    /// The empty block has been returned; all later reads stay empty.
    pub eof: bool,
    /// Whether this stream reports progress (set on leaf sources).
    pub reports_progress: bool,
    /// Min/max side-channel, maintained when enabled.
    extremes: Option<Block>,
    extremes_enabled: bool,
}

impl ProfileInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf-source profile: progress (and therefore limits and quotas)
    /// are accounted where data enters the pipeline.
    #[must_use]
    pub fn leaf() -> Self {
        Self {
            reports_progress: true,
            ..Self::default()
        }
    }

    pub fn enable_extremes(&mut self) {
        self.extremes_enabled = true;
    }

    #[must_use]
    pub fn extremes(&self) -> Option<&Block> {
        self.extremes.as_ref()
    }

    pub fn account(&mut self, block: &Block) {
        self.rows += block.rows() as u64;
        self.bytes += block.byte_size() as u64;
        self.blocks += 1;
    }

    /// Fold a block into the 2-row extremes block (row 0 = minima,
    /// row 1 = maxima).
    pub fn update_extremes(&mut self, block: &Block) -> Result<()> {
        if !self.extremes_enabled || block.rows() == 0 {
            return Ok(());
        }
        match &mut self.extremes {
            None => {
                let mut out = Block::new();
                for col in block.iter() {
                    let (min, max) = col.column.extremes();
                    let mut extreme = strata_column::Column::empty_of(&col.data_type)?;
                    extreme.insert_field(&min)?;
                    extreme.insert_field(&max)?;
                    out.insert(strata_column::ColumnWithTypeAndName::new(
                        col.name.clone(),
                        col.data_type.clone(),
                        extreme,
                    ))?;
                }
                self.extremes = Some(out);
            }
            Some(current) => {
                for (acc, col) in current.iter_mut().zip(block.iter()) {
                    let (min, max) = col.column.extremes();
                    let cur_min = acc.column.field_at(0);
                    let cur_max = acc.column.field_at(1);
                    let new_min = if min.cmp_with_nan_hint(&cur_min, 1).is_lt() {
                        min
                    } else {
                        cur_min
                    };
                    let new_max = if max.cmp_with_nan_hint(&cur_max, 1).is_gt() {
                        max
                    } else {
                        cur_max
                    };
                    let mut extreme = acc.column.empty_like();
                    extreme.insert_field(&new_min)?;
                    extreme.insert_field(&new_max)?;
                    acc.column = extreme;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::{Column, ColumnWithTypeAndName};
    use strata_types::{DataType, Field};

    #[test]
    fn test_extremes_two_blocks() {
        let mut profile = ProfileInfo::new();
        profile.enable_extremes();

        let block1 = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "x",
            DataType::Int64,
            Column::Int64(vec![3, -1, 2]),
        )])
        .expect("block");
        let block2 = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "x",
            DataType::Int64,
            Column::Int64(vec![10, -5]),
        )])
        .expect("block");

        profile.update_extremes(&block1).expect("extremes");
        profile.update_extremes(&block2).expect("extremes");

        let extremes = profile.extremes().expect("present");
        assert_eq!(extremes.rows(), 2);
        assert_eq!(extremes.by_position(0).column.field_at(0), Field::Int64(-5));
        assert_eq!(extremes.by_position(0).column.field_at(1), Field::Int64(10));
    }
}
