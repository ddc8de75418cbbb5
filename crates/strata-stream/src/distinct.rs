//! DISTINCT: keep the first occurrence of each key row.
//!
//! With a LIMIT hint the stream stops pulling from upstream as soon as
//! the set holds enough rows, so `SELECT DISTINCT … LIMIT n` reads only
//! as much input as it needs.

use std::sync::Arc;

use strata_column::{Block, Column};
use strata_error::Result;
use strata_functions::{Set, SetLimits, SetRowOutcome};
use strata_types::Names;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct DistinctBlockInputStream {
    child: Box<dyn BlockInputStream>,
    /// Key columns; empty means all columns.
    columns: Names,
    set: Set,
    /// Stop reading upstream once the set holds this many rows (0 = no
    /// hint).
    limit_hint: usize,
    stopped: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl DistinctBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        columns: Names,
        set_limits: SetLimits,
        limit_hint: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            columns,
            set: Set::new(set_limits),
            limit_hint,
            stopped: false,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for DistinctBlockInputStream {
    fn name(&self) -> &'static str {
        "Distinct"
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
            if self.stopped {
                return Ok(Block::new());
            }
            let block = self.child.read()?;
            if block.is_empty() {
                return Ok(block);
            }

            let key_columns: Vec<&Column> = if self.columns.is_empty() {
                block.iter().map(|c| &c.column).collect()
            } else {
                let mut cols = Vec::with_capacity(self.columns.len());
                for name in &self.columns {
                    cols.push(&block.by_name(name)?.column);
                }
                cols
            };

            let rows = block.rows();
            let mut mask = vec![0_u8; rows];
            let mut scratch = Vec::new();
            for (i, mask_entry) in mask.iter_mut().enumerate() {
                match self.set.insert_row(&key_columns, i, &mut scratch)? {
                    SetRowOutcome::Inserted => *mask_entry = 1,
                    SetRowOutcome::Exists | SetRowOutcome::Rejected => {}
                    SetRowOutcome::Stop => {
                        self.stopped = true;
                        break;
                    }
                }
            }

            if self.limit_hint != 0 && self.set.len() >= self.limit_hint {
                self.stopped = true;
            }

            let filtered = block.filter_rows(&mask)?;
            if filtered.rows() > 0 {
                return Ok(filtered);
            }
            if self.stopped {
                return Ok(Block::new());
            }
        }
    }
}
