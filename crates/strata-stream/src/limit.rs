//! LIMIT with optional OFFSET.

use std::sync::Arc;

use strata_column::Block;
use strata_error::Result;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct LimitBlockInputStream {
    child: Box<dyn BlockInputStream>,
    limit: usize,
    offset: usize,
    /// Rows seen from the child so far.
    seen: usize,
    /// Rows emitted downstream so far.
    emitted: usize,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl LimitBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        limit: usize,
        offset: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            limit,
            offset,
            seen: 0,
            emitted: 0,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for LimitBlockInputStream {
    fn name(&self) -> &'static str {
        "Limit"
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
            if self.emitted >= self.limit {
                return Ok(Block::new());
            }
            let block = self.child.read()?;
            if block.is_empty() {
                return Ok(block);
            }
            let rows = block.rows();
            let block_start = self.seen;
            self.seen += rows;

            if self.seen <= self.offset {
                continue;
            }
            let start_in_block = self.offset.saturating_sub(block_start);
            let available = rows - start_in_block;
            let take = available.min(self.limit - self.emitted);
            self.emitted += take;

            if start_in_block == 0 && take == rows {
                return Ok(block);
            }
            return block.cut(start_in_block, take);
        }
    }
}
