//! Trivial in-memory sources.

use std::sync::Arc;

use strata_column::Block;
use strata_error::Result;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

/// Emits one block, then the end-of-stream sentinel.
pub struct OneBlockInputStream {
    block: Option<Block>,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl OneBlockInputStream {
    #[must_use]
    pub fn new(block: Block, control: Arc<ExecControl>) -> Self {
        Self {
            block: Some(block),
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for OneBlockInputStream {
    fn name(&self) -> &'static str {
        "OneBlock"
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

    fn read_impl(&mut self) -> Result<Block> {
        Ok(self.block.take().unwrap_or_default())
    }
}

/// Emits a list of blocks in order.
pub struct BlocksListInputStream {
    blocks: std::vec::IntoIter<Block>,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl BlocksListInputStream {
    #[must_use]
    pub fn new(blocks: Vec<Block>, control: Arc<ExecControl>) -> Self {
        Self {
            blocks: blocks.into_iter(),
            control,
            profile: ProfileInfo::new(),
        }
    }

    /// Same, but accounting progress as a leaf source does.
    #[must_use]
    pub fn leaf(blocks: Vec<Block>, control: Arc<ExecControl>) -> Self {
        Self {
            blocks: blocks.into_iter(),
            control,
            profile: ProfileInfo::leaf(),
        }
    }
}

impl BlockInputStream for BlocksListInputStream {
    fn name(&self) -> &'static str {
        "BlocksList"
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

    fn read_impl(&mut self) -> Result<Block> {
        Ok(self.blocks.next().unwrap_or_default())
    }
}
