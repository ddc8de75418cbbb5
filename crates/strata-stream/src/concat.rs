//! Sequential concatenation of several sources.

use std::sync::Arc;

use strata_column::Block;
use strata_error::Result;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct ConcatBlockInputStream {
    children: Vec<Box<dyn BlockInputStream>>,
    current: usize,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl ConcatBlockInputStream {
    #[must_use]
    pub fn new(children: Vec<Box<dyn BlockInputStream>>, control: Arc<ExecControl>) -> Self {
        Self {
            children,
            current: 0,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for ConcatBlockInputStream {
    fn name(&self) -> &'static str {
        "Concat"
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
        while self.current < self.children.len() {
            let block = self.children[self.current].read()?;
            if block.is_empty() {
                self.current += 1;
            } else {
                return Ok(block);
            }
        }
        Ok(Block::new())
    }
}
