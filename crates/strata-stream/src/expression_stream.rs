//! Applies a resolved expression to every block.

use std::sync::Arc;

use strata_column::Block;
use strata_error::Result;
use strata_functions::Expression;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct ExpressionBlockInputStream {
    child: Box<dyn BlockInputStream>,
    expression: Expression,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl ExpressionBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        expression: Expression,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            expression,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for ExpressionBlockInputStream {
    fn name(&self) -> &'static str {
        "Expression"
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
        let mut block = self.child.read()?;
        if block.is_empty() {
            return Ok(block);
        }
        self.expression.execute(&mut block)?;
        Ok(block)
    }
}
