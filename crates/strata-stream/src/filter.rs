//! WHERE: drop rows by a 0/1 column.

use std::sync::Arc;

use strata_column::{Block, Column};
use strata_error::{Result, StrataError};
use strata_functions::Expression;
use strata_types::Field;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::BlockInputStream;

pub struct FilterBlockInputStream {
    child: Box<dyn BlockInputStream>,
    /// Optional expression computing the filter column first.
    expression: Option<Expression>,
    filter_column: String,
    /// Drop the filter column from the output (it was synthesized).
    remove_filter_column: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl FilterBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        expression: Option<Expression>,
        filter_column: impl Into<String>,
        remove_filter_column: bool,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            expression,
            filter_column: filter_column.into(),
            remove_filter_column,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for FilterBlockInputStream {
    fn name(&self) -> &'static str {
        "Filter"
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
            let mut block = self.child.read()?;
            if block.is_empty() {
                return Ok(block);
            }
            if let Some(expression) = &self.expression {
                expression.execute(&mut block)?;
            }

            let pos = block.position_by_name(&self.filter_column)?;
            let filter_col = &block.by_position(pos).column;

            // A constant filter either passes the block through untouched
            // or skips it entirely; no per-row work.
            if let Some(constant) = filter_col.as_const() {
                let truthy = !matches!(constant.value(), Field::UInt64(0) | Field::Int64(0));
                if !truthy {
                    continue;
                }
                if self.remove_filter_column {
                    block.erase(&self.filter_column)?;
                }
                return Ok(block);
            }

            let mask = match filter_col {
                Column::UInt8(mask) => mask.clone(),
                other => {
                    return Err(StrataError::IllegalColumn {
                        column: other.variant_name().into(),
                        context: "filter column must be UInt8".into(),
                    });
                }
            };

            let mut filtered = block.filter_rows(&mask)?;
            if self.remove_filter_column {
                filtered.erase(&self.filter_column)?;
            }
            if filtered.rows() > 0 {
                return Ok(filtered);
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
    use strata_functions::{ComparisonFunction, ComparisonOp, ExpressionAction};
    use strata_types::DataType;

    fn source(control: &Arc<ExecControl>) -> Box<dyn BlockInputStream> {
        let block = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "n",
            DataType::UInt64,
            Column::UInt64(vec![1, 5, 2, 7]),
        )])
        .expect("block");
        Box::new(BlocksListInputStream::new(vec![block], Arc::clone(control)))
    }

    #[test]
    fn test_filter_with_expression() {
        let control = ExecControl::unlimited();
        let expression = Expression::new(vec![
            ExpressionAction::AddConstant {
                name: "__bound".into(),
                data_type: DataType::UInt64,
                value: Field::UInt64(4),
            },
            ExpressionAction::ApplyFunction {
                function: Arc::new(ComparisonFunction::new(ComparisonOp::Greater)),
                arguments: vec!["n".into(), "__bound".into()],
                result: "__filter".into(),
            },
        ]);
        let mut stream = FilterBlockInputStream::new(
            source(&control),
            Some(expression),
            "__filter",
            true,
            Arc::clone(&control),
        );
        let out = read_all(&mut stream).expect("read");
        assert_eq!(out.rows(), 2);
        assert_eq!(out.columns(), 2); // n and __bound; the mask is gone
        assert_eq!(out.by_name("n").expect("n").column.field_at(0), Field::UInt64(5));
        assert_eq!(out.by_name("n").expect("n").column.field_at(1), Field::UInt64(7));
    }

    #[test]
    fn test_all_false_blocks_are_skipped() {
        let control = ExecControl::unlimited();
        let block = Block::from_columns(vec![
            ColumnWithTypeAndName::new("n", DataType::UInt64, Column::UInt64(vec![1, 2])),
            ColumnWithTypeAndName::new("f", DataType::UInt8, Column::UInt8(vec![0, 0])),
        ])
        .expect("block");
        let child = Box::new(BlocksListInputStream::new(
            vec![block],
            Arc::clone(&control),
        ));
        let mut stream =
            FilterBlockInputStream::new(child, None, "f", false, Arc::clone(&control));
        assert!(stream.read().expect("read").is_empty());
    }
}
