//! A resolved expression: the ordered actions the interpreter layer
//! lowers a SELECT list or WHERE clause into.

use std::sync::Arc;

use strata_column::{Block, Column, ColumnWithTypeAndName, ConstColumn};
use strata_error::Result;
use strata_types::{DataType, Field, Names};

use crate::function::Function;

pub enum ExpressionAction {
    /// Evaluate `function(arguments…)` and append the result column.
    ApplyFunction {
        function: Arc<dyn Function>,
        arguments: Names,
        result: String,
    },
    /// Append a constant column.
    AddConstant {
        name: String,
        data_type: DataType,
        value: Field,
    },
    /// Keep only the named columns, in that order.
    Project { names: Names },
}

pub struct Expression {
    actions: Vec<ExpressionAction>,
}

impl Expression {
    #[must_use]
    pub fn new(actions: Vec<ExpressionAction>) -> Self {
        Self { actions }
    }

    /// Column names the expression reads from its input block.
    #[must_use]
    pub fn required_columns(&self) -> Names {
        let mut produced: Vec<&str> = Vec::new();
        let mut required = Names::new();
        for action in &self.actions {
            match action {
                ExpressionAction::ApplyFunction {
                    arguments, result, ..
                } => {
                    for arg in arguments {
                        if !produced.contains(&arg.as_str()) && !required.contains(arg) {
                            required.push(arg.clone());
                        }
                    }
                    produced.push(result);
                }
                ExpressionAction::AddConstant { name, .. } => produced.push(name),
                ExpressionAction::Project { .. } => {}
            }
        }
        required
    }

    /// Run every action against the block, in order.
    pub fn execute(&self, block: &mut Block) -> Result<()> {
        for action in &self.actions {
            match action {
                ExpressionAction::ApplyFunction {
                    function,
                    arguments,
                    result,
                } => {
                    let rows = block.rows();
                    let positions: Result<Vec<usize>> = arguments
                        .iter()
                        .map(|name| block.position_by_name(name))
                        .collect();
                    let positions = positions?;
                    let args: Vec<&ColumnWithTypeAndName> =
                        positions.iter().map(|&p| block.by_position(p)).collect();
                    let arg_types: Vec<DataType> =
                        args.iter().map(|a| a.data_type.clone()).collect();
                    let column = function.execute(&args, rows)?;
                    let data_type = match &column {
                        // The executed column is authoritative for types
                        // that depend on constant arguments.
                        Column::Tuple(_) | Column::Const(_) => function.return_type(&arg_types)?,
                        other => data_type_of(other, &arg_types, function.as_ref())?,
                    };
                    block.insert(ColumnWithTypeAndName::new(result.clone(), data_type, column))?;
                }
                ExpressionAction::AddConstant {
                    name,
                    data_type,
                    value,
                } => {
                    let rows = block.rows();
                    block.insert(ColumnWithTypeAndName::new(
                        name.clone(),
                        data_type.clone(),
                        Column::Const(Box::new(ConstColumn::new(
                            data_type.clone(),
                            value.clone(),
                            rows,
                        ))),
                    ))?;
                }
                ExpressionAction::Project { names } => {
                    let mut projected = Block::new();
                    for name in names {
                        let col = block.by_name(name)?;
                        projected.insert(col.clone())?;
                    }
                    *block = projected;
                }
            }
        }
        Ok(())
    }
}

/// Derive the declared type of an executed column, falling back to the
/// function signature where the variant is ambiguous.
fn data_type_of(column: &Column, arg_types: &[DataType], function: &dyn Function) -> Result<DataType> {
    Ok(match column {
        Column::UInt8(_) => DataType::UInt8,
        Column::UInt16(_) => DataType::UInt16,
        Column::UInt32(_) => DataType::UInt32,
        Column::UInt64(_) => DataType::UInt64,
        Column::Int8(_) => DataType::Int8,
        Column::Int16(_) => DataType::Int16,
        Column::Int32(_) => DataType::Int32,
        Column::Int64(_) => DataType::Int64,
        Column::Float32(_) => DataType::Float32,
        Column::Float64(_) => DataType::Float64,
        Column::Date(_) => DataType::Date,
        Column::DateTime(_) => DataType::DateTime,
        Column::String(_) => DataType::String,
        Column::FixedString(c) => DataType::FixedString(c.width()),
        _ => function.return_type(arg_types)?,
    })
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for action in &self.actions {
            match action {
                ExpressionAction::ApplyFunction {
                    function,
                    arguments,
                    result,
                } => {
                    list.entry(&format!(
                        "{} = {}({})",
                        result,
                        function.name(),
                        arguments.join(", ")
                    ));
                }
                ExpressionAction::AddConstant { name, value, .. } => {
                    list.entry(&format!("{name} = {value}"));
                }
                ExpressionAction::Project { names } => {
                    list.entry(&format!("project({})", names.join(", ")));
                }
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionRegistry;

    #[test]
    fn test_where_clause_shape() {
        // n + 1 > 3, then project the mask.
        let registry = FunctionRegistry::with_builtins();
        let expr = Expression::new(vec![
            ExpressionAction::AddConstant {
                name: "__one".into(),
                data_type: DataType::UInt8,
                value: Field::UInt64(1),
            },
            ExpressionAction::AddConstant {
                name: "__three".into(),
                data_type: DataType::UInt8,
                value: Field::UInt64(3),
            },
            ExpressionAction::ApplyFunction {
                function: registry.get("plus").expect("plus"),
                arguments: vec!["n".into(), "__one".into()],
                result: "__sum".into(),
            },
            ExpressionAction::ApplyFunction {
                function: registry.get("greater").expect("greater"),
                arguments: vec!["__sum".into(), "__three".into()],
                result: "mask".into(),
            },
            ExpressionAction::Project {
                names: vec!["n".into(), "mask".into()],
            },
        ]);

        assert_eq!(expr.required_columns(), vec!["n".to_string()]);

        let mut block = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "n",
            DataType::UInt64,
            Column::UInt64(vec![1, 3, 5]),
        )])
        .expect("block");
        expr.execute(&mut block).expect("execute");

        assert_eq!(block.columns(), 2);
        let mask = &block.by_name("mask").expect("mask").column;
        assert_eq!(mask.field_at(0), Field::UInt64(0));
        assert_eq!(mask.field_at(1), Field::UInt64(1));
        assert_eq!(mask.field_at(2), Field::UInt64(1));
    }
}
