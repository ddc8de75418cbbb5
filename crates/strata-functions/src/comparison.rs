//! Row-wise comparisons producing a 0/1 `UInt8` mask column.

use std::cmp::Ordering;

use strata_column::{Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_types::DataType;

use crate::function::Function;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Equals,
    NotEquals,
    Less,
    Greater,
    LessOrEquals,
    GreaterOrEquals,
}

impl ComparisonOp {
    const fn name(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "notEquals",
            Self::Less => "less",
            Self::Greater => "greater",
            Self::LessOrEquals => "lessOrEquals",
            Self::GreaterOrEquals => "greaterOrEquals",
        }
    }

    fn matches(self, ord: Ordering) -> bool {
        match self {
            Self::Equals => ord == Ordering::Equal,
            Self::NotEquals => ord != Ordering::Equal,
            Self::Less => ord == Ordering::Less,
            Self::Greater => ord == Ordering::Greater,
            Self::LessOrEquals => ord != Ordering::Greater,
            Self::GreaterOrEquals => ord != Ordering::Less,
        }
    }
}

pub struct ComparisonFunction {
    op: ComparisonOp,
}

impl ComparisonFunction {
    #[must_use]
    pub const fn new(op: ComparisonOp) -> Self {
        Self { op }
    }
}

impl Function for ComparisonFunction {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != 2 {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("{} expects 2 arguments, got {}", self.op.name(), args.len()),
            });
        }
        let comparable = (args[0].is_numeric() && args[1].is_numeric())
            || matches!(
                (&args[0], &args[1]),
                (DataType::String | DataType::FixedString(_), DataType::String | DataType::FixedString(_))
            );
        if !comparable {
            return Err(StrataError::IllegalTypeOfArgument {
                function: self.op.name().into(),
                type_name: format!("{}, {}", args[0].name(), args[1].name()),
            });
        }
        Ok(DataType::UInt8)
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let arg_types: Vec<DataType> = args.iter().map(|a| a.data_type.clone()).collect();
        self.return_type(&arg_types)?;

        // Comparing through fields keeps one code path for every
        // numeric-width pairing; constants compare without materializing.
        let left = &args[0].column;
        let right = &args[1].column;
        let mut mask = Vec::with_capacity(rows);
        let same_variant = left.variant_name() == right.variant_name() && !left.is_const();
        for i in 0..rows {
            let ord = if same_variant {
                left.compare_at(i, right, i, 1)
            } else {
                left.field_at(i).cmp_with_nan_hint(&right.field_at(i), 1)
            };
            mask.push(u8::from(self.op.matches(ord)));
        }
        Ok(Column::UInt8(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::ConstColumn;
    use strata_types::Field;

    fn arg(ty: DataType, col: Column) -> ColumnWithTypeAndName {
        ColumnWithTypeAndName::new("x", ty, col)
    }

    #[test]
    fn test_less_mask() {
        let a = arg(DataType::Int64, Column::Int64(vec![1, 5, 3]));
        let b = arg(DataType::Int64, Column::Int64(vec![2, 2, 3]));
        let out = ComparisonFunction::new(ComparisonOp::Less)
            .execute(&[&a, &b], 3)
            .expect("less");
        assert_eq!(out.field_at(0), Field::UInt64(1));
        assert_eq!(out.field_at(1), Field::UInt64(0));
        assert_eq!(out.field_at(2), Field::UInt64(0));
    }

    #[test]
    fn test_equals_against_constant() {
        let a = arg(DataType::UInt64, Column::UInt64(vec![7, 8, 7]));
        let c = arg(
            DataType::UInt64,
            Column::Const(Box::new(ConstColumn::new(
                DataType::UInt64,
                Field::UInt64(7),
                3,
            ))),
        );
        let out = ComparisonFunction::new(ComparisonOp::Equals)
            .execute(&[&a, &c], 3)
            .expect("equals");
        assert_eq!(out.field_at(0), Field::UInt64(1));
        assert_eq!(out.field_at(1), Field::UInt64(0));
        assert_eq!(out.field_at(2), Field::UInt64(1));
    }

    #[test]
    fn test_string_comparison() {
        let mut s = strata_column::StringColumn::new();
        s.push(b"a");
        s.push(b"c");
        let a = arg(DataType::String, Column::String(s));
        let mut t = strata_column::StringColumn::new();
        t.push(b"b");
        t.push(b"b");
        let b = arg(DataType::String, Column::String(t));
        let out = ComparisonFunction::new(ComparisonOp::GreaterOrEquals)
            .execute(&[&a, &b], 2)
            .expect("cmp");
        assert_eq!(out.field_at(0), Field::UInt64(0));
        assert_eq!(out.field_at(1), Field::UInt64(1));
    }

    #[test]
    fn test_mixed_width_numerics() {
        let a = arg(DataType::UInt8, Column::UInt8(vec![200]));
        let b = arg(DataType::Int64, Column::Int64(vec![-1]));
        let out = ComparisonFunction::new(ComparisonOp::Greater)
            .execute(&[&a, &b], 1)
            .expect("cmp");
        assert_eq!(out.field_at(0), Field::UInt64(1));
    }
}
