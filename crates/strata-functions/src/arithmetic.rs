//! Binary and unary arithmetic over numeric columns.
//!
//! Type promotion is deliberately coarse: any float argument promotes
//! the computation to `Float64`, any signed integer to `Int64`,
//! otherwise `UInt64`. Division always yields `Float64`; modulo stays
//! integral.

use strata_column::{Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_types::{DataType, Field};

use crate::function::Function;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Negate,
}

impl ArithmeticOp {
    const fn name(self) -> &'static str {
        match self {
            Self::Plus => "plus",
            Self::Minus => "minus",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Modulo => "modulo",
            Self::Negate => "negate",
        }
    }

    const fn arity(self) -> usize {
        match self {
            Self::Negate => 1,
            _ => 2,
        }
    }
}

/// A numeric column widened to one of three computation domains.
enum NumericVec {
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

fn widen(column: &Column, rows: usize) -> Result<NumericVec> {
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    match column {
        Column::UInt8(v) => Ok(NumericVec::U64(v.iter().map(|&x| u64::from(x)).collect())),
        Column::UInt16(v) | Column::Date(v) => {
            Ok(NumericVec::U64(v.iter().map(|&x| u64::from(x)).collect()))
        }
        Column::UInt32(v) | Column::DateTime(v) => {
            Ok(NumericVec::U64(v.iter().map(|&x| u64::from(x)).collect()))
        }
        Column::UInt64(v) => Ok(NumericVec::U64(v.clone())),
        Column::Int8(v) => Ok(NumericVec::I64(v.iter().map(|&x| i64::from(x)).collect())),
        Column::Int16(v) => Ok(NumericVec::I64(v.iter().map(|&x| i64::from(x)).collect())),
        Column::Int32(v) => Ok(NumericVec::I64(v.iter().map(|&x| i64::from(x)).collect())),
        Column::Int64(v) => Ok(NumericVec::I64(v.clone())),
        Column::Float32(v) => Ok(NumericVec::F64(v.iter().map(|&x| f64::from(x)).collect())),
        Column::Float64(v) => Ok(NumericVec::F64(v.clone())),
        Column::Const(c) => {
            let widened = match c.value() {
                Field::UInt64(x) => NumericVec::U64(vec![*x; rows]),
                Field::Int64(x) => NumericVec::I64(vec![*x; rows]),
                Field::Float64(x) => NumericVec::F64(vec![*x; rows]),
                other => {
                    return Err(StrataError::IllegalTypeOfArgument {
                        function: "arithmetic".into(),
                        type_name: format!("{other}"),
                    });
                }
            };
            Ok(widened)
        }
        other => Err(StrataError::IllegalColumn {
            column: other.variant_name().into(),
            context: "arithmetic".into(),
        }),
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(v: NumericVec) -> Vec<f64> {
    match v {
        NumericVec::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        NumericVec::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        NumericVec::F64(v) => v,
    }
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(v: NumericVec) -> Result<Vec<i64>> {
    match v {
        NumericVec::U64(v) => Ok(v.into_iter().map(|x| x as i64).collect()),
        NumericVec::I64(v) => Ok(v),
        NumericVec::F64(_) => Err(StrataError::logical("float reached integral arithmetic")),
    }
}

pub struct ArithmeticFunction {
    op: ArithmeticOp,
}

impl ArithmeticFunction {
    #[must_use]
    pub const fn new(op: ArithmeticOp) -> Self {
        Self { op }
    }
}

impl Function for ArithmeticFunction {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != self.op.arity() {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!(
                    "{} expects {} arguments, got {}",
                    self.op.name(),
                    self.op.arity(),
                    args.len()
                ),
            });
        }
        for arg in args {
            if !arg.is_numeric() {
                return Err(StrataError::IllegalTypeOfArgument {
                    function: self.op.name().into(),
                    type_name: arg.name(),
                });
            }
        }
        let any_float = args
            .iter()
            .any(|t| matches!(t, DataType::Float32 | DataType::Float64));
        let any_signed = args.iter().any(|t| {
            matches!(
                t,
                DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
            )
        });
        Ok(match self.op {
            ArithmeticOp::Divide => DataType::Float64,
            ArithmeticOp::Negate => {
                if any_float {
                    DataType::Float64
                } else {
                    DataType::Int64
                }
            }
            _ if any_float => DataType::Float64,
            _ if any_signed || self.op == ArithmeticOp::Minus => DataType::Int64,
            _ => DataType::UInt64,
        })
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let arg_types: Vec<DataType> = args.iter().map(|a| a.data_type.clone()).collect();
        let result_type = self.return_type(&arg_types)?;

        if self.op == ArithmeticOp::Negate {
            let value = widen(&args[0].column, rows)?;
            return Ok(match result_type {
                DataType::Float64 => {
                    Column::Float64(to_f64(value).into_iter().map(|x| -x).collect())
                }
                _ => Column::Int64(to_i64(value)?.into_iter().map(|x| x.wrapping_neg()).collect()),
            });
        }

        let left = widen(&args[0].column, rows)?;
        let right = widen(&args[1].column, rows)?;

        match result_type {
            DataType::Float64 => {
                let (a, b) = (to_f64(left), to_f64(right));
                check_lengths(a.len(), b.len())?;
                let out = match self.op {
                    ArithmeticOp::Plus => zip_f64(&a, &b, |x, y| x + y),
                    ArithmeticOp::Minus => zip_f64(&a, &b, |x, y| x - y),
                    ArithmeticOp::Multiply => zip_f64(&a, &b, |x, y| x * y),
                    ArithmeticOp::Divide => zip_f64(&a, &b, |x, y| x / y),
                    ArithmeticOp::Modulo => zip_f64(&a, &b, f64::rem_euclid),
                    ArithmeticOp::Negate => unreachable!("handled above"),
                };
                Ok(Column::Float64(out))
            }
            DataType::Int64 => {
                let (a, b) = (to_i64(left)?, to_i64(right)?);
                check_lengths(a.len(), b.len())?;
                let out: Result<Vec<i64>> = a
                    .iter()
                    .zip(b.iter())
                    .map(|(&x, &y)| self.int_op(x, y))
                    .collect();
                Ok(Column::Int64(out?))
            }
            _ => {
                let (a, b) = (to_i64(left)?, to_i64(right)?);
                check_lengths(a.len(), b.len())?;
                let out: Result<Vec<u64>> = a
                    .iter()
                    .zip(b.iter())
                    .map(|(&x, &y)| self.int_op(x, y).map(|v| {
                        #[allow(clippy::cast_sign_loss)]
                        {
                            v as u64
                        }
                    }))
                    .collect();
                Ok(Column::UInt64(out?))
            }
        }
    }
}

impl ArithmeticFunction {
    fn int_op(&self, x: i64, y: i64) -> Result<i64> {
        Ok(match self.op {
            ArithmeticOp::Plus => x.wrapping_add(y),
            ArithmeticOp::Minus => x.wrapping_sub(y),
            ArithmeticOp::Multiply => x.wrapping_mul(y),
            ArithmeticOp::Modulo => {
                if y == 0 {
                    return Err(StrataError::ParameterOutOfBound {
                        detail: "division by zero".into(),
                    });
                }
                x.wrapping_rem(y)
            }
            ArithmeticOp::Divide | ArithmeticOp::Negate => {
                return Err(StrataError::logical("non-integral op in int_op"));
            }
        })
    }
}

fn zip_f64(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
}

fn check_lengths(left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(StrataError::SizesMismatch {
            what: "arithmetic arguments",
            left,
            right,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(name: &str, ty: DataType, col: Column) -> ColumnWithTypeAndName {
        ColumnWithTypeAndName::new(name, ty, col)
    }

    #[test]
    fn test_plus_unsigned() {
        let a = arg("a", DataType::UInt32, Column::UInt32(vec![1, 2]));
        let b = arg("b", DataType::UInt64, Column::UInt64(vec![10, 20]));
        let out = ArithmeticFunction::new(ArithmeticOp::Plus)
            .execute(&[&a, &b], 2)
            .expect("plus");
        assert_eq!(out.field_at(1), Field::UInt64(22));
    }

    #[test]
    fn test_divide_is_float() {
        let a = arg("a", DataType::UInt8, Column::UInt8(vec![1]));
        let b = arg("b", DataType::UInt8, Column::UInt8(vec![2]));
        let f = ArithmeticFunction::new(ArithmeticOp::Divide);
        assert_eq!(
            f.return_type(&[DataType::UInt8, DataType::UInt8]).expect("type"),
            DataType::Float64
        );
        let out = f.execute(&[&a, &b], 1).expect("divide");
        assert_eq!(out.field_at(0), Field::Float64(0.5));
    }

    #[test]
    fn test_const_argument_broadcasts() {
        let a = arg("a", DataType::Int64, Column::Int64(vec![5, 6, 7]));
        let two = arg(
            "two",
            DataType::UInt8,
            Column::Const(Box::new(strata_column::ConstColumn::new(
                DataType::UInt8,
                Field::UInt64(2),
                3,
            ))),
        );
        let out = ArithmeticFunction::new(ArithmeticOp::Multiply)
            .execute(&[&a, &two], 3)
            .expect("multiply");
        assert_eq!(out.field_at(2), Field::Int64(14));
    }

    #[test]
    fn test_modulo_by_zero_rejected() {
        let a = arg("a", DataType::Int64, Column::Int64(vec![5]));
        let b = arg("b", DataType::Int64, Column::Int64(vec![0]));
        assert!(ArithmeticFunction::new(ArithmeticOp::Modulo)
            .execute(&[&a, &b], 1)
            .is_err());
    }

    #[test]
    fn test_rejects_strings() {
        let f = ArithmeticFunction::new(ArithmeticOp::Plus);
        assert!(f.return_type(&[DataType::String, DataType::UInt8]).is_err());
    }
}
