//! Miscellaneous operators: `bar`, `visibleWidth`, `hostName`,
//! `currentDatabase`, and the `arrayJoin` marker.

use strata_column::{Column, ColumnWithTypeAndName, ConstColumn, StringColumn};
use strata_error::{Result, StrataError};
use strata_types::{DataType, Field};

use crate::function::Function;

/// `bar(x, min, max[, width])` renders a Unicode bar proportional to
/// `(x - min) / (max - min)`, capped at `width` (default 80) cells.
pub struct Bar;

const BAR_DEFAULT_WIDTH: f64 = 80.0;
const BAR_EIGHTHS: [&str; 8] = ["", "▏", "▎", "▍", "▌", "▋", "▊", "▉"];

fn render_bar(fraction_cells: f64, out: &mut String) {
    let full = fraction_cells.floor().max(0.0) as usize;
    for _ in 0..full {
        out.push('█');
    }
    let rem = ((fraction_cells - fraction_cells.floor()) * 8.0).round() as usize;
    if rem > 0 && rem < 8 {
        out.push_str(BAR_EIGHTHS[rem]);
    } else if rem == 8 {
        out.push('█');
    }
}

impl Function for Bar {
    fn name(&self) -> &str {
        "bar"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != 3 && args.len() != 4 {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("bar expects 3 or 4 arguments, got {}", args.len()),
            });
        }
        for arg in args {
            if !arg.is_numeric() {
                return Err(StrataError::IllegalTypeOfArgument {
                    function: "bar".into(),
                    type_name: arg.name(),
                });
            }
        }
        Ok(DataType::String)
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let value_col = &args[0].column;
        let min = const_f64(args.get(1))?;
        let max = const_f64(args.get(2))?;
        let width = match args.get(3) {
            Some(_) => const_f64(args.get(3))?,
            None => BAR_DEFAULT_WIDTH,
        };
        if max <= min {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("bar: max {max} must exceed min {min}"),
            });
        }

        let mut out = StringColumn::new();
        let mut text = String::new();
        for i in 0..rows {
            text.clear();
            let value = field_f64(&value_col.field_at(i))?;
            let cells = ((value - min) / (max - min) * width).clamp(0.0, width);
            render_bar(cells, &mut text);
            out.push(text.as_bytes());
        }
        Ok(Column::String(out))
    }
}

fn const_f64(arg: Option<&&ColumnWithTypeAndName>) -> Result<f64> {
    let arg = arg.ok_or_else(|| StrataError::ParameterOutOfBound {
        detail: "missing bar bound".into(),
    })?;
    let value = arg
        .column
        .as_const()
        .map(|c| c.value().clone())
        .unwrap_or_else(|| arg.column.field_at(0));
    field_f64(&value)
}

#[allow(clippy::cast_precision_loss)]
fn field_f64(field: &Field) -> Result<f64> {
    match field {
        Field::UInt64(v) => Ok(*v as f64),
        Field::Int64(v) => Ok(*v as f64),
        Field::Float64(v) => Ok(*v),
        other => Err(StrataError::IllegalTypeOfArgument {
            function: "bar".into(),
            type_name: format!("{other}"),
        }),
    }
}

/// `visibleWidth(x)` — display width, in characters, of the value as the
/// text formats would render it.
pub struct VisibleWidth;

impl Function for VisibleWidth {
    fn name(&self) -> &str {
        "visibleWidth"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != 1 {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("visibleWidth expects 1 argument, got {}", args.len()),
            });
        }
        Ok(DataType::UInt64)
    }

    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let col = &args[0].column;
        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            let rendered = format!("{}", col.field_at(i));
            out.push(rendered.chars().count() as u64);
        }
        Ok(Column::UInt64(out))
    }
}

/// `hostName()` — the server's host name as a constant column.
pub struct HostName;

impl Function for HostName {
    fn name(&self) -> &str {
        "hostName"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if !args.is_empty() {
            return Err(StrataError::ParameterOutOfBound {
                detail: "hostName expects no arguments".into(),
            });
        }
        Ok(DataType::String)
    }

    fn execute(&self, _args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(Column::Const(Box::new(ConstColumn::new(
            DataType::String,
            Field::from(name.as_str()),
            rows,
        ))))
    }
}

/// `currentDatabase()` — the session's database, injected at
/// construction by the interpreter layer.
pub struct CurrentDatabase {
    database: String,
}

impl CurrentDatabase {
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }
}

impl Function for CurrentDatabase {
    fn name(&self) -> &str {
        "currentDatabase"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if !args.is_empty() {
            return Err(StrataError::ParameterOutOfBound {
                detail: "currentDatabase expects no arguments".into(),
            });
        }
        Ok(DataType::String)
    }

    fn execute(&self, _args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column> {
        Ok(Column::Const(Box::new(ConstColumn::new(
            DataType::String,
            Field::from(self.database.as_str()),
            rows,
        ))))
    }
}

/// The `arrayJoin` marker.
///
/// The fan-out itself is a pipeline stage keyed on this function's name;
/// reaching `execute` means the planner failed to lift it.
pub struct ArrayJoinMarker;

impl Function for ArrayJoinMarker {
    fn name(&self) -> &str {
        "arrayJoin"
    }

    fn return_type(&self, args: &[DataType]) -> Result<DataType> {
        if args.len() != 1 {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!("arrayJoin expects 1 argument, got {}", args.len()),
            });
        }
        let DataType::Array(inner) = &args[0] else {
            return Err(StrataError::IllegalTypeOfArgument {
                function: "arrayJoin".into(),
                type_name: args[0].name(),
            });
        };
        Ok((**inner).clone())
    }

    fn execute(&self, _args: &[&ColumnWithTypeAndName], _rows: usize) -> Result<Column> {
        Err(StrataError::logical(
            "arrayJoin must be executed by its pipeline stage, not as an ordinary function",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num_arg(col: Column) -> ColumnWithTypeAndName {
        ColumnWithTypeAndName::new("x", DataType::UInt64, col)
    }

    fn const_arg(v: u64, rows: usize) -> ColumnWithTypeAndName {
        ColumnWithTypeAndName::new(
            "c",
            DataType::UInt64,
            Column::Const(Box::new(ConstColumn::new(
                DataType::UInt64,
                Field::UInt64(v),
                rows,
            ))),
        )
    }

    #[test]
    fn test_bar_proportions() {
        let x = num_arg(Column::UInt64(vec![0, 5, 10]));
        let (min, max, width) = (const_arg(0, 3), const_arg(10, 3), const_arg(10, 3));
        let out = Bar.execute(&[&x, &min, &max, &width], 3).expect("bar");
        assert_eq!(out.field_at(0), Field::from(""));
        assert_eq!(out.field_at(1), Field::from("█████"));
        assert_eq!(out.field_at(2), Field::from("██████████"));
    }

    #[test]
    fn test_bar_fractional_cell() {
        let x = num_arg(Column::UInt64(vec![1]));
        let (min, max, width) = (const_arg(0, 1), const_arg(16, 1), const_arg(2, 1));
        let out = Bar.execute(&[&x, &min, &max, &width], 1).expect("bar");
        // 1/16 of two cells = one eighth of a cell.
        assert_eq!(out.field_at(0), Field::from("▏"));
    }

    #[test]
    fn test_visible_width() {
        let x = num_arg(Column::UInt64(vec![7, 42, 12345]));
        let out = VisibleWidth.execute(&[&x], 3).expect("width");
        assert_eq!(out.field_at(0), Field::UInt64(1));
        assert_eq!(out.field_at(1), Field::UInt64(2));
        assert_eq!(out.field_at(2), Field::UInt64(5));
    }

    #[test]
    fn test_array_join_marker_refuses_execution() {
        assert_eq!(
            ArrayJoinMarker
                .return_type(&[DataType::Array(Box::new(DataType::UInt32))])
                .expect("type"),
            DataType::UInt32
        );
        let x = num_arg(Column::UInt64(vec![1]));
        assert!(ArrayJoinMarker.execute(&[&x], 1).is_err());
    }
}
