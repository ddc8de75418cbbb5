//! The column sum type and its uniform operation surface.
//!
//! Hot primitives (the numeric variants) dispatch through one `match`
//! per operation to monomorphized kernels in [`crate::vec_ops`];
//! variable-length variants implement the same contract in their own
//! modules. Operations that depend on data shape (`filter`, `permute`,
//! `replicate`, `cut`) validate sizes and return `Result`; row accessors
//! (`compare_at`, `data_at`, `u64_bits_at`) treat a wrong variant as a
//! caller bug and panic, mirroring slice indexing.

use std::cmp::Ordering;

use strata_error::{Result, StrataError};
use strata_types::{DataType, Field};

use crate::array::ArrayColumn;
use crate::constant::ConstColumn;
use crate::states::StatesColumn;
use crate::string::{FixedStringColumn, StringColumn};
use crate::vec_ops::{extremes_vec, filter_vec, permute_vec, replicate_vec, NativeValue};

/// 0/1 byte mask with one entry per row.
pub type Filter = Vec<u8>;

/// Row indices describing a reordering.
pub type Permutation = Vec<usize>;

#[derive(Debug, Clone)]
pub enum Column {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    /// Days since the Unix epoch.
    Date(Vec<u16>),
    /// Seconds since the Unix epoch.
    DateTime(Vec<u32>),
    String(StringColumn),
    FixedString(FixedStringColumn),
    Array(Box<ArrayColumn>),
    Tuple(Vec<Column>),
    Const(Box<ConstColumn>),
    AggregateStates(StatesColumn),
}

/// Evaluate `$e` with `$v` bound to the numeric payload; non-numeric
/// variants fall through to the listed arms.
macro_rules! for_numeric {
    ($value:expr, $v:ident => $e:expr, $($rest:tt)*) => {
        match $value {
            Column::UInt8($v) => $e,
            Column::UInt16($v) => $e,
            Column::UInt32($v) => $e,
            Column::UInt64($v) => $e,
            Column::Int8($v) => $e,
            Column::Int16($v) => $e,
            Column::Int32($v) => $e,
            Column::Int64($v) => $e,
            Column::Float32($v) => $e,
            Column::Float64($v) => $e,
            Column::Date($v) => $e,
            Column::DateTime($v) => $e,
            $($rest)*
        }
    };
}

/// Like [`for_numeric`], but rewrap the result of `$e` in the same
/// variant. `$e` may use `?`.
macro_rules! map_numeric {
    ($value:expr, $v:ident => $e:expr, $($rest:tt)*) => {
        match $value {
            Column::UInt8($v) => Column::UInt8($e),
            Column::UInt16($v) => Column::UInt16($e),
            Column::UInt32($v) => Column::UInt32($e),
            Column::UInt64($v) => Column::UInt64($e),
            Column::Int8($v) => Column::Int8($e),
            Column::Int16($v) => Column::Int16($e),
            Column::Int32($v) => Column::Int32($e),
            Column::Int64($v) => Column::Int64($e),
            Column::Float32($v) => Column::Float32($e),
            Column::Float64($v) => Column::Float64($e),
            Column::Date($v) => Column::Date($e),
            Column::DateTime($v) => Column::DateTime($e),
            $($rest)*
        }
    };
}

/// Match both sides on the same numeric variant, binding payloads.
macro_rules! zip_numeric {
    ($pair:expr, $a:ident, $b:ident => $e:expr, $($rest:tt)*) => {
        match $pair {
            (Column::UInt8($a), Column::UInt8($b)) => $e,
            (Column::UInt16($a), Column::UInt16($b)) => $e,
            (Column::UInt32($a), Column::UInt32($b)) => $e,
            (Column::UInt64($a), Column::UInt64($b)) => $e,
            (Column::Int8($a), Column::Int8($b)) => $e,
            (Column::Int16($a), Column::Int16($b)) => $e,
            (Column::Int32($a), Column::Int32($b)) => $e,
            (Column::Int64($a), Column::Int64($b)) => $e,
            (Column::Float32($a), Column::Float32($b)) => $e,
            (Column::Float64($a), Column::Float64($b)) => $e,
            (Column::Date($a), Column::Date($b)) => $e,
            (Column::DateTime($a), Column::DateTime($b)) => $e,
            $($rest)*
        }
    };
}

#[inline]
fn bytes_of<T: NativeValue>(v: &T) -> &[u8] {
    // Values are stored in native (little-endian) layout; the byte view
    // is what the on-disk format and packed hash keys use directly.
    unsafe { std::slice::from_raw_parts((v as *const T).cast::<u8>(), std::mem::size_of::<T>()) }
}

impl Column {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        for_numeric!(self, v => v.len(),
            Column::String(c) => c.len(),
            Column::FixedString(c) => c.len(),
            Column::Array(c) => c.len(),
            Column::Tuple(cols) => cols.first().map_or(0, Column::len),
            Column::Const(c) => c.len(),
            Column::AggregateStates(c) => c.len(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        for_numeric!(self, v => std::mem::size_of_val(v.as_slice()),
            Column::String(c) => c.byte_size(),
            Column::FixedString(c) => c.byte_size(),
            Column::Array(c) => c.byte_size(),
            Column::Tuple(cols) => cols.iter().map(Column::byte_size).sum(),
            Column::Const(c) => std::mem::size_of::<Field>() * c.len().min(1),
            Column::AggregateStates(c) => c.byte_size(),
        )
    }

    #[must_use]
    pub const fn is_const(&self) -> bool {
        matches!(self, Column::Const(_))
    }

    /// An empty column of the same variant (and width/element type).
    #[must_use]
    pub fn empty_like(&self) -> Column {
        map_numeric!(self, _v => Vec::new(),
            Column::String(_) => Column::String(StringColumn::new()),
            Column::FixedString(c) => Column::FixedString(FixedStringColumn::new(c.width())),
            Column::Array(c) => Column::Array(Box::new(ArrayColumn::new(c.values().empty_like()))),
            Column::Tuple(cols) => Column::Tuple(cols.iter().map(Column::empty_like).collect()),
            Column::Const(c) => Column::Const(Box::new(c.with_len(0))),
            Column::AggregateStates(_) => Column::AggregateStates(StatesColumn::new()),
        )
    }

    /// An empty column for a data type.
    pub fn empty_of(data_type: &DataType) -> Result<Column> {
        Ok(match data_type {
            DataType::UInt8 => Column::UInt8(Vec::new()),
            DataType::UInt16 => Column::UInt16(Vec::new()),
            DataType::UInt32 => Column::UInt32(Vec::new()),
            DataType::UInt64 => Column::UInt64(Vec::new()),
            DataType::Int8 => Column::Int8(Vec::new()),
            DataType::Int16 => Column::Int16(Vec::new()),
            DataType::Int32 => Column::Int32(Vec::new()),
            DataType::Int64 => Column::Int64(Vec::new()),
            DataType::Float32 => Column::Float32(Vec::new()),
            DataType::Float64 => Column::Float64(Vec::new()),
            DataType::Date => Column::Date(Vec::new()),
            DataType::DateTime => Column::DateTime(Vec::new()),
            DataType::String => Column::String(StringColumn::new()),
            DataType::FixedString(n) => Column::FixedString(FixedStringColumn::new(*n)),
            DataType::Array(inner) => {
                Column::Array(Box::new(ArrayColumn::new(Column::empty_of(inner)?)))
            }
            DataType::Tuple(types) => {
                let cols: Result<Vec<Column>> = types.iter().map(Column::empty_of).collect();
                Column::Tuple(cols?)
            }
            DataType::AggregateFunction { .. } => Column::AggregateStates(StatesColumn::new()),
        })
    }

    /// A column of `len` default values for a data type.
    pub fn defaults_of(data_type: &DataType, len: usize) -> Result<Column> {
        let mut col = Self::empty_of(data_type)?;
        col.reserve(len);
        for _ in 0..len {
            col.insert_default();
        }
        Ok(col)
    }

    /// The value of row `i` as a [`Field`].
    ///
    /// Panics on aggregate-state columns, which have no value form.
    #[must_use]
    pub fn field_at(&self, i: usize) -> Field {
        for_numeric!(self, v => v[i].to_field(),
            Column::String(c) => Field::String(c.value_at(i).to_vec()),
            Column::FixedString(c) => Field::String(c.value_at(i).to_vec()),
            Column::Array(c) => c.field_at(i),
            Column::Tuple(cols) => Field::Tuple(cols.iter().map(|c| c.field_at(i)).collect()),
            Column::Const(c) => {
                assert!(i < c.len(), "constant column row {i} out of range {}", c.len());
                c.value().clone()
            }
            Column::AggregateStates(_) => {
                panic!("aggregate-state columns have no field representation")
            }
        )
    }

    /// Byte view of the value of row `i`.
    ///
    /// Defined for fixed-width and string variants; panics for array,
    /// tuple, constant and state columns.
    #[must_use]
    pub fn data_at(&self, i: usize) -> &[u8] {
        for_numeric!(self, v => bytes_of(&v[i]),
            Column::String(c) => c.value_at(i),
            Column::FixedString(c) => c.value_at(i),
            other => panic!("data_at is not defined for {}", other.variant_name()),
        )
    }

    /// Raw value bits of numeric row `i`, zero-extended to 64.
    ///
    /// Panics on non-numeric variants; used by hash-key builders after
    /// method selection has proven the column numeric.
    #[must_use]
    pub fn u64_bits_at(&self, i: usize) -> u64 {
        for_numeric!(self, v => v[i].to_u64_bits(),
            Column::Const(c) => {
                assert!(i < c.len());
                match c.value() {
                    Field::UInt64(x) => *x,
                    #[allow(clippy::cast_sign_loss)]
                    Field::Int64(x) => *x as u64,
                    Field::Float64(x) => x.to_bits(),
                    other => panic!("constant {other} has no numeric bits"),
                }
            }
            other => panic!("u64_bits_at is not defined for {}", other.variant_name()),
        )
    }

    /// Append a numeric value from its raw 64-bit form; inverse of
    /// [`Column::u64_bits_at`] for the same variant.
    pub fn push_u64_bits(&mut self, bits: u64) {
        for_numeric!(self, v => v.push(NativeValue::from_u64_bits(bits)),
            other => panic!("push_u64_bits is not defined for {}", other.variant_name()),
        )
    }

    /// Fixed width of one value, when the variant has one.
    #[must_use]
    pub fn fixed_value_width(&self) -> Option<usize> {
        for_numeric!(self, v => {
            fn width_of<T>(_: &[T]) -> usize { std::mem::size_of::<T>() }
            Some(width_of(v))
        },
            Column::FixedString(c) => Some(c.width()),
            _ => None,
        )
    }

    pub fn reserve(&mut self, additional: usize) {
        for_numeric!(self, v => v.reserve(additional),
            Column::String(c) => c.reserve(additional, 0),
            Column::FixedString(c) => c.reserve(additional),
            Column::Array(c) => c.reserve(additional),
            Column::Tuple(cols) => {
                for col in cols {
                    col.reserve(additional);
                }
            }
            Column::Const(_) | Column::AggregateStates(_) => {}
        )
    }

    /// Append the default value (zero / empty).
    pub fn insert_default(&mut self) {
        for_numeric!(self, v => v.push(NativeValue::from_u64_bits(0)),
            Column::String(c) => c.push(b""),
            Column::FixedString(c) => c.push_default(),
            Column::Array(c) => c.insert_default(),
            Column::Tuple(cols) => {
                for col in cols {
                    col.insert_default();
                }
            }
            Column::Const(c) => c.set_len(c.len() + 1),
            Column::AggregateStates(c) => c.push(crate::states::StatePtr::null()),
        )
    }

    /// Append one value converted from a [`Field`].
    pub fn insert_field(&mut self, field: &Field) -> Result<()> {
        match self {
            Column::String(c) => {
                let bytes = field.as_bytes().ok_or_else(|| type_mismatch("String", field))?;
                c.push(bytes);
                Ok(())
            }
            Column::FixedString(c) => {
                let bytes = field.as_bytes().ok_or_else(|| type_mismatch("FixedString", field))?;
                c.push(bytes)
            }
            Column::Array(c) => c.insert_field(field),
            Column::Tuple(cols) => {
                let Field::Tuple(items) = field else {
                    return Err(type_mismatch("Tuple", field));
                };
                if items.len() != cols.len() {
                    return Err(StrataError::SizesMismatch {
                        what: "tuple field and tuple column",
                        left: items.len(),
                        right: cols.len(),
                    });
                }
                for (col, item) in cols.iter_mut().zip(items.iter()) {
                    col.insert_field(item)?;
                }
                Ok(())
            }
            Column::Const(_) => Err(StrataError::IllegalColumn {
                column: "Const".into(),
                context: "insert_field".into(),
            }),
            Column::AggregateStates(_) => Err(StrataError::IllegalColumn {
                column: "AggregateStates".into(),
                context: "insert_field".into(),
            }),
            numeric => {
                for_numeric!(numeric, v => {
                    match NativeValue::from_field(field) {
                        Some(value) => {
                            v.push(value);
                            Ok(())
                        }
                        None => Err(type_mismatch("numeric", field)),
                    }
                },
                    _ => unreachable!("non-numeric variants handled above"),
                )
            }
        }
    }

    /// Append row `i` of `src`, which must be the same variant.
    pub fn insert_from(&mut self, src: &Column, i: usize) -> Result<()> {
        zip_numeric!((&mut *self, src), a, b => {
            a.push(b[i]);
            Ok(())
        },
            (Column::String(a), Column::String(b)) => {
                a.push(b.value_at(i));
                Ok(())
            }
            (Column::FixedString(a), Column::FixedString(b)) => a.push(b.value_at(i)),
            (Column::Array(a), Column::Array(b)) => a.insert_from(b, i),
            (Column::Tuple(a), Column::Tuple(b)) => {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    x.insert_from(y, i)?;
                }
                Ok(())
            }
            (Column::AggregateStates(a), Column::AggregateStates(b)) => {
                a.insert_from(b, i);
                Ok(())
            }
            (dst, Column::Const(c)) => {
                assert!(i < c.len());
                dst.insert_field(c.value())
            }
            (a, b) => Err(StrataError::IllegalColumn {
                column: b.variant_name().into(),
                context: format!("insert_from into {}", a.variant_name()),
            }),
        )
    }

    /// Append rows `start .. start + length` of `src`.
    pub fn insert_range_from(&mut self, src: &Column, start: usize, length: usize) -> Result<()> {
        let bulk_copied = zip_numeric!((&mut *self, src), a, b => {
            a.extend_from_slice(&b[start..start + length]);
            true
        },
            _ => false,
        );
        if bulk_copied {
            return Ok(());
        }
        for i in start..start + length {
            self.insert_from(src, i)?;
        }
        Ok(())
    }

    /// A copy of rows `start .. start + length`.
    pub fn cut(&self, start: usize, length: usize) -> Result<Column> {
        if start + length > self.len() {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!(
                    "cut [{start}, {}) out of column of {} rows",
                    start + length,
                    self.len()
                ),
            });
        }
        Ok(map_numeric!(self, v => v[start..start + length].to_vec(),
            Column::String(c) => Column::String(c.cut(start, length)),
            Column::FixedString(c) => Column::FixedString(c.cut(start, length)),
            Column::Array(c) => Column::Array(Box::new(c.cut(start, length)?)),
            Column::Tuple(cols) => {
                let cut: Result<Vec<Column>> =
                    cols.iter().map(|c| c.cut(start, length)).collect();
                Column::Tuple(cut?)
            }
            Column::Const(c) => Column::Const(Box::new(c.with_len(length))),
            Column::AggregateStates(c) => Column::AggregateStates(c.cut(start, length)),
        ))
    }

    /// Keep rows whose mask byte is non-zero.
    pub fn filter(&self, mask: &[u8]) -> Result<Column> {
        Ok(map_numeric!(self, v => filter_vec(v, mask)?,
            Column::String(c) => Column::String(c.filter(mask)?),
            Column::FixedString(c) => Column::FixedString(c.filter(mask)?),
            Column::Array(c) => Column::Array(Box::new(c.filter(mask)?)),
            Column::Tuple(cols) => {
                let filtered: Result<Vec<Column>> =
                    cols.iter().map(|c| c.filter(mask)).collect();
                Column::Tuple(filtered?)
            }
            Column::Const(c) => Column::Const(Box::new(c.filter(mask)?)),
            Column::AggregateStates(c) => Column::AggregateStates(c.filter(mask)?),
        ))
    }

    /// Reorder rows by `perm`; output length `min(perm.len(), limit)`
    /// with `limit = 0` meaning no limit.
    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Column> {
        Ok(map_numeric!(self, v => permute_vec(v, perm, limit)?,
            Column::String(c) => Column::String(c.permute(perm, limit)?),
            Column::FixedString(c) => Column::FixedString(c.permute(perm, limit)?),
            Column::Array(c) => Column::Array(Box::new(c.permute(perm, limit)?)),
            Column::Tuple(cols) => {
                let permuted: Result<Vec<Column>> =
                    cols.iter().map(|c| c.permute(perm, limit)).collect();
                Column::Tuple(permuted?)
            }
            Column::Const(c) => Column::Const(Box::new(c.permute(perm, limit)?)),
            Column::AggregateStates(c) => Column::AggregateStates(c.permute(perm, limit)?),
        ))
    }

    /// Fan out row `i` into `offsets[i] - offsets[i-1]` copies.
    pub fn replicate(&self, offsets: &[u64]) -> Result<Column> {
        Ok(map_numeric!(self, v => replicate_vec(v, offsets)?,
            Column::String(c) => Column::String(c.replicate(offsets)?),
            Column::FixedString(c) => Column::FixedString(c.replicate(offsets)?),
            Column::Array(c) => Column::Array(Box::new(c.replicate(offsets)?)),
            Column::Tuple(cols) => {
                let replicated: Result<Vec<Column>> =
                    cols.iter().map(|c| c.replicate(offsets)).collect();
                Column::Tuple(replicated?)
            }
            Column::Const(c) => Column::Const(Box::new(c.replicate(offsets)?)),
            Column::AggregateStates(c) => Column::AggregateStates(c.replicate(offsets)?),
        ))
    }

    /// Compare row `i` with row `j` of `other` (same variant), NaNs
    /// ordered per `nan_hint` as in [`Field::cmp_with_nan_hint`].
    ///
    /// Panics when the variants differ or on state columns.
    #[must_use]
    pub fn compare_at(&self, i: usize, other: &Column, j: usize, nan_hint: i8) -> Ordering {
        zip_numeric!((self, other), a, b => NativeValue::cmp_native(a[i], b[j], nan_hint),
            (Column::String(a), Column::String(b)) => a.compare_at(i, b, j),
            (Column::FixedString(a), Column::FixedString(b)) => a.compare_at(i, b, j),
            (Column::Array(a), Column::Array(b)) => a.compare_at(i, b, j, nan_hint),
            (Column::Tuple(a), Column::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare_at(i, y, j, nan_hint);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            (a @ Column::Const(_), b) | (a, b @ Column::Const(_)) => {
                a.field_at(i).cmp_with_nan_hint(&b.field_at(j), nan_hint)
            }
            (a, b) => panic!(
                "cannot compare {} with {}",
                a.variant_name(),
                b.variant_name()
            ),
        )
    }

    /// A stable permutation sorting the column.
    ///
    /// `limit = 0` sorts fully; otherwise only the first `limit` output
    /// positions are meaningful (the permutation is truncated to them).
    #[must_use]
    pub fn sort_permutation(&self, reverse: bool, limit: usize, nan_hint: i8) -> Permutation {
        let mut perm: Permutation = (0..self.len()).collect();
        perm.sort_by(|&a, &b| {
            let ord = self.compare_at(a, self, b, nan_hint);
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        });
        if limit != 0 && limit < perm.len() {
            perm.truncate(limit);
        }
        perm
    }

    /// Per-column minimum and maximum. NaNs are skipped; non-comparable
    /// variants report type defaults.
    #[must_use]
    pub fn extremes(&self) -> (Field, Field) {
        for_numeric!(self, v => match extremes_vec(v) {
            Some((min, max)) => (min.to_field(), max.to_field()),
            None => (default_field_like(self), default_field_like(self)),
        },
            Column::Const(c) => (c.value().clone(), c.value().clone()),
            other => (default_field_like(other), default_field_like(other)),
        )
    }

    /// Materialize a constant into a full column; other variants pass
    /// through unchanged.
    pub fn materialized(self) -> Result<Column> {
        match self {
            Column::Const(c) => c.to_full(),
            other => Ok(other),
        }
    }

    #[must_use]
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Column::UInt8(_) => "UInt8",
            Column::UInt16(_) => "UInt16",
            Column::UInt32(_) => "UInt32",
            Column::UInt64(_) => "UInt64",
            Column::Int8(_) => "Int8",
            Column::Int16(_) => "Int16",
            Column::Int32(_) => "Int32",
            Column::Int64(_) => "Int64",
            Column::Float32(_) => "Float32",
            Column::Float64(_) => "Float64",
            Column::Date(_) => "Date",
            Column::DateTime(_) => "DateTime",
            Column::String(_) => "String",
            Column::FixedString(_) => "FixedString",
            Column::Array(_) => "Array",
            Column::Tuple(_) => "Tuple",
            Column::Const(_) => "Const",
            Column::AggregateStates(_) => "AggregateStates",
        }
    }

    #[must_use]
    pub fn as_string(&self) -> Option<&StringColumn> {
        match self {
            Column::String(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_fixed_string(&self) -> Option<&FixedStringColumn> {
        match self {
            Column::FixedString(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_const(&self) -> Option<&ConstColumn> {
        match self {
            Column::Const(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_states(&self) -> Option<&StatesColumn> {
        match self {
            Column::AggregateStates(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_states_mut(&mut self) -> Option<&mut StatesColumn> {
        match self {
            Column::AggregateStates(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&ArrayColumn> {
        match self {
            Column::Array(c) => Some(c),
            _ => None,
        }
    }
}

fn default_field_like(col: &Column) -> Field {
    match col {
        Column::Int8(_) | Column::Int16(_) | Column::Int32(_) | Column::Int64(_) => Field::Int64(0),
        Column::Float32(_) | Column::Float64(_) => Field::Float64(0.0),
        Column::String(_) | Column::FixedString(_) => Field::String(Vec::new()),
        Column::Array(_) => Field::Array(Vec::new()),
        Column::Tuple(cols) => Field::Tuple(cols.iter().map(default_field_like).collect()),
        _ => Field::UInt64(0),
    }
}

fn type_mismatch(expected: &str, field: &Field) -> StrataError {
    StrataError::TypeMismatch {
        name: String::new(),
        expected: expected.to_string(),
        actual: format!("{field}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_popcount_law() {
        let col = Column::UInt64(vec![1, 2, 3, 4, 5]);
        let mask = [1_u8, 0, 1, 0, 1];
        let filtered = col.filter(&mask).expect("filter");
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered.field_at(2), Field::UInt64(5));
    }

    #[test]
    fn test_permute_identity_law() {
        let col = Column::Int32(vec![5, -3, 7]);
        let perm = [2_usize, 0, 1];
        let out = col.permute(&perm, 0).expect("permute");
        for (i, &p) in perm.iter().enumerate() {
            assert_eq!(out.field_at(i), col.field_at(p));
        }
    }

    #[test]
    fn test_replicate_law() {
        let col = Column::String({
            let mut s = StringColumn::new();
            s.push(b"x");
            s.push(b"y");
            s
        });
        let out = col.replicate(&[3, 3]).expect("replicate");
        assert_eq!(out.len(), 3);
        assert_eq!(out.field_at(2), Field::from("x"));
    }

    #[test]
    fn test_cut_exact_slice() {
        let col = Column::UInt8(vec![9, 8, 7, 6]);
        let cut = col.cut(1, 2).expect("cut");
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.field_at(0), Field::UInt64(8));
        assert!(col.cut(3, 2).is_err());
    }

    #[test]
    fn test_nan_sort_both_directions() {
        let col = Column::Float64(vec![1.0, f64::NAN, -2.0, f64::NAN, 0.5]);
        // NaN greatest: ascending sort puts NaNs last.
        let perm = col.sort_permutation(false, 0, 1);
        assert!(col.field_at(perm[3]).cmp_with_nan_hint(&Field::Float64(f64::NAN), 1).is_eq());
        assert!(col.field_at(perm[4]).cmp_with_nan_hint(&Field::Float64(f64::NAN), 1).is_eq());
        assert_eq!(col.field_at(perm[0]), Field::Float64(-2.0));
        // NaN least: ascending sort puts NaNs first.
        let perm = col.sort_permutation(false, 0, -1);
        assert!(matches!(col.field_at(perm[0]), Field::Float64(v) if v.is_nan()));
        assert_eq!(col.field_at(perm[4]), Field::Float64(1.0));
    }

    #[test]
    fn test_sort_permutation_is_stable() {
        let col = Column::UInt8(vec![1, 0, 1, 0]);
        let perm = col.sort_permutation(false, 0, 1);
        assert_eq!(perm, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_sort_permutation_limit() {
        let col = Column::Int64(vec![4, 1, 3, 2]);
        let perm = col.sort_permutation(false, 2, 1);
        assert_eq!(perm, vec![1, 3]);
    }

    #[test]
    fn test_insert_from_const_materializes() {
        let constant = Column::Const(Box::new(ConstColumn::new(
            DataType::String,
            Field::from("c"),
            5,
        )));
        let mut dst = Column::String(StringColumn::new());
        dst.insert_from(&constant, 3).expect("insert");
        assert_eq!(dst.field_at(0), Field::from("c"));
    }

    #[test]
    fn test_u64_bits_roundtrip() {
        let mut col = Column::Int16(Vec::new());
        col.push_u64_bits(Column::Int16(vec![-5]).u64_bits_at(0));
        assert_eq!(col.field_at(0), Field::Int64(-5));
    }

    #[test]
    fn test_extremes_skip_nan() {
        let col = Column::Float64(vec![f64::NAN, 2.0, -1.0]);
        let (min, max) = col.extremes();
        assert_eq!(min, Field::Float64(-1.0));
        assert_eq!(max, Field::Float64(2.0));
    }

    #[test]
    fn test_tuple_column_ops() {
        let col = Column::Tuple(vec![
            Column::UInt64(vec![1, 2, 3]),
            Column::String({
                let mut s = StringColumn::new();
                s.push(b"a");
                s.push(b"b");
                s.push(b"c");
                s
            }),
        ]);
        assert_eq!(col.len(), 3);
        let filtered = col.filter(&[0, 1, 1]).expect("filter");
        assert_eq!(
            filtered.field_at(0),
            Field::Tuple(vec![Field::UInt64(2), Field::from("b")])
        );
    }
}
