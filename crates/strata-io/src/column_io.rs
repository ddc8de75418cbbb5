//! Bulk column payload (de)serialization.
//!
//! Numeric and fixed-string columns are written as raw little-endian
//! value bytes; variable strings as varint length + bytes per row. Array
//! columns are handled by the storage layer as two streams (element
//! values here, row offsets via [`write_u64_stream`]), matching the
//! `.bin` / `.size0.bin` file split.

use std::io::{Read, Write};

use strata_column::{Column, FixedStringColumn, StringColumn};
use strata_error::{Result, StrataError};
use strata_types::codec::write_varuint;
use strata_types::DataType;

const MAX_STRING_LEN: usize = 1 << 30;

/// Serialize rows `offset .. offset + count` of a flat column.
///
/// Callers decompose arrays into offsets + values and materialize
/// constants before writing; those variants are rejected here.
pub fn serialize_column(
    column: &Column,
    offset: usize,
    count: usize,
    out: &mut impl Write,
) -> Result<()> {
    if offset + count > column.len() {
        return Err(StrataError::ParameterOutOfBound {
            detail: format!(
                "serialize range [{offset}, {}) out of column of {} rows",
                offset + count,
                column.len()
            ),
        });
    }
    match column {
        Column::String(c) => {
            for i in offset..offset + count {
                let value = c.value_at(i);
                write_varuint(out, value.len() as u64)?;
                out.write_all(value)?;
            }
            Ok(())
        }
        Column::FixedString(c) => {
            let width = c.width();
            out.write_all(&c.raw()[offset * width..(offset + count) * width])?;
            Ok(())
        }
        Column::Array(_) | Column::Tuple(_) | Column::Const(_) | Column::AggregateStates(_) => {
            Err(StrataError::IllegalColumn {
                column: column.variant_name().into(),
                context: "bulk serialization".into(),
            })
        }
        numeric => {
            for i in offset..offset + count {
                out.write_all(numeric.data_at(i))?;
            }
            Ok(())
        }
    }
}

/// Deserialize up to `max_rows` rows of a flat column.
///
/// Stops early on a clean end of stream at a row boundary; a truncated
/// value is an error.
pub fn deserialize_column(
    data_type: &DataType,
    max_rows: usize,
    input: &mut impl Read,
) -> Result<Column> {
    match data_type {
        DataType::String => {
            let mut col = StringColumn::new();
            for _ in 0..max_rows {
                match try_read_varuint(input)? {
                    None => break,
                    Some(len) => {
                        let len = len as usize;
                        if len > MAX_STRING_LEN {
                            return Err(StrataError::CorruptedData {
                                detail: format!("string length {len} exceeds bound"),
                            });
                        }
                        let mut value = vec![0_u8; len];
                        input.read_exact(&mut value)?;
                        col.push(&value);
                    }
                }
            }
            Ok(Column::String(col))
        }
        DataType::FixedString(width) => {
            let mut col = FixedStringColumn::new(*width);
            let mut value = vec![0_u8; *width];
            for _ in 0..max_rows {
                match read_value(input, &mut value)? {
                    false => break,
                    true => col.push(&value)?,
                }
            }
            Ok(Column::FixedString(col))
        }
        ty if ty.is_numeric() => {
            let width = ty.fixed_value_size().unwrap_or(8);
            let mut col = Column::empty_of(ty)?;
            col.reserve(max_rows);
            let mut value = vec![0_u8; width];
            for _ in 0..max_rows {
                if !read_value(input, &mut value)? {
                    break;
                }
                let mut bits = [0_u8; 8];
                bits[..width].copy_from_slice(&value);
                col.push_u64_bits(u64::from_le_bytes(bits));
            }
            Ok(col)
        }
        other => Err(StrataError::IllegalTypeOfArgument {
            function: "deserialize_column".into(),
            type_name: other.name(),
        }),
    }
}

/// Serialize rows `offset .. offset + count` of an array column as two
/// streams: per-row element counts into `sizes_out`, flat element
/// values into `values_out`. Nested arrays are not supported by the
/// columnar file layout.
pub fn serialize_array_column(
    array: &strata_column::ArrayColumn,
    offset: usize,
    count: usize,
    sizes_out: &mut impl Write,
    values_out: &mut impl Write,
) -> Result<()> {
    if matches!(array.values(), Column::Array(_)) {
        return Err(StrataError::IllegalColumn {
            column: "Array(Array)".into(),
            context: "columnar file serialization".into(),
        });
    }
    let offsets = array.offsets();
    let elem_start = if offset == 0 {
        0
    } else {
        offsets[offset - 1] as usize
    };
    let mut prev = elem_start as u64;
    for &off in &offsets[offset..offset + count] {
        sizes_out.write_all(&(off - prev).to_le_bytes())?;
        prev = off;
    }
    let elem_end = if count == 0 {
        elem_start
    } else {
        offsets[offset + count - 1] as usize
    };
    serialize_column(array.values(), elem_start, elem_end - elem_start, values_out)
}

/// Deserialize up to `max_rows` rows of an array column from its two
/// streams. Stops early on a clean end of the sizes stream.
pub fn deserialize_array_column(
    element_type: &DataType,
    max_rows: usize,
    sizes_in: &mut impl Read,
    values_in: &mut impl Read,
) -> Result<Column> {
    let sizes = read_u64_stream(max_rows, sizes_in)?;
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut total = 0_u64;
    for size in sizes {
        total += size;
        offsets.push(total);
    }
    let values = deserialize_column(element_type, total as usize, values_in)?;
    if values.len() as u64 != total {
        return Err(StrataError::UnexpectedEndOfFile {
            expected: total as usize,
            actual: values.len(),
        });
    }
    Ok(Column::Array(Box::new(
        strata_column::ArrayColumn::from_parts(values, offsets)?,
    )))
}

/// Write a `u64` slice as raw little-endian values (array offsets, marks).
pub fn write_u64_stream(values: &[u64], out: &mut impl Write) -> Result<()> {
    for value in values {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Read up to `max_values` `u64`s, stopping on clean end of stream.
pub fn read_u64_stream(max_values: usize, input: &mut impl Read) -> Result<Vec<u64>> {
    let mut values = Vec::new();
    let mut buf = [0_u8; 8];
    for _ in 0..max_values {
        if !read_value(input, &mut buf)? {
            break;
        }
        values.push(u64::from_le_bytes(buf));
    }
    Ok(values)
}

/// Fill `buf` entirely, or report a clean end before the first byte.
fn read_value(input: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0_usize;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(StrataError::UnexpectedEndOfFile {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read a varint, or report a clean end before its first byte.
fn try_read_varuint(input: &mut impl Read) -> Result<Option<u64>> {
    let mut first = [0_u8; 1];
    if !read_value(input, &mut first)? {
        return Ok(None);
    }
    if first[0] & 0x80 == 0 {
        return Ok(Some(u64::from(first[0])));
    }
    let mut value = u64::from(first[0] & 0x7F);
    let mut shift = 7_u32;
    loop {
        let rest = read_varuint_byte(input)?;
        if shift >= 63 && rest > 1 {
            return Err(StrataError::CorruptedData {
                detail: "varint overflows u64".into(),
            });
        }
        value |= u64::from(rest & 0x7F) << shift;
        if rest & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

fn read_varuint_byte(input: &mut impl Read) -> Result<u8> {
    let mut byte = [0_u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use strata_types::Field;

    fn roundtrip(column: &Column, data_type: &DataType) -> Column {
        let mut buf = Vec::new();
        serialize_column(column, 0, column.len(), &mut buf).expect("serialize");
        deserialize_column(data_type, column.len(), &mut Cursor::new(buf)).expect("deserialize")
    }

    #[test]
    fn test_numeric_roundtrip() {
        let col = Column::Int32(vec![-1, 0, 7, i32::MAX]);
        let back = roundtrip(&col, &DataType::Int32);
        for i in 0..col.len() {
            assert_eq!(back.field_at(i), col.field_at(i));
        }
    }

    #[test]
    fn test_string_roundtrip_and_partial_read() {
        let mut s = StringColumn::new();
        s.push(b"one");
        s.push(b"");
        s.push(b"three");
        let col = Column::String(s);

        let mut buf = Vec::new();
        serialize_column(&col, 0, 3, &mut buf).expect("serialize");

        let mut cursor = Cursor::new(&buf);
        let first_two =
            deserialize_column(&DataType::String, 2, &mut cursor).expect("deserialize");
        assert_eq!(first_two.len(), 2);
        // Asking for more rows than remain stops cleanly at end of stream.
        let rest = deserialize_column(&DataType::String, 100, &mut cursor).expect("deserialize");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest.field_at(0), Field::from("three"));
    }

    #[test]
    fn test_truncated_value_is_error() {
        let col = Column::UInt64(vec![1, 2]);
        let mut buf = Vec::new();
        serialize_column(&col, 0, 2, &mut buf).expect("serialize");
        buf.truncate(buf.len() - 3);
        let err = deserialize_column(&DataType::UInt64, 2, &mut Cursor::new(buf));
        assert!(err.is_err());
    }

    #[test]
    fn test_range_serialization() {
        let col = Column::UInt16(vec![10, 20, 30, 40]);
        let mut buf = Vec::new();
        serialize_column(&col, 1, 2, &mut buf).expect("serialize");
        let back =
            deserialize_column(&DataType::UInt16, 2, &mut Cursor::new(buf)).expect("deserialize");
        assert_eq!(back.field_at(0), Field::UInt64(20));
        assert_eq!(back.field_at(1), Field::UInt64(30));
    }

    #[test]
    fn test_u64_stream_roundtrip() {
        let values = [0_u64, 5, u64::MAX];
        let mut buf = Vec::new();
        write_u64_stream(&values, &mut buf).expect("write");
        let back = read_u64_stream(10, &mut Cursor::new(buf)).expect("read");
        assert_eq!(back, values);
    }
}
