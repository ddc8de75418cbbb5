//! The native block format: the engine's own columnar wire layout.
//!
//! Layout per block: varint column count, varint row count, then per
//! column its name, its type name, and the raw payload. Array columns
//! write their offsets stream first, then the element values. A stream
//! of blocks is terminated by end of input.

use std::io::{Read, Write};
use std::sync::Arc;

use strata_column::{ArrayColumn, Block, Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_io::{deserialize_column, serialize_column};
use strata_types::codec::{read_binary_string, write_binary_string, write_varuint};
use strata_types::DataType;

use crate::control::ExecControl;
use crate::profile::ProfileInfo;
use crate::stream::{BlockInputStream, BlockOutputStream};

const MAX_NAME_LEN: usize = 1 << 16;

/// Writes blocks in the native format.
pub struct NativeBlockOutputStream<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> NativeBlockOutputStream<W> {
    #[must_use]
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_column(&mut self, column: &Column, rows: usize) -> Result<()> {
        match column {
            Column::Array(array) => {
                strata_io::write_u64_stream(array.offsets(), &mut self.out)?;
                self.write_column(array.values(), array.values().len())
            }
            Column::Const(_) => {
                let full = column.clone().materialized()?;
                self.write_column(&full, rows)
            }
            flat => serialize_column(flat, 0, rows, &mut self.out),
        }
    }
}

impl<W: Write + Send> BlockOutputStream for NativeBlockOutputStream<W> {
    fn write(&mut self, block: &Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        write_varuint(&mut self.out, block.columns() as u64)?;
        write_varuint(&mut self.out, block.rows() as u64)?;
        for col in block.iter() {
            write_binary_string(&mut self.out, col.name.as_bytes())?;
            write_binary_string(&mut self.out, col.data_type.name().as_bytes())?;
            self.write_column(&col.column, block.rows())?;
        }
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads blocks in the native format until end of input.
pub struct NativeBlockInputStream<R: Read + Send> {
    input: R,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl<R: Read + Send> NativeBlockInputStream<R> {
    #[must_use]
    pub fn new(input: R, control: Arc<ExecControl>) -> Self {
        Self {
            input,
            control,
            profile: ProfileInfo::new(),
        }
    }

    fn read_column(&mut self, data_type: &DataType, rows: usize) -> Result<Column> {
        match data_type {
            DataType::Array(inner) => {
                let offsets = strata_io::read_u64_stream(rows, &mut self.input)?;
                if offsets.len() != rows {
                    return Err(StrataError::UnexpectedEndOfFile {
                        expected: rows * 8,
                        actual: offsets.len() * 8,
                    });
                }
                let values_len = offsets.last().copied().unwrap_or(0) as usize;
                let values = self.read_column(inner, values_len)?;
                Ok(Column::Array(Box::new(ArrayColumn::from_parts(
                    values, offsets,
                )?)))
            }
            flat => {
                let column = deserialize_column(flat, rows, &mut self.input)?;
                if column.len() != rows {
                    return Err(StrataError::UnexpectedEndOfFile {
                        expected: rows,
                        actual: column.len(),
                    });
                }
                Ok(column)
            }
        }
    }
}

impl<R: Read + Send> BlockInputStream for NativeBlockInputStream<R> {
    fn name(&self) -> &'static str {
        "Native"
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

    fn read_impl(&mut self) -> Result<Block> {
        // A clean end before the header is the end of the stream.
        let mut first = [0_u8; 1];
        let n = loop {
            match self.input.read(&mut first) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(Block::new());
        }
        let columns = read_varuint_continued(first[0], &mut self.input)?;
        let rows = strata_types::codec::read_varuint(&mut self.input)? as usize;

        let mut block = Block::new();
        for _ in 0..columns {
            let name = String::from_utf8(read_binary_string(&mut self.input, MAX_NAME_LEN)?)
                .map_err(|_| StrataError::CorruptedData {
                    detail: "column name is not UTF-8".into(),
                })?;
            let type_name =
                String::from_utf8(read_binary_string(&mut self.input, MAX_NAME_LEN)?).map_err(
                    |_| StrataError::CorruptedData {
                        detail: "type name is not UTF-8".into(),
                    },
                )?;
            let data_type = DataType::parse(&type_name)?;
            let column = self.read_column(&data_type, rows)?;
            block.insert(ColumnWithTypeAndName::new(name, data_type, column))?;
        }
        Ok(block)
    }
}

/// Finish reading a varint whose first byte was already consumed.
fn read_varuint_continued(first: u8, input: &mut impl Read) -> Result<u64> {
    let mut value = u64::from(first & 0x7F);
    if first & 0x80 == 0 {
        return Ok(value);
    }
    let mut shift = 7_u32;
    loop {
        let mut byte = [0_u8; 1];
        input.read_exact(&mut byte)?;
        if shift >= 63 && byte[0] > 1 {
            return Err(StrataError::CorruptedData {
                detail: "varint overflows u64".into(),
            });
        }
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::read_all;
    use std::io::Cursor;
    use strata_column::StringColumn;
    use strata_types::Field;

    fn sample_block() -> Block {
        let mut s = StringColumn::new();
        s.push(b"x");
        s.push(b"yy");
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("n", DataType::UInt64, Column::UInt64(vec![1, 2])),
            ColumnWithTypeAndName::new("s", DataType::String, Column::String(s)),
            ColumnWithTypeAndName::new(
                "a",
                DataType::Array(Box::new(DataType::UInt32)),
                Column::Array(Box::new(
                    ArrayColumn::from_parts(Column::UInt32(vec![7, 8, 9]), vec![2, 3])
                        .expect("array"),
                )),
            ),
        ])
        .expect("block")
    }

    #[test]
    fn test_native_roundtrip() {
        let block = sample_block();
        let mut writer = NativeBlockOutputStream::new(Vec::new());
        writer.write(&block).expect("write");
        writer.write(&block).expect("write");
        writer.write_suffix().expect("suffix");
        let bytes = writer.into_inner();

        let mut reader =
            NativeBlockInputStream::new(Cursor::new(bytes), ExecControl::unlimited());
        let all = read_all(&mut reader).expect("read");
        assert_eq!(all.rows(), 4);
        assert_eq!(all.by_name("s").expect("s").column.field_at(1), Field::from("yy"));
        assert_eq!(
            all.by_name("a").expect("a").column.field_at(2),
            Field::Array(vec![Field::UInt64(7), Field::UInt64(8)])
        );
    }

    #[test]
    fn test_truncated_stream_is_error() {
        let block = sample_block();
        let mut writer = NativeBlockOutputStream::new(Vec::new());
        writer.write(&block).expect("write");
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 2);

        let mut reader =
            NativeBlockInputStream::new(Cursor::new(bytes), ExecControl::unlimited());
        assert!(reader.read().is_err());
    }
}
