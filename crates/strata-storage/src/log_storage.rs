//! Append-only log engine: one compressed file per column plus sparse
//! marks.
//!
//! Layout inside the table directory:
//!
//! ```text
//! <col>.bin          compressed column values
//! <col>.mrk          (rows_before, compressed_offset) pairs
//! <col>.size0.bin    compressed per-row element counts (array columns)
//! <col>.size0.mrk    marks for the sizes stream
//! count.txt          total row count
//! ```
//!
//! Every `write` emits one compressed frame per `index_granularity`
//! rows and a mark at each frame start, so readers can split the mark
//! list across threads and seek straight to their range.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use strata_column::{Block, Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_io::{
    create_for_write, deserialize_array_column, deserialize_column, escape_for_file_name,
    fsync_file, open_for_read, read_u64_stream, serialize_array_column, serialize_column,
    CompressedReader, CompressedWriter,
};
use strata_stream::{BlockInputStream, ExecControl, ProfileInfo};
use strata_types::{DataType, NameAndType, Names, NamesAndTypes};
use tracing::debug;

use crate::storage::Storage;

const DEFAULT_INDEX_GRANULARITY: usize = 8192;

/// One sparse index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mark {
    rows_before: u64,
    offset: u64,
}

pub struct LogStorage {
    name: String,
    columns: NamesAndTypes,
    path: PathBuf,
    index_granularity: usize,
    /// Writers exclusive; readers snapshot marks and the row count
    /// under the shared side.
    rw_lock: RwLock<()>,
}

impl LogStorage {
    pub fn open(
        name: impl Into<String>,
        columns: NamesAndTypes,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            name: name.into(),
            columns,
            path,
            index_granularity: DEFAULT_INDEX_GRANULARITY,
            rw_lock: RwLock::new(()),
        })
    }

    #[cfg(test)]
    fn with_granularity(mut self, granularity: usize) -> Self {
        self.index_granularity = granularity;
        self
    }

    fn data_file(&self, column: &str) -> PathBuf {
        self.path.join(format!("{}.bin", escape_for_file_name(column)))
    }

    fn marks_file(&self, column: &str) -> PathBuf {
        self.path.join(format!("{}.mrk", escape_for_file_name(column)))
    }

    fn sizes_file(&self, column: &str) -> PathBuf {
        self.path
            .join(format!("{}.size0.bin", escape_for_file_name(column)))
    }

    fn sizes_marks_file(&self, column: &str) -> PathBuf {
        self.path
            .join(format!("{}.size0.mrk", escape_for_file_name(column)))
    }

    fn count_file(&self) -> PathBuf {
        self.path.join("count.txt")
    }

    fn total_rows(&self) -> Result<u64> {
        match std::fs::read_to_string(self.count_file()) {
            Ok(text) => text.trim().parse().map_err(|_| StrataError::CorruptedData {
                detail: format!("bad row count in '{}'", self.count_file().display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read_marks(path: &Path) -> Result<Vec<Mark>> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let raw = read_u64_stream(usize::MAX / 16, &mut file)?;
        if raw.len() % 2 != 0 {
            return Err(StrataError::CorruptedData {
                detail: format!("odd mark file '{}'", path.display()),
            });
        }
        Ok(raw
            .chunks_exact(2)
            .map(|pair| Mark {
                rows_before: pair[0],
                offset: pair[1],
            })
            .collect())
    }

    fn append_mark(path: &Path, mark: Mark) -> Result<()> {
        use std::io::Write;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&mark.rows_before.to_le_bytes())?;
        file.write_all(&mark.offset.to_le_bytes())?;
        Ok(())
    }
}

/// Per-column append state during one `write` call.
struct ColumnAppender {
    column_name: String,
    writer: CompressedWriter<std::fs::File>,
    marks_path: PathBuf,
    sizes: Option<Box<ColumnAppender>>,
}

impl ColumnAppender {
    fn open(storage: &LogStorage, name: &str, data_type: &DataType) -> Result<Self> {
        let sizes = match data_type {
            DataType::Array(_) => Some(Box::new(ColumnAppender {
                column_name: name.to_string(),
                writer: open_appender(&storage.sizes_file(name))?,
                marks_path: storage.sizes_marks_file(name),
                sizes: None,
            })),
            _ => None,
        };
        Ok(Self {
            column_name: name.to_string(),
            writer: open_appender(&storage.data_file(name))?,
            marks_path: storage.marks_file(name),
            sizes,
        })
    }
}

fn open_appender(path: &Path) -> Result<CompressedWriter<std::fs::File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    Ok(CompressedWriter::new_at_offset(file, 1 << 20, offset))
}

impl Storage for LogStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "Log"
    }

    fn columns(&self) -> NamesAndTypes {
        self.columns.clone()
    }

    fn write(&self, block: &Block) -> Result<()> {
        self.check_block(block)?;
        let _guard = self.rw_lock.write();

        let rows_before_write = self.total_rows()?;
        let rows = block.rows();

        let mut appenders = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            appenders.push((
                col.clone(),
                ColumnAppender::open(self, &col.name, &col.data_type)?,
            ));
        }

        let mut chunk_start = 0_usize;
        while chunk_start < rows {
            let chunk_len = self.index_granularity.min(rows - chunk_start);
            for (schema_col, appender) in &mut appenders {
                let column = &block.by_name(&schema_col.name)?.column;
                Self::append_mark(
                    &appender.marks_path,
                    Mark {
                        rows_before: rows_before_write + chunk_start as u64,
                        offset: appender.writer.compressed_offset(),
                    },
                )?;
                match (column, appender.sizes.as_mut()) {
                    (Column::Array(array), Some(sizes)) => {
                        Self::append_mark(
                            &sizes.marks_path,
                            Mark {
                                rows_before: rows_before_write + chunk_start as u64,
                                offset: sizes.writer.compressed_offset(),
                            },
                        )?;
                        serialize_array_column(
                            array,
                            chunk_start,
                            chunk_len,
                            &mut sizes.writer,
                            &mut appender.writer,
                        )?;
                        sizes.writer.flush_frame()?;
                    }
                    (flat, None) => {
                        serialize_column(flat, chunk_start, chunk_len, &mut appender.writer)?;
                    }
                    _ => {
                        return Err(StrataError::TypeMismatch {
                            name: appender.column_name.clone(),
                            expected: schema_col.data_type.name(),
                            actual: column.variant_name().into(),
                        });
                    }
                }
                appender.writer.flush_frame()?;
            }
            chunk_start += chunk_len;
        }

        for (_, appender) in appenders {
            if let Some(sizes) = appender.sizes {
                let file = sizes.writer.finish()?;
                fsync_file(&file, &self.sizes_file(&sizes.column_name))?;
            }
            let file = appender.writer.finish()?;
            fsync_file(&file, &self.data_file(&appender.column_name))?;
        }

        let total = rows_before_write + rows as u64;
        let mut count = create_for_write(&self.count_file())?;
        use std::io::Write;
        write!(count, "{total}").map_err(|source| StrataError::CannotWrite {
            path: self.count_file(),
            source,
        })?;
        fsync_file(&count, &self.count_file())?;

        debug!(table = %self.name, rows, total, "appended to log");
        Ok(())
    }

    fn read(
        &self,
        column_names: &Names,
        max_block_size: usize,
        threads: usize,
        control: &Arc<ExecControl>,
    ) -> Result<Vec<Box<dyn BlockInputStream>>> {
        let _guard = self.rw_lock.read();

        let names: Names = if column_names.is_empty() {
            self.columns.iter().map(|c| c.name.clone()).collect()
        } else {
            column_names.clone()
        };
        let mut schema = Vec::with_capacity(names.len());
        for name in &names {
            schema.push(self.column_type(name)?);
        }

        let total_rows = self.total_rows()?;
        if total_rows == 0 {
            return Ok(vec![]);
        }

        // All columns share rows_before; take the mark skeleton from
        // the first requested column.
        let marks = Self::read_marks(&self.marks_file(&names[0]))?;
        let mark_count = marks.len().max(1);
        let threads = threads.clamp(1, mark_count);
        let per_thread = mark_count.div_ceil(threads);

        let mut streams: Vec<Box<dyn BlockInputStream>> = Vec::new();
        let mut mark_lo = 0_usize;
        while mark_lo < mark_count {
            let mark_hi = (mark_lo + per_thread).min(mark_count);
            let rows_from = marks.get(mark_lo).map_or(0, |m| m.rows_before);
            let rows_to = marks.get(mark_hi).map_or(total_rows, |m| m.rows_before);
            streams.push(Box::new(LogBlockInputStream::new(
                self,
                schema.clone(),
                mark_lo,
                (rows_to - rows_from) as usize,
                max_block_size,
                Arc::clone(control),
            )?));
            mark_lo = mark_hi;
        }
        Ok(streams)
    }

    fn truncate(&self) -> Result<()> {
        let _guard = self.rw_lock.write();
        for entry in std::fs::read_dir(&self.path)? {
            std::fs::remove_file(entry?.path())?;
        }
        Ok(())
    }
}

struct ColumnSource {
    name: String,
    data_type: DataType,
    data: CompressedReader<std::fs::File>,
    sizes: Option<CompressedReader<std::fs::File>>,
}

struct LogBlockInputStream {
    sources: Vec<ColumnSource>,
    rows_remaining: usize,
    max_block_size: usize,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl LogBlockInputStream {
    fn new(
        storage: &LogStorage,
        schema: Vec<NameAndType>,
        start_mark: usize,
        rows: usize,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Result<Self> {
        let mut sources = Vec::with_capacity(schema.len());
        for col in &schema {
            let data_path = storage.data_file(&col.name);
            let mut data =
                CompressedReader::new(open_for_read(&data_path)?, &data_path);
            let marks = LogStorage::read_marks(&storage.marks_file(&col.name))?;
            if let Some(mark) = marks.get(start_mark) {
                data.seek_to_frame(mark.offset)?;
            }

            let sizes = match &col.data_type {
                DataType::Array(_) => {
                    let sizes_path = storage.sizes_file(&col.name);
                    let mut sizes =
                        CompressedReader::new(open_for_read(&sizes_path)?, &sizes_path);
                    let size_marks =
                        LogStorage::read_marks(&storage.sizes_marks_file(&col.name))?;
                    if let Some(mark) = size_marks.get(start_mark) {
                        sizes.seek_to_frame(mark.offset)?;
                    }
                    Some(sizes)
                }
                _ => None,
            };

            sources.push(ColumnSource {
                name: col.name.clone(),
                data_type: col.data_type.clone(),
                data,
                sizes,
            });
        }
        Ok(Self {
            sources,
            rows_remaining: rows,
            max_block_size,
            control,
            profile: ProfileInfo::leaf(),
        })
    }
}

impl BlockInputStream for LogBlockInputStream {
    fn name(&self) -> &'static str {
        "Log"
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
        if self.rows_remaining == 0 {
            // Close files before the object dies, so many idle sources
            // do not pin descriptors.
            self.sources.clear();
            return Ok(Block::new());
        }
        let to_read = self.max_block_size.min(self.rows_remaining);

        let mut block = Block::new();
        let mut got_rows: Option<usize> = None;
        for source in &mut self.sources {
            let column = match (&source.data_type, source.sizes.as_mut()) {
                (DataType::Array(inner), Some(sizes)) => {
                    deserialize_array_column(inner, to_read, sizes, &mut source.data)?
                }
                _ => deserialize_column(&source.data_type, to_read, &mut source.data)?,
            };
            match got_rows {
                None => got_rows = Some(column.len()),
                Some(expected) => {
                    if column.len() != expected {
                        return Err(StrataError::SizesMismatch {
                            what: "rows across log column files",
                            left: expected,
                            right: column.len(),
                        });
                    }
                }
            }
            block.insert(ColumnWithTypeAndName::new(
                source.name.clone(),
                source.data_type.clone(),
                column,
            ))?;
        }

        let got = got_rows.unwrap_or(0);
        if got == 0 {
            self.rows_remaining = 0;
            self.sources.clear();
            return Ok(Block::new());
        }
        self.rows_remaining -= got.min(self.rows_remaining);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::ArrayColumn;
    use strata_stream::read_all;
    use strata_types::Field;

    fn schema() -> NamesAndTypes {
        vec![
            NameAndType::new("n", DataType::UInt64),
            NameAndType::new("s", DataType::String),
            NameAndType::new("a", DataType::Array(Box::new(DataType::UInt32))),
        ]
    }

    fn block(start: u64, rows: usize) -> Block {
        let mut s = strata_column::StringColumn::new();
        let mut elems = Vec::new();
        let mut offsets = Vec::new();
        for i in 0..rows {
            s.push(format!("row-{}", start + i as u64).as_bytes());
            elems.push((start + i as u64) as u32);
            offsets.push(elems.len() as u64);
        }
        Block::from_columns(vec![
            ColumnWithTypeAndName::new(
                "n",
                DataType::UInt64,
                Column::UInt64((start..start + rows as u64).collect()),
            ),
            ColumnWithTypeAndName::new("s", DataType::String, Column::String(s)),
            ColumnWithTypeAndName::new(
                "a",
                DataType::Array(Box::new(DataType::UInt32)),
                Column::Array(Box::new(
                    ArrayColumn::from_parts(Column::UInt32(elems), offsets).expect("array"),
                )),
            ),
        ])
        .expect("block")
    }

    #[test]
    fn test_append_and_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::open("events", schema(), dir.path().join("events"))
            .expect("open")
            .with_granularity(4);

        storage.write(&block(0, 10)).expect("write");
        storage.write(&block(10, 3)).expect("write");

        let control = ExecControl::unlimited();
        let mut streams = storage
            .read(&Names::new(), 65_536, 1, &control)
            .expect("read");
        assert_eq!(streams.len(), 1);
        let all = read_all(streams[0].as_mut()).expect("read_all");
        assert_eq!(all.rows(), 13);
        assert_eq!(all.by_name("n").expect("n").column.field_at(12), Field::UInt64(12));
        assert_eq!(
            all.by_name("s").expect("s").column.field_at(10),
            Field::from("row-10")
        );
        assert_eq!(
            all.by_name("a").expect("a").column.field_at(5),
            Field::Array(vec![Field::UInt64(5)])
        );
    }

    #[test]
    fn test_parallel_read_covers_all_marks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::open("events", schema(), dir.path().join("events"))
            .expect("open")
            .with_granularity(2);
        storage.write(&block(0, 9)).expect("write");

        let control = ExecControl::unlimited();
        let mut streams = storage
            .read(&vec!["n".to_string()], 65_536, 3, &control)
            .expect("read");
        assert!(streams.len() > 1);

        let mut total = 0_usize;
        let mut seen = Vec::new();
        for stream in &mut streams {
            let part = read_all(stream.as_mut()).expect("read_all");
            total += part.rows();
            for i in 0..part.rows() {
                seen.push(part.by_name("n").expect("n").column.field_at(i));
            }
        }
        assert_eq!(total, 9);
        seen.sort();
        assert_eq!(seen[0], Field::UInt64(0));
        assert_eq!(seen[8], Field::UInt64(8));
    }

    #[test]
    fn test_projection_reads_single_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage =
            LogStorage::open("events", schema(), dir.path().join("events")).expect("open");
        storage.write(&block(0, 5)).expect("write");

        let control = ExecControl::unlimited();
        let mut streams = storage
            .read(&vec!["s".to_string()], 65_536, 1, &control)
            .expect("read");
        let all = read_all(streams[0].as_mut()).expect("read_all");
        assert_eq!(all.columns(), 1);
        assert_eq!(all.by_name("s").expect("s").column.field_at(4), Field::from("row-4"));
    }
}
