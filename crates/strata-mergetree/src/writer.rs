//! Writing sealed parts.
//!
//! The writer streams blocks into a `tmp_…` directory — compressed
//! column files with a mark and an index entry at every granule
//! boundary — then seals it: metadata files, fsync, one atomic rename.
//! Publication into the part sets is the caller's move.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_agg::{create_aggregate_function, serialize_states, AggregateFunction};
use strata_column::{blocks_are_sorted, sort_block, Block, Column};
use strata_error::{Result, StrataError};
use strata_io::{
    atomic_rename, create_for_write, escape_for_file_name, file_hash, fsync_dir, fsync_file,
    serialize_array_column, serialize_column, CompressedWriter,
};
use strata_types::codec::write_field;
use strata_types::dates::month_of_date;
use strata_types::{DataType, Field, SortColumnDescription, SortDescription};
use tracing::debug;

use crate::checksums::{Checksums, FileChecksum};
use crate::data::{serialize_columns_file, MergeTreeData};
use crate::part::{DataPart, DataPartPtr, Mark, PartInfo};

/// Streaming writer for one part.
pub(crate) struct PartWriter {
    data: Arc<MergeTreeData>,
    info: PartInfo,
    tmp_path: PathBuf,
    columns: Vec<ColumnWriter>,
    index: Vec<Field>,
    rows_written: u64,
}

struct ColumnWriter {
    name: String,
    data_type: DataType,
    bin: CompressedWriter<std::fs::File>,
    marks: Vec<Mark>,
    sizes: Option<(CompressedWriter<std::fs::File>, Vec<Mark>)>,
    /// For aggregate-state columns.
    function: Option<Arc<dyn AggregateFunction>>,
}

impl PartWriter {
    pub fn new(data: Arc<MergeTreeData>, info: PartInfo) -> Result<Self> {
        let tmp_path = data.path.join(format!("tmp_{}", info.name()));
        if tmp_path.exists() {
            std::fs::remove_dir_all(&tmp_path)?;
        }
        std::fs::create_dir_all(&tmp_path)?;

        let mut columns = Vec::new();
        for col in data.schema() {
            let bin = CompressedWriter::new(
                create_for_write(&tmp_path.join(format!("{}.bin", escape_for_file_name(&col.name))))?,
                data.settings.max_compress_block_size,
            );
            let sizes = match &col.data_type {
                DataType::Array(_) => Some((
                    CompressedWriter::new(
                        create_for_write(&tmp_path.join(format!(
                            "{}.size0.bin",
                            escape_for_file_name(&col.name)
                        )))?,
                        data.settings.max_compress_block_size,
                    ),
                    Vec::new(),
                )),
                _ => None,
            };
            let function = match &col.data_type {
                DataType::AggregateFunction {
                    function,
                    argument_types,
                } => Some(create_aggregate_function(function, argument_types)?),
                _ => None,
            };
            columns.push(ColumnWriter {
                name: col.name.clone(),
                data_type: col.data_type.clone(),
                bin,
                marks: Vec::new(),
                sizes,
                function,
            });
        }

        Ok(Self {
            data,
            info,
            tmp_path,
            columns,
            index: Vec::new(),
            rows_written: 0,
        })
    }

    /// Append a block already sorted by the primary key.
    pub fn write(&mut self, block: &Block) -> Result<()> {
        let granularity = self.data.settings.index_granularity as u64;
        let rows = block.rows() as u64;
        let mut row = 0_u64;
        while row < rows {
            // Advance to the next granule boundary or the block end.
            let pos_in_granule = (self.rows_written + row) % granularity;
            let take = (granularity - pos_in_granule).min(rows - row);

            if pos_in_granule == 0 {
                self.start_granule(block, row as usize)?;
            }
            for writer in &mut self.columns {
                let column = &block.by_name(&writer.name)?.column;
                write_column_rows(writer, column, row as usize, take as usize)?;
            }

            row += take;
            if (self.rows_written + row) % granularity == 0 {
                self.end_granule()?;
            }
        }
        self.rows_written += rows;
        Ok(())
    }

    /// Record marks and the index entry at a granule start.
    fn start_granule(&mut self, block: &Block, row: usize) -> Result<()> {
        for key in &self.data.primary_keys {
            self.index.push(block.by_name(key)?.column.field_at(row));
        }
        let rows_before = self.rows_written + row as u64;
        for writer in &mut self.columns {
            writer.marks.push(Mark {
                rows_before,
                offset: writer.bin.compressed_offset(),
            });
            if let Some((sizes_writer, sizes_marks)) = &mut writer.sizes {
                sizes_marks.push(Mark {
                    rows_before,
                    offset: sizes_writer.compressed_offset(),
                });
            }
        }
        Ok(())
    }

    /// Seal compressed frames at a granule end, so marks stay aligned
    /// with frame starts.
    fn end_granule(&mut self) -> Result<()> {
        for writer in &mut self.columns {
            writer.bin.flush_frame()?;
            if let Some((sizes_writer, _)) = &mut writer.sizes {
                sizes_writer.flush_frame()?;
            }
        }
        Ok(())
    }

    /// Seal the part: metadata, fsync, atomic rename. Returns the
    /// loaded in-memory part, not yet published.
    pub fn finish(mut self) -> Result<DataPart> {
        self.end_granule()?;

        let mut written_files: Vec<(String, Option<u64>)> = Vec::new();

        for writer in std::mem::take(&mut self.columns) {
            let base = escape_for_file_name(&writer.name);
            let uncompressed = writer.bin.uncompressed_total();
            let file = writer.bin.finish()?;
            fsync_file(&file, &self.tmp_path.join(format!("{base}.bin")))?;
            written_files.push((format!("{base}.bin"), Some(uncompressed)));

            let marks_path = self.tmp_path.join(format!("{base}.mrk"));
            write_marks_file(&marks_path, &writer.marks)?;
            written_files.push((format!("{base}.mrk"), None));

            if let Some((sizes_writer, sizes_marks)) = writer.sizes {
                let file = sizes_writer.finish()?;
                fsync_file(&file, &self.tmp_path.join(format!("{base}.size0.bin")))?;
                written_files.push((format!("{base}.size0.bin"), None));

                let sizes_marks_path = self.tmp_path.join(format!("{base}.size0.mrk"));
                write_marks_file(&sizes_marks_path, &sizes_marks)?;
                written_files.push((format!("{base}.size0.mrk"), None));
            }
        }

        // primary.idx: packed key tuples, one per mark.
        let key_types: Vec<DataType> = {
            let schema = self.data.schema();
            self.data
                .primary_keys
                .iter()
                .map(|key| {
                    schema
                        .iter()
                        .find(|c| c.name == *key)
                        .map(|c| c.data_type.clone())
                        .ok_or_else(|| StrataError::NoSuchColumn { name: key.clone() })
                })
                .collect::<Result<_>>()?
        };
        {
            let mut index_file = create_for_write(&self.tmp_path.join("primary.idx"))?;
            let mut buf = Vec::new();
            if !key_types.is_empty() {
                for (i, field) in self.index.iter().enumerate() {
                    write_field(&mut buf, field, &key_types[i % key_types.len()])?;
                }
            }
            index_file.write_all(&buf)?;
            fsync_file(&index_file, &self.tmp_path.join("primary.idx"))?;
        }
        written_files.push(("primary.idx".into(), None));

        let columns_text = serialize_columns_file(&self.data.schema());
        write_text_file(&self.tmp_path, "columns.txt", &columns_text)?;
        written_files.push(("columns.txt".into(), None));

        write_text_file(&self.tmp_path, "count.txt", &self.rows_written.to_string())?;
        written_files.push(("count.txt".into(), None));

        let mut checksums = Checksums::new();
        for (file, uncompressed_size) in written_files {
            let path = self.tmp_path.join(&file);
            checksums.insert(
                file,
                FileChecksum {
                    size: std::fs::metadata(&path)?.len(),
                    hash: file_hash(&path)?,
                    uncompressed_size,
                },
            );
        }
        write_text_file(&self.tmp_path, "checksums.txt", &checksums.serialize())?;

        fsync_dir(&self.tmp_path)?;
        let final_path = self.data.path.join(self.info.name());
        atomic_rename(&self.tmp_path, &final_path)?;
        fsync_dir(&self.data.path)?;

        let marks = (self.rows_written as usize).div_ceil(self.data.settings.index_granularity);
        let size_in_bytes = checksums.files().values().map(|f| f.size).sum();
        debug!(part = %self.info.name(), rows = self.rows_written, marks, "part sealed");

        Ok(DataPart {
            name: self.info.name(),
            info: self.info,
            storage_path: self.data.path.clone(),
            rows: self.rows_written,
            marks,
            size_in_bytes,
            index: std::mem::take(&mut self.index),
            key_arity: key_types.len(),
            checksums: RwLock::new(checksums),
            columns: RwLock::new(self.data.schema()),
            columns_lock: Arc::new(RwLock::new(())),
            alter_mutex: Arc::new(Mutex::new(())),
            currently_merging: AtomicBool::new(false),
            remove_time: Mutex::new(None),
        })
    }
}

fn write_column_rows(
    writer: &mut ColumnWriter,
    column: &Column,
    offset: usize,
    count: usize,
) -> Result<()> {
    match (column, &mut writer.sizes, &writer.function) {
        (Column::Array(array), Some((sizes_writer, _)), _) => {
            serialize_array_column(array, offset, count, sizes_writer, &mut writer.bin)?;
        }
        (Column::AggregateStates(states), _, Some(function)) => {
            let mut buf = Vec::new();
            serialize_states(states, function.as_ref(), offset, count, &mut buf)?;
            writer.bin.write(&buf)?;
        }
        (flat, None, None) => {
            serialize_column(flat, offset, count, &mut writer.bin)?;
        }
        _ => {
            return Err(StrataError::TypeMismatch {
                name: writer.name.clone(),
                expected: writer.data_type.name(),
                actual: column.variant_name().into(),
            });
        }
    }
    Ok(())
}

fn write_marks_file(path: &std::path::Path, marks: &[Mark]) -> Result<()> {
    let mut file = create_for_write(path)?;
    for mark in marks {
        file.write_all(&mark.rows_before.to_le_bytes())?;
        file.write_all(&mark.offset.to_le_bytes())?;
    }
    fsync_file(&file, path)?;
    Ok(())
}

fn write_text_file(dir: &std::path::Path, name: &str, content: &str) -> Result<()> {
    let path = dir.join(name);
    let mut file = create_for_write(&path)?;
    file.write_all(content.as_bytes())?;
    fsync_file(&file, &path)?;
    Ok(())
}

/// Split an insert block by month, sort each partition block by the
/// primary key, and seal one level-0 part per month. Returns the
/// published parts.
pub fn write_block(data: &Arc<MergeTreeData>, block: &Block) -> Result<Vec<DataPartPtr>> {
    block.check_sane()?;
    for col in data.schema() {
        let found = block.by_name(&col.name)?;
        if found.data_type != col.data_type {
            return Err(StrataError::TypeMismatch {
                name: col.name.clone(),
                expected: col.data_type.name(),
                actual: found.data_type.name(),
            });
        }
    }

    let date_col = block.by_name(&data.date_column)?;
    let Column::Date(days) = &date_col.column else {
        return Err(StrataError::IllegalColumn {
            column: date_col.column.variant_name().into(),
            context: format!("partition column '{}' must be Date", data.date_column),
        });
    };

    let mut months: Vec<u32> = days.iter().map(|&d| month_of_date(d)).collect();
    months.sort_unstable();
    months.dedup();

    let sort_description: SortDescription = data
        .primary_keys
        .iter()
        .map(|k| SortColumnDescription::ascending(k.clone()))
        .collect();

    let mut published = Vec::with_capacity(months.len());
    for month in months {
        let mask: Vec<u8> = days
            .iter()
            .map(|&d| u8::from(month_of_date(d) == month))
            .collect();
        let month_block = block.filter_rows(&mask)?;
        let sorted = if blocks_are_sorted(&month_block, &sort_description)? {
            month_block
        } else {
            sort_block(&month_block, &sort_description, 0)?
        };

        let id = data.increment().allocate(1)?;
        let info = PartInfo {
            partition: month,
            min_id: id,
            max_id: id,
            level: 0,
        };
        let mut writer = PartWriter::new(Arc::clone(data), info)?;
        writer.write(&sorted)?;
        let part = writer.finish()?;
        published.push(data.add_sealed_part(part));
    }
    Ok(published)
}
