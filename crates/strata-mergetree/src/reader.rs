//! Reading mark ranges out of sealed parts.
//!
//! A stream owns one part and a stack of mark ranges, consumed from the
//! tail. Each `read` decompresses up to `max_block_size` rows' worth of
//! granules. With a PREWHERE the filter column set is read and applied
//! first; the remaining (usually wider) columns are only decompressed
//! for granule spans where the filter passed at least one row.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;
use strata_agg::{create_aggregate_function, deserialize_states};
use strata_column::{Block, Column, ColumnWithTypeAndName, ConstColumn};
use strata_error::{Result, StrataError};
use strata_functions::Expression;
use strata_io::{deserialize_array_column, deserialize_column, open_for_read, CompressedReader};
use strata_stream::{BlockInputStream, ExecControl, ProfileInfo};
use strata_types::{DataType, Field, Names, NamesAndTypes};

use crate::index::MarkRange;
use crate::part::{read_marks, DataPartPtr, Mark};

/// The part-name virtual column.
pub const VIRTUAL_PART_COLUMN: &str = "_part";

/// A filter applied over a reduced column set before the wide columns
/// are decompressed.
#[derive(Debug)]
pub struct PrewhereInfo {
    pub expression: Expression,
    /// Name of the `UInt8` column the expression leaves in the block.
    pub column: String,
    /// Drop the filter column from the output.
    pub remove_column: bool,
}

struct ColumnReader {
    data: CompressedReader<std::fs::File>,
    sizes: Option<CompressedReader<std::fs::File>>,
    /// Mark the reader is positioned at, for seek elision on
    /// sequential scans.
    next_mark: usize,
}

pub struct MergeTreeBlockInputStream {
    part: DataPartPtr,
    /// Requested output columns, in order.
    columns: Names,
    prewhere: Option<Arc<PrewhereInfo>>,
    /// Consumed from the back.
    ranges: Vec<MarkRange>,
    granularity: usize,
    max_block_size: usize,
    readers: HashMap<String, ColumnReader>,
    marks_cache: HashMap<String, Vec<Mark>>,
    /// Skeleton marks (rows-before values) from any on-disk column.
    row_marks: Vec<Mark>,
    /// Table schema, consulted for columns the part no longer carries
    /// (partition-scoped drops, later adds).
    table_schema: NamesAndTypes,
    /// Held for the scan lifetime unless a pool holds it instead.
    _columns_guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl MergeTreeBlockInputStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        part: DataPartPtr,
        columns: Names,
        table_schema: NamesAndTypes,
        prewhere: Option<Arc<PrewhereInfo>>,
        ranges: Vec<MarkRange>,
        granularity: usize,
        max_block_size: usize,
        take_columns_lock: bool,
        control: Arc<ExecControl>,
    ) -> Result<Self> {
        let guard = take_columns_lock.then(|| part.columns_lock.read_arc());
        let row_marks = skeleton_marks(&part)?;
        Ok(Self {
            part,
            columns,
            prewhere,
            ranges,
            granularity,
            max_block_size,
            readers: HashMap::new(),
            marks_cache: HashMap::new(),
            row_marks,
            table_schema,
            _columns_guard: guard,
            control,
            profile: ProfileInfo::leaf(),
        })
    }

    /// A stream over the whole part (merges, checks).
    pub fn whole_part(
        part: DataPartPtr,
        columns: Names,
        table_schema: NamesAndTypes,
        granularity: usize,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Result<Self> {
        let marks = part.marks;
        Self::new(
            part,
            columns,
            table_schema,
            None,
            vec![MarkRange {
                begin: 0,
                end: marks,
            }],
            granularity,
            max_block_size,
            true,
            control,
        )
    }

    fn rows_before_mark(&self, mark: usize) -> u64 {
        self.row_marks
            .get(mark)
            .map_or(self.part.rows, |m| m.rows_before)
    }

    fn marks_of(&mut self, column: &str, sizes_stream: bool) -> Result<&[Mark]> {
        let key = if sizes_stream {
            format!("{column}\0size0")
        } else {
            column.to_string()
        };
        if !self.marks_cache.contains_key(&key) {
            let path = if sizes_stream {
                self.part.sizes_file(column, "mrk")
            } else {
                self.part.column_file(column, "mrk")
            };
            self.marks_cache.insert(key.clone(), read_marks(&path)?);
        }
        Ok(self.marks_cache.get(&key).map_or(&[], |v| v.as_slice()))
    }

    /// Read rows `[mark_begin, mark_end)` of one on-disk column.
    fn read_physical_column(
        &mut self,
        name: &str,
        data_type: &DataType,
        mark_begin: usize,
        rows: usize,
    ) -> Result<Column> {
        let needs_seek = self
            .readers
            .get(name)
            .map_or(true, |reader| reader.next_mark != mark_begin);
        let (data_offset, sizes_offset) = if needs_seek {
            let data = self.marks_of(name, false)?.get(mark_begin).map(|m| m.offset);
            let sizes = match data_type {
                DataType::Array(_) => {
                    self.marks_of(name, true)?.get(mark_begin).map(|m| m.offset)
                }
                _ => None,
            };
            (data, sizes)
        } else {
            (None, None)
        };

        if !self.readers.contains_key(name) {
            let data_path = self.part.column_file(name, "bin");
            let data = CompressedReader::new(open_for_read(&data_path)?, &data_path);
            let sizes = match data_type {
                DataType::Array(_) => {
                    let path = self.part.sizes_file(name, "bin");
                    Some(CompressedReader::new(open_for_read(&path)?, &path))
                }
                _ => None,
            };
            self.readers.insert(
                name.to_string(),
                ColumnReader {
                    data,
                    sizes,
                    next_mark: 0,
                },
            );
        }
        let reader = self
            .readers
            .get_mut(name)
            .ok_or_else(|| StrataError::logical("column reader vanished"))?;
        if needs_seek {
            if let Some(offset) = data_offset {
                reader.data.seek_to_frame(offset)?;
            }
            if let (Some(sizes), Some(offset)) = (reader.sizes.as_mut(), sizes_offset) {
                sizes.seek_to_frame(offset)?;
            }
        }
        let column = match data_type {
            DataType::Array(inner) => {
                let sizes = reader.sizes.as_mut().ok_or_else(|| {
                    StrataError::NoFileInDataPart {
                        file: format!("{name}.size0.bin"),
                        part: self.part.name.clone(),
                    }
                })?;
                deserialize_array_column(inner, rows, sizes, &mut reader.data)?
            }
            DataType::AggregateFunction {
                function,
                argument_types,
            } => {
                let function = create_aggregate_function(function, argument_types)?;
                deserialize_states(&function, rows, &mut reader.data)?
            }
            flat => deserialize_column(flat, rows, &mut reader.data)?,
        };
        if column.len() != rows {
            return Err(StrataError::UnexpectedEndOfFile {
                expected: rows,
                actual: column.len(),
            });
        }
        reader.next_mark = mark_begin + rows.div_ceil(self.granularity);
        Ok(column)
    }

    /// Materialize one requested column over a span: physical when the
    /// part has files, virtual `_part`, or type defaults.
    fn read_column_or_default(
        &mut self,
        name: &str,
        mark_begin: usize,
        rows: usize,
    ) -> Result<ColumnWithTypeAndName> {
        if name == VIRTUAL_PART_COLUMN {
            return Ok(ColumnWithTypeAndName::new(
                name,
                DataType::String,
                Column::Const(Box::new(ConstColumn::new(
                    DataType::String,
                    Field::from(self.part.name.as_str()),
                    rows,
                ))),
            ));
        }
        let data_type = self
            .part
            .column_type(name)
            .or_else(|| {
                self.table_schema
                    .iter()
                    .find(|c| c.name == name)
                    .map(|c| c.data_type.clone())
            })
            .ok_or_else(|| StrataError::NoSuchColumn {
                name: name.to_string(),
            })?;
        if self.part.has_column_files(name) {
            let column = self.read_physical_column(name, &data_type, mark_begin, rows)?;
            Ok(ColumnWithTypeAndName::new(name, data_type, column))
        } else {
            // Dropped or never-written column: defaults of its type.
            let column = Column::defaults_of(&data_type, rows)?;
            Ok(ColumnWithTypeAndName::new(name, data_type, column))
        }
    }

    /// Read one granule span, applying the PREWHERE split.
    fn read_span(&mut self, mark_begin: usize, mark_end: usize) -> Result<Block> {
        let rows = (self.rows_before_mark(mark_end) - self.rows_before_mark(mark_begin)) as usize;
        if rows == 0 {
            return Ok(Block::new());
        }

        let requested = self.columns.clone();
        let prewhere = self.prewhere.clone();

        let (phase_one, mask): (Block, Option<Vec<u8>>) = match &prewhere {
            None => {
                let mut block = Block::new();
                let mut names = requested.clone();
                // Row counts must stay knowable even when nothing the
                // query asked for exists on disk.
                if !names
                    .iter()
                    .any(|n| self.part.has_column_files(n) || n == VIRTUAL_PART_COLUMN)
                {
                    if let Some(smallest) = self.part.smallest_column_on_disk() {
                        if !names.contains(&smallest) {
                            names.push(smallest);
                        }
                    }
                }
                for name in &names {
                    block.insert(self.read_column_or_default(name, mark_begin, rows)?)?;
                }
                (block, None)
            }
            Some(prewhere) => {
                let mut filter_block = Block::new();
                let mut needed = prewhere.expression.required_columns();
                if needed.is_empty() {
                    needed.push(
                        self.part
                            .smallest_column_on_disk()
                            .unwrap_or_else(|| prewhere.column.clone()),
                    );
                }
                for name in &needed {
                    filter_block.insert(self.read_column_or_default(name, mark_begin, rows)?)?;
                }
                prewhere.expression.execute(&mut filter_block)?;

                let filter_col = &filter_block.by_name(&prewhere.column)?.column;
                let mask: Vec<u8> = match filter_col {
                    Column::UInt8(mask) => mask.clone(),
                    Column::Const(c) => {
                        let truthy =
                            !matches!(c.value(), Field::UInt64(0) | Field::Int64(0));
                        vec![u8::from(truthy); rows]
                    }
                    other => {
                        return Err(StrataError::IllegalColumn {
                            column: other.variant_name().into(),
                            context: "prewhere column must be UInt8".into(),
                        });
                    }
                };

                if mask.iter().all(|&m| m == 0) {
                    // Nothing survives; the wide columns are never
                    // touched for this span.
                    return Ok(Block::new());
                }
                (filter_block.filter_rows(&mask)?, Some(mask))
            }
        };

        // Second phase: the columns the filter did not need.
        let mut out = Block::new();
        for name in &requested {
            if let Ok(existing) = phase_one.by_name(name) {
                out.insert(existing.clone())?;
                continue;
            }
            let mut col = self.read_column_or_default(name, mark_begin, rows)?;
            if let Some(mask) = &mask {
                col.column = col.column.filter(mask)?;
            }
            out.insert(col)?;
        }
        if let Some(prewhere) = &prewhere {
            if !prewhere.remove_column && !out.has(&prewhere.column) {
                if let Ok(filter_col) = phase_one.by_name(&prewhere.column) {
                    out.insert(filter_col.clone())?;
                }
            }
        }
        Ok(out)
    }
}

/// Rows-before skeleton from the first column that has marks on disk.
fn skeleton_marks(part: &DataPartPtr) -> Result<Vec<Mark>> {
    let columns = part.columns.read().clone();
    for col in &columns {
        if part.has_column_files(&col.name) {
            return read_marks(&part.column_file(&col.name, "mrk"));
        }
    }
    Ok(Vec::new())
}

impl BlockInputStream for MergeTreeBlockInputStream {
    fn name(&self) -> &'static str {
        "MergeTree"
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
        let granules_per_block = (self.max_block_size / self.granularity).max(1);
        loop {
            if self.control.is_cancelled() {
                return Ok(Block::new());
            }
            let Some(range) = self.ranges.last_mut() else {
                self.readers.clear();
                return Ok(Block::new());
            };
            let mark_begin = range.begin;
            let mark_end = (mark_begin + granules_per_block).min(range.end);
            range.begin = mark_end;
            if range.is_empty() {
                self.ranges.pop();
            }

            let block = self.read_span(mark_begin, mark_end)?;
            if block.rows() > 0 {
                return Ok(block);
            }
        }
    }
}
