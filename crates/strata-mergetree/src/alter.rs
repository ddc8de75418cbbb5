//! ALTER on sealed parts.
//!
//! A column change never mutates a part in place. New files are written
//! alongside under `.tmp` names while the part's `alter_mutex` is held;
//! `commit` takes the `columns_lock` exclusively for the short rename
//! window, swaps the files, and rewrites `columns.txt` and
//! `checksums.txt`. Dropping the transaction uncommitted removes the
//! temporary files and changes nothing.

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use strata_column::Column;
use strata_error::{Result, StrataError};
use strata_io::{
    atomic_rename, create_for_write, escape_for_file_name, file_hash, fsync_dir, fsync_file,
    serialize_column, CompressedReader, CompressedWriter,
};
use strata_types::{DataType, NameAndType, NamesAndTypes};
use tracing::{debug, error, info};

use crate::checksums::FileChecksum;
use crate::data::{serialize_columns_file, MergeTreeData};
use crate::part::{DataPartPtr, Mark};

/// One schema mutation.
#[derive(Debug, Clone)]
pub enum AlterCommand {
    AddColumn { name: String, data_type: DataType },
    DropColumn { name: String },
    ModifyColumn { name: String, data_type: DataType },
}

impl AlterCommand {
    #[must_use]
    pub fn column_name(&self) -> &str {
        match self {
            Self::AddColumn { name, .. }
            | Self::DropColumn { name }
            | Self::ModifyColumn { name, .. } => name,
        }
    }
}

/// Apply the commands to a schema, validating them.
pub fn apply_to_schema(columns: &NamesAndTypes, commands: &[AlterCommand]) -> Result<NamesAndTypes> {
    let mut out = columns.clone();
    for command in commands {
        match command {
            AlterCommand::AddColumn { name, data_type } => {
                if out.iter().any(|c| c.name == *name) {
                    return Err(StrataError::DuplicateColumn { name: name.clone() });
                }
                out.push(NameAndType::new(name.clone(), data_type.clone()));
            }
            AlterCommand::DropColumn { name } => {
                let before = out.len();
                out.retain(|c| c.name != *name);
                if out.len() == before {
                    return Err(StrataError::NoSuchColumn { name: name.clone() });
                }
            }
            AlterCommand::ModifyColumn { name, data_type } => {
                let col = out
                    .iter_mut()
                    .find(|c| c.name == *name)
                    .ok_or_else(|| StrataError::NoSuchColumn { name: name.clone() })?;
                col.data_type = data_type.clone();
            }
        }
    }
    Ok(out)
}

/// `(temporary file, final name)`; an empty final name deletes.
type RenameMap = Vec<(String, String)>;

/// In-flight ALTER over one part.
pub struct AlterDataPartTransaction {
    part: DataPartPtr,
    new_columns: NamesAndTypes,
    rename_map: RenameMap,
    /// Held for the whole flow; the `columns_lock` is only taken at
    /// commit.
    _alter_guard: ArcMutexGuard<RawMutex, ()>,
    committed: bool,
}

impl AlterDataPartTransaction {
    /// Prepare the change: convert / rewrite files under `.tmp` names.
    pub fn new(
        part: DataPartPtr,
        data: Arc<MergeTreeData>,
        commands: &[AlterCommand],
    ) -> Result<Self> {
        let alter_guard = part.alter_mutex.lock_arc();

        let old_columns = part.columns.read().clone();
        let new_columns = apply_to_schema(&old_columns, commands)?;
        let mut rename_map = RenameMap::new();

        for command in commands {
            let base = escape_for_file_name(command.column_name());
            match command {
                AlterCommand::AddColumn { .. } => {
                    // Nothing on disk; reads materialize defaults.
                }
                AlterCommand::DropColumn { name } => {
                    if part.has_column_files(name) {
                        rename_map.push((format!("{base}.bin"), String::new()));
                        rename_map.push((format!("{base}.mrk"), String::new()));
                        if part
                            .checksums
                            .read()
                            .files()
                            .contains_key(&format!("{base}.size0.bin"))
                        {
                            rename_map.push((format!("{base}.size0.bin"), String::new()));
                            rename_map.push((format!("{base}.size0.mrk"), String::new()));
                        }
                    }
                }
                AlterCommand::ModifyColumn { name, data_type } => {
                    if !part.has_column_files(name) {
                        continue;
                    }
                    let old_type = part.column_type(name).ok_or_else(|| {
                        StrataError::NoSuchColumn { name: name.clone() }
                    })?;
                    convert_column_file(&part, &data, name, &old_type, data_type)?;
                    rename_map.push((format!("{base}.bin.tmp"), format!("{base}.bin")));
                    rename_map.push((format!("{base}.mrk.tmp"), format!("{base}.mrk")));
                }
            }
        }

        debug!(part = %part.name, files = rename_map.len(), "alter prepared");
        Ok(Self {
            part,
            new_columns,
            rename_map,
            _alter_guard: alter_guard,
            committed: false,
        })
    }

    /// Swap the files in and publish the new schema.
    pub fn commit(mut self) -> Result<()> {
        let part_path = self.part.path();
        {
            // Exclusive only for the short rename window; readers hold
            // the shared side for whole scans.
            let _columns_guard = self.part.columns_lock.write();

            let mut checksums = self.part.checksums.read().clone();
            for (from, to) in &self.rename_map {
                if to.is_empty() {
                    std::fs::remove_file(part_path.join(from))?;
                    checksums.remove(from);
                } else {
                    atomic_rename(&part_path.join(from), &part_path.join(to))?;
                    let path = part_path.join(to);
                    checksums.insert(
                        to.clone(),
                        FileChecksum {
                            size: std::fs::metadata(&path)?.len(),
                            hash: file_hash(&path)?,
                            uncompressed_size: None,
                        },
                    );
                }
            }

            let columns_text = serialize_columns_file(&self.new_columns);
            write_and_sync(&part_path, "columns.txt", &columns_text)?;
            update_metadata_checksum(&mut checksums, &part_path, "columns.txt")?;
            write_and_sync(&part_path, "checksums.txt", &checksums.serialize())?;
            fsync_dir(&part_path)?;

            *self.part.checksums.write() = checksums;
            *self.part.columns.write() = self.new_columns.clone();
        }
        self.committed = true;
        info!(part = %self.part.name, "alter committed");
        Ok(())
    }
}

impl Drop for AlterDataPartTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Abandon: remove temporaries, swallow and log any failure so
        // the original error stays primary.
        let part_path = self.part.path();
        for (from, to) in &self.rename_map {
            if !to.is_empty() {
                if let Err(e) = std::fs::remove_file(part_path.join(from)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!(part = %self.part.name, file = %from, error = %e,
                            "failed to remove abandoned alter temporary");
                    }
                }
            }
        }
    }
}

/// Rewrite one column file under a new type, into `.tmp` names.
fn convert_column_file(
    part: &DataPartPtr,
    data: &Arc<MergeTreeData>,
    name: &str,
    old_type: &DataType,
    new_type: &DataType,
) -> Result<()> {
    if old_type.fixed_value_size().is_none() || new_type.fixed_value_size().is_none() {
        return Err(StrataError::IllegalTypeOfArgument {
            function: "ALTER MODIFY COLUMN".into(),
            type_name: format!("{old_type} -> {new_type}"),
        });
    }

    let granularity = data.settings.index_granularity;
    let source_path = part.column_file(name, "bin");
    let mut source = CompressedReader::new(
        strata_io::open_for_read(&source_path)?,
        &source_path,
    );

    let base = escape_for_file_name(name);
    let tmp_bin = part.path().join(format!("{base}.bin.tmp"));
    let mut sink = CompressedWriter::new(
        create_for_write(&tmp_bin)?,
        data.settings.max_compress_block_size,
    );
    let mut marks: Vec<Mark> = Vec::new();

    let mut rows_before = 0_u64;
    loop {
        let old_column = strata_io::deserialize_column(old_type, granularity, &mut source)?;
        if old_column.len() == 0 {
            break;
        }
        let mut new_column = Column::empty_of(new_type)?;
        new_column.reserve(old_column.len());
        for row in 0..old_column.len() {
            new_column.insert_field(&old_column.field_at(row))?;
        }

        marks.push(Mark {
            rows_before,
            offset: sink.compressed_offset(),
        });
        serialize_column(&new_column, 0, new_column.len(), &mut sink)?;
        sink.flush_frame()?;
        rows_before += old_column.len() as u64;
    }

    let file = sink.finish()?;
    fsync_file(&file, &tmp_bin)?;

    let tmp_mrk = part.path().join(format!("{base}.mrk.tmp"));
    let mut mrk_file = create_for_write(&tmp_mrk)?;
    use std::io::Write;
    for mark in &marks {
        mrk_file.write_all(&mark.rows_before.to_le_bytes())?;
        mrk_file.write_all(&mark.offset.to_le_bytes())?;
    }
    fsync_file(&mrk_file, &tmp_mrk)?;
    Ok(())
}

fn write_and_sync(dir: &std::path::Path, name: &str, content: &str) -> Result<()> {
    use std::io::Write;
    let path = dir.join(name);
    let mut file = create_for_write(&path)?;
    file.write_all(content.as_bytes())?;
    fsync_file(&file, &path)?;
    Ok(())
}

fn update_metadata_checksum(
    checksums: &mut crate::checksums::Checksums,
    dir: &std::path::Path,
    name: &str,
) -> Result<()> {
    let path = dir.join(name);
    checksums.insert(
        name,
        FileChecksum {
            size: std::fs::metadata(&path)?.len(),
            hash: file_hash(&path)?,
            uncompressed_size: None,
        },
    );
    Ok(())
}
