//! The in-memory part sets, part loading, and old-part collection.
//!
//! Two structures under separate mutexes: the **active set** (disjoint
//! parts visible to readers) and the **all-parts set** (active plus
//! retired parts still referenced by readers). Neither mutex is ever
//! held across I/O. Lock order where both are needed: `data_parts`
//! before `all_data_parts`.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strata_error::{Result, StrataError};
use strata_io::PersistentIncrement;
use strata_types::codec::read_field;
use strata_types::{DataType, Field, NameAndType, Names, NamesAndTypes};
use tracing::{debug, info, warn};

use crate::checksums::Checksums;
use crate::merger::MergeMode;
use crate::part::{read_marks, DataPart, DataPartPtr, PartInfo};

/// Tuning knobs of one merge-tree table.
#[derive(Debug, Clone)]
pub struct MergeTreeSettings {
    /// Rows per mark / per compressed granule.
    pub index_granularity: usize,
    /// Longest run of parts one merge may take.
    pub max_parts_to_merge_at_once: usize,
    /// Parts above this size never participate in ordinary merges.
    pub max_bytes_to_merge_parts: u64,
    /// Parts above this size count against the big-merge concurrency cap.
    pub max_bytes_to_merge_parts_small: u64,
    /// Reject runs whose largest part dwarfs the rest:
    /// `max_size / sum_of_other_sizes` must stay below this.
    pub size_ratio_coefficient_to_merge_parts: f64,
    /// Added to the ratio coefficient during the night hours (1–5 UTC).
    pub merge_parts_at_night_inc: f64,
    /// Ignore the ratio entirely for partitions older than the
    /// previous month.
    pub merge_anything_for_old_months: bool,
    /// Grace period between retirement and physical deletion.
    pub old_parts_lifetime: Duration,
    /// Split factor of the coarse index refinement.
    pub coarse_index_granularity: usize,
    /// Smallest chunk of marks the read pool hands to one worker.
    pub min_marks_for_concurrent_read: usize,
    /// Force a compressed frame at this many buffered bytes.
    pub max_compress_block_size: usize,
    /// Refuse ALTERs touching more columns than this at once.
    pub max_columns_to_alter_at_once: usize,
}

impl Default for MergeTreeSettings {
    fn default() -> Self {
        Self {
            index_granularity: 8192,
            max_parts_to_merge_at_once: 10,
            max_bytes_to_merge_parts: 10 * 1024 * 1024 * 1024,
            max_bytes_to_merge_parts_small: 250 * 1024 * 1024,
            size_ratio_coefficient_to_merge_parts: 2.0,
            merge_parts_at_night_inc: 1.0,
            merge_anything_for_old_months: false,
            old_parts_lifetime: Duration::from_secs(480),
            coarse_index_granularity: 8,
            min_marks_for_concurrent_read: 20,
            max_compress_block_size: 1 << 20,
            max_columns_to_alter_at_once: 50,
        }
    }
}

/// Callback invoked with the name of a part that failed validation.
pub type BrokenPartCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct MergeTreeData {
    pub path: PathBuf,
    pub date_column: String,
    pub primary_keys: Names,
    pub mode: MergeMode,
    pub settings: MergeTreeSettings,
    columns: RwLock<NamesAndTypes>,
    increment: PersistentIncrement,
    data_parts: Mutex<BTreeSet<DataPartPtr>>,
    all_data_parts: Mutex<BTreeSet<DataPartPtr>>,
    broken_part_callback: Option<BrokenPartCallback>,
}

impl MergeTreeData {
    /// Open (or create) the table directory: drop temp leftovers, load
    /// every sealed part, rebuild the active set.
    pub fn open(
        path: impl Into<PathBuf>,
        columns: NamesAndTypes,
        date_column: impl Into<String>,
        primary_keys: Names,
        mode: MergeMode,
        settings: MergeTreeSettings,
        broken_part_callback: Option<BrokenPartCallback>,
    ) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let data = Self {
            increment: PersistentIncrement::open(&path.join("increment.txt"))?,
            path,
            date_column: date_column.into(),
            primary_keys,
            mode,
            settings,
            columns: RwLock::new(columns),
            data_parts: Mutex::new(BTreeSet::new()),
            all_data_parts: Mutex::new(BTreeSet::new()),
            broken_part_callback,
        };
        data.load_parts()?;
        Ok(data)
    }

    fn load_parts(&self) -> Result<()> {
        let mut loaded: Vec<DataPartPtr> = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();

            // A crash mid-write or mid-delete leaves temp directories;
            // both kinds are garbage on open.
            if dir_name.starts_with("tmp_") || dir_name.starts_with("tmp2_") {
                warn!(dir = %dir_name, "removing leftover temporary directory");
                std::fs::remove_dir_all(entry.path())?;
                continue;
            }
            let Some(info) = PartInfo::parse(&dir_name) else {
                continue;
            };

            match self.load_part(&entry.path(), info) {
                Ok(part) => loaded.push(Arc::new(part)),
                Err(e) => {
                    warn!(part = %dir_name, error = %e, "broken part excluded from active set");
                    if let Some(callback) = &self.broken_part_callback {
                        callback(&dir_name);
                    }
                }
            }
        }

        // Parts covered by a merged neighbour were retired before the
        // crash; only uncovered parts become active.
        let mut data_parts = self.data_parts.lock();
        let mut all_parts = self.all_data_parts.lock();
        for part in &loaded {
            let covered = loaded
                .iter()
                .any(|other| other.info.contains(&part.info));
            if covered {
                part.retire();
            } else {
                data_parts.insert(Arc::clone(part));
            }
            all_parts.insert(Arc::clone(part));
        }
        info!(
            active = data_parts.len(),
            total = all_parts.len(),
            path = %self.path.display(),
            "loaded parts"
        );
        Ok(())
    }

    fn load_part(&self, part_path: &Path, info: PartInfo) -> Result<DataPart> {
        let name = info.name();

        let checksums_text = std::fs::read_to_string(part_path.join("checksums.txt"))
            .map_err(|_| StrataError::NoFileInDataPart {
                file: "checksums.txt".into(),
                part: name.clone(),
            })?;
        let checksums = Checksums::parse(&checksums_text)?;

        // Lazy integrity: verify presence and size on open, leave the
        // content hashes to an explicit check.
        for (file, sum) in checksums.files() {
            let metadata = std::fs::metadata(part_path.join(file)).map_err(|_| {
                StrataError::NoFileInDataPart {
                    file: file.clone(),
                    part: name.clone(),
                }
            })?;
            if metadata.len() != sum.size {
                return Err(StrataError::BadSizeOfFile {
                    file: file.clone(),
                    part: name.clone(),
                    expected: sum.size,
                    actual: metadata.len(),
                });
            }
        }

        let columns = parse_columns_file(&std::fs::read_to_string(part_path.join("columns.txt"))
            .map_err(|_| StrataError::NoFileInDataPart {
                file: "columns.txt".into(),
                part: name.clone(),
            })?)?;

        let rows: u64 = std::fs::read_to_string(part_path.join("count.txt"))
            .map_err(|_| StrataError::NoFileInDataPart {
                file: "count.txt".into(),
                part: name.clone(),
            })?
            .trim()
            .parse()
            .map_err(|_| StrataError::CorruptedData {
                detail: format!("bad count.txt in part {name}"),
            })?;

        let marks = if self.primary_keys.is_empty() {
            (rows as usize).div_ceil(self.settings.index_granularity)
        } else {
            let first_key_col = strata_io::escape_for_file_name(&self.primary_keys[0]);
            read_marks(&part_path.join(format!("{first_key_col}.mrk")))
                .map(|m| m.len())
                .unwrap_or_else(|_| (rows as usize).div_ceil(self.settings.index_granularity))
        };

        let key_types = self.key_types_for(&columns)?;
        let index = load_primary_index(&part_path.join("primary.idx"), &key_types, marks)?;

        let size_in_bytes = checksums.files().values().map(|f| f.size).sum();

        Ok(DataPart {
            info,
            name,
            storage_path: self.path.clone(),
            rows,
            marks,
            size_in_bytes,
            index,
            key_arity: key_types.len(),
            checksums: RwLock::new(checksums),
            columns: RwLock::new(columns),
            columns_lock: Arc::new(RwLock::new(())),
            alter_mutex: Arc::new(Mutex::new(())),
            currently_merging: AtomicBool::new(false),
            remove_time: Mutex::new(None),
        })
    }

    fn key_types_for(&self, columns: &NamesAndTypes) -> Result<Vec<DataType>> {
        self.primary_keys
            .iter()
            .map(|key| {
                columns
                    .iter()
                    .find(|c| c.name == *key)
                    .map(|c| c.data_type.clone())
                    .ok_or_else(|| StrataError::NoSuchColumn { name: key.clone() })
            })
            .collect()
    }

    #[must_use]
    pub fn schema(&self) -> NamesAndTypes {
        self.columns.read().clone()
    }

    pub fn set_schema(&self, columns: NamesAndTypes) {
        *self.columns.write() = columns;
    }

    #[must_use]
    pub fn increment(&self) -> &PersistentIncrement {
        &self.increment
    }

    #[must_use]
    pub fn key_arity(&self) -> usize {
        self.primary_keys.len()
    }

    /// Snapshot of the active set, in part order. Each returned handle
    /// keeps its part alive for the caller's read.
    #[must_use]
    pub fn active_parts(&self) -> Vec<DataPartPtr> {
        self.data_parts.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn all_parts_count(&self) -> usize {
        self.all_data_parts.lock().len()
    }

    /// Publish a freshly sealed part (already renamed to its final
    /// directory) into both sets.
    pub fn add_sealed_part(&self, part: DataPart) -> DataPartPtr {
        let part = Arc::new(part);
        let mut data_parts = self.data_parts.lock();
        let mut all_parts = self.all_data_parts.lock();
        data_parts.insert(Arc::clone(&part));
        all_parts.insert(Arc::clone(&part));
        debug!(part = %part.name, rows = part.rows, "part published");
        part
    }

    /// Atomically swap `removed` out of the active set for `added`.
    ///
    /// The returned transaction rolls the swap back if dropped without
    /// [`PartsTransaction::commit`], so a publisher failing between the
    /// swap and its own commit leaves the set unchanged.
    pub fn replace_parts(
        self: &Arc<Self>,
        removed: Vec<DataPartPtr>,
        added: Vec<DataPartPtr>,
    ) -> PartsTransaction {
        {
            let mut data_parts = self.data_parts.lock();
            let mut all_parts = self.all_data_parts.lock();
            for part in &removed {
                data_parts.remove(part);
                part.retire();
            }
            for part in &added {
                data_parts.insert(Arc::clone(part));
                all_parts.insert(Arc::clone(part));
            }
        }
        info!(
            removed = removed.len(),
            added = added.len(),
            "replaced parts in active set"
        );
        PartsTransaction {
            data: Arc::clone(self),
            removed,
            added,
            committed: false,
        }
    }

    /// Physically delete retired parts whose grace period elapsed and
    /// which no reader references any more.
    pub fn clear_old_parts(&self) -> usize {
        let mut candidates = Vec::new();
        {
            let data_parts = self.data_parts.lock();
            let mut all_parts = self.all_data_parts.lock();
            let lifetime = self.settings.old_parts_lifetime;
            all_parts.retain(|part| {
                let deletable = !data_parts.contains(part)
                    && part.retired_for().is_some_and(|d| d >= lifetime)
                    && Arc::strong_count(part) == 1;
                if deletable {
                    candidates.push((part.name.clone(), part.path()));
                }
                !deletable
            });
        }

        let mut deleted = 0_usize;
        for (name, path) in candidates {
            let tomb = self.path.join(format!("tmp2_{name}"));
            let result = strata_io::atomic_rename(&path, &tomb)
                .and_then(|()| std::fs::remove_dir_all(&tomb).map_err(Into::into));
            match result {
                Ok(()) => {
                    info!(part = %name, "old part deleted");
                    deleted += 1;
                }
                Err(e) => warn!(part = %name, error = %e, "failed to delete old part"),
            }
        }
        deleted
    }

    /// Retire every active part of one partition (DROP PARTITION).
    pub fn drop_partition(self: &Arc<Self>, partition: u32) -> usize {
        let removed: Vec<DataPartPtr> = {
            let data_parts = self.data_parts.lock();
            data_parts
                .iter()
                .filter(|p| p.info.partition == partition)
                .cloned()
                .collect()
        };
        let count = removed.len();
        if count > 0 {
            self.replace_parts(removed, Vec::new()).commit();
            info!(partition, parts = count, "partition dropped");
        }
        count
    }
}

/// Rollback guard for one active-set swap.
pub struct PartsTransaction {
    data: Arc<MergeTreeData>,
    removed: Vec<DataPartPtr>,
    added: Vec<DataPartPtr>,
    committed: bool,
}

impl PartsTransaction {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartsTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Failures here must not mask the error that aborted the
        // publisher; restore the previous active set and log.
        let mut data_parts = self.data.data_parts.lock();
        let mut all_parts = self.data.all_data_parts.lock();
        for part in &self.added {
            data_parts.remove(part);
            all_parts.remove(part);
            part.retire();
        }
        for part in &self.removed {
            *part.remove_time.lock() = None;
            data_parts.insert(Arc::clone(part));
        }
        tracing::error!(
            restored = self.removed.len(),
            dropped = self.added.len(),
            "parts transaction rolled back"
        );
    }
}

/// `columns.txt`: versioned text listing `name<TAB>type` per line.
pub fn serialize_columns_file(columns: &NamesAndTypes) -> String {
    let mut out = String::from("columns format version: 1\n");
    out.push_str(&format!("{} columns:\n", columns.len()));
    for col in columns {
        out.push_str(&format!("{}\t{}\n", col.name, col.data_type.name()));
    }
    out
}

pub fn parse_columns_file(text: &str) -> Result<NamesAndTypes> {
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| StrataError::CorruptedData {
        detail: "empty columns file".into(),
    })?;
    let version: u32 = header
        .strip_prefix("columns format version: ")
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| StrataError::CorruptedData {
            detail: format!("bad columns header: '{header}'"),
        })?;
    if version < 1 {
        return Err(StrataError::FormatVersionTooOld {
            what: "columns.txt",
            found: version,
            min_supported: 1,
        });
    }
    let _count_line = lines.next();

    let mut columns = NamesAndTypes::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, type_name) = line.split_once('\t').ok_or_else(|| {
            StrataError::CorruptedData {
                detail: format!("bad columns line: '{line}'"),
            }
        })?;
        columns.push(NameAndType::new(name, DataType::parse(type_name)?));
    }
    Ok(columns)
}

/// Load `primary.idx`: `marks` packed key tuples.
fn load_primary_index(path: &Path, key_types: &[DataType], marks: usize) -> Result<Vec<Field>> {
    if key_types.is_empty() {
        return Ok(Vec::new());
    }
    let mut file = strata_io::open_for_read(path)?;
    let mut index = Vec::with_capacity(marks * key_types.len());
    for _ in 0..marks {
        for key_type in key_types {
            index.push(read_field(&mut file, key_type)?);
        }
    }
    // Trailing bytes mean the mark count and the index disagree.
    let mut probe = [0_u8; 1];
    if file.read(&mut probe)? != 0 {
        return Err(StrataError::CorruptedData {
            detail: format!("primary index '{}' longer than mark count", path.display()),
        });
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_file_roundtrip() {
        let columns = vec![
            NameAndType::new("d", DataType::Date),
            NameAndType::new("n", DataType::Int64),
            NameAndType::new("s", DataType::String),
        ];
        let text = serialize_columns_file(&columns);
        assert_eq!(parse_columns_file(&text).expect("parse"), columns);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = MergeTreeSettings::default();
        assert_eq!(settings.index_granularity, 8192);
        assert_eq!(settings.max_parts_to_merge_at_once, 10);
        assert_eq!(settings.old_parts_lifetime, Duration::from_secs(480));
    }
}
