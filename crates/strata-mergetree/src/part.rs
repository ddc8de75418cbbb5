//! Parts: the immutable on-disk unit.
//!
//! A part name encodes `<partition>_<min_id>_<max_id>_<level>`. Two
//! parts are ordered when their id ranges are disjoint; a part contains
//! another when its id range covers it. Directory layout per part:
//!
//! ```text
//! <partition>_<min>_<max>_<level>/
//!     primary.idx        key tuple at every mark, packed binary
//!     columns.txt        schema at the time of write
//!     checksums.txt      per-file sizes and hashes
//!     count.txt          exact row count
//!     <col>.bin          compressed column values
//!     <col>.mrk          (rows_before, compressed_offset) pairs
//!     <col>.size0.bin    array element counts (array columns only)
//!     <col>.size0.mrk
//! ```

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use strata_error::{Result, StrataError};
use strata_io::escape_for_file_name;
use strata_types::{DataType, Field, NamesAndTypes};

use crate::checksums::Checksums;

/// One sparse index entry in a `.mrk` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pub rows_before: u64,
    pub offset: u64,
}

/// The name triple plus level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartInfo {
    /// Month key, `YYYYMM`.
    pub partition: u32,
    pub min_id: u64,
    pub max_id: u64,
    pub level: u32,
}

impl PartInfo {
    #[must_use]
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.partition, self.min_id, self.max_id, self.level
        )
    }

    /// Parse a directory name; `None` for anything that is not a part.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let mut pieces = name.split('_');
        let partition = pieces.next()?.parse().ok()?;
        let min_id = pieces.next()?.parse().ok()?;
        let max_id = pieces.next()?.parse().ok()?;
        let level = pieces.next()?.parse().ok()?;
        if pieces.next().is_some() || min_id > max_id {
            return None;
        }
        Some(Self {
            partition,
            min_id,
            max_id,
            level,
        })
    }

    /// Whether this part's id range covers `other` (same partition).
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.partition == other.partition
            && self.min_id <= other.min_id
            && self.max_id >= other.max_id
            && self.level >= other.level
            && *self != *other
    }

    /// Whether the two id ranges cannot overlap.
    #[must_use]
    pub fn disjoint(&self, other: &Self) -> bool {
        self.partition != other.partition
            || self.max_id < other.min_id
            || other.max_id < self.min_id
    }

    /// Sort key used by the part sets.
    #[must_use]
    pub const fn order_key(&self) -> (u32, u64, u64, u32) {
        (self.partition, self.min_id, self.max_id, self.level)
    }
}

/// One sealed part.
pub struct DataPart {
    pub info: PartInfo,
    pub name: String,
    /// The table directory this part lives under.
    pub storage_path: PathBuf,
    pub rows: u64,
    pub marks: usize,
    /// Sum of on-disk file sizes.
    pub size_in_bytes: u64,
    /// Primary-key values at every mark: `marks × key_arity` fields,
    /// row-major, fully resident while the part is open.
    pub index: Vec<Field>,
    pub key_arity: usize,
    pub checksums: RwLock<Checksums>,
    /// Schema at the time of write.
    pub columns: RwLock<NamesAndTypes>,
    /// Readers hold shared for the scan lifetime; ALTER takes exclusive
    /// at commit.
    pub columns_lock: Arc<RwLock<()>>,
    /// Serializes whole ALTER flows on this part.
    pub alter_mutex: Arc<Mutex<()>>,
    /// Reserved by a merge.
    pub currently_merging: AtomicBool,
    /// When the part left the active set.
    pub remove_time: Mutex<Option<Instant>>,
}

impl DataPart {
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.storage_path.join(&self.name)
    }

    #[must_use]
    pub fn column_file(&self, column: &str, extension: &str) -> PathBuf {
        self.path()
            .join(format!("{}.{extension}", escape_for_file_name(column)))
    }

    #[must_use]
    pub fn sizes_file(&self, column: &str, extension: &str) -> PathBuf {
        self.path()
            .join(format!("{}.size0.{extension}", escape_for_file_name(column)))
    }

    /// The key tuple at mark `mark`.
    #[must_use]
    pub fn index_row(&self, mark: usize) -> &[Field] {
        &self.index[mark * self.key_arity..(mark + 1) * self.key_arity]
    }

    /// The declared type of a column, if this part has it.
    #[must_use]
    pub fn column_type(&self, name: &str) -> Option<DataType> {
        self.columns
            .read()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data_type.clone())
    }

    /// Whether the part carries data files for a column.
    #[must_use]
    pub fn has_column_files(&self, name: &str) -> bool {
        self.checksums
            .read()
            .files()
            .contains_key(&format!("{}.bin", escape_for_file_name(name)))
    }

    /// The present column with the smallest data file, used to learn
    /// row counts when none of the requested columns exist on disk.
    #[must_use]
    pub fn smallest_column_on_disk(&self) -> Option<String> {
        let columns = self.columns.read();
        let checksums = self.checksums.read();
        columns
            .iter()
            .filter_map(|c| {
                let file = format!("{}.bin", escape_for_file_name(&c.name));
                checksums
                    .files()
                    .get(&file)
                    .map(|sum| (sum.size, c.name.clone()))
            })
            .min()
            .map(|(_, name)| name)
    }

    /// Set the retirement timestamp (idempotent).
    pub fn retire(&self) {
        let mut remove_time = self.remove_time.lock();
        if remove_time.is_none() {
            *remove_time = Some(Instant::now());
        }
    }

    #[must_use]
    pub fn retired_for(&self) -> Option<std::time::Duration> {
        self.remove_time.lock().map(|at| at.elapsed())
    }

    /// Try to reserve this part for a merge.
    pub fn try_reserve_for_merge(&self) -> bool {
        !self
            .currently_merging
            .swap(true, AtomicOrdering::SeqCst)
    }

    pub fn release_merge_reservation(&self) {
        self.currently_merging.store(false, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_merging(&self) -> bool {
        self.currently_merging.load(AtomicOrdering::SeqCst)
    }
}

impl std::fmt::Debug for DataPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPart")
            .field("name", &self.name)
            .field("rows", &self.rows)
            .field("marks", &self.marks)
            .finish()
    }
}

impl PartialEq for DataPart {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl Eq for DataPart {}

impl PartialOrd for DataPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataPart {
    fn cmp(&self, other: &Self) -> Ordering {
        self.info.order_key().cmp(&other.info.order_key())
    }
}

/// Read a `.mrk` file.
pub fn read_marks(path: &Path) -> Result<Vec<Mark>> {
    let mut file = strata_io::open_for_read(path)?;
    let raw = strata_io::read_u64_stream(usize::MAX / 16, &mut file)?;
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

/// A shared handle to a sealed part.
pub type DataPartPtr = Arc<DataPart>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let info = PartInfo {
            partition: 201_612,
            min_id: 7,
            max_id: 12,
            level: 2,
        };
        assert_eq!(info.name(), "201612_7_12_2");
        assert_eq!(PartInfo::parse("201612_7_12_2"), Some(info));
        assert_eq!(PartInfo::parse("tmp_201612_7_12_2"), None);
        assert_eq!(PartInfo::parse("201612_9_7_0"), None);
        assert_eq!(PartInfo::parse("checksums.txt"), None);
    }

    #[test]
    fn test_containment_and_disjointness() {
        let merged = PartInfo::parse("201612_1_5_1").expect("parse");
        let inner = PartInfo::parse("201612_2_3_0").expect("parse");
        let after = PartInfo::parse("201612_6_6_0").expect("parse");
        let other_month = PartInfo::parse("201611_1_5_1").expect("parse");

        assert!(merged.contains(&inner));
        assert!(!inner.contains(&merged));
        assert!(merged.disjoint(&after));
        assert!(!merged.disjoint(&inner));
        assert!(merged.disjoint(&other_month));
        assert!(!merged.contains(&merged.clone()));
    }
}
