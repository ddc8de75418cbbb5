//! Persistent monotonic counter backing part-id allocation.
//!
//! The counter file holds the last allocated id as decimal text. Every
//! allocation persists the new value before returning, so a restart can
//! only skip ids, never reuse them.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use tracing::debug;

use crate::fs::{create_for_write, fsync_file};

pub struct PersistentIncrement {
    path: PathBuf,
    value: Mutex<u64>,
}

impl PersistentIncrement {
    /// Open or create the counter file.
    pub fn open(path: &Path) -> Result<Self> {
        let value = match std::fs::read_to_string(path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| StrataError::CorruptedData {
                    detail: format!("bad increment file '{}': '{}'", path.display(), text.trim()),
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(StrataError::CannotRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        debug!(path = %path.display(), value, "opened increment");
        Ok(Self {
            path: path.to_path_buf(),
            value: Mutex::new(value),
        })
    }

    /// Allocate `n` consecutive ids and return the first.
    pub fn allocate(&self, n: u64) -> Result<u64> {
        let mut guard = self.value.lock();
        let first = *guard + 1;
        let next = *guard + n;
        let mut file = create_for_write(&self.path)?;
        write!(file, "{next}").map_err(|source| StrataError::CannotWrite {
            path: self.path.clone(),
            source,
        })?;
        fsync_file(&file, &self.path)?;
        *guard = next;
        Ok(first)
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        *self.value.lock()
    }
}
