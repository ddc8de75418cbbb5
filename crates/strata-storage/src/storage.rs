//! The table-engine trait.

use std::sync::Arc;

use strata_column::Block;
use strata_error::{Result, StrataError};
use strata_stream::{BlockInputStream, BlockOutputStream, ExecControl};
use strata_types::{NameAndType, Names, NamesAndTypes};

/// A table engine.
///
/// Methods an engine does not implement return
/// [`StrataError::NotSupported`]; only the merge-tree engine carries
/// ALTER and partition operations.
pub trait Storage: Send + Sync {
    /// Table name.
    fn name(&self) -> &str;

    /// Engine name, for error messages and `SHOW CREATE`.
    fn engine(&self) -> &'static str;

    fn columns(&self) -> NamesAndTypes;

    /// Create the read sources. At most `threads` streams come back;
    /// each emits blocks of at most `max_block_size` rows.
    fn read(
        &self,
        column_names: &Names,
        max_block_size: usize,
        threads: usize,
        control: &Arc<ExecControl>,
    ) -> Result<Vec<Box<dyn BlockInputStream>>>;

    /// Append one block.
    fn write(&self, block: &Block) -> Result<()>;

    /// Delete all data, keeping the table definition.
    fn truncate(&self) -> Result<()> {
        Err(StrataError::NotSupported {
            method: "truncate",
            engine: self.engine(),
        })
    }

    /// Flush background state before the table goes away.
    fn shutdown(&self) {}

    /// Resolve a column's declared type.
    fn column_type(&self, name: &str) -> Result<NameAndType> {
        self.columns()
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StrataError::NoSuchColumn {
                name: name.to_string(),
            })
    }

    /// Verify an incoming block matches the schema by name and type.
    fn check_block(&self, block: &Block) -> Result<()> {
        for col in block.iter() {
            let expected = self.column_type(&col.name)?;
            if expected.data_type != col.data_type {
                return Err(StrataError::TypeMismatch {
                    name: col.name.clone(),
                    expected: expected.data_type.name(),
                    actual: col.data_type.name(),
                });
            }
        }
        block.check_sane()
    }
}

/// Adapts a storage into a block sink.
pub struct StorageBlockOutputStream {
    storage: Arc<dyn Storage>,
}

impl StorageBlockOutputStream {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl BlockOutputStream for StorageBlockOutputStream {
    fn write(&mut self, block: &Block) -> Result<()> {
        self.storage.write(block)
    }
}
