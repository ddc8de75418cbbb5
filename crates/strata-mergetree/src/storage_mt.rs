//! The MergeTree table engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_column::Block;
use strata_error::{Result, StrataError};
use strata_stream::{BlockInputStream, ExecControl};
use strata_storage::Storage;
use strata_types::{Names, NamesAndTypes};
use tracing::info;

use crate::alter::{apply_to_schema, AlterCommand, AlterDataPartTransaction};
use crate::background::BackgroundPool;
use crate::data::{MergeTreeData, MergeTreeSettings};
use crate::index::{select_mark_ranges, KeyCondition};
use crate::merger::{
    local_can_merge, merge_parts, select_parts_to_merge, CanMergePredicate, MergeMode,
};
use crate::read_pool::MergeTreeReadPool;
use crate::reader::PrewhereInfo;
use crate::writer::write_block;

pub struct StorageMergeTree {
    name: String,
    data: Arc<MergeTreeData>,
    can_merge: CanMergePredicate,
    background: Mutex<Option<BackgroundPool>>,
}

impl StorageMergeTree {
    /// Open the table and start its background workers.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        name: impl Into<String>,
        path: impl Into<std::path::PathBuf>,
        columns: NamesAndTypes,
        date_column: impl Into<String>,
        primary_keys: Names,
        mode: MergeMode,
        settings: MergeTreeSettings,
        background_threads: usize,
    ) -> Result<Arc<Self>> {
        let data = Arc::new(MergeTreeData::open(
            path,
            columns,
            date_column,
            primary_keys,
            mode,
            settings,
            None,
        )?);
        let can_merge = local_can_merge();
        let storage = Arc::new(Self {
            name: name.into(),
            data: Arc::clone(&data),
            can_merge: Arc::clone(&can_merge),
            background: Mutex::new(None),
        });
        if background_threads > 0 {
            *storage.background.lock() = Some(BackgroundPool::start(
                data,
                can_merge,
                background_threads,
                Duration::from_secs(10),
            ));
        }
        Ok(storage)
    }

    #[must_use]
    pub fn data(&self) -> &Arc<MergeTreeData> {
        &self.data
    }

    /// Read with a primary-key condition and optional PREWHERE.
    pub fn read_with_condition(
        &self,
        column_names: &Names,
        condition: &KeyCondition,
        prewhere: Option<Arc<PrewhereInfo>>,
        max_block_size: usize,
        threads: usize,
        do_not_steal_tasks: bool,
        control: &Arc<ExecControl>,
    ) -> Result<Vec<Box<dyn BlockInputStream>>> {
        let columns: Names = if column_names.is_empty() {
            self.data.schema().iter().map(|c| c.name.clone()).collect()
        } else {
            column_names.clone()
        };

        let mut parts_with_ranges = Vec::new();
        for part in self.data.active_parts() {
            let ranges = select_mark_ranges(
                &part,
                condition,
                self.data.settings.coarse_index_granularity,
            )?;
            if !ranges.is_empty() {
                parts_with_ranges.push((part, ranges));
            }
        }
        if parts_with_ranges.is_empty() {
            return Ok(Vec::new());
        }

        let threads = threads.max(1);
        let pool = MergeTreeReadPool::new(
            parts_with_ranges,
            columns,
            self.data.schema(),
            prewhere,
            threads,
            self.data.settings.min_marks_for_concurrent_read,
            do_not_steal_tasks,
            self.data.settings.index_granularity,
            max_block_size,
        );

        Ok((0..threads)
            .map(|thread| {
                Box::new(pool.stream(thread, Arc::clone(control))) as Box<dyn BlockInputStream>
            })
            .collect())
    }

    /// Run one synchronous merge pass (OPTIMIZE).
    pub fn optimize(&self) -> Result<bool> {
        let Some(parts) = select_parts_to_merge(&self.data, &self.can_merge, None, 0, 1, true)
        else {
            return Ok(false);
        };
        merge_parts(&self.data, parts)?;
        Ok(true)
    }

    /// Apply schema changes, to every part or to one partition only.
    pub fn alter(&self, commands: &[AlterCommand], partition: Option<u32>) -> Result<()> {
        if commands.len() > self.data.settings.max_columns_to_alter_at_once {
            return Err(StrataError::ParameterOutOfBound {
                detail: format!(
                    "suspiciously many columns to alter at once: {} (limit {})",
                    commands.len(),
                    self.data.settings.max_columns_to_alter_at_once
                ),
            });
        }

        // Table-wide schema first: a partition-scoped column drop keeps
        // the table schema intact and only rewrites the parts.
        if partition.is_none() {
            let new_schema = apply_to_schema(&self.data.schema(), commands)?;
            self.data.set_schema(new_schema);
        }

        for part in self.data.active_parts() {
            if let Some(partition) = partition {
                if part.info.partition != partition {
                    continue;
                }
            }
            let transaction =
                AlterDataPartTransaction::new(part, Arc::clone(&self.data), commands)?;
            transaction.commit()?;
        }
        info!(table = %self.name, commands = commands.len(), "alter finished");
        Ok(())
    }

    pub fn drop_partition(&self, partition: u32) -> usize {
        self.data.drop_partition(partition)
    }

    /// Collect deletable retired parts now.
    pub fn clear_old_parts(&self) -> usize {
        self.data.clear_old_parts()
    }
}

impl Storage for StorageMergeTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "MergeTree"
    }

    fn columns(&self) -> NamesAndTypes {
        self.data.schema()
    }

    fn read(
        &self,
        column_names: &Names,
        max_block_size: usize,
        threads: usize,
        control: &Arc<ExecControl>,
    ) -> Result<Vec<Box<dyn BlockInputStream>>> {
        self.read_with_condition(
            column_names,
            &KeyCondition::always(),
            None,
            max_block_size,
            threads,
            false,
            control,
        )
    }

    fn write(&self, block: &Block) -> Result<()> {
        let parts = write_block(&self.data, block)?;
        if let Some(background) = self.background.lock().as_ref() {
            for part in &parts {
                background.wakeup(part.info.partition, part.size_in_bytes);
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(background) = self.background.lock().take() {
            background.shutdown();
        }
    }
}

impl Drop for StorageMergeTree {
    fn drop(&mut self) {
        self.shutdown();
    }
}
