//! The merge-tree storage engine.
//!
//! Data lives in immutable sorted parts, one directory each. Inserts
//! write new level-0 parts through a temp directory and an atomic
//! rename; background workers continuously coalesce neighbouring parts
//! into higher levels; readers prune parts and mark ranges through the
//! sparse primary-key index and scan through a work-stealing read pool.
//! ALTER rewrites column files under a per-part transaction.

mod alter;
mod background;
mod checksums;
mod data;
mod index;
mod merger;
mod part;
mod read_pool;
mod reader;
mod storage_mt;
mod writer;

pub use alter::{apply_to_schema, AlterCommand, AlterDataPartTransaction};
pub use background::BackgroundPool;
pub use checksums::{Checksums, FileChecksum};
pub use data::{MergeTreeData, MergeTreeSettings, PartsTransaction};
pub use index::{select_mark_ranges, KeyCondition, KeyRange, MarkRange};
pub use merger::{
    local_can_merge, merge_parts, select_parts_to_merge, CanMergePredicate, MergeMode,
};
pub use part::{DataPart, DataPartPtr, Mark, PartInfo};
pub use read_pool::{MergeTreeReadPool, PooledBlockInputStream, TaskChunk};
pub use reader::{MergeTreeBlockInputStream, PrewhereInfo, VIRTUAL_PART_COLUMN};
pub use storage_mt::StorageMergeTree;
pub use writer::write_block;
