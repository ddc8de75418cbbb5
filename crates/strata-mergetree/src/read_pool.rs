//! The work-stealing read pool.
//!
//! `(part, mark ranges)` pairs are distributed across worker threads up
//! front; a worker prefers the work assigned to it and only steals from
//! other threads once its own queue drains (unless stealing is turned
//! off for the plan). Chunks handed out hold at least
//! `min_marks_for_concurrent_read` marks, and a residue below that
//! threshold goes out whole so no straggler chunk survives. Ranges
//! inside one task are consumed from the tail, so finishing a range is
//! one swap-and-pop.
//!
//! The pool read-locks every part's `columns_lock` for its own
//! lifetime, so a schema-mutating ALTER cannot retype a column file
//! mid-scan.

use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock};
use strata_column::Block;
use strata_error::Result;
use strata_stream::{BlockInputStream, ExecControl, ProfileInfo};
use strata_types::{Names, NamesAndTypes};

use crate::index::MarkRange;
use crate::part::DataPartPtr;
use crate::reader::{MergeTreeBlockInputStream, PrewhereInfo};

struct ThreadTask {
    part: DataPartPtr,
    /// Consumed from the tail.
    ranges: Vec<MarkRange>,
}

impl ThreadTask {
    fn remaining_marks(&self) -> usize {
        self.ranges.iter().map(MarkRange::len).sum()
    }
}

struct PoolState {
    per_thread: Vec<Vec<ThreadTask>>,
}

/// One chunk of work handed to a stream.
pub struct TaskChunk {
    pub part: DataPartPtr,
    pub ranges: Vec<MarkRange>,
}

pub struct MergeTreeReadPool {
    state: Mutex<PoolState>,
    columns: Names,
    table_schema: NamesAndTypes,
    prewhere: Option<Arc<PrewhereInfo>>,
    min_marks_per_chunk: usize,
    do_not_steal_tasks: bool,
    granularity: usize,
    max_block_size: usize,
    /// Keeps every involved part's schema frozen while the pool lives.
    _columns_guards: Vec<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl MergeTreeReadPool {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        parts_with_ranges: Vec<(DataPartPtr, Vec<MarkRange>)>,
        columns: Names,
        table_schema: NamesAndTypes,
        prewhere: Option<Arc<PrewhereInfo>>,
        threads: usize,
        min_marks_per_chunk: usize,
        do_not_steal_tasks: bool,
        granularity: usize,
        max_block_size: usize,
    ) -> Arc<Self> {
        let threads = threads.max(1);
        let guards = parts_with_ranges
            .iter()
            .map(|(part, _)| part.columns_lock.read_arc())
            .collect();

        // Round-robin whole parts by descending mark count: a cheap
        // balance that keeps each part's ranges on one thread at first.
        let mut tasks: Vec<ThreadTask> = parts_with_ranges
            .into_iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .map(|(part, ranges)| ThreadTask { part, ranges })
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.remaining_marks()));

        let mut per_thread: Vec<Vec<ThreadTask>> = (0..threads).map(|_| Vec::new()).collect();
        let mut loads = vec![0_usize; threads];
        for task in tasks {
            let lightest = loads
                .iter()
                .enumerate()
                .min_by_key(|(_, &load)| load)
                .map_or(0, |(i, _)| i);
            loads[lightest] += task.remaining_marks();
            per_thread[lightest].push(task);
        }

        Arc::new(Self {
            state: Mutex::new(PoolState { per_thread }),
            columns,
            table_schema,
            prewhere,
            min_marks_per_chunk: min_marks_per_chunk.max(1),
            do_not_steal_tasks,
            granularity,
            max_block_size,
            _columns_guards: guards,
        })
    }

    /// Next chunk for `thread`, stealing from the fullest other thread
    /// when its own queue is empty.
    fn next_chunk(&self, thread: usize) -> Option<TaskChunk> {
        let mut state = self.state.lock();

        let owner = if state.per_thread[thread].is_empty() {
            if self.do_not_steal_tasks {
                return None;
            }
            let victim = state
                .per_thread
                .iter()
                .enumerate()
                .filter(|(_, queue)| !queue.is_empty())
                .max_by_key(|(_, queue)| {
                    queue.iter().map(ThreadTask::remaining_marks).sum::<usize>()
                })
                .map(|(i, _)| i)?;
            victim
        } else {
            thread
        };

        let queue = &mut state.per_thread[owner];
        let task = queue.last_mut()?;

        let total_remaining = task.remaining_marks();
        // Below the threshold the whole residue goes out as one chunk,
        // so no worker is left a crumb.
        let target = if total_remaining <= 2 * self.min_marks_per_chunk {
            total_remaining
        } else {
            self.min_marks_per_chunk
        };

        let mut chunk_ranges = Vec::new();
        let mut taken = 0_usize;
        while taken < target {
            let Some(range) = task.ranges.last_mut() else { break };
            let need = target - taken;
            if range.len() <= need {
                taken += range.len();
                chunk_ranges.push(*range);
                task.ranges.pop();
            } else {
                // Take the tail of the range.
                let split = MarkRange {
                    begin: range.end - need,
                    end: range.end,
                };
                range.end = split.begin;
                taken += need;
                chunk_ranges.push(split);
            }
        }

        let part = Arc::clone(&task.part);
        if task.ranges.is_empty() {
            queue.pop();
        }
        if chunk_ranges.is_empty() {
            return None;
        }
        Some(TaskChunk {
            part,
            ranges: chunk_ranges,
        })
    }

    /// The stream driving thread `thread` of this pool.
    #[must_use]
    pub fn stream(
        self: &Arc<Self>,
        thread: usize,
        control: Arc<ExecControl>,
    ) -> PooledBlockInputStream {
        PooledBlockInputStream {
            pool: Arc::clone(self),
            thread,
            current: None,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

/// A worker stream pulling chunks from the pool.
pub struct PooledBlockInputStream {
    pool: Arc<MergeTreeReadPool>,
    thread: usize,
    current: Option<MergeTreeBlockInputStream>,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl BlockInputStream for PooledBlockInputStream {
    fn name(&self) -> &'static str {
        "MergeTreePooled"
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
        loop {
            if self.current.is_none() {
                let Some(chunk) = self.pool.next_chunk(self.thread) else {
                    return Ok(Block::new());
                };
                self.current = Some(MergeTreeBlockInputStream::new(
                    chunk.part,
                    self.pool.columns.clone(),
                    self.pool.table_schema.clone(),
                    self.pool.prewhere.clone(),
                    chunk.ranges,
                    self.pool.granularity,
                    self.pool.max_block_size,
                    // The pool itself holds the columns locks.
                    false,
                    Arc::clone(&self.control),
                )?);
            }
            if let Some(inner) = &mut self.current {
                let block = inner.read()?;
                if block.is_empty() {
                    self.current = None;
                    continue;
                }
                return Ok(block);
            }
        }
    }
}
