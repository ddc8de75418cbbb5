//! Background merge workers and the old-part collector.
//!
//! A small fixed set of long-running workers polls a priority queue of
//! `(partition, candidate bytes)` merge jobs; inserts enqueue a job for
//! their partition, and a periodic tick enqueues a full sweep so merges
//! happen even on an idle table. Every pass ends with an old-part
//! collection. Shutdown is cooperative and joins the workers.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::data::MergeTreeData;
use crate::merger::{merge_parts, select_parts_to_merge, CanMergePredicate};

/// One queued unit of merge pressure. Bigger candidates first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MergeJob {
    bytes: u64,
    partition: u32,
}

impl Ord for MergeJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes
            .cmp(&other.bytes)
            .then(self.partition.cmp(&other.partition))
    }
}

impl PartialOrd for MergeJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    jobs: Mutex<BinaryHeap<MergeJob>>,
    wakeup: Condvar,
}

pub struct BackgroundPool {
    queue: Arc<Queue>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundPool {
    /// Start `threads` workers polling every `poll_interval` even
    /// without explicit wakeups.
    #[must_use]
    pub fn start(
        data: Arc<MergeTreeData>,
        can_merge: CanMergePredicate,
        threads: usize,
        poll_interval: Duration,
    ) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let big_merges = Arc::new(AtomicUsize::new(0));
        let max_big = (threads / 2).max(1);

        let workers = (0..threads.max(1))
            .map(|worker| {
                let data = Arc::clone(&data);
                let can_merge = Arc::clone(&can_merge);
                let queue = Arc::clone(&queue);
                let shutdown = Arc::clone(&shutdown);
                let big_merges = Arc::clone(&big_merges);
                std::thread::Builder::new()
                    .name(format!("strata-bg-{worker}"))
                    .spawn(move || {
                        worker_loop(
                            &data,
                            &can_merge,
                            &queue,
                            &shutdown,
                            &big_merges,
                            max_big,
                            poll_interval,
                        );
                    })
                    .expect("failed to spawn background worker thread")
            })
            .collect();

        Self {
            queue,
            shutdown,
            workers,
        }
    }

    /// Nudge the workers after an insert into `partition`.
    pub fn wakeup(&self, partition: u32, bytes: u64) {
        self.queue.jobs.lock().push(MergeJob { bytes, partition });
        self.queue.wakeup.notify_one();
    }

    /// Stop accepting work, wake everyone, join.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.wakeup.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("background worker panicked");
            }
        }
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_inner();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    data: &Arc<MergeTreeData>,
    can_merge: &CanMergePredicate,
    queue: &Queue,
    shutdown: &AtomicBool,
    big_merges: &AtomicUsize,
    max_big: usize,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        // Jobs order the queue by merge pressure; the sweep itself
        // always looks at the whole table.
        let _job = {
            let mut jobs = queue.jobs.lock();
            if jobs.is_empty() {
                queue.wakeup.wait_for(&mut jobs, poll_interval);
            }
            jobs.pop()
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let selected = select_parts_to_merge(
            data,
            can_merge,
            None,
            big_merges.load(Ordering::SeqCst),
            max_big,
            false,
        );
        if let Some(parts) = selected {
            let is_big = parts
                .iter()
                .any(|p| p.size_in_bytes >= data.settings.max_bytes_to_merge_parts_small);
            if is_big {
                big_merges.fetch_add(1, Ordering::SeqCst);
            }
            if let Err(e) = merge_parts(data, parts) {
                error!(error = %e, "background merge failed");
            }
            if is_big {
                big_merges.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let deleted = data.clear_old_parts();
        if deleted > 0 {
            debug!(deleted, "collected old parts");
        }
    }
}
