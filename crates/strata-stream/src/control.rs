//! Query-wide execution control shared by every stream of one query.
//!
//! One [`ExecControl`] is created per query and handed to each stream at
//! construction. Cancellation is a shared atomic flag: setting it on any
//! stream is immediately observed by all of them, which is what makes
//! `cancel` recursive without the streams holding references to each
//! other. The control also owns the process-level read totals that
//! limits and the speed check run against.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_types::{Limits, OverflowMode, Progress, ProgressCallback};

use crate::quota::Quota;

/// What the profiling layer should do after accounting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    /// A limit fired under `Break`: finish cleanly as if data ended.
    Stop,
}

pub struct ExecControl {
    cancelled: AtomicBool,
    limits: Limits,
    rows_read: AtomicU64,
    bytes_read: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    progress_callback: Mutex<Option<ProgressCallback>>,
    quota: Mutex<Option<Arc<Quota>>>,
}

impl ExecControl {
    #[must_use]
    pub fn new(limits: Limits) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            limits,
            rows_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            started_at: Mutex::new(None),
            progress_callback: Mutex::new(None),
            quota: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn unlimited() -> Arc<Self> {
        Self::new(Limits::default())
    }

    /// Request cooperative cancellation. Idempotent, any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.lock() = Some(callback);
    }

    pub fn set_quota(&self, quota: Arc<Quota>) {
        *self.quota.lock() = Some(quota);
    }

    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Seconds since the first accounted block.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at
            .lock()
            .map_or(0.0, |start| start.elapsed().as_secs_f64())
    }

    /// Account one block's worth of progress: update totals, notify the
    /// callback, charge the quota, then check every read limit.
    pub fn progress(&self, progress: &Progress) -> Result<Signal> {
        {
            let mut started = self.started_at.lock();
            if started.is_none() {
                *started = Some(Instant::now());
            }
        }
        let rows = self.rows_read.fetch_add(progress.rows, Ordering::Relaxed) + progress.rows;
        let bytes = self.bytes_read.fetch_add(progress.bytes, Ordering::Relaxed) + progress.bytes;

        if let Some(callback) = self.progress_callback.lock().as_ref() {
            callback(progress);
        }
        if let Some(quota) = self.quota.lock().as_ref() {
            quota.charge(progress.rows, progress.bytes)?;
        }

        if self.limits.max_rows_to_read != 0 && rows > self.limits.max_rows_to_read {
            match self.limits.read_overflow_mode {
                OverflowMode::Throw => {
                    return Err(StrataError::TooManyRows {
                        rows,
                        max: self.limits.max_rows_to_read,
                    });
                }
                OverflowMode::Break | OverflowMode::Any => return Ok(Signal::Stop),
            }
        }
        if self.limits.max_bytes_to_read != 0 && bytes > self.limits.max_bytes_to_read {
            match self.limits.read_overflow_mode {
                OverflowMode::Throw => {
                    return Err(StrataError::TooManyBytes {
                        bytes,
                        max: self.limits.max_bytes_to_read,
                    });
                }
                OverflowMode::Break | OverflowMode::Any => return Ok(Signal::Stop),
            }
        }

        let elapsed = self.elapsed_secs();
        if self.limits.max_execution_time_secs != 0
            && elapsed > self.limits.max_execution_time_secs as f64
        {
            match self.limits.timeout_overflow_mode {
                OverflowMode::Throw => {
                    return Err(StrataError::TimeoutExceeded {
                        elapsed_secs: elapsed,
                        max_secs: self.limits.max_execution_time_secs as f64,
                    });
                }
                OverflowMode::Break | OverflowMode::Any => return Ok(Signal::Stop),
            }
        }

        // Speed is only judged after the grace window, so short queries
        // and cold starts do not trip it.
        if self.limits.min_execution_speed != 0
            && elapsed > self.limits.timeout_before_checking_execution_speed_secs as f64
            && elapsed > 0.0
        {
            #[allow(clippy::cast_precision_loss)]
            let speed = rows as f64 / elapsed;
            if speed < self.limits.min_execution_speed as f64 {
                return Err(StrataError::TooSlow {
                    rows_per_sec: speed,
                    min_rows_per_sec: self.limits.min_execution_speed,
                });
            }
        }

        Ok(Signal::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent_and_shared() {
        let control = ExecControl::unlimited();
        let clone = Arc::clone(&control);
        assert!(!control.is_cancelled());
        clone.cancel();
        clone.cancel();
        assert!(control.is_cancelled());
    }

    #[test]
    fn test_row_limit_throw_and_break() {
        let mut limits = Limits::default();
        limits.max_rows_to_read = 10;
        let control = ExecControl::new(limits.clone());
        assert_eq!(
            control.progress(&Progress::new(5, 0)).expect("progress"),
            Signal::Continue
        );
        assert!(control.progress(&Progress::new(6, 0)).is_err());

        limits.read_overflow_mode = OverflowMode::Break;
        let control = ExecControl::new(limits);
        assert_eq!(
            control.progress(&Progress::new(11, 0)).expect("progress"),
            Signal::Stop
        );
    }

    #[test]
    fn test_progress_callback_sees_deltas() {
        let control = ExecControl::unlimited();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        control.set_progress_callback(Arc::new(move |p: &Progress| {
            seen_cb.fetch_add(p.rows, Ordering::Relaxed);
        }));
        control.progress(&Progress::new(3, 100)).expect("progress");
        control.progress(&Progress::new(4, 100)).expect("progress");
        assert_eq!(seen.load(Ordering::Relaxed), 7);
        assert_eq!(control.rows_read(), 7);
        assert_eq!(control.bytes_read(), 200);
    }
}
