//! Per-interval usage quota charged by the profiling layer.
//!
//! Policy storage and user resolution live outside the core; this is
//! only the counter the stream layer charges against.

use std::sync::atomic::{AtomicU64, Ordering};

use strata_error::{Result, StrataError};

#[derive(Debug, Default)]
pub struct Quota {
    /// Zero = unlimited.
    max_rows: u64,
    max_bytes: u64,
    used_rows: AtomicU64,
    used_bytes: AtomicU64,
}

impl Quota {
    #[must_use]
    pub fn new(max_rows: u64, max_bytes: u64) -> Self {
        Self {
            max_rows,
            max_bytes,
            ..Self::default()
        }
    }

    /// Reset consumption at an interval boundary.
    pub fn reset(&self) {
        self.used_rows.store(0, Ordering::Relaxed);
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    pub fn charge(&self, rows: u64, bytes: u64) -> Result<()> {
        let used_rows = self.used_rows.fetch_add(rows, Ordering::Relaxed) + rows;
        let used_bytes = self.used_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.max_rows != 0 && used_rows > self.max_rows {
            return Err(StrataError::QuotaExceeded {
                detail: format!("rows: {used_rows} of {}", self.max_rows),
            });
        }
        if self.max_bytes != 0 && used_bytes > self.max_bytes {
            return Err(StrataError::QuotaExceeded {
                detail: format!("bytes: {used_bytes} of {}", self.max_bytes),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_trips_then_resets() {
        let quota = Quota::new(10, 0);
        quota.charge(8, 0).expect("within quota");
        assert!(quota.charge(3, 0).is_err());
        quota.reset();
        quota.charge(10, 0).expect("within quota after reset");
    }
}
