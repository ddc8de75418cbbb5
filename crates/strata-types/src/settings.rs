//! Per-query settings and read limits.

use serde::{Deserialize, Serialize};

/// Policy applied when a configured limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Raise the limit error.
    #[default]
    Throw,
    /// Stop reading and finish cleanly, as if the data ended.
    Break,
    /// Keep working over entries already accumulated, but admit no new
    /// ones. Only meaningful for keyed accumulation (GROUP BY, sets).
    Any,
}

/// Replica selection policy for distributed reads. Parsed and stored for
/// the interpreter layer; the engine core does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    Random,
    NearestHostname,
    InOrder,
}

/// When totals are computed relative to HAVING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TotalsMode {
    #[default]
    BeforeHaving,
    AfterHavingInclusive,
    AfterHavingExclusive,
    AfterHavingAuto,
}

/// Limits enforced by the stream profiling layer. Zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_rows_to_read: u64,
    pub max_bytes_to_read: u64,
    pub read_overflow_mode: OverflowMode,

    pub max_rows_to_group_by: u64,
    pub group_by_overflow_mode: OverflowMode,

    pub max_rows_in_distinct: u64,
    pub max_bytes_in_distinct: u64,
    pub distinct_overflow_mode: OverflowMode,

    /// Wall-clock bound for one query, in seconds. Zero = unlimited.
    pub max_execution_time_secs: u64,
    pub timeout_overflow_mode: OverflowMode,

    /// Minimal acceptable read speed in rows per second, checked once the
    /// grace window below has elapsed. Zero = no check.
    pub min_execution_speed: u64,
    pub timeout_before_checking_execution_speed_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rows_to_read: 0,
            max_bytes_to_read: 0,
            read_overflow_mode: OverflowMode::Throw,
            max_rows_to_group_by: 0,
            group_by_overflow_mode: OverflowMode::Throw,
            max_rows_in_distinct: 0,
            max_bytes_in_distinct: 0,
            distinct_overflow_mode: OverflowMode::Throw,
            max_execution_time_secs: 0,
            timeout_overflow_mode: OverflowMode::Throw,
            min_execution_speed: 0,
            timeout_before_checking_execution_speed_secs: 0,
        }
    }
}

/// Query-level settings.
///
/// Defaults follow the engine's shipped configuration. Connection and
/// distributed-query knobs are carried for the outer layers; the core
/// honors the block, thread, compression and limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Rows per block produced by sources.
    pub max_block_size: usize,
    /// Worker threads per query.
    pub max_threads: usize,
    pub max_distributed_connections: usize,
    /// Compress only when a granule reaches this many bytes.
    pub min_compress_block_size: usize,
    /// Force a compressed frame boundary at this many bytes.
    pub max_compress_block_size: usize,
    pub use_uncompressed_cache: bool,
    /// Experimental; parsed and ignored by this implementation.
    pub use_splitting_aggregator: bool,
    pub load_balancing: LoadBalancing,
    pub totals_mode: TotalsMode,
    pub default_sample: f64,

    pub connect_timeout_secs: u64,
    pub connect_timeout_with_failover_ms: u64,
    pub receive_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub interactive_delay_us: u64,
    pub queue_max_wait_ms: u64,
    pub distributed_connections_pool_size: usize,
    pub connections_with_failover_max_tries: usize,
    /// Compute the 2-row min/max side-channel block.
    pub extremes: bool,
    pub replace_running_query: bool,

    pub limits: Limits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_block_size: 65_536,
            max_threads: 8,
            max_distributed_connections: 100,
            min_compress_block_size: 65_536,
            max_compress_block_size: 1_048_576,
            use_uncompressed_cache: false,
            use_splitting_aggregator: false,
            load_balancing: LoadBalancing::Random,
            totals_mode: TotalsMode::BeforeHaving,
            default_sample: 1.0,
            connect_timeout_secs: 10,
            connect_timeout_with_failover_ms: 50,
            receive_timeout_secs: 300,
            send_timeout_secs: 300,
            poll_interval_secs: 10,
            interactive_delay_us: 100_000,
            queue_max_wait_ms: 5_000,
            distributed_connections_pool_size: 128,
            connections_with_failover_max_tries: 3,
            extremes: false,
            replace_running_query: false,
            limits: Limits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unlimited() {
        let limits = Limits::default();
        assert_eq!(limits.max_rows_to_read, 0);
        assert_eq!(limits.read_overflow_mode, OverflowMode::Throw);
    }

    #[test]
    fn test_settings_serde_roundtrip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).expect("settings should serialize");
        let back: Settings = serde_json::from_str(&json).expect("settings should deserialize");
        assert_eq!(back.max_block_size, settings.max_block_size);
        assert_eq!(back.limits.group_by_overflow_mode, OverflowMode::Throw);
    }
}
