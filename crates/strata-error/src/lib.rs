//! Error taxonomy for the StrataDB engine.
//!
//! One structured error enum shared by every crate in the workspace. The
//! variants are grouped by how the caller is expected to react:
//!
//! - **Input shape**: the caller violated a contract (mismatched sizes,
//!   wrong column variant, unknown identifier). Never retried.
//! - **Resource limits**: a configured limit fired. Whether this is an
//!   error or a clean early end is decided by the overflow mode at the
//!   point where the limit is checked.
//! - **Storage format**: an on-disk structure failed validation. The
//!   affected part is excluded from the active set and reported upward.
//! - **System I/O**: an `errno`-level failure, with path context attached.
//! - **Coordination**: failures of the external coordination service.
//!   Session expiry must abort the current insert without marking the
//!   local part as successfully inserted.
//! - **Logical**: an internal invariant did not hold. Always a bug.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T, E = StrataError> = std::result::Result<T, E>;

/// Primary error type for StrataDB operations.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Input shape ===
    /// An index or length parameter was outside the valid range.
    #[error("parameter out of bound: {detail}")]
    ParameterOutOfBound { detail: String },

    /// Two containers that must agree in length did not.
    #[error("sizes of {what} do not match: {left} vs {right}")]
    SizesMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    /// A function or operator received an argument of an unsupported type.
    #[error("illegal type {type_name} of argument for {function}")]
    IllegalTypeOfArgument {
        function: String,
        type_name: String,
    },

    /// A column of the wrong physical variant reached an operation.
    #[error("illegal column {column} for {context}")]
    IllegalColumn { column: String, context: String },

    /// A name did not resolve to any known column.
    #[error("there is no column with name '{name}' in table")]
    NoSuchColumn { name: String },

    /// The same column name was inserted into a block twice.
    #[error("duplicate column '{name}' in block")]
    DuplicateColumn { name: String },

    /// A column arrived with a declared type different from the schema.
    #[error("type mismatch for column '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A data type name could not be parsed.
    #[error("unknown data type: '{name}'")]
    UnknownDataType { name: String },

    /// A function name did not resolve.
    #[error("unknown function: '{name}'")]
    UnknownFunction { name: String },

    /// An operation that requires data received none.
    #[error("empty data passed to {operation}")]
    EmptyData { operation: &'static str },

    /// The storage engine does not implement this operation.
    #[error("method {method} is not supported by storage engine {engine}")]
    NotSupported {
        method: &'static str,
        engine: &'static str,
    },

    // === Resource limits ===
    /// A row-count limit was exceeded while reading.
    #[error("limit for rows to read exceeded: {rows} rows read, maximum: {max}")]
    TooManyRows { rows: u64, max: u64 },

    /// A byte-count limit was exceeded while reading.
    #[error("limit for bytes to read exceeded: {bytes} bytes read, maximum: {max}")]
    TooManyBytes { bytes: u64, max: u64 },

    /// The GROUP BY produced more distinct keys than allowed.
    #[error("limit for rows to GROUP BY exceeded: has {rows} rows, maximum: {max}")]
    TooManyGroups { rows: u64, max: u64 },

    /// A set (DISTINCT, IN) outgrew its configured bound.
    #[error("size limit for set exceeded: {detail}")]
    SetSizeLimitExceeded { detail: String },

    /// The query ran longer than `max_execution_time`.
    #[error("timeout exceeded: elapsed {elapsed_secs:.3} s, maximum: {max_secs:.3} s")]
    TimeoutExceeded { elapsed_secs: f64, max_secs: f64 },

    /// The query read slower than `min_execution_speed`.
    #[error("query is executing too slowly: {rows_per_sec:.0} rows/s, minimum: {min_rows_per_sec}")]
    TooSlow {
        rows_per_sec: f64,
        min_rows_per_sec: u64,
    },

    /// A quota interval was exhausted.
    #[error("quota exceeded: {detail}")]
    QuotaExceeded { detail: String },

    /// The query was cancelled cooperatively.
    #[error("query was cancelled")]
    Cancelled,

    // === Storage format ===
    /// A column file named in the schema is absent from the part.
    #[error("no file {file} in data part {part}")]
    NoFileInDataPart { file: String, part: String },

    /// A file's on-disk size disagrees with its checksum record.
    #[error("bad size of file {file} in data part {part}: expected {expected}, got {actual}")]
    BadSizeOfFile {
        file: String,
        part: String,
        expected: u64,
        actual: u64,
    },

    /// An on-disk metadata file uses a format version this build refuses.
    #[error("format version {found} of {what} is too old, minimum supported: {min_supported}")]
    FormatVersionTooOld {
        what: &'static str,
        found: u32,
        min_supported: u32,
    },

    /// Stored and recomputed hashes disagree.
    #[error("checksum mismatch for {file} in data part {part}")]
    ChecksumMismatch { file: String, part: String },

    /// A structure failed validation beyond repair.
    #[error("corrupted data: {detail}")]
    CorruptedData { detail: String },

    /// Fewer bytes than required were available.
    #[error("unexpected end of file: expected {expected} bytes, got {actual}")]
    UnexpectedEndOfFile { expected: usize, actual: usize },

    // === System I/O ===
    /// Untyped I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to read from a file.
    #[error("cannot read from file '{path}'")]
    CannotRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write to a file.
    #[error("cannot write to file '{path}'")]
    CannotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to seek within a file.
    #[error("cannot seek in file '{path}' to offset {offset}")]
    CannotSeek {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// Failed to fsync a file or directory.
    #[error("cannot fsync '{path}'")]
    CannotFsync {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to rename a path.
    #[error("cannot rename '{from}' to '{to}'")]
    CannotRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === Coordination ===
    /// The coordination-service session expired mid-operation.
    ///
    /// Fatal for the current operation; the in-progress part is kept
    /// locally because the service may still have accepted it.
    #[error("coordination session expired")]
    SessionExpired,

    /// A coordination-service call timed out; outcome unknown.
    #[error("coordination operation timed out: {operation}")]
    OperationTimeout { operation: String },

    /// A node the caller intended to create already exists.
    #[error("unexpected node exists: {path}")]
    UnexpectedNodeExists { path: String },

    // === Logical ===
    /// An internal invariant was violated. Always a bug; never retried.
    #[error("logical error: {detail}")]
    Logical { detail: String },
}

impl StrataError {
    /// Shorthand for [`StrataError::Logical`].
    pub fn logical(detail: impl Into<String>) -> Self {
        Self::Logical {
            detail: detail.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation marker.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error came from a configured resource limit.
    ///
    /// Limit errors may be downgraded to a clean early end by the overflow
    /// mode at the check site; every other kind always propagates.
    #[must_use]
    pub const fn is_limit(&self) -> bool {
        matches!(
            self,
            Self::TooManyRows { .. }
                | Self::TooManyBytes { .. }
                | Self::TooManyGroups { .. }
                | Self::SetSizeLimitExceeded { .. }
                | Self::TimeoutExceeded { .. }
                | Self::TooSlow { .. }
                | Self::QuotaExceeded { .. }
        )
    }

    /// Whether this error indicates a damaged on-disk part.
    ///
    /// Used by the part loader to decide between "report broken and skip"
    /// and "fail the whole table open".
    #[must_use]
    pub const fn is_storage_format(&self) -> bool {
        matches!(
            self,
            Self::NoFileInDataPart { .. }
                | Self::BadSizeOfFile { .. }
                | Self::FormatVersionTooOld { .. }
                | Self::ChecksumMismatch { .. }
                | Self::CorruptedData { .. }
                | Self::UnexpectedEndOfFile { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_classification() {
        assert!(StrataError::TooManyRows { rows: 10, max: 5 }.is_limit());
        assert!(StrataError::Cancelled.is_cancelled());
        assert!(!StrataError::Cancelled.is_limit());
        assert!(!StrataError::logical("x").is_limit());
    }

    #[test]
    fn test_storage_format_classification() {
        let err = StrataError::ChecksumMismatch {
            file: "n.bin".into(),
            part: "201612_1_1_0".into(),
        };
        assert!(err.is_storage_format());
        assert!(!StrataError::SessionExpired.is_storage_format());
    }

    #[test]
    fn test_display_includes_context() {
        let err = StrataError::BadSizeOfFile {
            file: "s.bin".into(),
            part: "201611_2_2_0".into(),
            expected: 100,
            actual: 90,
        };
        let text = err.to_string();
        assert!(text.contains("s.bin"));
        assert!(text.contains("201611_2_2_0"));
    }
}
