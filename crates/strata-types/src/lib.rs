//! Core value, type and settings definitions for StrataDB.
//!
//! This crate is the leaf of the workspace: everything above it (columns,
//! streams, aggregation, storage) speaks in terms of [`Field`],
//! [`DataType`], [`Settings`] and the sort/progress vocabulary defined
//! here.

pub mod codec;
pub mod dates;
pub mod field;
pub mod settings;
pub mod sort;

pub use field::Field;
pub use settings::{Limits, LoadBalancing, OverflowMode, Settings, TotalsMode};
pub use sort::{SortColumnDescription, SortDescription, SortDirection};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use strata_error::{Result, StrataError};

/// Column names, in order.
pub type Names = Vec<String>;

/// A column name together with its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAndType {
    pub name: String,
    pub data_type: DataType,
}

impl NameAndType {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered table schema.
pub type NamesAndTypes = Vec<NameAndType>;

/// The logical type of a column.
///
/// Rendered to and parsed from the name-with-parameters syntax
/// (`FixedString(10)`, `Array(UInt32)`, `Tuple(UInt8, String)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Days since the Unix epoch, stored as `u16`.
    Date,
    /// Seconds since the Unix epoch, stored as `u32`.
    DateTime,
    String,
    FixedString(usize),
    Array(Box<DataType>),
    Tuple(Vec<DataType>),
    /// An opaque aggregate-function state column, produced by two-phase
    /// aggregation with `final = false`.
    AggregateFunction {
        function: String,
        argument_types: Vec<DataType>,
    },
}

impl DataType {
    /// Whether values of this type have a fixed binary width, and if so
    /// which. Variable-length types return `None`.
    #[must_use]
    pub fn fixed_value_size(&self) -> Option<usize> {
        match self {
            Self::UInt8 | Self::Int8 => Some(1),
            Self::UInt16 | Self::Int16 | Self::Date => Some(2),
            Self::UInt32 | Self::Int32 | Self::DateTime | Self::Float32 => Some(4),
            Self::UInt64 | Self::Int64 | Self::Float64 => Some(8),
            Self::FixedString(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether this is one of the integral or floating-point types
    /// (including Date and DateTime, which are stored as integers).
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
                | Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::Float32
                | Self::Float64
                | Self::Date
                | Self::DateTime
        )
    }

    /// The default value for this type: zero for numbers, the empty
    /// string, the empty array, a tuple of defaults.
    #[must_use]
    pub fn default_field(&self) -> Field {
        match self {
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 | Self::Date | Self::DateTime => {
                Field::UInt64(0)
            }
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => Field::Int64(0),
            Self::Float32 | Self::Float64 => Field::Float64(0.0),
            Self::String => Field::String(Vec::new()),
            Self::FixedString(n) => Field::String(vec![0; *n]),
            Self::Array(_) => Field::Array(Vec::new()),
            Self::Tuple(types) => Field::Tuple(types.iter().map(Self::default_field).collect()),
            Self::AggregateFunction { .. } => Field::String(Vec::new()),
        }
    }

    /// Parse a type from its textual name.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let (base, args) = match name.find('(') {
            None => (name, None),
            Some(open) => {
                let close = name.rfind(')').ok_or_else(|| StrataError::UnknownDataType {
                    name: name.to_string(),
                })?;
                (&name[..open], Some(&name[open + 1..close]))
            }
        };

        match (base, args) {
            ("UInt8", None) => Ok(Self::UInt8),
            ("UInt16", None) => Ok(Self::UInt16),
            ("UInt32", None) => Ok(Self::UInt32),
            ("UInt64", None) => Ok(Self::UInt64),
            ("Int8", None) => Ok(Self::Int8),
            ("Int16", None) => Ok(Self::Int16),
            ("Int32", None) => Ok(Self::Int32),
            ("Int64", None) => Ok(Self::Int64),
            ("Float32", None) => Ok(Self::Float32),
            ("Float64", None) => Ok(Self::Float64),
            ("Date", None) => Ok(Self::Date),
            ("DateTime", None) => Ok(Self::DateTime),
            ("String", None) => Ok(Self::String),
            ("FixedString", Some(n)) => {
                let n: usize = n.trim().parse().map_err(|_| StrataError::UnknownDataType {
                    name: name.to_string(),
                })?;
                Ok(Self::FixedString(n))
            }
            ("Array", Some(inner)) => Ok(Self::Array(Box::new(Self::parse(inner)?))),
            ("Tuple", Some(inner)) => {
                let mut elems = Vec::new();
                for part in split_top_level(inner) {
                    elems.push(Self::parse(part)?);
                }
                Ok(Self::Tuple(elems))
            }
            ("AggregateFunction", Some(inner)) => {
                let mut parts = split_top_level(inner);
                if parts.is_empty() {
                    return Err(StrataError::UnknownDataType {
                        name: name.to_string(),
                    });
                }
                let function = parts.remove(0).trim().to_string();
                let mut argument_types = Vec::new();
                for part in parts {
                    argument_types.push(Self::parse(part)?);
                }
                Ok(Self::AggregateFunction {
                    function,
                    argument_types,
                })
            }
            _ => Err(StrataError::UnknownDataType {
                name: name.to_string(),
            }),
        }
    }

    /// The textual name, inverse of [`DataType::parse`].
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::UInt8 => "UInt8".into(),
            Self::UInt16 => "UInt16".into(),
            Self::UInt32 => "UInt32".into(),
            Self::UInt64 => "UInt64".into(),
            Self::Int8 => "Int8".into(),
            Self::Int16 => "Int16".into(),
            Self::Int32 => "Int32".into(),
            Self::Int64 => "Int64".into(),
            Self::Float32 => "Float32".into(),
            Self::Float64 => "Float64".into(),
            Self::Date => "Date".into(),
            Self::DateTime => "DateTime".into(),
            Self::String => "String".into(),
            Self::FixedString(n) => format!("FixedString({n})"),
            Self::Array(inner) => format!("Array({})", inner.name()),
            Self::Tuple(elems) => {
                let inner: Vec<String> = elems.iter().map(Self::name).collect();
                format!("Tuple({})", inner.join(", "))
            }
            Self::AggregateFunction {
                function,
                argument_types,
            } => {
                let mut inner = vec![function.clone()];
                inner.extend(argument_types.iter().map(Self::name));
                format!("AggregateFunction({})", inner.join(", "))
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Split `a, Tuple(b, c), d` into top-level comma-separated pieces.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut start = 0_usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if !s[start..].trim().is_empty() {
        parts.push(&s[start..]);
    }
    parts
}

/// Read/insert progress of one query, accumulated across all its sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    /// Total rows the sources expect to produce, when knowable up front.
    pub total_rows: u64,
}

impl Progress {
    #[must_use]
    pub const fn new(rows: u64, bytes: u64) -> Self {
        Self {
            rows,
            bytes,
            total_rows: 0,
        }
    }
}

/// Callback invoked by every source with incremental [`Progress`] deltas.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// A persistent monotonic counter handing out part ids.
///
/// The in-memory face of the on-disk increment file; the storage layer
/// seeds it from disk on open and writes it back after each allocation.
#[derive(Debug, Default)]
pub struct Increment {
    value: AtomicU64,
}

impl Increment {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            value: AtomicU64::new(start),
        }
    }

    /// Allocate and return the next id (1-based on a fresh counter).
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Allocate a contiguous range of `n` ids, returning the first.
    pub fn next_range(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::SeqCst) + 1
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_name_roundtrip() {
        let cases = [
            "UInt8",
            "Int64",
            "Float64",
            "Date",
            "String",
            "FixedString(10)",
            "Array(UInt32)",
            "Array(Array(String))",
            "Tuple(UInt8, String)",
            "AggregateFunction(sum, UInt64)",
        ];
        for case in cases {
            let parsed = DataType::parse(case).expect("type should parse");
            assert_eq!(parsed.name(), case);
        }
    }

    #[test]
    fn test_data_type_parse_rejects_garbage() {
        assert!(DataType::parse("VarChar").is_err());
        assert!(DataType::parse("FixedString(ten)").is_err());
        assert!(DataType::parse("Array(UInt32").is_err());
    }

    #[test]
    fn test_fixed_value_sizes() {
        assert_eq!(DataType::UInt8.fixed_value_size(), Some(1));
        assert_eq!(DataType::Date.fixed_value_size(), Some(2));
        assert_eq!(DataType::DateTime.fixed_value_size(), Some(4));
        assert_eq!(DataType::FixedString(17).fixed_value_size(), Some(17));
        assert_eq!(DataType::String.fixed_value_size(), None);
        assert_eq!(DataType::Array(Box::new(DataType::UInt8)).fixed_value_size(), None);
    }

    #[test]
    fn test_increment_is_monotonic() {
        let inc = Increment::new(41);
        assert_eq!(inc.next(), 42);
        assert_eq!(inc.next_range(3), 43);
        assert_eq!(inc.current(), 45);
        assert_eq!(inc.next(), 46);
    }
}
