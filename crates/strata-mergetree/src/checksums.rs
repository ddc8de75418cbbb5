//! The `checksums.txt` format.
//!
//! Text layout, version-prefixed:
//!
//! ```text
//! checksums format version: 2
//! 5 files:
//! d.bin
//!     size: 123
//!     hash: 0123…cdef
//!     uncompressed size: 456
//! primary.idx
//!     size: 64
//!     hash: 89ab…0123
//! summary: fedc…3210
//! ```
//!
//! Record order on disk is irrelevant; the summary hash folds the
//! records in file-name-sorted order, so two equal checksum sets always
//! produce the same summary.

use std::collections::BTreeMap;
use std::path::Path;

use strata_error::{Result, StrataError};
use strata_io::{file_hash, hex_u128, parse_hex_u128};
use xxhash_rust::xxh3::Xxh3;

pub const CHECKSUMS_FORMAT_VERSION: u32 = 2;
pub const MIN_SUPPORTED_VERSION: u32 = 2;

/// Checksum record for one file inside a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksum {
    pub size: u64,
    pub hash: u128,
    /// Total uncompressed payload bytes, for compressed files.
    pub uncompressed_size: Option<u64>,
}

/// All file checksums of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksums {
    files: BTreeMap<String, FileChecksum>,
}

impl Checksums {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn files(&self) -> &BTreeMap<String, FileChecksum> {
        &self.files
    }

    pub fn insert(&mut self, file: impl Into<String>, checksum: FileChecksum) {
        self.files.insert(file.into(), checksum);
    }

    pub fn remove(&mut self, file: &str) -> Option<FileChecksum> {
        self.files.remove(file)
    }

    /// Hash of all records, folded in file-name-sorted order.
    #[must_use]
    pub fn summary(&self) -> u128 {
        let mut hasher = Xxh3::new();
        // BTreeMap iterates name-sorted.
        for (name, sum) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update(&sum.size.to_le_bytes());
            hasher.update(&sum.hash.to_le_bytes());
            if let Some(uncompressed) = sum.uncompressed_size {
                hasher.update(&uncompressed.to_le_bytes());
            }
        }
        hasher.digest128()
    }

    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = format!("checksums format version: {CHECKSUMS_FORMAT_VERSION}\n");
        out.push_str(&format!("{} files:\n", self.files.len()));
        for (name, sum) in &self.files {
            out.push_str(name);
            out.push('\n');
            out.push_str(&format!("\tsize: {}\n", sum.size));
            out.push_str(&format!("\thash: {}\n", hex_u128(sum.hash)));
            if let Some(uncompressed) = sum.uncompressed_size {
                out.push_str(&format!("\tuncompressed size: {uncompressed}\n"));
            }
        }
        out.push_str(&format!("summary: {}\n", hex_u128(self.summary())));
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header = lines.next().ok_or_else(|| StrataError::CorruptedData {
            detail: "empty checksums file".into(),
        })?;
        let version: u32 = header
            .strip_prefix("checksums format version: ")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| StrataError::CorruptedData {
                detail: format!("bad checksums header: '{header}'"),
            })?;
        if version < MIN_SUPPORTED_VERSION {
            return Err(StrataError::FormatVersionTooOld {
                what: "checksums.txt",
                found: version,
                min_supported: MIN_SUPPORTED_VERSION,
            });
        }

        let count_line = lines.next().ok_or_else(|| StrataError::CorruptedData {
            detail: "checksums file ends after header".into(),
        })?;
        let count: usize = count_line
            .strip_suffix(" files:")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| StrataError::CorruptedData {
                detail: format!("bad checksums count line: '{count_line}'"),
            })?;

        let mut checksums = Self::new();
        let mut current: Option<(String, FileChecksum)> = None;
        let mut declared_summary: Option<u128> = None;

        for line in lines {
            if let Some(rest) = line.strip_prefix('\t') {
                let (_, sum) = current.as_mut().ok_or_else(|| StrataError::CorruptedData {
                    detail: "checksum attribute before any file name".into(),
                })?;
                if let Some(v) = rest.strip_prefix("size: ") {
                    sum.size = v.trim().parse().map_err(|_| StrataError::CorruptedData {
                        detail: format!("bad size line: '{line}'"),
                    })?;
                } else if let Some(v) = rest.strip_prefix("hash: ") {
                    sum.hash = parse_hex_u128(v)?;
                } else if let Some(v) = rest.strip_prefix("uncompressed size: ") {
                    sum.uncompressed_size =
                        Some(v.trim().parse().map_err(|_| StrataError::CorruptedData {
                            detail: format!("bad uncompressed size line: '{line}'"),
                        })?);
                } else {
                    return Err(StrataError::CorruptedData {
                        detail: format!("unknown checksum attribute: '{line}'"),
                    });
                }
            } else if let Some(rest) = line.strip_prefix("summary: ") {
                declared_summary = Some(parse_hex_u128(rest)?);
            } else if !line.trim().is_empty() {
                if let Some((name, sum)) = current.take() {
                    checksums.files.insert(name, sum);
                }
                current = Some((
                    line.to_string(),
                    FileChecksum {
                        size: 0,
                        hash: 0,
                        uncompressed_size: None,
                    },
                ));
            }
        }
        if let Some((name, sum)) = current.take() {
            checksums.files.insert(name, sum);
        }

        if checksums.files.len() != count {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "checksums file declares {count} files, holds {}",
                    checksums.files.len()
                ),
            });
        }
        if let Some(declared) = declared_summary {
            if declared != checksums.summary() {
                return Err(StrataError::CorruptedData {
                    detail: "checksums summary mismatch".into(),
                });
            }
        }
        Ok(checksums)
    }

    /// Verify every recorded file against the directory: existence,
    /// size, and content hash.
    pub fn check_files(&self, dir: &Path, part_name: &str) -> Result<()> {
        for (file, sum) in &self.files {
            let path = dir.join(file);
            let metadata = std::fs::metadata(&path).map_err(|_| StrataError::NoFileInDataPart {
                file: file.clone(),
                part: part_name.to_string(),
            })?;
            if metadata.len() != sum.size {
                return Err(StrataError::BadSizeOfFile {
                    file: file.clone(),
                    part: part_name.to_string(),
                    expected: sum.size,
                    actual: metadata.len(),
                });
            }
            if file_hash(&path)? != sum.hash {
                return Err(StrataError::ChecksumMismatch {
                    file: file.clone(),
                    part: part_name.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checksums {
        let mut checksums = Checksums::new();
        checksums.insert(
            "n.bin",
            FileChecksum {
                size: 100,
                hash: 0xDEAD_BEEF,
                uncompressed_size: Some(400),
            },
        );
        checksums.insert(
            "primary.idx",
            FileChecksum {
                size: 16,
                hash: 0x1234,
                uncompressed_size: None,
            },
        );
        checksums
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let checksums = sample();
        let text = checksums.serialize();
        let parsed = Checksums::parse(&text).expect("parse");
        assert_eq!(parsed, checksums);
        assert_eq!(parsed.summary(), checksums.summary());
    }

    #[test]
    fn test_old_version_rejected_cleanly() {
        let text = "checksums format version: 1\n0 files:\n";
        let err = Checksums::parse(text).unwrap_err();
        assert!(matches!(err, StrataError::FormatVersionTooOld { found: 1, .. }));
    }

    #[test]
    fn test_summary_is_order_independent() {
        let a = sample().serialize();
        // Same records, reversed in the file.
        let mut reversed = Checksums::new();
        let sample = sample();
        for (name, sum) in sample.files().iter().rev() {
            reversed.insert(name.clone(), sum.clone());
        }
        assert_eq!(Checksums::parse(&a).expect("parse").summary(), reversed.summary());
    }

    #[test]
    fn test_tampered_summary_detected() {
        let text = sample().serialize();
        let tampered = text.replace("size: 100", "size: 101");
        assert!(Checksums::parse(&tampered).is_err());
    }

    #[test]
    fn test_check_files_against_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("n.bin"), b"hello").expect("write");

        let mut checksums = Checksums::new();
        checksums.insert(
            "n.bin",
            FileChecksum {
                size: 5,
                hash: file_hash(&dir.path().join("n.bin")).expect("hash"),
                uncompressed_size: None,
            },
        );
        checksums
            .check_files(dir.path(), "201612_1_1_0")
            .expect("files should verify");

        std::fs::write(dir.path().join("n.bin"), b"hellO").expect("write");
        assert!(checksums.check_files(dir.path(), "201612_1_1_0").is_err());
    }
}
