//! Interruption-safe file primitives with path context on every error.
//!
//! `std` already retries `EINTR` inside `read_exact`/`write_all`; the
//! wrappers here pin that discipline down, attach the path to the error
//! and keep fsync explicit, since the part lifecycle depends on the
//! write → fsync → rename ordering.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use strata_error::{Result, StrataError};
use xxhash_rust::xxh3::Xxh3;

pub fn open_for_read(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| StrataError::CannotRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn create_for_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| StrataError::CannotWrite {
            path: path.to_path_buf(),
            source,
        })
}

/// Read exactly `buf.len()` bytes, retrying on interruption.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|source| StrataError::CannotRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn fsync_file(file: &File, path: &Path) -> Result<()> {
    file.sync_all().map_err(|source| StrataError::CannotFsync {
        path: path.to_path_buf(),
        source,
    })
}

/// Fsync a directory so a just-renamed entry survives a crash.
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).map_err(|source| StrataError::CannotFsync {
        path: path.to_path_buf(),
        source,
    })?;
    dir.sync_all().map_err(|source| StrataError::CannotFsync {
        path: path.to_path_buf(),
        source,
    })
}

/// Rename, assuming same-filesystem atomicity.
pub fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|source| StrataError::CannotRename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// XXH3-128 content hash of a whole file, streamed.
pub fn file_hash(path: &Path) -> Result<u128> {
    let mut file = open_for_read(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(StrataError::CannotRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest128())
}

/// Escape a column name for use as a file name: alphanumerics, `_`,
/// `-` and `.` pass through, everything else becomes `%XX`.
#[must_use]
pub fn escape_for_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' || byte == b'.' {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

/// Lower-case, zero-padded 32-digit hex of a 128-bit hash.
#[must_use]
pub fn hex_u128(value: u128) -> String {
    format!("{value:032x}")
}

pub fn parse_hex_u128(text: &str) -> Result<u128> {
    u128::from_str_radix(text.trim(), 16).map_err(|_| StrataError::CorruptedData {
        detail: format!("bad 128-bit hex value: '{text}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_and_hex_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        let mut file = create_for_write(&path).expect("create");
        file.write_all(b"stratadb").expect("write");
        drop(file);

        let h1 = file_hash(&path).expect("hash");
        let h2 = file_hash(&path).expect("hash");
        assert_eq!(h1, h2);
        assert_eq!(parse_hex_u128(&hex_u128(h1)).expect("parse"), h1);
    }

    #[test]
    fn test_atomic_rename_moves_content(){
        let dir = tempfile::tempdir().expect("tempdir");
        let from = dir.path().join("tmp_x");
        let to = dir.path().join("x");
        std::fs::write(&from, b"abc").expect("write");
        atomic_rename(&from, &to).expect("rename");
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).expect("read"), b"abc");
    }

    #[test]
    fn test_open_missing_has_path_context() {
        let err = open_for_read(Path::new("/nonexistent/stratadb-test")).unwrap_err();
        assert!(err.to_string().contains("stratadb-test"));
    }
}
