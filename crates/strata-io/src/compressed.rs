//! The compressed frame format used by every `.bin` column file.
//!
//! Frame layout:
//!
//! ```text
//! Offset  Size  Description
//!   0      16   XXH3-128 of bytes 16 .. 25 + payload (little-endian)
//!  16       1   Method byte (0x82 = LZ4 block)
//!  17       4   Compressed size: 9 header bytes + payload, LE
//!  21       4   Uncompressed size, LE
//!  25       n   LZ4-compressed payload
//! ```
//!
//! The writer flushes a frame at every granule boundary, so mark files
//! can point straight at frame starts. The reader verifies the checksum
//! of every frame before decompressing.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};
use xxhash_rust::xxh3::Xxh3;

/// Bytes before the payload in every frame.
pub const COMPRESSED_FRAME_HEADER_SIZE: usize = 25;

const METHOD_LZ4: u8 = 0x82;
/// Refuse absurd frame sizes before allocating.
const MAX_FRAME_SIZE: u32 = 1 << 30;

fn frame_checksum(header_tail: &[u8], payload: &[u8]) -> u128 {
    let mut hasher = Xxh3::new();
    hasher.update(header_tail);
    hasher.update(payload);
    hasher.digest128()
}

/// Buffers uncompressed bytes and emits one compressed frame per flush.
pub struct CompressedWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    /// Force a frame once the buffer reaches this size.
    max_block_size: usize,
    compressed_offset: u64,
    uncompressed_total: u64,
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(inner: W, max_block_size: usize) -> Self {
        Self::new_at_offset(inner, max_block_size, 0)
    }

    /// Writer appending to a stream that already holds `offset` bytes,
    /// so marks keep pointing at absolute frame positions.
    pub fn new_at_offset(inner: W, max_block_size: usize, offset: u64) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(max_block_size.min(1 << 20)),
            max_block_size,
            compressed_offset: offset,
            uncompressed_total: 0,
        }
    }

    /// Total payload bytes accepted so far.
    #[must_use]
    pub const fn uncompressed_total(&self) -> u64 {
        self.uncompressed_total
    }

    /// Byte offset in the compressed stream where the next frame starts.
    /// Only meaningful at frame boundaries (after [`Self::flush_frame`]).
    #[must_use]
    pub const fn compressed_offset(&self) -> u64 {
        self.compressed_offset
    }

    /// Bytes buffered but not yet framed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.uncompressed_total += data.len() as u64;
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.max_block_size {
            self.flush_frame()?;
        }
        Ok(())
    }

    /// Compress and emit everything buffered. No-op on an empty buffer.
    pub fn flush_frame(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let to_compress = if self.buffer.len() > self.max_block_size {
            &self.buffer[..self.max_block_size]
        } else {
            &self.buffer[..]
        };
        let payload = lz4_flex::block::compress(to_compress);

        let compressed_size = 9 + payload.len() as u32;
        let uncompressed_size = to_compress.len() as u32;
        let mut header_tail = [0_u8; 9];
        header_tail[0] = METHOD_LZ4;
        header_tail[1..5].copy_from_slice(&compressed_size.to_le_bytes());
        header_tail[5..9].copy_from_slice(&uncompressed_size.to_le_bytes());
        let checksum = frame_checksum(&header_tail, &payload);

        self.inner.write_all(&checksum.to_le_bytes())?;
        self.inner.write_all(&header_tail)?;
        self.inner.write_all(&payload)?;
        self.compressed_offset += (16 + 9 + payload.len()) as u64;

        let consumed = to_compress.len();
        self.buffer.drain(..consumed);
        Ok(())
    }

    /// Flush all remaining data and hand the inner writer back.
    pub fn finish(mut self) -> Result<W> {
        while !self.buffer.is_empty() {
            self.flush_frame()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

// Columnar serializers write through the standard trait; everything
// lands in the frame buffer, frames are cut explicitly or by size.
impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        CompressedWriter::write(self, data).map_err(std::io::Error::other)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Streaming reader over a sequence of compressed frames.
pub struct CompressedReader<R: Read> {
    inner: R,
    path: PathBuf,
    buffer: Vec<u8>,
    pos: usize,
}

impl<R: Read> CompressedReader<R> {
    pub fn new(inner: R, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Load the next frame into the buffer. `Ok(false)` on clean end.
    fn refill(&mut self) -> Result<bool> {
        let mut checksum_bytes = [0_u8; 16];
        match read_or_eof(&mut self.inner, &mut checksum_bytes)? {
            ReadOutcome::Eof => return Ok(false),
            ReadOutcome::Full => {}
            ReadOutcome::Partial(got) => {
                return Err(StrataError::UnexpectedEndOfFile {
                    expected: 16,
                    actual: got,
                });
            }
        }
        let mut header_tail = [0_u8; 9];
        self.inner
            .read_exact(&mut header_tail)
            .map_err(|source| StrataError::CannotRead {
                path: self.path.clone(),
                source,
            })?;
        if header_tail[0] != METHOD_LZ4 {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "unknown compression method {:#04x} in '{}'",
                    header_tail[0],
                    self.path.display()
                ),
            });
        }
        let compressed_size = u32::from_le_bytes([
            header_tail[1],
            header_tail[2],
            header_tail[3],
            header_tail[4],
        ]);
        let uncompressed_size = u32::from_le_bytes([
            header_tail[5],
            header_tail[6],
            header_tail[7],
            header_tail[8],
        ]);
        if compressed_size < 9 || compressed_size > MAX_FRAME_SIZE || uncompressed_size > MAX_FRAME_SIZE
        {
            return Err(StrataError::CorruptedData {
                detail: format!(
                    "implausible frame sizes ({compressed_size}, {uncompressed_size}) in '{}'",
                    self.path.display()
                ),
            });
        }

        let payload_len = (compressed_size - 9) as usize;
        let mut payload = vec![0_u8; payload_len];
        self.inner
            .read_exact(&mut payload)
            .map_err(|source| StrataError::CannotRead {
                path: self.path.clone(),
                source,
            })?;

        let expected = u128::from_le_bytes(checksum_bytes);
        let actual = frame_checksum(&header_tail, &payload);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch {
                file: self.path.display().to_string(),
                part: String::new(),
            });
        }

        self.buffer = lz4_flex::block::decompress(&payload, uncompressed_size as usize)
            .map_err(|e| StrataError::CorruptedData {
                detail: format!("LZ4 decompression failed in '{}': {e}", self.path.display()),
            })?;
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Position the reader at a frame boundary in the compressed stream.
    pub fn seek_to_frame(&mut self, compressed_offset: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(compressed_offset))
            .map_err(|source| StrataError::CannotSeek {
                path: self.path.clone(),
                offset: compressed_offset,
                source,
            })?;
        self.buffer.clear();
        self.pos = 0;
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Partial(usize),
    Eof,
}

/// Fill `buf`, distinguishing a clean EOF before the first byte from a
/// truncated read.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0_usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial(filled)
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.buffer.len() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(std::io::Error::other(e.to_string())),
            }
        }
        let n = out.len().min(self.buffer.len() - self.pos);
        out[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(data: &[u8], block_size: usize) -> Vec<u8> {
        let mut writer = CompressedWriter::new(Vec::new(), block_size);
        writer.write(data).expect("write");
        let compressed = writer.finish().expect("finish");

        let mut reader = CompressedReader::new(Cursor::new(compressed), Path::new("test.bin"));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        out
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        assert_eq!(roundtrip(&data, 1 << 16), data);
    }

    #[test]
    fn test_roundtrip_many_frames() {
        let data: Vec<u8> = (0..100_000_u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data, 1024), data);
    }

    #[test]
    fn test_corruption_detected() {
        let mut writer = CompressedWriter::new(Vec::new(), 1 << 16);
        writer.write(b"payload payload payload").expect("write");
        let mut compressed = writer.finish().expect("finish");
        let last = compressed.len() - 1;
        compressed[last] ^= 0xFF;

        let mut reader = CompressedReader::new(Cursor::new(compressed), Path::new("test.bin"));
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_seek_to_second_frame() {
        let mut writer = CompressedWriter::new(Vec::new(), 1 << 16);
        writer.write(b"first frame").expect("write");
        writer.flush_frame().expect("flush");
        let second_frame_offset = writer.compressed_offset();
        writer.write(b"second frame").expect("write");
        let compressed = writer.finish().expect("finish");

        let mut reader = CompressedReader::new(Cursor::new(compressed), Path::new("test.bin"));
        reader.seek_to_frame(second_frame_offset).expect("seek");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"second frame");
    }

    #[test]
    fn test_empty_stream_is_clean_eof() {
        let mut reader =
            CompressedReader::new(Cursor::new(Vec::<u8>::new()), Path::new("empty.bin"));
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).expect("read"), 0);
    }
}
