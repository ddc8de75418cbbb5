//! File I/O, compressed framing and columnar (de)serialization.
//!
//! Everything the storage layer touches on disk goes through this crate:
//! interruption-safe file wrappers, the LZ4 + XXH3 compressed frame
//! format, bulk column payload codecs, and the persistent increment
//! counter that hands out part ids.

mod column_io;
mod compressed;
mod fs;
mod increment;

pub use column_io::{
    deserialize_array_column, deserialize_column, read_u64_stream, serialize_array_column,
    serialize_column, write_u64_stream,
};
pub use compressed::{CompressedReader, CompressedWriter, COMPRESSED_FRAME_HEADER_SIZE};
pub use fs::{
    atomic_rename, create_for_write, escape_for_file_name, file_hash, fsync_dir, fsync_file,
    hex_u128, open_for_read, parse_hex_u128, read_full,
};
pub use increment::PersistentIncrement;
