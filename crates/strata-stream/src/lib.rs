//! The block stream protocol.
//!
//! Every operator is a block source ([`BlockInputStream`]) or a block
//! sink ([`BlockOutputStream`]). Sources implement `read_impl`; the
//! provided `read` wraps it with the profiling layer: counters, limit
//! and quota checks, progress propagation and cooperative cancellation.
//! The empty block is returned exactly once to signal end of stream and
//! every later `read` keeps returning it.

mod concat;
mod control;
mod distinct;
mod expression_stream;
mod filter;
mod limit;
mod merging_sorted;
mod native;
mod one_block;
mod profile;
mod quota;
mod sorting;
mod stream;
mod summing;

pub use concat::ConcatBlockInputStream;
pub use control::{ExecControl, Signal};
pub use distinct::DistinctBlockInputStream;
pub use expression_stream::ExpressionBlockInputStream;
pub use filter::FilterBlockInputStream;
pub use limit::LimitBlockInputStream;
pub use merging_sorted::{CollapsingSortedInputStream, MergingSortedInputStream};
pub use native::{NativeBlockInputStream, NativeBlockOutputStream};
pub use one_block::{BlocksListInputStream, OneBlockInputStream};
pub use profile::ProfileInfo;
pub use quota::Quota;
pub use sorting::{MergeSortingBlockInputStream, PartialSortingBlockInputStream};
pub use stream::{read_all, BlockInputStream, BlockOutputStream, BlocksListOutputStream};
pub use summing::SummingSortedInputStream;
