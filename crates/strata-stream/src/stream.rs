//! Source and sink traits.

use std::sync::Arc;
use std::time::Instant;

use strata_column::Block;
use strata_error::Result;
use strata_types::Progress;

use crate::control::{ExecControl, Signal};
use crate::profile::ProfileInfo;

/// A block source.
///
/// Implementors provide `read_impl` plus access to their profile state
/// and the query's [`ExecControl`]; the provided `read` layers on
/// end-of-stream latching, cancellation, counters, progress, limit and
/// quota checks. `read_impl` must re-check cancellation at its own
/// blocking points (I/O loops, polls) so a cancel lands within one poll
/// interval.
pub trait BlockInputStream: Send {
    /// Short stable name for logs and the process list.
    fn name(&self) -> &'static str;

    fn control(&self) -> &Arc<ExecControl>;

    fn profile(&self) -> &ProfileInfo;

    fn profile_mut(&mut self) -> &mut ProfileInfo;

    /// Produce the next block; the empty block signals end of stream.
    fn read_impl(&mut self) -> Result<Block>;

    /// Direct children, for the recursive prefix/suffix walks.
    fn children_mut(&mut self) -> Vec<&mut dyn BlockInputStream> {
        Vec::new()
    }

    /// Read one block through the profiling layer.
    ///
    /// Returns the empty block exactly once at end of stream and on
    /// every read after that; a cancelled query reads as ended rather
    /// than raising, so sibling streams unwind quietly.
    fn read(&mut self) -> Result<Block> {
        if self.profile().eof || self.control().is_cancelled() {
            return Ok(Block::new());
        }

        let started = Instant::now();
        let block = match self.read_impl() {
            Ok(block) => block,
            Err(e) => {
                // Set the shared flag before re-raising so siblings
                // running on other threads stop promptly.
                self.control().cancel();
                return Err(e);
            }
        };
        self.profile_mut().total_time += started.elapsed();

        if block.is_empty() {
            self.profile_mut().eof = true;
            return Ok(block);
        }

        self.profile_mut().account(&block);
        self.profile_mut().update_extremes(&block)?;

        if self.profile().reports_progress {
            let progress = Progress::new(block.rows() as u64, block.byte_size() as u64);
            match self.control().progress(&progress) {
                Ok(Signal::Continue) => {}
                Ok(Signal::Stop) => {
                    self.profile_mut().eof = true;
                    return Ok(Block::new());
                }
                Err(e) => {
                    self.control().cancel();
                    return Err(e);
                }
            }
        }

        Ok(block)
    }

    /// Pre-read hook, walked top-down through the children.
    fn read_prefix(&mut self) -> Result<()> {
        for child in self.children_mut() {
            child.read_prefix()?;
        }
        Ok(())
    }

    /// Finalization hook, invoked after end of stream.
    ///
    /// The default recurses into children; a parent that reads its
    /// children from worker threads overrides this to sequence teardown
    /// after the join.
    fn read_suffix(&mut self) -> Result<()> {
        for child in self.children_mut() {
            child.read_suffix()?;
        }
        Ok(())
    }

    /// Request cancellation of this stream's query. Idempotent and safe
    /// from any thread; every stream sharing the control observes it.
    fn cancel(&self) {
        self.control().cancel();
    }

    /// Aggregation-without-key side channel, when the stream carries one.
    fn totals(&mut self) -> Option<Block> {
        None
    }

    /// The 2-row min/max side channel, when enabled on this stream.
    fn extremes(&self) -> Option<Block> {
        self.profile().extremes().cloned()
    }
}

/// A block sink.
pub trait BlockOutputStream: Send {
    fn write(&mut self, block: &Block) -> Result<()>;

    fn write_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects written blocks in memory; test and glue sink.
#[derive(Default)]
pub struct BlocksListOutputStream {
    blocks: Vec<Block>,
}

impl BlocksListOutputStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}

impl BlockOutputStream for BlocksListOutputStream {
    fn write(&mut self, block: &Block) -> Result<()> {
        if !block.is_empty() {
            self.blocks.push(block.clone());
        }
        Ok(())
    }
}

/// Drain a stream into one block (test and small-result helper).
pub fn read_all(stream: &mut dyn BlockInputStream) -> Result<Block> {
    stream.read_prefix()?;
    let mut result = Block::new();
    loop {
        let block = stream.read()?;
        if block.is_empty() {
            break;
        }
        result.append(&block)?;
    }
    stream.read_suffix()?;
    Ok(result)
}
