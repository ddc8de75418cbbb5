//! The hash aggregation engine.
//!
//! Group-by state lives in an [`Arena`]; one contiguous byte blob per
//! group holds every aggregate function's state at a precomputed
//! offset. The hash layout is chosen from the key shape at the first
//! block ([`Aggregator`]); two-phase aggregation emits opaque state
//! columns that co-own the arena and are merged downstream.

mod aggregator;
mod arena;
mod function;
mod hash_table;
mod state_io;
mod streams;

pub use aggregator::{
    AggregateDescription, AggregatedData, AggregatedDataVariants, AggregationMethod, Aggregator,
};
pub use arena::Arena;
pub use function::{create_aggregate_function, AggregateFunction};
pub use hash_table::{ArenaStr, HashKey, HashTable, HashedCell, HashedEntry, PlainCell, SlotRef};
pub use state_io::{deserialize_states, serialize_states, OwnedStates};
pub use streams::{
    AggregatingBlockInputStream, AggregatingSortedInputStream, MergingAggregatedBlockInputStream,
};
