//! StrataDB: a columnar merge-tree analytical engine.
//!
//! This facade re-exports the public surface of the workspace crates:
//! the column containers and blocks, the stream protocol, the
//! aggregation engine, the table engines, and the error type they all
//! share.

pub use strata_error::{Result, StrataError};

pub use strata_types::{
    codec, dates, DataType, Field, Increment, Limits, NameAndType, Names, NamesAndTypes,
    OverflowMode, Progress, ProgressCallback, Settings, SortColumnDescription, SortDescription,
    SortDirection,
};

pub use strata_column::{
    sort_block, sort_permutation_for_block, ArrayColumn, Block, Column, ColumnWithTypeAndName,
    ConstColumn, Filter, FixedStringColumn, Permutation, StatesColumn, StringColumn,
};

pub use strata_functions::{
    Expression, ExpressionAction, Function, FunctionRegistry, InSet, Set, SetLimits,
};

pub use strata_stream::{
    read_all, BlockInputStream, BlockOutputStream, BlocksListInputStream, BlocksListOutputStream,
    CollapsingSortedInputStream, ConcatBlockInputStream, DistinctBlockInputStream, ExecControl,
    ExpressionBlockInputStream, FilterBlockInputStream, LimitBlockInputStream,
    MergeSortingBlockInputStream, MergingSortedInputStream, NativeBlockInputStream,
    NativeBlockOutputStream, OneBlockInputStream, PartialSortingBlockInputStream, ProfileInfo,
    Quota, SummingSortedInputStream,
};

pub use strata_agg::{
    create_aggregate_function, AggregateDescription, AggregateFunction, AggregatedData,
    AggregatingBlockInputStream, AggregatingSortedInputStream, AggregationMethod, Aggregator,
    Arena, MergingAggregatedBlockInputStream,
};

pub use strata_storage::{LogStorage, MemoryStorage, Storage, StorageBlockOutputStream};

pub use strata_mergetree::{
    AlterCommand, KeyCondition, KeyRange, MergeMode, MergeTreeSettings, PrewhereInfo,
    StorageMergeTree,
};
