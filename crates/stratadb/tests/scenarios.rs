//! End-to-end scenarios across the whole engine.

use std::sync::Arc;

use stratadb::dates::days_from_civil;
use stratadb::{
    create_aggregate_function, read_all, AggregateDescription, AggregatedData,
    AggregatingBlockInputStream, AggregationMethod, Aggregator, AlterCommand, Block,
    BlockInputStream, BlocksListInputStream, Column, ColumnWithTypeAndName, ConcatBlockInputStream,
    DataType, DistinctBlockInputStream, ExecControl, Field, LimitBlockInputStream, MergeMode,
    MergeSortingBlockInputStream, MergeTreeSettings, MergingAggregatedBlockInputStream,
    NameAndType, Names, OverflowMode, SetLimits, SortColumnDescription, Storage, StorageMergeTree,
    StringColumn,
};

fn open_table(dir: &std::path::Path) -> Arc<StorageMergeTree> {
    StorageMergeTree::open(
        "t",
        dir.join("t"),
        vec![
            NameAndType::new("d", DataType::Date),
            NameAndType::new("n", DataType::Int64),
            NameAndType::new("s", DataType::String),
        ],
        "d",
        vec!["d".to_string()],
        MergeMode::Ordinary,
        MergeTreeSettings {
            index_granularity: 8,
            ..MergeTreeSettings::default()
        },
        0,
    )
    .expect("open")
}

fn insert(storage: &StorageMergeTree, rows: &[(u16, i64, &str)]) {
    let mut s = StringColumn::new();
    for (_, _, text) in rows {
        s.push(text.as_bytes());
    }
    let block = Block::from_columns(vec![
        ColumnWithTypeAndName::new(
            "d",
            DataType::Date,
            Column::Date(rows.iter().map(|r| r.0).collect()),
        ),
        ColumnWithTypeAndName::new(
            "n",
            DataType::Int64,
            Column::Int64(rows.iter().map(|r| r.1).collect()),
        ),
        ColumnWithTypeAndName::new("s", DataType::String, Column::String(s)),
    ])
    .expect("block");
    storage.write(&block).expect("write");
}

/// `SELECT n, s FROM t ORDER BY n` as a pipeline.
fn select_ordered(storage: &StorageMergeTree, columns: &[&str], order_by: &str) -> Block {
    let control = ExecControl::unlimited();
    let names: Names = columns.iter().map(|c| (*c).to_string()).collect();
    let streams = storage.read(&names, 1024, 2, &control).expect("read");
    let concat = ConcatBlockInputStream::new(streams, Arc::clone(&control));
    let mut sorted = MergeSortingBlockInputStream::new(
        Box::new(concat),
        vec![SortColumnDescription::ascending(order_by)],
        0,
        Arc::clone(&control),
    );
    read_all(&mut sorted).expect("read_all")
}

#[test]
fn test_insert_select_and_partition_scoped_drop_column() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = open_table(dir.path());

    insert(
        &storage,
        &[
            (days_from_civil(2016, 12, 12), 1, "a"),
            (days_from_civil(2016, 11, 12), 2, "b"),
        ],
    );
    assert_eq!(storage.data().active_parts().len(), 2);

    let result = select_ordered(&storage, &["n", "s"], "n");
    assert_eq!(result.rows(), 2);
    assert_eq!(result.by_name("n").expect("n").column.field_at(0), Field::Int64(1));
    assert_eq!(result.by_name("s").expect("s").column.field_at(0), Field::from("a"));
    assert_eq!(result.by_name("n").expect("n").column.field_at(1), Field::Int64(2));

    // Drop `n` only in the December partition; its rows read back as
    // the type default.
    storage
        .alter(
            &[AlterCommand::DropColumn { name: "n".into() }],
            Some(201_612),
        )
        .expect("alter");

    let result = select_ordered(&storage, &["n", "s"], "n");
    assert_eq!(result.rows(), 2);
    assert_eq!(result.by_name("n").expect("n").column.field_at(0), Field::Int64(0));
    assert_eq!(result.by_name("s").expect("s").column.field_at(0), Field::from("a"));
    assert_eq!(result.by_name("n").expect("n").column.field_at(1), Field::Int64(2));
    assert_eq!(result.by_name("s").expect("s").column.field_at(1), Field::from("b"));
}

fn key_value_blocks(rows: usize, cardinality: u64, block_size: usize) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut row = 0_u64;
    while (row as usize) < rows {
        let take = block_size.min(rows - row as usize);
        let keys: Vec<u32> = (0..take).map(|i| ((row + i as u64) % cardinality) as u32).collect();
        let values: Vec<u64> = (0..take).map(|i| row + i as u64).collect();
        blocks.push(
            Block::from_columns(vec![
                ColumnWithTypeAndName::new("k", DataType::UInt32, Column::UInt32(keys)),
                ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
            ])
            .expect("block"),
        );
        row += take as u64;
    }
    blocks
}

fn sum_aggregator() -> Arc<Aggregator> {
    let sum = create_aggregate_function("sum", &[DataType::UInt64]).expect("sum");
    Arc::new(Aggregator::new(
        vec!["k".into()],
        vec![AggregateDescription {
            function: sum,
            arguments: vec!["v".into()],
            argument_types: vec![DataType::UInt64],
            column_name: "sum_v".into(),
        }],
        0,
        OverflowMode::Throw,
        false,
    ))
}

#[test]
fn test_group_by_selects_key64_and_sums_everything() {
    const ROWS: usize = 100_000;
    const CARDINALITY: u64 = 1_000;

    let control = ExecControl::unlimited();
    let aggregator = sum_aggregator();
    let mut source = BlocksListInputStream::new(
        key_value_blocks(ROWS, CARDINALITY, 8_192),
        Arc::clone(&control),
    );

    let mut data = AggregatedData::new();
    aggregator.execute(&mut source, &mut data).expect("aggregate");
    assert_eq!(data.method(), Some(AggregationMethod::Key64));
    assert_eq!(data.len(), CARDINALITY as usize);

    let result = aggregator.convert_to_block(data, true).expect("convert");
    assert_eq!(result.rows(), CARDINALITY as usize);

    let sum_col = &result.by_name("sum_v").expect("sum").column;
    let total: u64 = (0..result.rows())
        .map(|i| match sum_col.field_at(i) {
            Field::UInt64(v) => v,
            other => panic!("unexpected {other}"),
        })
        .sum();
    let expected: u64 = (0..ROWS as u64).sum();
    assert_eq!(total, expected);
}

#[test]
fn test_group_by_string_key_counts_distinct_keys() {
    let control = ExecControl::unlimited();
    let mut s = StringColumn::new();
    let mut values = Vec::new();
    for i in 0..10_000_u64 {
        s.push(format!("key-{}", i % 257).as_bytes());
        values.push(1_u64);
    }
    let block = Block::from_columns(vec![
        ColumnWithTypeAndName::new("k", DataType::String, Column::String(s)),
        ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
    ])
    .expect("block");

    let aggregator = sum_aggregator();
    let mut source = BlocksListInputStream::new(vec![block], Arc::clone(&control));
    let mut data = AggregatedData::new();
    aggregator.execute(&mut source, &mut data).expect("aggregate");

    assert_eq!(data.method(), Some(AggregationMethod::KeyString));
    assert_eq!(data.len(), 257);

    let result = aggregator.convert_to_block(data, true).expect("convert");
    assert_eq!(result.rows(), 257);
}

#[test]
fn test_distinct_with_limit_stops_early() {
    let control = ExecControl::unlimited();
    // 100 blocks of 1000 rows; distinct values repeat every 10 000.
    let blocks: Vec<Block> = (0..100_u64)
        .map(|b| {
            let values: Vec<u64> = (0..1_000).map(|i| (b * 1_000 + i) % 10_000).collect();
            Block::from_columns(vec![ColumnWithTypeAndName::new(
                "x",
                DataType::UInt64,
                Column::UInt64(values),
            )])
            .expect("block")
        })
        .collect();

    let source = Box::new(BlocksListInputStream::new(blocks, Arc::clone(&control)));
    let distinct = DistinctBlockInputStream::new(
        source,
        Names::new(),
        SetLimits::default(),
        100,
        Arc::clone(&control),
    );
    let mut limit =
        LimitBlockInputStream::new(Box::new(distinct), 100, 0, Arc::clone(&control));
    let result = read_all(&mut limit).expect("read_all");
    assert_eq!(result.rows(), 100);
}

#[test]
fn test_two_phase_aggregation_over_partitions() {
    let control = ExecControl::unlimited();
    let aggregator = sum_aggregator();

    // Phase one per partition, keeping states.
    let mut partials = Vec::new();
    for partition in key_value_blocks(20_000, 100, 4_096).chunks(2) {
        let source = Box::new(BlocksListInputStream::new(
            partition.to_vec(),
            Arc::clone(&control),
        ));
        let mut phase_one = AggregatingBlockInputStream::new(
            source,
            Arc::clone(&aggregator),
            false,
            Arc::clone(&control),
        );
        partials.push(read_all(&mut phase_one).expect("phase one"));
    }
    assert!(partials.len() > 1);

    // Phase two: merge the state streams with final = true.
    let source = Box::new(BlocksListInputStream::new(partials, Arc::clone(&control)));
    let mut phase_two = MergingAggregatedBlockInputStream::new(
        source,
        Arc::clone(&aggregator),
        true,
        Arc::clone(&control),
    );
    let merged = read_all(&mut phase_two).expect("phase two");
    assert_eq!(merged.rows(), 100);

    let sum_col = &merged.by_name("sum_v").expect("sum").column;
    let total: u64 = (0..merged.rows())
        .map(|i| match sum_col.field_at(i) {
            Field::UInt64(v) => v,
            other => panic!("unexpected {other}"),
        })
        .sum();
    assert_eq!(total, (0..20_000_u64).sum::<u64>());
}

#[test]
fn test_cancellation_reads_as_end_of_stream() {
    let control = ExecControl::unlimited();
    let blocks = key_value_blocks(10_000, 10, 100);
    let mut source = BlocksListInputStream::new(blocks, Arc::clone(&control));

    assert!(!source.read().expect("read").is_empty());
    control.cancel();
    assert!(source.read().expect("read").is_empty());
    assert!(source.read().expect("read").is_empty());
}

#[test]
fn test_merge_tree_summing_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = StorageMergeTree::open(
        "sums",
        dir.path().join("sums"),
        vec![
            NameAndType::new("d", DataType::Date),
            NameAndType::new("v", DataType::UInt64),
        ],
        "d",
        vec!["d".to_string()],
        MergeMode::Summing,
        MergeTreeSettings {
            index_granularity: 4,
            ..MergeTreeSettings::default()
        },
        0,
    )
    .expect("open");

    let day = days_from_civil(2016, 12, 1);
    for v in [10_u64, 20, 12] {
        let block = Block::from_columns(vec![
            ColumnWithTypeAndName::new("d", DataType::Date, Column::Date(vec![day])),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(vec![v])),
        ])
        .expect("block");
        storage.write(&block).expect("write");
    }

    while storage.optimize().expect("optimize") {}
    assert_eq!(storage.data().active_parts().len(), 1);

    let control = ExecControl::unlimited();
    let mut streams = storage
        .read(&vec!["d".to_string(), "v".to_string()], 1024, 1, &control)
        .expect("read");
    let result = read_all(streams[0].as_mut()).expect("read_all");
    assert_eq!(result.rows(), 1);
    assert_eq!(
        result.by_name("v").expect("v").column.field_at(0),
        Field::UInt64(42)
    );
}
