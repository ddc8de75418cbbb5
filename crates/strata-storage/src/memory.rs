//! In-memory blocks table for small reference data.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_column::{Block, ColumnWithTypeAndName};
use strata_error::Result;
use strata_stream::{BlockInputStream, BlocksListInputStream, ExecControl};
use strata_types::{NamesAndTypes, Names};

use crate::storage::Storage;

pub struct MemoryStorage {
    name: String,
    columns: NamesAndTypes,
    data: Mutex<Vec<Block>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: NamesAndTypes) -> Self {
        Self {
            name: name.into(),
            columns,
            data: Mutex::new(Vec::new()),
        }
    }

    fn project(block: &Block, column_names: &Names) -> Result<Block> {
        if column_names.is_empty() {
            return Ok(block.clone());
        }
        let mut out = Block::new();
        for name in column_names {
            out.insert(block.by_name(name)?.clone())?;
        }
        Ok(out)
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> &'static str {
        "Memory"
    }

    fn columns(&self) -> NamesAndTypes {
        self.columns.clone()
    }

    fn read(
        &self,
        column_names: &Names,
        _max_block_size: usize,
        threads: usize,
        control: &Arc<ExecControl>,
    ) -> Result<Vec<Box<dyn BlockInputStream>>> {
        let data = self.data.lock();
        let blocks: Result<Vec<Block>> = data
            .iter()
            .map(|b| Self::project(b, column_names))
            .collect();
        let blocks = blocks?;
        drop(data);

        // Split the block list evenly across the requested threads.
        let threads = threads.clamp(1, blocks.len().max(1));
        let mut streams: Vec<Box<dyn BlockInputStream>> = Vec::with_capacity(threads);
        let per_thread = blocks.len().div_ceil(threads);
        let mut iter = blocks.into_iter().peekable();
        for _ in 0..threads {
            let chunk: Vec<Block> = iter.by_ref().take(per_thread).collect();
            streams.push(Box::new(BlocksListInputStream::leaf(
                chunk,
                Arc::clone(control),
            )));
            if iter.peek().is_none() {
                break;
            }
        }
        Ok(streams)
    }

    fn write(&self, block: &Block) -> Result<()> {
        self.check_block(block)?;
        // Keep stored blocks positionally aligned with the schema.
        let mut ordered = Block::new();
        for col in &self.columns {
            match block.by_name(&col.name) {
                Ok(found) => ordered.insert(found.clone())?,
                Err(_) => {
                    let mut filler = strata_column::Column::empty_of(&col.data_type)?;
                    for _ in 0..block.rows() {
                        filler.insert_default();
                    }
                    ordered.insert(ColumnWithTypeAndName::new(
                        col.name.clone(),
                        col.data_type.clone(),
                        filler,
                    ))?;
                }
            }
        }
        self.data.lock().push(ordered);
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_column::Column;
    use strata_stream::read_all;
    use strata_types::{DataType, Field, NameAndType};

    fn storage() -> MemoryStorage {
        MemoryStorage::new(
            "lookup",
            vec![
                NameAndType::new("id", DataType::UInt64),
                NameAndType::new("name", DataType::String),
            ],
        )
    }

    fn block(ids: Vec<u64>, names: Vec<&str>) -> Block {
        let mut s = strata_column::StringColumn::new();
        for n in &names {
            s.push(n.as_bytes());
        }
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("id", DataType::UInt64, Column::UInt64(ids)),
            ColumnWithTypeAndName::new("name", DataType::String, Column::String(s)),
        ])
        .expect("block")
    }

    #[test]
    fn test_write_then_read_projection() {
        let storage = storage();
        storage.write(&block(vec![1, 2], vec!["a", "b"])).expect("write");
        storage.write(&block(vec![3], vec!["c"])).expect("write");

        let control = ExecControl::unlimited();
        let mut streams = storage
            .read(&vec!["name".to_string()], 65_536, 1, &control)
            .expect("read");
        assert_eq!(streams.len(), 1);
        let all = read_all(streams[0].as_mut()).expect("read_all");
        assert_eq!(all.columns(), 1);
        assert_eq!(all.rows(), 3);
        assert_eq!(all.by_position(0).column.field_at(2), Field::from("c"));
    }

    #[test]
    fn test_read_splits_across_threads() {
        let storage = storage();
        for i in 0..4_u64 {
            storage.write(&block(vec![i], vec!["x"])).expect("write");
        }
        let control = ExecControl::unlimited();
        let streams = storage.read(&Names::new(), 65_536, 2, &control).expect("read");
        assert_eq!(streams.len(), 2);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let storage = storage();
        let wrong = Block::from_columns(vec![ColumnWithTypeAndName::new(
            "id",
            DataType::Int64,
            Column::Int64(vec![1]),
        )])
        .expect("block");
        assert!(storage.write(&wrong).is_err());
    }

    #[test]
    fn test_truncate() {
        let storage = storage();
        storage.write(&block(vec![1], vec!["a"])).expect("write");
        storage.truncate().expect("truncate");
        let control = ExecControl::unlimited();
        let mut streams = storage.read(&Names::new(), 65_536, 1, &control).expect("read");
        if let Some(stream) = streams.first_mut() {
            assert!(read_all(stream.as_mut()).expect("read_all").is_empty());
        }
    }
}
