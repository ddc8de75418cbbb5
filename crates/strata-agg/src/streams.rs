//! Aggregation as pipeline stages.

use std::sync::Arc;

use strata_column::{Block, StatePtr};
use strata_error::{Result, StrataError};
use strata_stream::{BlockInputStream, ExecControl, ProfileInfo};
use strata_types::{DataType, Field, SortDescription};

use crate::aggregator::{AggregatedData, Aggregator};
use crate::function::{create_aggregate_function, AggregateFunction};
use crate::state_io::OwnedStates;

/// Consumes its child entirely and emits the aggregated result as one
/// block. `final_ = false` emits state columns for a downstream merge.
pub struct AggregatingBlockInputStream {
    child: Box<dyn BlockInputStream>,
    aggregator: Arc<Aggregator>,
    final_: bool,
    executed: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl AggregatingBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        aggregator: Arc<Aggregator>,
        final_: bool,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            aggregator,
            final_,
            executed: false,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for AggregatingBlockInputStream {
    fn name(&self) -> &'static str {
        "Aggregating"
    }

    fn control(&self) -> &Arc<ExecControl> {
        &self.control
    }

    fn profile(&self) -> &ProfileInfo {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut ProfileInfo {
        &mut self.profile
    }

    fn children_mut(&mut self) -> Vec<&mut dyn BlockInputStream> {
        vec![self.child.as_mut()]
    }

    fn read_impl(&mut self) -> Result<Block> {
        if self.executed {
            return Ok(Block::new());
        }
        self.executed = true;
        let mut data = AggregatedData::new();
        self.aggregator.execute(self.child.as_mut(), &mut data)?;
        if data.is_empty() && !data.is_initialized() {
            return Ok(Block::new());
        }
        self.aggregator.convert_to_block(data, self.final_)
    }
}

/// Merges a stream of partially-aggregated blocks (the second phase of
/// distributed aggregation).
pub struct MergingAggregatedBlockInputStream {
    child: Box<dyn BlockInputStream>,
    aggregator: Arc<Aggregator>,
    final_: bool,
    executed: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

impl MergingAggregatedBlockInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        aggregator: Arc<Aggregator>,
        final_: bool,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            aggregator,
            final_,
            executed: false,
            control,
            profile: ProfileInfo::new(),
        }
    }
}

impl BlockInputStream for MergingAggregatedBlockInputStream {
    fn name(&self) -> &'static str {
        "MergingAggregated"
    }

    fn control(&self) -> &Arc<ExecControl> {
        &self.control
    }

    fn profile(&self) -> &ProfileInfo {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut ProfileInfo {
        &mut self.profile
    }

    fn children_mut(&mut self) -> Vec<&mut dyn BlockInputStream> {
        vec![self.child.as_mut()]
    }

    fn read_impl(&mut self) -> Result<Block> {
        if self.executed {
            return Ok(Block::new());
        }
        self.executed = true;
        let mut data = AggregatedData::new();
        self.aggregator.merge_stream(self.child.as_mut(), &mut data)?;
        if data.is_empty() && !data.is_initialized() {
            return Ok(Block::new());
        }
        self.aggregator.convert_to_block(data, self.final_)
    }
}


/// Aggregating merge: rows of an already-merged sorted stream that
/// share a key collapse into one row whose aggregate-state columns are
/// merged. Non-key, non-state columns keep the first row's value.
///
/// Output states live in this stream's own arenas, so the input blocks
/// (and their owners) can be dropped as soon as they are consumed.
pub struct AggregatingSortedInputStream {
    child: Box<dyn BlockInputStream>,
    description: SortDescription,
    max_block_size: usize,
    /// Per block column: the function and its state owner, for
    /// aggregate-state columns.
    plan: Option<Vec<Option<(Arc<dyn AggregateFunction>, Arc<OwnedStates>)>>>,
    template: Option<Block>,
    current_key: Option<Vec<Field>>,
    acc: Vec<AccCell>,
    pending: Option<Block>,
    done: bool,
    control: Arc<ExecControl>,
    profile: ProfileInfo,
}

enum AccCell {
    Value(Field),
    State(StatePtr),
}

impl AggregatingSortedInputStream {
    #[must_use]
    pub fn new(
        child: Box<dyn BlockInputStream>,
        description: SortDescription,
        max_block_size: usize,
        control: Arc<ExecControl>,
    ) -> Self {
        Self {
            child,
            description,
            max_block_size,
            plan: None,
            template: None,
            current_key: None,
            acc: Vec::new(),
            pending: None,
            done: false,
            control,
            profile: ProfileInfo::new(),
        }
    }

    fn resolve_plan(&mut self, block: &Block) -> Result<()> {
        let mut plan = Vec::with_capacity(block.columns());
        for col in block.iter() {
            match &col.data_type {
                DataType::AggregateFunction {
                    function,
                    argument_types,
                } => {
                    let function = create_aggregate_function(function, argument_types)?;
                    let owner = Arc::new(OwnedStates::new(Arc::clone(&function)));
                    plan.push(Some((function, owner)));
                }
                _ => plan.push(None),
            }
        }
        self.plan = Some(plan);
        self.template = Some(block.clone_empty()?);
        Ok(())
    }

    fn flush_group(&mut self) -> Result<()> {
        if self.current_key.is_none() {
            return Ok(());
        }
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| StrataError::logical("aggregating flush without template"))?;
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| StrataError::logical("aggregating flush without plan"))?;

        let mut row_block = template.clone_empty()?;
        for ((col, cell), entry) in row_block.iter_mut().zip(self.acc.drain(..)).zip(plan.iter())
        {
            match (cell, entry) {
                (AccCell::Value(field), None) => col.column.insert_field(&field)?,
                (AccCell::State(state), Some((_, owner))) => {
                    let states = col.column.as_states_mut().ok_or_else(|| {
                        StrataError::logical("plan/template disagree on state column")
                    })?;
                    states.push(state);
                    states.add_owner(Arc::clone(owner) as Arc<dyn std::any::Any + Send + Sync>);
                }
                _ => {
                    return Err(StrataError::logical(
                        "accumulator cell does not match column plan",
                    ));
                }
            }
        }
        match &mut self.pending {
            None => self.pending = Some(row_block),
            Some(pending) => pending.append(&row_block)?,
        }
        self.current_key = None;
        Ok(())
    }

    fn key_of(&self, block: &Block, row: usize) -> Result<Vec<Field>> {
        let mut key = Vec::with_capacity(self.description.len());
        for desc in &self.description {
            key.push(block.by_name(&desc.name)?.column.field_at(row));
        }
        Ok(key)
    }

    fn take_pending(&mut self) -> Block {
        self.pending.take().unwrap_or_default()
    }
}

impl BlockInputStream for AggregatingSortedInputStream {
    fn name(&self) -> &'static str {
        "AggregatingSorted"
    }

    fn control(&self) -> &Arc<ExecControl> {
        &self.control
    }

    fn profile(&self) -> &ProfileInfo {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut ProfileInfo {
        &mut self.profile
    }

    fn children_mut(&mut self) -> Vec<&mut dyn BlockInputStream> {
        vec![self.child.as_mut()]
    }

    fn read_impl(&mut self) -> Result<Block> {
        loop {
            if self.done {
                return Ok(self.take_pending());
            }
            let block = self.child.read()?;
            if block.is_empty() {
                self.flush_group()?;
                self.done = true;
                return Ok(self.take_pending());
            }
            if self.plan.is_none() {
                self.resolve_plan(&block)?;
            }

            for row in 0..block.rows() {
                let key = self.key_of(&block, row)?;
                let same_group = self.current_key.as_ref() == Some(&key);
                if !same_group {
                    self.flush_group()?;
                    self.current_key = Some(key);
                }

                let plan = self
                    .plan
                    .as_ref()
                    .ok_or_else(|| StrataError::logical("plan vanished mid-stream"))?;
                if same_group {
                    for ((col, entry), cell) in
                        block.iter().zip(plan.iter()).zip(self.acc.iter())
                    {
                        if let (Some((function, _)), AccCell::State(acc_state)) = (entry, cell) {
                            let states = col.column.as_states().ok_or_else(|| {
                                StrataError::IllegalColumn {
                                    column: col.column.variant_name().into(),
                                    context: "aggregating merge expects state columns".into(),
                                }
                            })?;
                            unsafe {
                                function.merge(acc_state.0, states.state_at(row).0);
                            }
                        }
                    }
                } else {
                    let mut acc = Vec::with_capacity(block.columns());
                    for (col, entry) in block.iter().zip(plan.iter()) {
                        match entry {
                            None => acc.push(AccCell::Value(col.column.field_at(row))),
                            Some((function, owner)) => {
                                let states = col.column.as_states().ok_or_else(|| {
                                    StrataError::IllegalColumn {
                                        column: col.column.variant_name().into(),
                                        context: "aggregating merge expects state columns".into(),
                                    }
                                })?;
                                let fresh = owner.create_state()?;
                                unsafe {
                                    function.merge(fresh.0, states.state_at(row).0);
                                }
                                acc.push(AccCell::State(fresh));
                            }
                        }
                    }
                    self.acc = acc;
                }
            }

            if self
                .pending
                .as_ref()
                .is_some_and(|p| p.rows() >= self.max_block_size)
            {
                return Ok(self.take_pending());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::create_aggregate_function;
    use crate::aggregator::AggregateDescription;
    use strata_column::{Column, ColumnWithTypeAndName};
    use strata_stream::{read_all, BlocksListInputStream};
    use strata_types::{DataType, Field, Names, OverflowMode};

    fn aggregator() -> Arc<Aggregator> {
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

    fn block(keys: Vec<u64>, values: Vec<u64>) -> Block {
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(keys)),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
        ])
        .expect("block")
    }

    #[test]
    fn test_streamed_two_phase_equals_direct() {
        let control = ExecControl::unlimited();
        let agg = aggregator();

        // Phase one over two partitions, keeping states.
        let mut partials = Vec::new();
        for part in [block(vec![1, 2], vec![10, 20]), block(vec![2, 3], vec![5, 7])] {
            let child = Box::new(BlocksListInputStream::new(vec![part], Arc::clone(&control)));
            let mut stage = AggregatingBlockInputStream::new(
                child,
                Arc::clone(&agg),
                false,
                Arc::clone(&control),
            );
            let partial = read_all(&mut stage).expect("phase one");
            partials.push(partial);
        }

        // Phase two merges the state blocks.
        let child = Box::new(BlocksListInputStream::new(partials, Arc::clone(&control)));
        let mut stage = MergingAggregatedBlockInputStream::new(
            child,
            Arc::clone(&agg),
            true,
            Arc::clone(&control),
        );
        let merged = read_all(&mut stage).expect("phase two");

        assert_eq!(merged.rows(), 3);
        let mut pairs: Vec<(u64, u64)> = (0..3)
            .map(|i| {
                let Field::UInt64(k) = merged.by_name("k").expect("k").column.field_at(i) else {
                    panic!("key");
                };
                let Field::UInt64(s) = merged.by_name("sum_v").expect("s").column.field_at(i)
                else {
                    panic!("sum");
                };
                (k, s)
            })
            .collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(1, 10), (2, 25), (3, 7)]);
    }
}
