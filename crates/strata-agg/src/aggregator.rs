//! The multi-method group-by operator.
//!
//! The hash layout is chosen from the key shape at the first block and
//! never changes for the life of one aggregation. Group states are
//! contiguous blobs in the arena; `convert_to_block` either finalizes
//! them into value columns or publishes state-pointer columns that
//! co-own the whole aggregation result for a later merge.

use std::sync::Arc;

use strata_column::{
    Block, Column, ColumnWithTypeAndName, StatePtr, StateOwner, StatesColumn,
};
use strata_error::{Result, StrataError};
use strata_stream::BlockInputStream;
use strata_types::codec::{read_varuint, write_varuint};
use strata_types::{DataType, Names, OverflowMode};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_128;

use crate::arena::Arena;
use crate::function::{AggregateFunction, CountFunction};
use crate::hash_table::{ArenaStr, HashTable, HashedCell, HashedEntry, PlainCell};

/// One aggregate in the GROUP BY list.
pub struct AggregateDescription {
    pub function: Arc<dyn AggregateFunction>,
    pub arguments: Names,
    pub argument_types: Vec<DataType>,
    pub column_name: String,
}

/// The hash layout families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    WithoutKey,
    Key64,
    KeyString,
    KeyFixedString,
    Keys128,
    Hashed,
}

impl AggregationMethod {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WithoutKey => "without_key",
            Self::Key64 => "key64",
            Self::KeyString => "key_string",
            Self::KeyFixedString => "key_fixed_string",
            Self::Keys128 => "keys128",
            Self::Hashed => "hashed",
        }
    }
}

type U64Table = HashTable<u64, StatePtr, PlainCell<u64, StatePtr>>;
type U128Table = HashTable<u128, StatePtr, PlainCell<u128, StatePtr>>;
type StrTable = HashTable<ArenaStr, StatePtr, HashedCell<ArenaStr, StatePtr>>;
type FullHashTable = HashTable<u128, HashedEntry, HashedCell<u128, HashedEntry>>;

/// Method-specific group containers.
pub enum AggregatedDataVariants {
    Empty,
    WithoutKey,
    Key64(U64Table),
    KeyString(StrTable),
    KeyFixedString(StrTable),
    Keys128(U128Table),
    Hashed(FullHashTable),
}

impl AggregatedDataVariants {
    fn table_len(&self) -> usize {
        match self {
            Self::Empty | Self::WithoutKey => 0,
            Self::Key64(t) => t.len(),
            Self::KeyString(t) | Self::KeyFixedString(t) => t.len(),
            Self::Keys128(t) => t.len(),
            Self::Hashed(t) => t.len(),
        }
    }
}

struct StatesLayout {
    functions: Vec<Arc<dyn AggregateFunction>>,
    offsets: Vec<usize>,
    any_nontrivial: bool,
}

/// The result of one aggregation: containers, arena, and the knowledge
/// of how to destroy the states it owns.
pub struct AggregatedData {
    pub variants: AggregatedDataVariants,
    arena: Arc<Arena>,
    /// Arenas adopted from merged-in results; states inside the tables
    /// may point into any of them.
    extra_arenas: Vec<Arc<Arena>>,
    /// The no-key state, doubling as the overflow row accumulator for
    /// keyed aggregation.
    without_key: StatePtr,
    key_types: Vec<DataType>,
    key_sizes: Vec<usize>,
    /// Present while this value owns its states; taken when ownership
    /// moves (to a column or to a merge destination).
    layout: Option<StatesLayout>,
}

// States are only mutated by the single-threaded aggregation path;
// once shared (via Arc in a StatesColumn owner) they are read-only.
unsafe impl Send for AggregatedData {}
unsafe impl Sync for AggregatedData {}

impl Default for AggregatedData {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatedData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            variants: AggregatedDataVariants::Empty,
            arena: Arc::new(Arena::new()),
            extra_arenas: Vec::new(),
            without_key: StatePtr::null(),
            key_types: Vec::new(),
            key_sizes: Vec::new(),
            layout: None,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !matches!(self.variants, AggregatedDataVariants::Empty)
    }

    /// Number of groups, the no-key / overflow slot included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variants.table_len() + usize::from(!self.without_key.is_null())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn method(&self) -> Option<AggregationMethod> {
        match &self.variants {
            AggregatedDataVariants::Empty => None,
            AggregatedDataVariants::WithoutKey => Some(AggregationMethod::WithoutKey),
            AggregatedDataVariants::Key64(_) => Some(AggregationMethod::Key64),
            AggregatedDataVariants::KeyString(_) => Some(AggregationMethod::KeyString),
            AggregatedDataVariants::KeyFixedString(_) => Some(AggregationMethod::KeyFixedString),
            AggregatedDataVariants::Keys128(_) => Some(AggregationMethod::Keys128),
            AggregatedDataVariants::Hashed(_) => Some(AggregationMethod::Hashed),
        }
    }

    /// Give up state ownership (they now belong elsewhere).
    fn disarm(&mut self) {
        self.layout = None;
    }

    fn each_state(&self, mut f: impl FnMut(StatePtr)) {
        if !self.without_key.is_null() {
            f(self.without_key);
        }
        match &self.variants {
            AggregatedDataVariants::Empty | AggregatedDataVariants::WithoutKey => {}
            AggregatedDataVariants::Key64(t) => {
                for (_, &state) in t.iter() {
                    f(state);
                }
            }
            AggregatedDataVariants::KeyString(t) | AggregatedDataVariants::KeyFixedString(t) => {
                for (_, &state) in t.iter() {
                    f(state);
                }
            }
            AggregatedDataVariants::Keys128(t) => {
                for (_, &state) in t.iter() {
                    f(state);
                }
            }
            AggregatedDataVariants::Hashed(t) => {
                for (_, entry) in t.iter() {
                    f(entry.state);
                }
            }
        }
    }
}

impl Drop for AggregatedData {
    fn drop(&mut self) {
        let Some(layout) = self.layout.take() else {
            return;
        };
        if !layout.any_nontrivial {
            return;
        }
        trace!(groups = self.len(), "destroying aggregate states");
        self.each_state(|state| {
            if state.is_null() {
                return;
            }
            for (function, &offset) in layout.functions.iter().zip(layout.offsets.iter()) {
                if !function.has_trivial_destructor() {
                    // States were fully created before publication; a
                    // partially-created group never escapes upsert.
                    unsafe { function.destroy(state.0.add(offset)) };
                }
            }
        });
    }
}

enum Upsert {
    /// The group's state base pointer, and whether it was just created.
    Slot(StatePtr),
    /// Key rejected under `no_more_keys`.
    Overflow,
}

pub struct Aggregator {
    keys: Names,
    aggregates: Vec<AggregateDescription>,
    /// Accumulate rows rejected under `no_more_keys` in the dedicated
    /// overflow slot instead of dropping them.
    overflow_row: bool,
    max_rows_to_group_by: u64,
    group_by_overflow_mode: OverflowMode,
    offsets: Vec<usize>,
    total_state_size: usize,
    state_align: usize,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        keys: Names,
        aggregates: Vec<AggregateDescription>,
        max_rows_to_group_by: u64,
        group_by_overflow_mode: OverflowMode,
        overflow_row: bool,
    ) -> Self {
        let mut offsets = Vec::with_capacity(aggregates.len());
        let mut offset = 0_usize;
        let mut align = 1_usize;
        for aggregate in &aggregates {
            let function_align = aggregate.function.state_align().max(1);
            offset = (offset + function_align - 1) & !(function_align - 1);
            offsets.push(offset);
            offset += aggregate.function.state_size();
            align = align.max(function_align);
        }
        Self {
            keys,
            aggregates,
            overflow_row,
            max_rows_to_group_by,
            group_by_overflow_mode,
            offsets,
            total_state_size: offset.max(1),
            state_align: align,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &Names {
        &self.keys
    }

    /// Pick the hash layout from the key columns of the first block.
    fn choose_method(key_types: &[DataType]) -> (AggregationMethod, Vec<usize>) {
        if key_types.is_empty() {
            return (AggregationMethod::WithoutKey, Vec::new());
        }
        let sizes: Vec<usize> = key_types
            .iter()
            .map(|t| t.fixed_value_size().unwrap_or(0))
            .collect();

        if key_types.len() == 1 {
            let only = &key_types[0];
            if only.is_numeric() && sizes[0] <= 8 {
                return (AggregationMethod::Key64, sizes);
            }
            if *only == DataType::String {
                return (AggregationMethod::KeyString, sizes);
            }
            if matches!(only, DataType::FixedString(_)) {
                return (AggregationMethod::KeyFixedString, sizes);
            }
        }

        let all_fixed = sizes.iter().all(|&s| s > 0);
        let total: usize = sizes.iter().sum();
        if all_fixed && total <= 16 {
            return (AggregationMethod::Keys128, sizes);
        }
        (AggregationMethod::Hashed, sizes)
    }

    fn init_result(&self, result: &mut AggregatedData, key_types: Vec<DataType>) {
        let (method, key_sizes) = Self::choose_method(&key_types);
        debug!(method = method.name(), keys = key_types.len(), "aggregation method");
        result.variants = match method {
            AggregationMethod::WithoutKey => AggregatedDataVariants::WithoutKey,
            AggregationMethod::Key64 => AggregatedDataVariants::Key64(HashTable::new()),
            AggregationMethod::KeyString => AggregatedDataVariants::KeyString(HashTable::new()),
            AggregationMethod::KeyFixedString => {
                AggregatedDataVariants::KeyFixedString(HashTable::new())
            }
            AggregationMethod::Keys128 => AggregatedDataVariants::Keys128(HashTable::new()),
            AggregationMethod::Hashed => AggregatedDataVariants::Hashed(HashTable::new()),
        };
        result.key_types = key_types;
        result.key_sizes = key_sizes;
        result.layout = Some(StatesLayout {
            functions: self.aggregates.iter().map(|a| Arc::clone(&a.function)).collect(),
            offsets: self.offsets.clone(),
            any_nontrivial: self
                .aggregates
                .iter()
                .any(|a| !a.function.has_trivial_destructor()),
        });
    }

    /// Allocate and construct one group's states, rolling back the
    /// already-constructed prefix if a constructor fails.
    unsafe fn create_group_states(&self, arena: &Arena) -> Result<StatePtr> {
        let place = arena.alloc(self.total_state_size, self.state_align);
        for (j, aggregate) in self.aggregates.iter().enumerate() {
            if let Err(e) = aggregate.function.create(place.add(self.offsets[j])) {
                for (rollback, offset) in self.aggregates[..j].iter().zip(&self.offsets) {
                    rollback.function.destroy(place.add(*offset));
                }
                return Err(e);
            }
        }
        Ok(StatePtr(place))
    }

    fn ensure_without_key(&self, result: &mut AggregatedData) -> Result<()> {
        if result.without_key.is_null() {
            result.without_key = unsafe { self.create_group_states(&result.arena)? };
        }
        Ok(())
    }

    /// Pack fixed-width key bytes into one 128-bit word.
    fn pack_keys_128(key_columns: &[&Column], key_sizes: &[usize], row: usize) -> u128 {
        let mut packed = [0_u8; 16];
        let mut offset = 0_usize;
        for (col, &size) in key_columns.iter().zip(key_sizes.iter()) {
            packed[offset..offset + size].copy_from_slice(col.data_at(row));
            offset += size;
        }
        u128::from_le_bytes(packed)
    }

    /// Serialize one key row with length prefixes (collision-free).
    fn serialize_keys(key_columns: &[&Column], row: usize, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        for col in key_columns {
            let bytes = match col {
                Column::Array(_) | Column::Tuple(_) | Column::Const(_)
                | Column::AggregateStates(_) => {
                    return Err(StrataError::IllegalColumn {
                        column: col.variant_name().into(),
                        context: "GROUP BY key".into(),
                    });
                }
                flat => flat.data_at(row),
            };
            write_varuint(out, bytes.len() as u64)?;
            out.extend_from_slice(bytes);
        }
        Ok(())
    }

    /// Probe/insert the group for one row and return its state base.
    ///
    /// # Safety
    /// `result` must have been initialized for these key columns.
    unsafe fn upsert(
        &self,
        result: &mut AggregatedData,
        key_columns: &[&Column],
        row: usize,
        no_more_keys: bool,
        scratch: &mut Vec<u8>,
    ) -> Result<Upsert> {
        let arena = Arc::clone(&result.arena);
        match &mut result.variants {
            AggregatedDataVariants::Empty | AggregatedDataVariants::WithoutKey => {
                Err(StrataError::logical("upsert on keyless aggregation state"))
            }
            AggregatedDataVariants::Key64(table) => {
                let key = key_columns[0].u64_bits_at(row);
                if no_more_keys {
                    return match table.find(key) {
                        Some(slot) => Ok(Upsert::Slot(*table.value(slot))),
                        None => Ok(Upsert::Overflow),
                    };
                }
                let (slot, inserted) = table.emplace(key);
                if inserted {
                    let state = self.create_group_states(&arena)?;
                    *table.value_mut(slot) = state;
                }
                Ok(Upsert::Slot(*table.value(slot)))
            }
            AggregatedDataVariants::KeyString(table)
            | AggregatedDataVariants::KeyFixedString(table) => {
                let bytes = key_columns[0].data_at(row);
                let key = ArenaStr::from_slice(bytes);
                if no_more_keys {
                    return match table.find(key) {
                        Some(slot) => Ok(Upsert::Slot(*table.value(slot))),
                        None => Ok(Upsert::Overflow),
                    };
                }
                let (slot, inserted) = table.emplace(key);
                if inserted {
                    // Repoint the key at its arena copy so it outlives
                    // the input block.
                    let interned = arena.intern(bytes);
                    table.set_key(slot, ArenaStr::from_raw(interned, bytes.len() as u32));
                    let state = self.create_group_states(&arena)?;
                    *table.value_mut(slot) = state;
                }
                Ok(Upsert::Slot(*table.value(slot)))
            }
            AggregatedDataVariants::Keys128(table) => {
                let key = Self::pack_keys_128(key_columns, &result.key_sizes, row);
                if no_more_keys {
                    return match table.find(key) {
                        Some(slot) => Ok(Upsert::Slot(*table.value(slot))),
                        None => Ok(Upsert::Overflow),
                    };
                }
                let (slot, inserted) = table.emplace(key);
                if inserted {
                    let state = self.create_group_states(&arena)?;
                    *table.value_mut(slot) = state;
                }
                Ok(Upsert::Slot(*table.value(slot)))
            }
            AggregatedDataVariants::Hashed(table) => {
                Self::serialize_keys(key_columns, row, scratch)?;
                let key = xxh3_128(scratch);
                if no_more_keys {
                    return match table.find(key) {
                        Some(slot) => Ok(Upsert::Slot(table.value(slot).state)),
                        None => Ok(Upsert::Overflow),
                    };
                }
                let (slot, inserted) = table.emplace(key);
                if inserted {
                    let blob = arena.intern(scratch);
                    let state = self.create_group_states(&arena)?;
                    *table.value_mut(slot) = HashedEntry {
                        keys_ptr: blob,
                        keys_len: scratch.len() as u32,
                        state,
                    };
                }
                Ok(Upsert::Slot(table.value(slot).state))
            }
        }
    }

    /// Resolve key columns, materializing constants.
    fn key_columns<'a>(
        &self,
        block: &'a Block,
        materialized: &'a mut Vec<Column>,
    ) -> Result<Vec<&'a Column>> {
        // Constants are materialized up front so the per-row key
        // extraction never branches on constness.
        for name in &self.keys {
            let col = &block.by_name(name)?.column;
            if col.is_const() {
                materialized.push(col.clone().materialized()?);
            }
        }
        let mut out = Vec::with_capacity(self.keys.len());
        let mut const_index = 0_usize;
        for name in &self.keys {
            let col = &block.by_name(name)?.column;
            if col.is_const() {
                out.push(&materialized[const_index]);
                const_index += 1;
            } else {
                out.push(col);
            }
        }
        Ok(out)
    }

    /// Fold one block into the aggregation state.
    ///
    /// Returns `false` when the group-count bound fired under `Break`
    /// and reading should stop cleanly.
    pub fn execute_on_block(
        &self,
        block: &Block,
        result: &mut AggregatedData,
        no_more_keys: &mut bool,
    ) -> Result<bool> {
        let mut materialized = Vec::new();
        let key_columns = self.key_columns(block, &mut materialized)?;

        if !result.is_initialized() {
            let key_types: Result<Vec<DataType>> = self
                .keys
                .iter()
                .map(|name| Ok(block.by_name(name)?.data_type.clone()))
                .collect();
            self.init_result(result, key_types?);
        }

        let mut argument_columns: Vec<Vec<&Column>> = Vec::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            let mut args = Vec::with_capacity(aggregate.arguments.len());
            for name in &aggregate.arguments {
                let col = &block.by_name(name)?.column;
                if col.is_const() {
                    return Err(StrataError::IllegalColumn {
                        column: col.variant_name().into(),
                        context: "constants are not allowed as aggregate arguments".into(),
                    });
                }
                args.push(col);
            }
            argument_columns.push(args);
        }

        let rows = block.rows();

        if matches!(result.variants, AggregatedDataVariants::WithoutKey) {
            self.ensure_without_key(result)?;
            let state = result.without_key;
            // A lone count() needs no per-row work at all.
            if self.aggregates.len() == 1 && self.aggregates[0].function.name() == "count" {
                unsafe { CountFunction::add_delta(state.0.add(self.offsets[0]), rows as u64) };
            } else {
                for row in 0..rows {
                    for (j, aggregate) in self.aggregates.iter().enumerate() {
                        unsafe {
                            aggregate.function.add(
                                state.0.add(self.offsets[j]),
                                &argument_columns[j],
                                row,
                            )?;
                        }
                    }
                }
            }
            return Ok(true);
        }

        if self.overflow_row {
            self.ensure_without_key(result)?;
        }

        let mut scratch = Vec::new();
        for row in 0..rows {
            let state = match unsafe {
                self.upsert(result, &key_columns, row, *no_more_keys, &mut scratch)?
            } {
                Upsert::Slot(state) => state,
                Upsert::Overflow => {
                    if self.overflow_row {
                        result.without_key
                    } else {
                        continue;
                    }
                }
            };
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                unsafe {
                    aggregate
                        .function
                        .add(state.0.add(self.offsets[j]), &argument_columns[j], row)?;
                }
            }
        }

        if !*no_more_keys
            && self.max_rows_to_group_by != 0
            && result.len() as u64 > self.max_rows_to_group_by
        {
            match self.group_by_overflow_mode {
                OverflowMode::Throw => {
                    return Err(StrataError::TooManyGroups {
                        rows: result.len() as u64,
                        max: self.max_rows_to_group_by,
                    });
                }
                OverflowMode::Break => return Ok(false),
                OverflowMode::Any => *no_more_keys = true,
            }
        }

        Ok(true)
    }

    /// Aggregate a whole stream into `result`.
    pub fn execute(
        &self,
        stream: &mut dyn BlockInputStream,
        result: &mut AggregatedData,
    ) -> Result<()> {
        let mut no_more_keys = false;
        let mut src_rows = 0_u64;
        loop {
            let block = stream.read()?;
            if block.is_empty() {
                break;
            }
            src_rows += block.rows() as u64;
            if !self.execute_on_block(&block, result, &mut no_more_keys)? {
                break;
            }
        }
        debug!(src_rows, groups = result.len(), "aggregated");
        Ok(())
    }

    /// Emit keys from a table entry back into the key columns.
    fn emit_key_64(key: u64, key_columns: &mut [Column]) {
        key_columns[0].push_u64_bits(key);
    }

    fn emit_key_bytes(bytes: &[u8], key_columns: &mut [Column]) -> Result<()> {
        match &mut key_columns[0] {
            Column::String(c) => {
                c.push(bytes);
                Ok(())
            }
            Column::FixedString(c) => c.push(bytes),
            other => Err(StrataError::IllegalColumn {
                column: other.variant_name().into(),
                context: "string key emission".into(),
            }),
        }
    }

    fn emit_keys_128(key: u128, key_sizes: &[usize], key_columns: &mut [Column]) -> Result<()> {
        let packed = key.to_le_bytes();
        let mut offset = 0_usize;
        for (col, &size) in key_columns.iter_mut().zip(key_sizes.iter()) {
            let bytes = &packed[offset..offset + size];
            match col {
                Column::FixedString(c) => c.push(bytes)?,
                numeric => {
                    let mut bits = [0_u8; 8];
                    bits[..size].copy_from_slice(bytes);
                    numeric.push_u64_bits(u64::from_le_bytes(bits));
                }
            }
            offset += size;
        }
        Ok(())
    }

    fn emit_serialized_keys(blob: &[u8], key_columns: &mut [Column]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(blob);
        for col in key_columns.iter_mut() {
            let len = read_varuint(&mut cursor)? as usize;
            let start = cursor.position() as usize;
            let bytes = &blob[start..start + len];
            cursor.set_position((start + len) as u64);
            match col {
                Column::String(c) => c.push(bytes),
                Column::FixedString(c) => c.push(bytes)?,
                numeric => {
                    let mut bits = [0_u8; 8];
                    bits[..len.min(8)].copy_from_slice(&bytes[..len.min(8)]);
                    numeric.push_u64_bits(u64::from_le_bytes(bits));
                }
            }
        }
        Ok(())
    }

    /// Materialize the aggregation result.
    ///
    /// With `final_ = true` every state is finalized into its value
    /// column and the whole result is destroyed on return. With
    /// `final_ = false` the keys come with opaque state columns that
    /// co-own the arena (and the destructors), for downstream merging.
    pub fn convert_to_block(&self, mut data: AggregatedData, final_: bool) -> Result<Block> {
        if !data.is_initialized() && data.without_key.is_null() {
            return Ok(Block::new());
        }

        let mut key_columns: Vec<Column> = data
            .key_types
            .iter()
            .map(Column::empty_of)
            .collect::<Result<_>>()?;
        let mut state_bases: Vec<StatePtr> = Vec::with_capacity(data.len());

        // The overflow row (or the single no-key group) goes first,
        // under default key values.
        if !data.without_key.is_null() {
            state_bases.push(data.without_key);
            for col in &mut key_columns {
                col.insert_default();
            }
        }

        match &data.variants {
            AggregatedDataVariants::Empty | AggregatedDataVariants::WithoutKey => {}
            AggregatedDataVariants::Key64(table) => {
                for (key, &state) in table.iter() {
                    Self::emit_key_64(key, &mut key_columns);
                    state_bases.push(state);
                }
            }
            AggregatedDataVariants::KeyString(table)
            | AggregatedDataVariants::KeyFixedString(table) => {
                for (key, &state) in table.iter() {
                    unsafe { Self::emit_key_bytes(key.bytes(), &mut key_columns)? };
                    state_bases.push(state);
                }
            }
            AggregatedDataVariants::Keys128(table) => {
                for (key, &state) in table.iter() {
                    Self::emit_keys_128(key, &data.key_sizes, &mut key_columns)?;
                    state_bases.push(state);
                }
            }
            AggregatedDataVariants::Hashed(table) => {
                for (_, entry) in table.iter() {
                    let blob = unsafe {
                        std::slice::from_raw_parts(entry.keys_ptr, entry.keys_len as usize)
                    };
                    Self::emit_serialized_keys(blob, &mut key_columns)?;
                    state_bases.push(entry.state);
                }
            }
        }

        let mut block = Block::new();
        for (name, (data_type, column)) in self
            .keys
            .iter()
            .zip(data.key_types.iter().cloned().zip(key_columns))
        {
            block.insert(ColumnWithTypeAndName::new(name.clone(), data_type, column))?;
        }

        if final_ {
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                let mut column = Column::empty_of(&aggregate.function.return_type())?;
                column.reserve(state_bases.len());
                for state in &state_bases {
                    unsafe {
                        aggregate
                            .function
                            .insert_result(state.0.add(self.offsets[j]), &mut column)?;
                    }
                }
                block.insert(ColumnWithTypeAndName::new(
                    aggregate.column_name.clone(),
                    aggregate.function.return_type(),
                    column,
                ))?;
            }
            // `data` drops here and destroys the states.
            Ok(block)
        } else {
            let owner: StateOwner = Arc::new(data);
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                let mut states = StatesColumn::new();
                states.reserve(state_bases.len());
                for state in &state_bases {
                    states.push(StatePtr(unsafe { state.0.add(self.offsets[j]) }));
                }
                states.add_owner(Arc::clone(&owner));
                block.insert(ColumnWithTypeAndName::new(
                    aggregate.column_name.clone(),
                    DataType::AggregateFunction {
                        function: aggregate.function.name().to_string(),
                        argument_types: aggregate.argument_types.clone(),
                    },
                    Column::AggregateStates(states),
                ))?;
            }
            Ok(block)
        }
    }

    /// Merge several independently-built results into one.
    ///
    /// Collisions merge state into the destination and destroy the
    /// source state; fresh keys adopt the source state pointer, so the
    /// source arenas are adopted wholesale.
    pub fn merge_variants(&self, mut many: Vec<AggregatedData>) -> Result<AggregatedData> {
        if many.is_empty() {
            return Err(StrataError::EmptyData {
                operation: "merge of aggregation results",
            });
        }
        let mut dst = many.remove(0);
        for mut src in many {
            if src.is_empty() {
                continue;
            }
            if dst.is_empty() && !dst.is_initialized() {
                dst = src;
                continue;
            }
            if src.method() != dst.method() {
                return Err(StrataError::logical(
                    "cannot merge aggregation results of different methods",
                ));
            }

            unsafe {
                self.merge_without_key(&mut dst, &src)?;
                self.merge_tables(&mut dst, &mut src)?;
            }
            dst.extra_arenas.push(Arc::clone(&src.arena));
            dst.extra_arenas.extend(src.extra_arenas.iter().cloned());
            // The destination (or inline destruction above) now owns
            // every state the source had.
            src.disarm();
        }
        Ok(dst)
    }

    unsafe fn merge_without_key(&self, dst: &mut AggregatedData, src: &AggregatedData) -> Result<()> {
        if src.without_key.is_null() {
            return Ok(());
        }
        self.ensure_without_key(dst)?;
        self.merge_states(dst.without_key, src.without_key);
        self.destroy_states(src.without_key);
        Ok(())
    }

    unsafe fn merge_states(&self, dst: StatePtr, src: StatePtr) {
        for (j, aggregate) in self.aggregates.iter().enumerate() {
            aggregate
                .function
                .merge(dst.0.add(self.offsets[j]), src.0.add(self.offsets[j]));
        }
    }

    unsafe fn destroy_states(&self, state: StatePtr) {
        for (j, aggregate) in self.aggregates.iter().enumerate() {
            if !aggregate.function.has_trivial_destructor() {
                aggregate.function.destroy(state.0.add(self.offsets[j]));
            }
        }
    }

    unsafe fn merge_tables(&self, dst: &mut AggregatedData, src: &mut AggregatedData) -> Result<()> {
        macro_rules! merge_plain {
            ($dst_table:expr, $src_table:expr) => {{
                for (key, &src_state) in $src_table.iter() {
                    let (slot, inserted) = $dst_table.emplace(key);
                    if inserted {
                        *$dst_table.value_mut(slot) = src_state;
                    } else {
                        let dst_state = *$dst_table.value(slot);
                        self.merge_states(dst_state, src_state);
                        self.destroy_states(src_state);
                    }
                }
            }};
        }

        match (&mut dst.variants, &src.variants) {
            (AggregatedDataVariants::WithoutKey, AggregatedDataVariants::WithoutKey) => {}
            (AggregatedDataVariants::Key64(d), AggregatedDataVariants::Key64(s)) => {
                merge_plain!(d, s);
            }
            (AggregatedDataVariants::KeyString(d), AggregatedDataVariants::KeyString(s))
            | (
                AggregatedDataVariants::KeyFixedString(d),
                AggregatedDataVariants::KeyFixedString(s),
            ) => {
                merge_plain!(d, s);
            }
            (AggregatedDataVariants::Keys128(d), AggregatedDataVariants::Keys128(s)) => {
                merge_plain!(d, s);
            }
            (AggregatedDataVariants::Hashed(d), AggregatedDataVariants::Hashed(s)) => {
                for (key, entry) in s.iter() {
                    let (slot, inserted) = d.emplace(key);
                    if inserted {
                        *d.value_mut(slot) = *entry;
                    } else {
                        let dst_state = d.value(slot).state;
                        self.merge_states(dst_state, entry.state);
                        self.destroy_states(entry.state);
                    }
                }
            }
            (AggregatedDataVariants::Empty, _) => {
                return Err(StrataError::logical("merge into uninitialized aggregation"));
            }
            _ => {
                return Err(StrataError::logical(
                    "cannot merge aggregation results of different methods",
                ));
            }
        }
        Ok(())
    }

    /// Merge a stream of partially-aggregated blocks (key columns plus
    /// state columns) into `result`.
    pub fn merge_stream(
        &self,
        stream: &mut dyn BlockInputStream,
        result: &mut AggregatedData,
    ) -> Result<()> {
        loop {
            let block = stream.read()?;
            if block.is_empty() {
                break;
            }
            self.merge_block(&block, result)?;
        }
        Ok(())
    }

    pub fn merge_block(&self, block: &Block, result: &mut AggregatedData) -> Result<()> {
        let mut materialized = Vec::new();
        let key_columns = self.key_columns(block, &mut materialized)?;

        if !result.is_initialized() {
            let key_types: Result<Vec<DataType>> = self
                .keys
                .iter()
                .map(|name| Ok(block.by_name(name)?.data_type.clone()))
                .collect();
            self.init_result(result, key_types?);
        }

        let mut state_columns = Vec::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            let col = &block.by_name(&aggregate.column_name)?.column;
            let states = col.as_states().ok_or_else(|| StrataError::IllegalColumn {
                column: col.variant_name().into(),
                context: "merging aggregated stream expects state columns".into(),
            })?;
            state_columns.push(states);
        }

        let rows = block.rows();

        if matches!(result.variants, AggregatedDataVariants::WithoutKey) {
            self.ensure_without_key(result)?;
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                for row in 0..rows {
                    unsafe {
                        aggregate.function.merge(
                            result.without_key.0.add(self.offsets[j]),
                            state_columns[j].state_at(row).0,
                        );
                    }
                }
            }
            return Ok(());
        }

        let mut scratch = Vec::new();
        for row in 0..rows {
            let state = match unsafe {
                self.upsert(result, &key_columns, row, false, &mut scratch)?
            } {
                Upsert::Slot(state) => state,
                Upsert::Overflow => continue,
            };
            for (j, aggregate) in self.aggregates.iter().enumerate() {
                unsafe {
                    aggregate
                        .function
                        .merge(state.0.add(self.offsets[j]), state_columns[j].state_at(row).0);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::create_aggregate_function;
    use strata_column::StringColumn;
    use strata_types::Field;

    fn sum_aggregator(keys: Names) -> Aggregator {
        let sum = create_aggregate_function("sum", &[DataType::UInt64]).expect("sum");
        Aggregator::new(
            keys,
            vec![AggregateDescription {
                function: sum,
                arguments: vec!["v".into()],
                argument_types: vec![DataType::UInt64],
                column_name: "sum_v".into(),
            }],
            0,
            OverflowMode::Throw,
            false,
        )
    }

    fn block_u32_key(keys: Vec<u32>, values: Vec<u64>) -> Block {
        Block::from_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt32, Column::UInt32(keys)),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
        ])
        .expect("block")
    }

    #[test]
    fn test_key64_method_and_sums() {
        let aggregator = sum_aggregator(vec!["k".into()]);
        let mut data = AggregatedData::new();
        let mut no_more_keys = false;

        let block = block_u32_key(vec![1, 2, 1, 3, 2, 1], vec![10, 20, 1, 30, 2, 1]);
        aggregator
            .execute_on_block(&block, &mut data, &mut no_more_keys)
            .expect("execute");

        assert_eq!(data.method(), Some(AggregationMethod::Key64));
        assert_eq!(data.len(), 3);

        let result = aggregator.convert_to_block(data, true).expect("convert");
        assert_eq!(result.rows(), 3);
        let k = &result.by_name("k").expect("k").column;
        let s = &result.by_name("sum_v").expect("sum").column;
        let mut pairs: Vec<(u64, u64)> = (0..3)
            .map(|i| {
                let Field::UInt64(key) = k.field_at(i) else { panic!("key") };
                let Field::UInt64(sum) = s.field_at(i) else { panic!("sum") };
                (key, sum)
            })
            .collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(1, 12), (2, 22), (3, 30)]);
    }

    #[test]
    fn test_string_method_uses_arena_copies() {
        let aggregator = sum_aggregator(vec!["k".into()]);
        let mut data = AggregatedData::new();
        let mut no_more_keys = false;

        // Two separate blocks: the arena copy must make keys from the
        // first block still comparable after the block is gone.
        for chunk in [vec!["a", "b", "a"], vec!["b", "c"]] {
            let mut s = StringColumn::new();
            for key in &chunk {
                s.push(key.as_bytes());
            }
            let block = Block::from_columns(vec![
                ColumnWithTypeAndName::new("k", DataType::String, Column::String(s)),
                ColumnWithTypeAndName::new(
                    "v",
                    DataType::UInt64,
                    Column::UInt64(vec![1; chunk.len()]),
                ),
            ])
            .expect("block");
            aggregator
                .execute_on_block(&block, &mut data, &mut no_more_keys)
                .expect("execute");
        }

        assert_eq!(data.method(), Some(AggregationMethod::KeyString));
        assert_eq!(data.len(), 3);

        let result = aggregator.convert_to_block(data, true).expect("convert");
        assert_eq!(result.rows(), 3);
    }

    #[test]
    fn test_without_key_count_fast_path() {
        let count = create_aggregate_function("count", &[]).expect("count");
        let aggregator = Aggregator::new(
            Names::new(),
            vec![AggregateDescription {
                function: count,
                arguments: Names::new(),
                argument_types: Vec::new(),
                column_name: "count()".into(),
            }],
            0,
            OverflowMode::Throw,
            false,
        );
        let mut data = AggregatedData::new();
        let mut no_more_keys = false;
        let block = block_u32_key(vec![1, 2, 3], vec![0, 0, 0]);
        aggregator
            .execute_on_block(&block, &mut data, &mut no_more_keys)
            .expect("execute");

        let result = aggregator.convert_to_block(data, true).expect("convert");
        assert_eq!(result.rows(), 1);
        assert_eq!(
            result.by_name("count()").expect("count").column.field_at(0),
            Field::UInt64(3)
        );
    }

    #[test]
    fn test_group_limit_any_mode_stops_new_keys() {
        let sum = create_aggregate_function("sum", &[DataType::UInt64]).expect("sum");
        let aggregator = Aggregator::new(
            vec!["k".into()],
            vec![AggregateDescription {
                function: sum,
                arguments: vec!["v".into()],
                argument_types: vec![DataType::UInt64],
                column_name: "sum_v".into(),
            }],
            2,
            OverflowMode::Any,
            false,
        );
        let mut data = AggregatedData::new();
        let mut no_more_keys = false;

        let block = block_u32_key(vec![1, 2, 3], vec![5, 5, 5]);
        aggregator
            .execute_on_block(&block, &mut data, &mut no_more_keys)
            .expect("execute");
        assert!(no_more_keys);
        let seen = data.len();

        // Existing keys still update; new keys are dropped.
        let block = block_u32_key(vec![1, 9, 9], vec![5, 5, 5]);
        aggregator
            .execute_on_block(&block, &mut data, &mut no_more_keys)
            .expect("execute");
        assert_eq!(data.len(), seen);
    }

    #[test]
    fn test_two_phase_equals_one_phase() {
        let aggregator = sum_aggregator(vec!["k".into()]);

        // One phase over everything.
        let mut whole = AggregatedData::new();
        let mut nmk = false;
        let all = block_u32_key(vec![1, 2, 1, 3, 2, 1], vec![1, 2, 3, 4, 5, 6]);
        aggregator.execute_on_block(&all, &mut whole, &mut nmk).expect("execute");
        let expected = aggregator.convert_to_block(whole, true).expect("convert");

        // Two phases: split, partial-aggregate, emit states, merge.
        let mut left = AggregatedData::new();
        let mut right = AggregatedData::new();
        let mut nmk = false;
        aggregator
            .execute_on_block(
                &block_u32_key(vec![1, 2, 1], vec![1, 2, 3]),
                &mut left,
                &mut nmk,
            )
            .expect("execute");
        aggregator
            .execute_on_block(
                &block_u32_key(vec![3, 2, 1], vec![4, 5, 6]),
                &mut right,
                &mut nmk,
            )
            .expect("execute");

        let partial_left = aggregator.convert_to_block(left, false).expect("partial");
        let partial_right = aggregator.convert_to_block(right, false).expect("partial");

        let mut merged = AggregatedData::new();
        aggregator.merge_block(&partial_left, &mut merged).expect("merge");
        aggregator.merge_block(&partial_right, &mut merged).expect("merge");
        let actual = aggregator.convert_to_block(merged, true).expect("convert");

        let collect = |b: &Block| {
            let mut pairs: Vec<(u64, u64)> = (0..b.rows())
                .map(|i| {
                    let Field::UInt64(k) = b.by_name("k").expect("k").column.field_at(i) else {
                        panic!("key")
                    };
                    let Field::UInt64(s) = b.by_name("sum_v").expect("s").column.field_at(i)
                    else {
                        panic!("sum")
                    };
                    (k, s)
                })
                .collect();
            pairs.sort_unstable();
            pairs
        };
        assert_eq!(collect(&expected), collect(&actual));
        assert_eq!(collect(&expected), vec![(1, 10), (2, 7), (3, 4)]);
    }
}
