//! Aggregate functions and their arena-resident states.
//!
//! A state is a fixed-size blob living at an arena address; the
//! function knows its size, alignment and lifecycle. States with heap
//! content (min/max over strings, uniq) report a non-trivial destructor
//! and are dropped in place when the owning aggregation result dies.

use std::collections::HashSet;
use std::sync::Arc;

use strata_column::Column;
use strata_error::{Result, StrataError};
use strata_types::codec::write_field;
use strata_types::{DataType, Field};
use xxhash_rust::xxh3::xxh3_64;

/// One aggregate function.
///
/// # Safety contract
/// Every `place` passed to the unsafe methods must point at
/// `state_size()` bytes aligned to `state_align()`, previously
/// initialized by `create` (except in `create` itself) and not yet
/// destroyed.
pub trait AggregateFunction: Send + Sync {
    fn name(&self) -> &str;

    fn return_type(&self) -> DataType;

    fn state_size(&self) -> usize;

    fn state_align(&self) -> usize;

    fn has_trivial_destructor(&self) -> bool {
        true
    }

    /// Initialize a fresh state at `place`.
    ///
    /// May fail when the state needs resources beyond its blob; the
    /// caller rolls back sibling states created for the same group.
    unsafe fn create(&self, place: *mut u8) -> Result<()>;

    /// Tear down the state at `place`.
    unsafe fn destroy(&self, _place: *mut u8) {}

    /// Fold row `row` of the argument columns into the state.
    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()>;

    /// Combine `other` into `place`, leaving `other` intact.
    unsafe fn merge(&self, place: *mut u8, other: *const u8);

    /// Append the finalized value to `into`.
    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()>;

    /// Serialize the state for storage or the wire.
    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()>;

    /// Restore a serialized state into a freshly `create`d `place`.
    unsafe fn deserialize_state(&self, place: *mut u8, input: &mut dyn std::io::Read)
        -> Result<()>;
}

/// Resolve a function by name against its argument types.
pub fn create_aggregate_function(
    name: &str,
    argument_types: &[DataType],
) -> Result<Arc<dyn AggregateFunction>> {
    match name {
        "count" => Ok(Arc::new(CountFunction)),
        "sum" => {
            let arg = single_numeric_arg("sum", argument_types)?;
            Ok(Arc::new(SumFunction::new(arg)?))
        }
        "min" => Ok(Arc::new(MinMaxFunction::new(
            single_arg("min", argument_types)?,
            true,
        ))),
        "max" => Ok(Arc::new(MinMaxFunction::new(
            single_arg("max", argument_types)?,
            false,
        ))),
        "any" => Ok(Arc::new(AnyFunction::new(single_arg("any", argument_types)?))),
        "avg" => {
            single_numeric_arg("avg", argument_types)?;
            Ok(Arc::new(AvgFunction))
        }
        "uniq" => {
            single_arg("uniq", argument_types)?;
            Ok(Arc::new(UniqFunction))
        }
        _ => Err(StrataError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn single_arg(name: &str, argument_types: &[DataType]) -> Result<DataType> {
    if argument_types.len() != 1 {
        return Err(StrataError::ParameterOutOfBound {
            detail: format!("{name} expects one argument, got {}", argument_types.len()),
        });
    }
    Ok(argument_types[0].clone())
}

fn single_numeric_arg(name: &str, argument_types: &[DataType]) -> Result<DataType> {
    let arg = single_arg(name, argument_types)?;
    if !arg.is_numeric() {
        return Err(StrataError::IllegalTypeOfArgument {
            function: name.to_string(),
            type_name: arg.name(),
        });
    }
    Ok(arg)
}

// ---------------------------------------------------------------------------
// count
// ---------------------------------------------------------------------------

pub struct CountFunction;

impl CountFunction {
    /// Bulk path used by the no-key aggregation: count whole blocks
    /// without touching rows.
    ///
    /// # Safety
    /// `place` must be a live `count` state.
    pub unsafe fn add_delta(place: *mut u8, delta: u64) {
        *place.cast::<u64>() += delta;
    }
}

impl AggregateFunction for CountFunction {
    fn name(&self) -> &str {
        "count"
    }
    fn return_type(&self) -> DataType {
        DataType::UInt64
    }
    fn state_size(&self) -> usize {
        std::mem::size_of::<u64>()
    }
    fn state_align(&self) -> usize {
        std::mem::align_of::<u64>()
    }
    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<u64>().write(0);
        Ok(())
    }
    unsafe fn add(&self, place: *mut u8, _args: &[&Column], _row: usize) -> Result<()> {
        *place.cast::<u64>() += 1;
        Ok(())
    }
    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        *place.cast::<u64>() += *other.cast::<u64>();
    }
    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        into.insert_field(&Field::UInt64(*place.cast::<u64>()))
    }
    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(*place.cast::<u64>()).to_le_bytes());
        Ok(())
    }
    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        let mut buf = [0_u8; 8];
        input.read_exact(&mut buf)?;
        place.cast::<u64>().write(u64::from_le_bytes(buf));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sum
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum SumDomain {
    Unsigned,
    Signed,
    Float,
}

pub struct SumFunction {
    domain: SumDomain,
}

impl SumFunction {
    pub fn new(argument: DataType) -> Result<Self> {
        let domain = match argument {
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date
            | DataType::DateTime => SumDomain::Unsigned,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                SumDomain::Signed
            }
            DataType::Float32 | DataType::Float64 => SumDomain::Float,
            other => {
                return Err(StrataError::IllegalTypeOfArgument {
                    function: "sum".into(),
                    type_name: other.name(),
                });
            }
        };
        Ok(Self { domain })
    }
}

impl AggregateFunction for SumFunction {
    fn name(&self) -> &str {
        "sum"
    }

    fn return_type(&self) -> DataType {
        match self.domain {
            SumDomain::Unsigned => DataType::UInt64,
            SumDomain::Signed => DataType::Int64,
            SumDomain::Float => DataType::Float64,
        }
    }

    fn state_size(&self) -> usize {
        8
    }

    fn state_align(&self) -> usize {
        8
    }

    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<u64>().write(0);
        Ok(())
    }

    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()> {
        match (self.domain, args[0].field_at(row)) {
            (SumDomain::Unsigned, Field::UInt64(v)) => {
                *place.cast::<u64>() = (*place.cast::<u64>()).wrapping_add(v);
            }
            (SumDomain::Signed, Field::Int64(v)) => {
                *place.cast::<i64>() = (*place.cast::<i64>()).wrapping_add(v);
            }
            (SumDomain::Float, Field::Float64(v)) => {
                *place.cast::<f64>() += v;
            }
            (_, other) => {
                return Err(StrataError::IllegalTypeOfArgument {
                    function: "sum".into(),
                    type_name: format!("{other}"),
                });
            }
        }
        Ok(())
    }

    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        match self.domain {
            SumDomain::Unsigned => {
                *place.cast::<u64>() = (*place.cast::<u64>()).wrapping_add(*other.cast::<u64>());
            }
            SumDomain::Signed => {
                *place.cast::<i64>() = (*place.cast::<i64>()).wrapping_add(*other.cast::<i64>());
            }
            SumDomain::Float => *place.cast::<f64>() += *other.cast::<f64>(),
        }
    }

    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        let field = match self.domain {
            SumDomain::Unsigned => Field::UInt64(*place.cast::<u64>()),
            SumDomain::Signed => Field::Int64(*place.cast::<i64>()),
            SumDomain::Float => Field::Float64(*place.cast::<f64>()),
        };
        into.insert_field(&field)
    }

    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(*place.cast::<u64>()).to_le_bytes());
        Ok(())
    }

    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        let mut buf = [0_u8; 8];
        input.read_exact(&mut buf)?;
        place.cast::<u64>().write(u64::from_le_bytes(buf));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// min / max / any
// ---------------------------------------------------------------------------

type FieldState = Option<Field>;

/// Shared (de)serialization of `Option<Field>` states against a
/// declared value type.
unsafe fn serialize_field_state(
    place: *const u8,
    value_type: &DataType,
    out: &mut Vec<u8>,
) -> Result<()> {
    match &*place.cast::<FieldState>() {
        None => out.push(0),
        Some(value) => {
            out.push(1);
            write_field(out, value, value_type)?;
        }
    }
    Ok(())
}

unsafe fn deserialize_field_state(
    place: *mut u8,
    value_type: &DataType,
    input: &mut dyn std::io::Read,
) -> Result<()> {
    let mut flag = [0_u8; 1];
    input.read_exact(&mut flag)?;
    let state = if flag[0] == 0 {
        None
    } else {
        Some(strata_types::codec::read_field(input, value_type)?)
    };
    // `place` holds the fresh `None` written by `create`; plain
    // assignment through the typed pointer drops it correctly.
    *place.cast::<FieldState>() = state;
    Ok(())
}


pub struct MinMaxFunction {
    argument: DataType,
    is_min: bool,
}

impl MinMaxFunction {
    #[must_use]
    pub fn new(argument: DataType, is_min: bool) -> Self {
        Self { argument, is_min }
    }
}

impl AggregateFunction for MinMaxFunction {
    fn name(&self) -> &str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }

    fn return_type(&self) -> DataType {
        self.argument.clone()
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<FieldState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<FieldState>()
    }

    fn has_trivial_destructor(&self) -> bool {
        false
    }

    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<FieldState>().write(None);
        Ok(())
    }

    unsafe fn destroy(&self, place: *mut u8) {
        place.cast::<FieldState>().drop_in_place();
    }

    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()> {
        let state = &mut *place.cast::<FieldState>();
        let value = args[0].field_at(row);
        let replace = match state {
            None => true,
            Some(current) => {
                let ord = value.cmp_with_nan_hint(current, 1);
                if self.is_min {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                }
            }
        };
        if replace {
            *state = Some(value);
        }
        Ok(())
    }

    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        let state = &mut *place.cast::<FieldState>();
        let incoming = &*other.cast::<FieldState>();
        if let Some(value) = incoming {
            let replace = match state {
                None => true,
                Some(current) => {
                    let ord = value.cmp_with_nan_hint(current, 1);
                    if self.is_min {
                        ord.is_lt()
                    } else {
                        ord.is_gt()
                    }
                }
            };
            if replace {
                *state = Some(value.clone());
            }
        }
    }

    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        match &*place.cast::<FieldState>() {
            Some(value) => into.insert_field(value),
            None => {
                into.insert_default();
                Ok(())
            }
        }
    }

    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        serialize_field_state(place, &self.argument, out)
    }

    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        deserialize_field_state(place, &self.argument, input)
    }
}

pub struct AnyFunction {
    argument: DataType,
}

impl AnyFunction {
    #[must_use]
    pub fn new(argument: DataType) -> Self {
        Self { argument }
    }
}

impl AggregateFunction for AnyFunction {
    fn name(&self) -> &str {
        "any"
    }

    fn return_type(&self) -> DataType {
        self.argument.clone()
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<FieldState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<FieldState>()
    }

    fn has_trivial_destructor(&self) -> bool {
        false
    }

    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<FieldState>().write(None);
        Ok(())
    }

    unsafe fn destroy(&self, place: *mut u8) {
        place.cast::<FieldState>().drop_in_place();
    }

    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()> {
        let state = &mut *place.cast::<FieldState>();
        if state.is_none() {
            *state = Some(args[0].field_at(row));
        }
        Ok(())
    }

    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        let state = &mut *place.cast::<FieldState>();
        if state.is_none() {
            (*other.cast::<FieldState>()).clone_into(state);
        }
    }

    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        match &*place.cast::<FieldState>() {
            Some(value) => into.insert_field(value),
            None => {
                into.insert_default();
                Ok(())
            }
        }
    }

    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        serialize_field_state(place, &self.argument, out)
    }

    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        deserialize_field_state(place, &self.argument, input)
    }
}

// ---------------------------------------------------------------------------
// avg
// ---------------------------------------------------------------------------

#[repr(C)]
struct AvgState {
    sum: f64,
    count: u64,
}

pub struct AvgFunction;

impl AggregateFunction for AvgFunction {
    fn name(&self) -> &str {
        "avg"
    }

    fn return_type(&self) -> DataType {
        DataType::Float64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<AvgState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<AvgState>()
    }

    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<AvgState>().write(AvgState { sum: 0.0, count: 0 });
        Ok(())
    }

    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()> {
        let state = &mut *place.cast::<AvgState>();
        #[allow(clippy::cast_precision_loss)]
        let value = match args[0].field_at(row) {
            Field::UInt64(v) => v as f64,
            Field::Int64(v) => v as f64,
            Field::Float64(v) => v,
            other => {
                return Err(StrataError::IllegalTypeOfArgument {
                    function: "avg".into(),
                    type_name: format!("{other}"),
                });
            }
        };
        state.sum += value;
        state.count += 1;
        Ok(())
    }

    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        let state = &mut *place.cast::<AvgState>();
        let incoming = &*other.cast::<AvgState>();
        state.sum += incoming.sum;
        state.count += incoming.count;
    }

    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        let state = &*place.cast::<AvgState>();
        #[allow(clippy::cast_precision_loss)]
        let value = if state.count == 0 {
            0.0
        } else {
            state.sum / state.count as f64
        };
        into.insert_field(&Field::Float64(value))
    }

    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        let state = &*place.cast::<AvgState>();
        out.extend_from_slice(&state.sum.to_le_bytes());
        out.extend_from_slice(&state.count.to_le_bytes());
        Ok(())
    }

    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        let mut buf = [0_u8; 16];
        input.read_exact(&mut buf)?;
        let sum = f64::from_le_bytes(buf[..8].try_into().unwrap_or([0; 8]));
        let count = u64::from_le_bytes(buf[8..].try_into().unwrap_or([0; 8]));
        place.cast::<AvgState>().write(AvgState { sum, count });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// uniq
// ---------------------------------------------------------------------------

type UniqState = HashSet<u64>;

pub struct UniqFunction;

impl AggregateFunction for UniqFunction {
    fn name(&self) -> &str {
        "uniq"
    }

    fn return_type(&self) -> DataType {
        DataType::UInt64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<UniqState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<UniqState>()
    }

    fn has_trivial_destructor(&self) -> bool {
        false
    }

    unsafe fn create(&self, place: *mut u8) -> Result<()> {
        place.cast::<UniqState>().write(UniqState::new());
        Ok(())
    }

    unsafe fn destroy(&self, place: *mut u8) {
        place.cast::<UniqState>().drop_in_place();
    }

    unsafe fn add(&self, place: *mut u8, args: &[&Column], row: usize) -> Result<()> {
        let state = &mut *place.cast::<UniqState>();
        let mut bytes = Vec::new();
        let field = args[0].field_at(row);
        // Hash the canonical binary form so equal values collapse
        // regardless of the block they came from.
        let type_hint = canonical_type_of(&field);
        write_field(&mut bytes, &field, &type_hint)?;
        state.insert(xxh3_64(&bytes));
        Ok(())
    }

    unsafe fn merge(&self, place: *mut u8, other: *const u8) {
        let state = &mut *place.cast::<UniqState>();
        let incoming = &*other.cast::<UniqState>();
        state.extend(incoming.iter().copied());
    }

    unsafe fn insert_result(&self, place: *const u8, into: &mut Column) -> Result<()> {
        let state = &*place.cast::<UniqState>();
        into.insert_field(&Field::UInt64(state.len() as u64))
    }

    unsafe fn serialize_state(&self, place: *const u8, out: &mut Vec<u8>) -> Result<()> {
        let state = &*place.cast::<UniqState>();
        strata_types::codec::write_varuint(out, state.len() as u64)?;
        for hash in state {
            out.extend_from_slice(&hash.to_le_bytes());
        }
        Ok(())
    }

    unsafe fn deserialize_state(
        &self,
        place: *mut u8,
        input: &mut dyn std::io::Read,
    ) -> Result<()> {
        let mut counted = input;
        let count = read_varuint_dyn(&mut counted)?;
        let state = &mut *place.cast::<UniqState>();
        let mut buf = [0_u8; 8];
        for _ in 0..count {
            counted.read_exact(&mut buf)?;
            state.insert(u64::from_le_bytes(buf));
        }
        Ok(())
    }
}

/// Varint reader over a dynamic `Read` (the trait method cannot be
/// generic).
fn read_varuint_dyn(input: &mut &mut dyn std::io::Read) -> Result<u64> {
    let mut value = 0_u64;
    let mut shift = 0_u32;
    loop {
        let mut byte = [0_u8; 1];
        input.read_exact(&mut byte)?;
        if shift >= 63 && byte[0] > 1 {
            return Err(StrataError::CorruptedData {
                detail: "varint overflows u64".into(),
            });
        }
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn canonical_type_of(field: &Field) -> DataType {
    match field {
        Field::UInt64(_) => DataType::UInt64,
        Field::Int64(_) => DataType::Int64,
        Field::Float64(_) => DataType::Float64,
        Field::String(_) => DataType::String,
        Field::Array(items) => DataType::Array(Box::new(
            items
                .first()
                .map_or(DataType::UInt64, |f| canonical_type_of(f)),
        )),
        Field::Tuple(items) => DataType::Tuple(items.iter().map(canonical_type_of).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn with_state<F: FnOnce(*mut u8)>(function: &dyn AggregateFunction, body: F) {
        let layout = std::alloc::Layout::from_size_align(
            function.state_size().max(1),
            function.state_align(),
        )
        .expect("layout");
        let place = std::alloc::alloc(layout);
        function.create(place).expect("create");
        body(place);
        function.destroy(place);
        std::alloc::dealloc(place, layout);
    }

    #[test]
    fn test_sum_and_merge() {
        let function = create_aggregate_function("sum", &[DataType::UInt64]).expect("sum");
        let column = Column::UInt64(vec![1, 2, 3]);
        unsafe {
            with_state(function.as_ref(), |a| {
                with_state(function.as_ref(), |b| {
                    for row in 0..3 {
                        function.add(a, &[&column], row).expect("add");
                    }
                    function.add(b, &[&column], 0).expect("add");
                    function.merge(a, b);

                    let mut out = Column::UInt64(Vec::new());
                    function.insert_result(a, &mut out).expect("result");
                    assert_eq!(out.field_at(0), Field::UInt64(7));
                });
            });
        }
    }

    #[test]
    fn test_min_max_over_strings() {
        let min = create_aggregate_function("min", &[DataType::String]).expect("min");
        let max = create_aggregate_function("max", &[DataType::String]).expect("max");
        let mut s = strata_column::StringColumn::new();
        s.push(b"pear");
        s.push(b"apple");
        s.push(b"quince");
        let column = Column::String(s);
        unsafe {
            with_state(min.as_ref(), |mn| {
                with_state(max.as_ref(), |mx| {
                    for row in 0..3 {
                        min.add(mn, &[&column], row).expect("add");
                        max.add(mx, &[&column], row).expect("add");
                    }
                    let mut out = Column::String(strata_column::StringColumn::new());
                    min.insert_result(mn, &mut out).expect("result");
                    max.insert_result(mx, &mut out).expect("result");
                    assert_eq!(out.field_at(0), Field::from("apple"));
                    assert_eq!(out.field_at(1), Field::from("quince"));
                });
            });
        }
    }

    #[test]
    fn test_uniq_counts_distinct() {
        let function = create_aggregate_function("uniq", &[DataType::UInt64]).expect("uniq");
        let column = Column::UInt64(vec![1, 2, 2, 3, 1]);
        unsafe {
            with_state(function.as_ref(), |place| {
                for row in 0..5 {
                    function.add(place, &[&column], row).expect("add");
                }
                let mut out = Column::UInt64(Vec::new());
                function.insert_result(place, &mut out).expect("result");
                assert_eq!(out.field_at(0), Field::UInt64(3));
            });
        }
    }

    #[test]
    fn test_avg() {
        let function = create_aggregate_function("avg", &[DataType::Int64]).expect("avg");
        let column = Column::Int64(vec![2, 4]);
        unsafe {
            with_state(function.as_ref(), |place| {
                function.add(place, &[&column], 0).expect("add");
                function.add(place, &[&column], 1).expect("add");
                let mut out = Column::Float64(Vec::new());
                function.insert_result(place, &mut out).expect("result");
                assert_eq!(out.field_at(0), Field::Float64(3.0));
            });
        }
    }

    #[test]
    fn test_unknown_function_rejected() {
        assert!(create_aggregate_function("median", &[DataType::UInt64]).is_err());
    }
}
