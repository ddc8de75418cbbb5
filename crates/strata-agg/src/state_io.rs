//! Aggregate-state columns on disk.
//!
//! Each row is one serialized state, length-prefixed. Reading restores
//! the states into a fresh arena; the returned column co-owns that
//! arena (and the destructor walk) through its owner handle.

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_column::{Column, StatePtr, StatesColumn};
use strata_error::{Result, StrataError};
use strata_types::codec::write_varuint;

use crate::arena::Arena;
use crate::function::AggregateFunction;

const MAX_STATE_SIZE: usize = 1 << 28;

/// Owns restored (or merge-produced) states: the arena plus the list of
/// states to destroy.
pub struct OwnedStates {
    arena: Arc<Arena>,
    function: Arc<dyn AggregateFunction>,
    states: Mutex<Vec<StatePtr>>,
}

// State pointers are read-only once published.
unsafe impl Send for OwnedStates {}
unsafe impl Sync for OwnedStates {}

impl OwnedStates {
    #[must_use]
    pub fn new(function: Arc<dyn AggregateFunction>) -> Self {
        Self {
            arena: Arc::new(Arena::new()),
            function,
            states: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[must_use]
    pub fn function(&self) -> &Arc<dyn AggregateFunction> {
        &self.function
    }

    /// Allocate and construct one fresh state, registering it for
    /// destruction with this owner.
    pub fn create_state(&self) -> Result<StatePtr> {
        let place = self
            .arena
            .alloc(self.function.state_size(), self.function.state_align());
        unsafe { self.function.create(place)? };
        let ptr = StatePtr(place);
        self.states.lock().push(ptr);
        Ok(ptr)
    }
}

impl Drop for OwnedStates {
    fn drop(&mut self) {
        if self.function.has_trivial_destructor() {
            return;
        }
        for state in self.states.lock().drain(..) {
            unsafe { self.function.destroy(state.0) };
        }
    }
}

/// Serialize rows `offset .. offset + count` of a state column.
pub fn serialize_states(
    states: &StatesColumn,
    function: &dyn AggregateFunction,
    offset: usize,
    count: usize,
    out: &mut impl Write,
) -> Result<()> {
    let mut buf = Vec::new();
    for row in offset..offset + count {
        buf.clear();
        let state = states.state_at(row);
        if state.is_null() {
            return Err(StrataError::logical("null state pointer during serialization"));
        }
        unsafe { function.serialize_state(state.0, &mut buf)? };
        let mut prefix = Vec::with_capacity(10);
        write_varuint(&mut prefix, buf.len() as u64)?;
        out.write_all(&prefix)?;
        out.write_all(&buf)?;
    }
    Ok(())
}

/// Deserialize up to `max_rows` states; stops on clean end of stream.
pub fn deserialize_states(
    function: &Arc<dyn AggregateFunction>,
    max_rows: usize,
    input: &mut impl Read,
) -> Result<Column> {
    let owner = Arc::new(OwnedStates::new(Arc::clone(function)));
    let mut column = StatesColumn::new();

    for _ in 0..max_rows {
        let Some(len) = try_read_varuint(input)? else {
            break;
        };
        let len = len as usize;
        if len > MAX_STATE_SIZE {
            return Err(StrataError::CorruptedData {
                detail: format!("state blob of {len} bytes exceeds bound"),
            });
        }
        let mut blob = vec![0_u8; len];
        input.read_exact(&mut blob)?;

        let state = owner.create_state()?;
        let mut reader: &[u8] = &blob;
        unsafe { function.deserialize_state(state.0, &mut reader)? };
        column.push(state);
    }

    column.add_owner(owner);
    Ok(Column::AggregateStates(column))
}

/// Read a varint or report a clean end before its first byte.
fn try_read_varuint(input: &mut impl Read) -> Result<Option<u64>> {
    let mut first = [0_u8; 1];
    loop {
        match input.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let mut value = u64::from(first[0] & 0x7F);
    if first[0] & 0x80 == 0 {
        return Ok(Some(value));
    }
    let mut shift = 7_u32;
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
            return Ok(Some(value));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::create_aggregate_function;
    use std::io::Cursor;
    use strata_types::{DataType, Field};

    #[test]
    fn test_state_column_roundtrip() {
        let function = create_aggregate_function("sum", &[DataType::UInt64]).expect("sum");
        let owner = Arc::new(OwnedStates::new(Arc::clone(&function)));
        let column = Column::UInt64(vec![5, 7, 11]);

        let mut states = StatesColumn::new();
        for row in 0..3 {
            let state = owner.create_state().expect("create");
            unsafe { function.add(state.0, &[&column], row).expect("add") };
            states.push(state);
        }

        let mut bytes = Vec::new();
        serialize_states(&states, function.as_ref(), 0, 3, &mut bytes).expect("serialize");

        let restored = deserialize_states(&function, 10, &mut Cursor::new(bytes)).expect("read");
        let restored_states = restored.as_states().expect("states");
        assert_eq!(restored_states.len(), 3);

        let mut out = Column::UInt64(Vec::new());
        for row in 0..3 {
            unsafe {
                function
                    .insert_result(restored_states.state_at(row).0, &mut out)
                    .expect("result");
            }
        }
        assert_eq!(out.field_at(0), Field::UInt64(5));
        assert_eq!(out.field_at(2), Field::UInt64(11));
    }

    #[test]
    fn test_uniq_state_roundtrip_preserves_set() {
        let function = create_aggregate_function("uniq", &[DataType::String]).expect("uniq");
        let owner = Arc::new(OwnedStates::new(Arc::clone(&function)));
        let mut s = strata_column::StringColumn::new();
        for v in ["a", "b", "a", "c"] {
            s.push(v.as_bytes());
        }
        let column = Column::String(s);

        let state = owner.create_state().expect("create");
        for row in 0..4 {
            unsafe { function.add(state.0, &[&column], row).expect("add") };
        }
        let mut states = StatesColumn::new();
        states.push(state);

        let mut bytes = Vec::new();
        serialize_states(&states, function.as_ref(), 0, 1, &mut bytes).expect("serialize");
        let restored = deserialize_states(&function, 1, &mut Cursor::new(bytes)).expect("read");

        let mut out = Column::UInt64(Vec::new());
        unsafe {
            function
                .insert_result(restored.as_states().expect("states").state_at(0).0, &mut out)
                .expect("result");
        }
        assert_eq!(out.field_at(0), Field::UInt64(3));
    }
}
