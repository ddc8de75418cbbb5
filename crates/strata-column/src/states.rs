//! The aggregate-state column.
//!
//! Holds one pointer per row into arena-allocated aggregate-state
//! memory. The column does not own that memory; it co-owns the arenas
//! (and whatever destroys non-trivial states) through opaque
//! [`StateOwner`] handles, so states stay alive exactly as long as any
//! column or aggregation result referencing them.

use std::any::Any;
use std::sync::Arc;

use strata_error::{Result, StrataError};

use crate::vec_ops::permuted_len;

/// A pointer to one group's aggregate-state blob inside an arena.
///
/// The pointee is valid for as long as the owning [`StateOwner`] is
/// alive; the aggregation layer guarantees no mutation happens after a
/// pointer has been published into a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePtr(pub *mut u8);

// Published state pointers are only read (finalize/merge) and the arena
// they point into is kept alive by the owner handles below.
unsafe impl Send for StatePtr {}
unsafe impl Sync for StatePtr {}

impl Default for StatePtr {
    fn default() -> Self {
        Self::null()
    }
}

impl StatePtr {
    #[must_use]
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Shared-ownership handle keeping state memory (and its destructor
/// logic) alive. The concrete type lives in the aggregation layer.
pub type StateOwner = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct StatesColumn {
    states: Vec<StatePtr>,
    owners: Vec<StateOwner>,
}

impl std::fmt::Debug for StatesColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatesColumn")
            .field("rows", &self.states.len())
            .field("owners", &self.owners.len())
            .finish()
    }
}

impl StatesColumn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.states.len() * std::mem::size_of::<StatePtr>()
    }

    #[must_use]
    pub fn state_at(&self, i: usize) -> StatePtr {
        self.states[i]
    }

    pub fn push(&mut self, state: StatePtr) {
        self.states.push(state);
    }

    pub fn reserve(&mut self, rows: usize) {
        self.states.reserve(rows);
    }

    pub fn resize(&mut self, rows: usize) {
        self.states.resize(rows, StatePtr::null());
    }

    pub fn set(&mut self, i: usize, state: StatePtr) {
        self.states[i] = state;
    }

    /// Attach an ownership handle; idempotent per handle identity.
    pub fn add_owner(&mut self, owner: StateOwner) {
        if !self.owners.iter().any(|o| Arc::ptr_eq(o, &owner)) {
            self.owners.push(owner);
        }
    }

    #[must_use]
    pub fn owners(&self) -> &[StateOwner] {
        &self.owners
    }

    pub fn insert_from(&mut self, src: &Self, i: usize) {
        self.states.push(src.states[i]);
        for owner in &src.owners {
            self.add_owner(Arc::clone(owner));
        }
    }

    pub fn cut(&self, start: usize, length: usize) -> Self {
        Self {
            states: self.states[start..start + length].to_vec(),
            owners: self.owners.clone(),
        }
    }

    pub fn filter(&self, mask: &[u8]) -> Result<Self> {
        if mask.len() != self.states.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and filter",
                left: self.states.len(),
                right: mask.len(),
            });
        }
        let states = self
            .states
            .iter()
            .zip(mask.iter())
            .filter(|(_, &m)| m != 0)
            .map(|(&s, _)| s)
            .collect();
        Ok(Self {
            states,
            owners: self.owners.clone(),
        })
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Self> {
        let out_len = permuted_len(self.states.len(), perm, limit)?;
        let states = perm[..out_len].iter().map(|&p| self.states[p]).collect();
        Ok(Self {
            states,
            owners: self.owners.clone(),
        })
    }

    pub fn replicate(&self, offsets: &[u64]) -> Result<Self> {
        if offsets.len() != self.states.len() {
            return Err(StrataError::SizesMismatch {
                what: "column and replicate offsets",
                left: self.states.len(),
                right: offsets.len(),
            });
        }
        let mut states = Vec::with_capacity(offsets.last().copied().unwrap_or(0) as usize);
        let mut prev = 0_u64;
        for (i, &off) in offsets.iter().enumerate() {
            for _ in prev..off {
                states.push(self.states[i]);
            }
            prev = off;
        }
        Ok(Self {
            states,
            owners: self.owners.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_dedup() {
        let owner: StateOwner = Arc::new(42_u64);
        let mut col = StatesColumn::new();
        col.add_owner(Arc::clone(&owner));
        col.add_owner(owner);
        assert_eq!(col.owners().len(), 1);
    }

    #[test]
    fn test_index_ops() {
        let mut col = StatesColumn::new();
        let a = StatePtr(0x10 as *mut u8);
        let b = StatePtr(0x20 as *mut u8);
        col.push(a);
        col.push(b);
        let cut = col.cut(1, 1);
        assert_eq!(cut.state_at(0), b);
        let filtered = col.filter(&[0, 1]).expect("filter");
        assert_eq!(filtered.state_at(0), b);
    }
}
