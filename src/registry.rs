//! Dense registry with generational handles.
//!
//! Every entity collection in the store (blocks, nodes, objects, labels and
//! the annotation kinds hanging off them) lives in a [`Registry`]. Values are
//! kept in one contiguous vector so the position of an entity is its dense
//! index (the number written to files as a cross-reference). Removal is
//! swap-and-pop; the registry fixes up the displaced entry's slot itself, so
//! callers never maintain stored indices by hand.
//!
//! ```text
//!  slots:  [0: gen 2 → pos 1] [1: gen 0 → pos 0] [2: gen 1 → free]
//!  dense:  [(slot 1, B)] [(slot 0, A)]
//! ```

use crate::model::Handle;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    position: Option<u32>,
}

/// Arena of `T` addressed by handles of type `H`, stored densely.
#[derive(Debug, Clone)]
pub struct Registry<H, T> {
    dense: Vec<(H, T)>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl<H: Handle, T> Default for Registry<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Handle, T> Registry<H, T> {
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Append `value` at the end of the dense array and return its handle.
    pub fn insert(&mut self, value: T) -> H {
        let position = self.dense.len() as u32;
        let handle = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.position = Some(position);
                H::from_parts(slot, entry.generation)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, position: Some(position) });
                H::from_parts(slot, 0)
            }
        };
        self.dense.push((handle, value));
        handle
    }

    /// Swap-and-pop `handle` out of the registry.
    ///
    /// The entry that used to be last takes over the removed position.
    pub fn remove(&mut self, handle: H) -> Option<T> {
        let position = self.position(handle)?;
        let (_, value) = self.dense.swap_remove(position);
        if let Some((moved, _)) = self.dense.get(position) {
            self.slots[moved.slot() as usize].position = Some(position as u32);
        }
        let slot = &mut self.slots[handle.slot() as usize];
        slot.position = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot());
        Some(value)
    }

    #[inline]
    fn position(&self, handle: H) -> Option<usize> {
        let slot = self.slots.get(handle.slot() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.position.map(|p| p as usize)
    }

    #[inline]
    pub fn contains(&self, handle: H) -> bool {
        self.position(handle).is_some()
    }

    /// Dense index of `handle`, if it is live.
    #[inline]
    pub fn index_of(&self, handle: H) -> Option<usize> {
        self.position(handle)
    }

    #[inline]
    pub fn handle_at(&self, index: usize) -> Option<H> {
        self.dense.get(index).map(|(h, _)| *h)
    }

    #[inline]
    pub fn at(&self, index: usize) -> Option<&T> {
        self.dense.get(index).map(|(_, v)| v)
    }

    #[inline]
    pub fn get(&self, handle: H) -> Option<&T> {
        self.position(handle).map(|p| &self.dense[p].1)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.position(handle).map(|p| &mut self.dense[p].1)
    }

    /// Like [`get`](Self::get), reporting a stale handle as `NotFound`.
    pub fn try_get(&self, handle: H) -> Result<&T> {
        self.get(handle).ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    pub fn try_get_mut(&mut self, handle: H) -> Result<&mut T> {
        self.get_mut(handle).ok_or_else(|| Error::NotFound(handle.to_string()))
    }

    /// Entries in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> + '_ {
        self.dense.iter().map(|(h, v)| (*h, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut T)> + '_ {
        self.dense.iter_mut().map(|(h, v)| (*h, v))
    }

    /// Handles in dense order, collected so the registry can be mutated while
    /// walking them.
    pub fn handles(&self) -> Vec<H> {
        self.dense.iter().map(|(h, _)| *h).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.dense.iter().map(|(_, v)| v)
    }
}
