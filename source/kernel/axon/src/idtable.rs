// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Dense, reusable id tables backing the process, thread and channel registries
//! OWNERS: @kernel-team
//! PUBLIC API: IdTable (with_capacity/insert/get/get_mut/remove/iter), IdError
//! INVARIANTS: Ids start at 1; lookup is O(1); a freed id resolves to `None` until reused

extern crate alloc;

use alloc::vec::Vec;

/// Errors produced when allocating ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Every slot is occupied.
    #[error("id table exhausted")]
    Exhausted,
}

/// Fixed-capacity table handing out the lowest free id.
#[derive(Debug, Clone)]
pub struct IdTable<T> {
    slots: Vec<Option<T>>,
    used: usize,
}

impl<T> IdTable<T> {
    /// Creates an empty table holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, used: 0 }
    }

    /// Stores `value` under the lowest free id.
    pub fn insert(&mut self, value: T) -> Result<u32, IdError> {
        self.insert_with(|_| value)
    }

    /// Stores the value built from the id it will be stored under.
    pub fn insert_with(&mut self, make: impl FnOnce(u32) -> T) -> Result<u32, IdError> {
        let index = self.slots.iter().position(Option::is_none).ok_or(IdError::Exhausted)?;
        let id = (index + 1) as u32;
        self.slots[index] = Some(make(id));
        self.used += 1;
        Ok(id)
    }

    /// Returns the id the next `insert` would hand out.
    pub fn peek_free(&self) -> Option<u32> {
        self.slots.iter().position(Option::is_none).map(|index| (index + 1) as u32)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        Self::index(id).and_then(|index| self.slots.get(index)).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        Self::index(id).and_then(|index| self.slots.get_mut(index)).and_then(Option::as_mut)
    }

    /// Mutable access to two distinct entries at once.
    pub fn pair_mut(&mut self, a: u32, b: u32) -> Option<(&mut T, &mut T)> {
        let (ia, ib) = (Self::index(a)?, Self::index(b)?);
        if ia == ib || ia >= self.slots.len() || ib >= self.slots.len() {
            return None;
        }
        let (first, second) = if ia < ib {
            let (lo, hi) = self.slots.split_at_mut(ib);
            (&mut lo[ia], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(ia);
            (&mut hi[0], &mut lo[ib])
        };
        Some((first.as_mut()?, second.as_mut()?))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Frees `id`, returning its value.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let value = Self::index(id).and_then(|index| self.slots.get_mut(index)).and_then(Option::take);
        if value.is_some() {
            self.used -= 1;
        }
        value
    }

    /// Occupied entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| ((index + 1) as u32, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|value| ((index + 1) as u32, value)))
    }

    /// Occupied ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(id: u32) -> Option<usize> {
        (id as usize).checked_sub(1)
    }
}
