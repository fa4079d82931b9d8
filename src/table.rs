//! Fiber table: fixed-capacity registry with generational ids
//!
//! Slots are reused, ids are not: a slot's generation is bumped on removal.
//! Iteration follows registration order so every scheduler phase visits
//! fibers first-come first-served.
//!
//! Author: Moroya Sakamoto

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, FiberState};

struct Slot {
    generation: u32,
    fiber: Option<Fiber>,
}

pub(crate) struct FiberTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<FiberId>,
    capacity: usize,
}

impl FiberTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn insert(&mut self, fiber: Fiber) -> Result<FiberId> {
        if self.is_full() {
            return Err(Error::TooManyFibers(self.capacity));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    fiber: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.fiber = Some(fiber);
        let id = FiberId::new(index, slot.generation);
        self.order.push(id);
        Ok(id)
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.fiber.as_ref())
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: FiberId) -> Option<Fiber> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let fiber = slot.fiber.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.order.retain(|&other| other != id);
        Some(fiber)
    }

    /// Registered fibers, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Fiber> + '_ {
        self.order.iter().filter_map(move |&id| self.get(id))
    }

    /// Snapshot of the fibers currently in `state`, oldest first
    pub fn in_state(&self, state: FiberState) -> Vec<Fiber> {
        self.iter().filter(|f| f.state() == state).cloned().collect()
    }

    /// Empty the table, handing back every fiber
    pub fn drain(&mut self) -> Vec<Fiber> {
        let fibers = self.iter().cloned().collect();
        for slot in &mut self.slots {
            if slot.fiber.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.order.clear();
        fibers
    }
}
