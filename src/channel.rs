//! Bounded FIFO channel between fibers
//!
//! Fixed capacity, fixed element type, never resized. Blocking `send` waits
//! for room and `recv` waits for data; both are predicate waits, so they
//! always give up the processor for at least one cycle.
//!
//! There is no close: producers and consumers agree on when to stop.
//!
//! Author: Moroya Sakamoto

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use log::trace;

use crate::error::Result;
use crate::fiber::Fiber;

struct Ring<T> {
    slots: Box<[Option<T>]>,
    /// Read cursor, never reset
    start: u64,
    /// Write cursor, never reset
    end: u64,
}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn slot(&self, cursor: u64) -> usize {
        (cursor % self.capacity() as u64) as usize
    }

    fn push(&mut self, value: T) -> core::result::Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let idx = self.slot(self.end);
        self.slots[idx] = Some(value);
        self.end += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.end == self.start {
            return None;
        }
        let idx = self.slot(self.start);
        let value = self.slots[idx].take();
        self.start += 1;
        value
    }
}

/// Bounded blocking FIFO. Clones refer to the same buffer.
pub struct Channel<T> {
    ring: Rc<RefCell<Ring<T>>>,
}

impl<T: 'static> Channel<T> {
    /// Channel holding up to `capacity` elements (at least one)
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| None).collect();
        Self {
            ring: Rc::new(RefCell::new(Ring {
                slots,
                start: 0,
                end: 0,
            })),
        }
    }

    /// Size of one element in bytes
    pub fn elem_size(&self) -> usize {
        mem::size_of::<T>()
    }

    pub fn capacity(&self) -> usize {
        self.ring.borrow().capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.ring.borrow().is_full()
    }

    /// Enqueue without waiting. A full channel hands the value back.
    pub fn try_send(&self, value: T) -> core::result::Result<(), T> {
        self.ring.borrow_mut().push(value)
    }

    /// Dequeue without waiting
    pub fn try_recv(&self) -> Option<T> {
        self.ring.borrow_mut().pop()
    }

    /// Enqueue `value`, suspending `fiber` until there is room
    pub fn send(&self, fiber: &Fiber, value: T) -> Result<()> {
        let mut value = value;
        loop {
            let ring = Rc::clone(&self.ring);
            fiber.wait_for_cond(0, move |_| !ring.borrow().is_full())?;
            // Another sender woken in the same cycle may have taken the slot
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    trace!("{fiber}: channel refilled before send, waiting again");
                    value = back;
                }
            }
        }
    }

    /// Dequeue the oldest element, suspending `fiber` until there is one
    pub fn recv(&self, fiber: &Fiber) -> Result<T> {
        loop {
            let ring = Rc::clone(&self.ring);
            fiber.wait_for_cond(0, move |_| ring.borrow().len() > 0)?;
            if let Some(value) = self.try_recv() {
                return Ok(value);
            }
            trace!("{fiber}: channel drained before recv, waiting again");
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Rc::clone(&self.ring),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.borrow();
        f.debug_struct("Channel")
            .field("capacity", &ring.capacity())
            .field("start", &ring.start)
            .field("end", &ring.end)
            .finish()
    }
}
