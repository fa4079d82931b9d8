//! Predicates and the blocking wait API
//!
//! Every wait builds a [`Predicate`], hands it to the calling fiber by value,
//! and gives the processor back to the scheduler. The scheduler evaluates the
//! predicate once per cycle in its suspend phase; when it resolves the fiber
//! is marked `Running` and picks up its outcome on resume.
//!
//! Author: Moroya Sakamoto

use std::cell::Cell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId};
use crate::timer::Deadline;

/// Outcome of a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateState {
    /// Still waiting
    Active,
    /// The condition became true before the deadline
    Realized,
    /// The deadline passed first
    Fired,
}

/// Result of a completed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The condition was met
    Ready,
    /// The deadline passed first
    TimedOut,
}

impl WaitStatus {
    pub fn timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

/// What a suspended fiber is waiting for, besides its deadline
pub(crate) enum Condition {
    /// Nothing: only the deadline can wake the fiber
    Timeout,
    Custom(Box<dyn FnMut(&Fiber) -> bool>),
    VarEquals(Box<dyn Fn() -> bool>),
    /// The fiber with this id left the scheduler table
    Join(FiberId),
}

pub(crate) struct Predicate {
    deadline: Option<Deadline>,
    condition: Condition,
    state: PredicateState,
}

impl Predicate {
    pub fn new(deadline: Option<Deadline>, condition: Condition) -> Self {
        Self {
            deadline,
            condition,
            state: PredicateState::Active,
        }
    }

    pub fn state(&self) -> PredicateState {
        self.state
    }

    /// Evaluate at logical time `now`. Returns true when the fiber must wake.
    ///
    /// The deadline is checked first, so a condition that becomes true on the
    /// same cycle the deadline passes still reports `Fired`.
    pub fn evaluate(&mut self, fiber: &Fiber, now: u64, registered: impl Fn(FiberId) -> bool) -> bool {
        if self.state != PredicateState::Active {
            return true;
        }
        if self.deadline.map_or(false, |d| d.is_expired(now)) {
            self.state = PredicateState::Fired;
            return true;
        }
        let met = match &mut self.condition {
            Condition::Timeout => false,
            Condition::Custom(test) => test(fiber),
            Condition::VarEquals(test) => test(),
            Condition::Join(target) => !registered(*target),
        };
        if met {
            self.state = PredicateState::Realized;
        }
        met
    }
}

impl Fiber {
    /// Give the processor back; the fiber runs again next cycle
    pub fn yield_now(&self) -> Result<()> {
        self.park(None).map(|_| ())
    }

    /// Sleep for `ms` milliseconds of logical time.
    ///
    /// `wait(0)` is a plain yield and reports `Ready`.
    pub fn wait(&self, ms: u64) -> Result<WaitStatus> {
        if ms == 0 {
            self.yield_now()?;
            return Ok(WaitStatus::Ready);
        }
        self.suspend_on(ms, Condition::Timeout)
    }

    /// Suspend until `test` returns true, or `ms` elapse (`0`: no deadline)
    pub fn wait_for_cond<F>(&self, ms: u64, test: F) -> Result<WaitStatus>
    where
        F: FnMut(&Fiber) -> bool + 'static,
    {
        self.suspend_on(ms, Condition::Custom(Box::new(test)))
    }

    /// Suspend until `var` holds `value`, or `ms` elapse (`0`: no deadline)
    pub fn wait_for_var<T>(&self, ms: u64, var: &Rc<Cell<T>>, value: T) -> Result<WaitStatus>
    where
        T: Copy + PartialEq + 'static,
    {
        let var = Rc::clone(var);
        self.suspend_on(ms, Condition::VarEquals(Box::new(move || var.get() == value)))
    }

    /// Suspend until `other` has finished and left the scheduler, or `ms`
    /// elapse (`0`: no deadline).
    ///
    /// A target that was never started (or lives on another scheduler) costs
    /// one yield and reports `NoSuchFiber`.
    pub fn join(&self, ms: u64, other: &Fiber) -> Result<WaitStatus> {
        let target = match other.id() {
            Some(id) if self.same_scheduler(other) => id,
            _ => {
                self.yield_now()?;
                return Err(Error::NoSuchFiber);
            }
        };
        self.suspend_on(ms, Condition::Join(target))
    }

    fn suspend_on(&self, ms: u64, condition: Condition) -> Result<WaitStatus> {
        let deadline = match (ms, self.shared()) {
            (0, _) | (_, None) => None,
            (ms, Some(shared)) => Some(Deadline::after(shared.now(), ms)),
        };
        match self.park(Some(Predicate::new(deadline, condition)))? {
            Some(PredicateState::Fired) => Ok(WaitStatus::TimedOut),
            _ => Ok(WaitStatus::Ready),
        }
    }
}
