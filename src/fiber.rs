//! Fiber: a cooperatively scheduled task with its own stack
//!
//! A fiber is created in `Egg`, configured only while it is still an egg,
//! then handed to a scheduler (`Init`). From there the scheduler drives it:
//!
//! ```text
//! Egg ─start─▶ Init ─▶ Running ⇄ Suspend
//!                        │  └──stop──▶ Term ─▶ Done ─▶ removed
//!                        └─return─────────────▶ Done
//! ```
//!
//! `Fiber` is a cheap handle. The caller keeps one, the scheduler keeps one
//! while the fiber is registered, and the fiber body receives a borrow.
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use log::{debug, error, trace};

use crate::context::{self, Context, Stack, DEFAULT_STACK_SIZE};
use crate::error::{Error, Result};
use crate::predicate::{Predicate, PredicateState};
use crate::scheduler::{Scheduler, Shared};

/// Fiber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FiberState {
    /// Created, not attached to a scheduler yet
    Egg,
    /// Attached, waiting for its first cycle
    Init,
    /// Waiting for a predicate
    Suspend,
    /// Ready to run, or running
    Running,
    /// Asked to terminate
    Term,
    /// Finished; removed from the scheduler at the end of the cycle
    Done,
}

/// Scheduler-scoped fiber identifier.
///
/// The generation changes every time a table slot is reused, so a stale id
/// never matches a newer fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

impl FiberId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Fiber body and lifecycle callbacks. Each runs at most once.
pub type FiberFn = Box<dyn FnOnce(&Fiber)>;

#[derive(Default)]
struct Callbacks {
    init: Option<FiberFn>,
    term: Option<FiberFn>,
    done: Option<FiberFn>,
}

pub(crate) struct FiberCell {
    state: Cell<FiberState>,
    id: Cell<Option<FiberId>>,
    stack_size: Cell<Option<usize>>,
    entry: RefCell<Option<FiberFn>>,
    callbacks: RefCell<Callbacks>,
    extra: RefCell<Option<Rc<dyn Any>>>,
    scheduler: RefCell<Weak<Shared>>,
    stack: RefCell<Option<Stack>>,
    // One predicate at most, owned here for the length of one suspension
    predicate: RefCell<Option<Predicate>>,
    context: Context,
}

/// Handle to a fiber
#[derive(Clone)]
pub struct Fiber {
    cell: Rc<FiberCell>,
}

impl Fiber {
    /// Create a fiber in `Egg` state running `entry` once started
    pub fn new<F>(entry: F) -> Self
    where
        F: FnOnce(&Fiber) + 'static,
    {
        Self {
            cell: Rc::new(FiberCell {
                state: Cell::new(FiberState::Egg),
                id: Cell::new(None),
                stack_size: Cell::new(None),
                entry: RefCell::new(Some(Box::new(entry))),
                callbacks: RefCell::new(Callbacks::default()),
                extra: RefCell::new(None),
                scheduler: RefCell::new(Weak::new()),
                stack: RefCell::new(None),
                predicate: RefCell::new(None),
                context: Context::new(),
            }),
        }
    }

    /// Create a fiber carrying user data
    pub fn with_extra<F, T>(entry: F, extra: T) -> Self
    where
        F: FnOnce(&Fiber) + 'static,
        T: Any,
    {
        let fiber = Self::new(entry);
        *fiber.cell.extra.borrow_mut() = Some(Rc::new(extra));
        fiber
    }

    pub fn state(&self) -> FiberState {
        self.cell.state.get()
    }

    /// Id assigned by the scheduler at start
    pub fn id(&self) -> Option<FiberId> {
        self.cell.id.get()
    }

    /// Configured stack size, or the size actually allocated once started
    pub fn stack_size(&self) -> usize {
        self.cell.stack_size.get().unwrap_or(DEFAULT_STACK_SIZE)
    }

    pub fn extra(&self) -> Option<Rc<dyn Any>> {
        self.cell.extra.borrow().clone()
    }

    /// User data downcast to `T`
    pub fn extra_as<T: Any>(&self) -> Option<Rc<T>> {
        self.extra()?.downcast::<T>().ok()
    }

    /// Scheduler this fiber was started on, while it still exists
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.shared().map(Scheduler::from_shared)
    }

    /// Is the fiber present in its scheduler's table?
    pub fn is_registered(&self) -> bool {
        match (self.shared(), self.id()) {
            (Some(shared), Some(id)) => shared.contains(id),
            _ => false,
        }
    }

    /// Do both handles point at the same fiber?
    pub fn ptr_eq(&self, other: &Fiber) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn set_stack_size(&self, size: usize) -> Result<()> {
        self.require_egg()?;
        context::check_stack_size(size)?;
        self.cell.stack_size.set(Some(size));
        Ok(())
    }

    /// Called once, on the scheduler stack, right after the fiber turns `Running`
    pub fn set_init_func<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Fiber) + 'static,
    {
        self.require_egg()?;
        self.cell.callbacks.borrow_mut().init = Some(Box::new(f));
        Ok(())
    }

    /// Called once while the fiber is in `Term`
    pub fn set_term_func<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Fiber) + 'static,
    {
        self.require_egg()?;
        self.cell.callbacks.borrow_mut().term = Some(Box::new(f));
        Ok(())
    }

    /// Called once from `Done`, just before removal from the scheduler
    pub fn set_done_func<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Fiber) + 'static,
    {
        self.require_egg()?;
        self.cell.callbacks.borrow_mut().done = Some(Box::new(f));
        Ok(())
    }

    pub fn set_extra<T: Any>(&self, extra: T) -> Result<()> {
        self.require_egg()?;
        *self.cell.extra.borrow_mut() = Some(Rc::new(extra));
        Ok(())
    }

    /// Ask a suspended or running fiber to terminate.
    ///
    /// Only the state changes here; the scheduler runs the term and done
    /// callbacks on its next pass. A stopped fiber is never resumed.
    ///
    /// Its stack is freed without unwinding: values still owned by the
    /// fiber's frames (the entry closure's captures included) are leaked and
    /// their destructors never run. Fibers that own resources should be
    /// asked to return instead.
    pub fn stop(&self) -> Result<()> {
        let state = self.state();
        if state == FiberState::Egg {
            return Err(Error::IllegalState(state));
        }
        if !self.is_registered() {
            return Err(Error::NoSuchFiber);
        }
        match state {
            FiberState::Suspend | FiberState::Running => {
                self.terminate();
                debug!("{self} stopped while {state:?}");
                Ok(())
            }
            other => Err(Error::IllegalState(other)),
        }
    }

    /// Release the fiber. Only an egg or a finished fiber can be freed;
    /// anything else hands the handle back.
    pub fn free(self) -> core::result::Result<(), Fiber> {
        match self.state() {
            FiberState::Egg | FiberState::Done => {
                self.release();
                Ok(())
            }
            _ => Err(self),
        }
    }

    fn require_egg(&self) -> Result<()> {
        match self.state() {
            FiberState::Egg => Ok(()),
            other => Err(Error::IllegalState(other)),
        }
    }

    pub(crate) fn shared(&self) -> Option<Rc<Shared>> {
        self.cell.scheduler.borrow().upgrade()
    }

    pub(crate) fn same_scheduler(&self, other: &Fiber) -> bool {
        Weak::ptr_eq(&self.cell.scheduler.borrow(), &other.cell.scheduler.borrow())
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.cell.state.set(state);
    }

    pub(crate) fn requested_stack_size(&self) -> Option<usize> {
        self.cell.stack_size.get()
    }

    /// Bind the fiber to its scheduler: `Egg` → `Init`
    pub(crate) fn attach(&self, shared: &Rc<Shared>, id: FiberId, stack: Stack) {
        self.cell.stack_size.set(Some(stack.size()));
        *self.cell.stack.borrow_mut() = Some(stack);
        *self.cell.scheduler.borrow_mut() = Rc::downgrade(shared);
        self.cell.id.set(Some(id));
        self.set_state(FiberState::Init);
    }

    /// Prepare the first resumption point on the fiber's own stack
    pub(crate) fn install(&self) -> Result<()> {
        let stack = self.cell.stack.borrow();
        let stack = stack.as_ref().ok_or(Error::Failed("fiber has no stack"))?;
        let arg = Rc::as_ptr(&self.cell) as *const ();
        // SAFETY: the stack stays in this cell until `release`, which only
        // happens once the fiber can no longer be resumed, and the context
        // lives inside the Rc allocation so it never moves. The scheduler
        // table holds an Rc for as long as `fiber_main` may run.
        unsafe { self.cell.context.install(stack, fiber_main, arg) }
    }

    pub(crate) fn context(&self) -> &Context {
        &self.cell.context
    }

    pub(crate) fn take_predicate(&self) -> Option<Predicate> {
        self.cell.predicate.borrow_mut().take()
    }

    pub(crate) fn put_predicate(&self, predicate: Predicate) {
        *self.cell.predicate.borrow_mut() = Some(predicate);
    }

    pub(crate) fn terminate(&self) {
        self.take_predicate();
        self.set_state(FiberState::Term);
    }

    pub(crate) fn run_init_func(&self) {
        let f = self.cell.callbacks.borrow_mut().init.take();
        if let Some(f) = f {
            f(self);
        }
    }

    pub(crate) fn run_term_func(&self) {
        let f = self.cell.callbacks.borrow_mut().term.take();
        if let Some(f) = f {
            f(self);
        }
    }

    pub(crate) fn run_done_func(&self) {
        let f = self.cell.callbacks.borrow_mut().done.take();
        if let Some(f) = f {
            f(self);
        }
    }

    /// Drop everything tied to execution: stack, pending predicate, unrun body
    pub(crate) fn release(&self) {
        self.take_predicate();
        let entry = self.cell.entry.borrow_mut().take();
        drop(entry);
        let stack = self.cell.stack.borrow_mut().take();
        drop(stack);
    }

    /// Give the processor back to the scheduler, optionally suspended on
    /// `predicate`. Returns the predicate outcome once resumed.
    ///
    /// Only the scheduler's running fiber may call this. A fiber already in
    /// `Term` is not suspended again; it is simply never resumed.
    pub(crate) fn park(&self, predicate: Option<Predicate>) -> Result<Option<PredicateState>> {
        let state = self.state();
        let shared = match self.shared() {
            Some(shared) => shared,
            None if state == FiberState::Egg => return Err(Error::IllegalState(state)),
            None => return Err(Error::NoSuchFiber),
        };
        let id = self.id().ok_or(Error::NoSuchFiber)?;
        if !shared.contains(id) {
            return Err(Error::NoSuchFiber);
        }
        if shared.running() != Some(id) {
            error!("{self} tried to give up the processor while not running ({state:?})");
            return Err(Error::IllegalState(state));
        }

        let suspends = predicate.is_some() && state == FiberState::Running;
        if suspends {
            *self.cell.predicate.borrow_mut() = predicate;
            self.set_state(FiberState::Suspend);
        }

        let main: *const Context = shared.main_context();
        drop(shared);
        trace!("{self} yielding");
        // SAFETY: the scheduler resumed us from inside `cycle`, which keeps
        // its Shared (and thus the main context) alive and in place.
        if let Err(err) = unsafe { Context::transfer(&self.cell.context, &*main) } {
            if suspends {
                self.take_predicate();
                self.set_state(FiberState::Running);
            }
            return Err(err);
        }
        trace!("{self} resumed");
        Ok(self.take_predicate().map(|p| p.state()))
    }

    fn run_entry(&self) {
        let entry = self.cell.entry.borrow_mut().take();
        if let Some(entry) = entry {
            // Unwinding must stop here, it cannot cross the context boundary
            if panic::catch_unwind(AssertUnwindSafe(|| entry(self))).is_err() {
                error!("{self} panicked, terminating");
                self.set_state(FiberState::Term);
                return;
            }
        }
        if self.state() != FiberState::Term {
            self.set_state(FiberState::Done);
        }
        debug!("{self} returned, now {:?}", self.state());
    }

    fn finish(&self) -> ! {
        if let Some(shared) = self.shared() {
            let main: *const Context = shared.main_context();
            drop(shared);
            // SAFETY: as in `park`; the scheduler is inside `cycle`
            let _ = unsafe { Context::transfer(&self.cell.context, &*main) };
        }
        error!("{self} resumed after its body returned");
        std::process::abort();
    }
}

/// First frame on every fiber stack
extern "C" fn fiber_main(hi: u32, lo: u32) {
    let cell = context::join_ptr(hi, lo) as *const FiberCell;
    // SAFETY: `install` passed Rc::as_ptr of a cell the scheduler table keeps
    // alive while this fiber can run. ManuallyDrop leaves the count untouched.
    let fiber = ManuallyDrop::new(Fiber {
        cell: unsafe { Rc::from_raw(cell) },
    });
    fiber.run_entry();
    fiber.finish();
}

impl fmt::Display for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "fiber {id}"),
            None => f.write_str("fiber <egg>"),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}
