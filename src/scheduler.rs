//! Cooperative fiber scheduler
//!
//! One call to [`Scheduler::cycle`] processes every registered fiber once,
//! in five fixed phases:
//!
//! 1. `Init` → `Running`: install the fiber on its stack, run its init callback
//! 2. `Suspend`: evaluate predicates, wake the fibers whose wait resolved
//! 3. `Running`: transfer control to each running fiber in turn
//! 4. `Term` → `Done`: run term callbacks
//! 5. `Done`: run done callbacks, drop the fiber from the table, free its stack
//!
//! Every phase visits fibers in registration order (strict FIFO) and works
//! on a snapshot taken when the phase starts: a fiber started during a cycle
//! waits for the next one. The logical timestamp passed to `cycle` is the
//! only clock fibers see while the cycle runs.
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use log::{debug, error, info, trace, warn};

use crate::config::SchedulerConfig;
use crate::context::{Context, Stack};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, FiberState};
use crate::table::FiberTable;

/// Pre/post cycle hook
pub type CycleHook = Box<dyn FnMut(&Scheduler)>;

/// Counters since the scheduler was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Cycles run
    pub cycles: u64,
    /// Fibers started
    pub started: u64,
    /// Fibers that went all the way to removal
    pub completed: u64,
}

#[derive(Default)]
struct Hooks {
    pre: Option<CycleHook>,
    post: Option<CycleHook>,
}

struct Core {
    table: FiberTable,
    /// Fiber currently holding the processor, only set during dispatch
    running: Option<FiberId>,
    /// Logical time of the current (or last) cycle
    now: u64,
    stats: SchedulerStats,
}

pub(crate) struct Shared {
    core: RefCell<Core>,
    // Resumption point of the cycle loop; fibers transfer back here
    main: Context,
    cycling: Cell<bool>,
    hooks: RefCell<Hooks>,
    extra: RefCell<Option<Rc<dyn Any>>>,
    config: SchedulerConfig,
}

impl Shared {
    pub(crate) fn contains(&self, id: FiberId) -> bool {
        self.core.borrow().table.contains(id)
    }

    pub(crate) fn running(&self) -> Option<FiberId> {
        self.core.borrow().running
    }

    pub(crate) fn now(&self) -> u64 {
        self.core.borrow().now
    }

    pub(crate) fn main_context(&self) -> &Context {
        &self.main
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Stacks go away with the scheduler; nothing is resumed or unwound
        for fiber in self.core.get_mut().table.drain() {
            fiber.release();
        }
    }
}

/// Handle to a scheduler. Clones share the same fibers.
///
/// When the last handle goes away, fibers still registered are dropped
/// without being resumed. Their stacks are unmapped without unwinding, so
/// whatever their frames own is leaked, as with [`Fiber::stop`].
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                core: RefCell::new(Core {
                    table: FiberTable::with_capacity(config.max_fibers),
                    running: None,
                    now: 0,
                    stats: SchedulerStats::default(),
                }),
                main: Context::new(),
                cycling: Cell::new(false),
                hooks: RefCell::new(Hooks::default()),
                extra: RefCell::new(None),
                config,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Attach an egg to this scheduler: allocate its stack, assign its id,
    /// move it to `Init`. It first runs on the next cycle.
    pub fn start(&self, fiber: &Fiber) -> Result<FiberId> {
        let state = fiber.state();
        if state != FiberState::Egg {
            return Err(Error::IllegalState(state));
        }
        {
            let core = self.shared.core.borrow();
            if core.table.is_full() {
                warn!("cannot start fiber: table full ({})", core.table.capacity());
                return Err(Error::TooManyFibers(core.table.capacity()));
            }
        }
        let size = fiber
            .requested_stack_size()
            .unwrap_or(self.shared.config.default_stack_size);
        let stack = Stack::new(size)?;

        let id = {
            let mut core = self.shared.core.borrow_mut();
            let id = core.table.insert(fiber.clone())?;
            core.stats.started += 1;
            id
        };
        fiber.attach(&self.shared, id, stack);
        debug!("{fiber} started with a {size} byte stack");
        Ok(id)
    }

    /// Run one scheduling cycle at logical time `now` (milliseconds).
    ///
    /// A timestamp older than the previous cycle's is clamped to it.
    /// Calling `cycle` from inside a cycle (from a fiber or a hook) is refused.
    pub fn cycle(&self, now: u64) {
        if self.shared.cycling.replace(true) {
            warn!("scheduler is already cycling, nested cycle ignored");
            return;
        }
        let _guard = CycleGuard(&self.shared.cycling);

        let now = {
            let mut core = self.shared.core.borrow_mut();
            if now < core.now {
                debug!("cycle timestamp {now} went backwards, keeping {}", core.now);
            }
            core.now = core.now.max(now);
            core.stats.cycles += 1;
            core.now
        };
        trace!("cycle at {now} ms");

        self.run_hook(|hooks| &mut hooks.pre);
        self.boot_fibers();
        self.wake_fibers(now);
        self.dispatch();
        self.terminate_fibers();
        self.reap_fibers();
        self.run_hook(|hooks| &mut hooks.post);
    }

    /// Terminate every started fiber. Callbacks run and fibers leave the
    /// table on the next cycle. Returns how many fibers were stopped.
    pub fn stop(&self) -> usize {
        let fibers: Vec<Fiber> = self.shared.core.borrow().table.iter().cloned().collect();
        let mut stopped = 0;
        for fiber in fibers {
            if matches!(
                fiber.state(),
                FiberState::Init | FiberState::Suspend | FiberState::Running
            ) {
                fiber.terminate();
                stopped += 1;
            }
        }
        info!("scheduler stop: {stopped} fibers terminating");
        stopped
    }

    /// Number of registered fibers
    pub fn numfibers(&self) -> usize {
        self.shared.core.borrow().table.len()
    }

    /// Install pre/post cycle hooks, replacing any previous ones
    pub fn set_hooks(&self, pre: Option<CycleHook>, post: Option<CycleHook>) {
        let mut hooks = self.shared.hooks.borrow_mut();
        hooks.pre = pre;
        hooks.post = post;
    }

    pub fn set_extra<T: Any>(&self, extra: T) {
        *self.shared.extra.borrow_mut() = Some(Rc::new(extra));
    }

    pub fn extra(&self) -> Option<Rc<dyn Any>> {
        self.shared.extra.borrow().clone()
    }

    pub fn extra_as<T: Any>(&self) -> Option<Rc<T>> {
        self.extra()?.downcast::<T>().ok()
    }

    /// Logical time of the current or last cycle
    pub fn now(&self) -> u64 {
        self.shared.now()
    }

    /// Fiber holding the processor, if called from inside a fiber
    pub fn running(&self) -> Option<FiberId> {
        self.shared.running()
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.shared.contains(id)
    }

    /// Look up a registered fiber
    pub fn fiber(&self, id: FiberId) -> Option<Fiber> {
        self.shared.core.borrow().table.get(id).cloned()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.core.borrow().stats
    }

    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    fn fibers_in(&self, state: FiberState) -> Vec<Fiber> {
        self.shared.core.borrow().table.in_state(state)
    }

    fn run_hook(&self, pick: fn(&mut Hooks) -> &mut Option<CycleHook>) {
        let hook = pick(&mut self.shared.hooks.borrow_mut()).take();
        if let Some(mut hook) = hook {
            hook(self);
            let mut hooks = self.shared.hooks.borrow_mut();
            let slot = pick(&mut hooks);
            // set_hooks from inside the hook wins
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn boot_fibers(&self) {
        for fiber in self.fibers_in(FiberState::Init) {
            if fiber.state() != FiberState::Init {
                continue;
            }
            if let Err(err) = fiber.install() {
                error!("{fiber}: install failed: {err}");
                fiber.set_state(FiberState::Term);
                continue;
            }
            fiber.set_state(FiberState::Running);
            debug!("{fiber} installed");
            fiber.run_init_func();
        }
    }

    fn wake_fibers(&self, now: u64) {
        for fiber in self.fibers_in(FiberState::Suspend) {
            if fiber.state() != FiberState::Suspend {
                continue;
            }
            let Some(mut predicate) = fiber.take_predicate() else {
                fiber.set_state(FiberState::Running);
                continue;
            };
            let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
                predicate.evaluate(&fiber, now, |id| self.shared.contains(id))
            }));
            let Ok(wake) = evaluated else {
                error!("{fiber}: wait test panicked, terminating");
                fiber.terminate();
                continue;
            };
            // The test itself may have stopped the fiber
            if fiber.state() != FiberState::Suspend {
                continue;
            }
            fiber.put_predicate(predicate);
            if wake {
                trace!("{fiber} woken");
                fiber.set_state(FiberState::Running);
            }
        }
    }

    fn dispatch(&self) {
        for fiber in self.fibers_in(FiberState::Running) {
            if fiber.state() != FiberState::Running {
                continue;
            }
            let Some(id) = fiber.id() else {
                continue;
            };
            self.shared.core.borrow_mut().running = Some(id);
            trace!("switching to {fiber}");
            // SAFETY: a running fiber was installed in the boot phase and its
            // stack lives until the done phase. No RefCell borrow is held.
            let switched = unsafe { Context::transfer(&self.shared.main, fiber.context()) };
            self.shared.core.borrow_mut().running = None;

            match (switched, fiber.state()) {
                (Err(err), _) => {
                    error!("{fiber}: switch failed: {err}");
                    fiber.terminate();
                }
                (Ok(()), FiberState::Done) => debug!("{fiber} finished"),
                (Ok(()), FiberState::Term) => debug!("{fiber} terminated while running"),
                (Ok(()), state) => trace!("{fiber} gave up the processor ({state:?})"),
            }
        }
    }

    fn terminate_fibers(&self) {
        for fiber in self.fibers_in(FiberState::Term) {
            if fiber.state() != FiberState::Term {
                continue;
            }
            fiber.run_term_func();
            fiber.set_state(FiberState::Done);
        }
    }

    fn reap_fibers(&self) {
        for fiber in self.fibers_in(FiberState::Done) {
            fiber.run_done_func();
            if let Some(id) = fiber.id() {
                let mut core = self.shared.core.borrow_mut();
                if core.table.remove(id).is_some() {
                    core.stats.completed += 1;
                }
            }
            fiber.release();
            debug!("{fiber} removed");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.borrow();
        f.debug_struct("Scheduler")
            .field("numfibers", &core.table.len())
            .field("now", &core.now)
            .field("stats", &core.stats)
            .finish()
    }
}

struct CycleGuard<'a>(&'a Cell<bool>);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::WaitStatus;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn spawn<F: FnOnce(&Fiber) + 'static>(sched: &Scheduler, entry: F) -> Fiber {
        let fiber = Fiber::new(entry);
        sched.start(&fiber).unwrap();
        fiber
    }

    #[test]
    fn test_empty_cycle() {
        let sched = Scheduler::new();
        sched.cycle(0);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(sched.stats().cycles, 1);
    }

    #[test]
    fn test_start_assigns_id() {
        let sched = Scheduler::new();
        let fiber = Fiber::new(|_| {});
        let id = sched.start(&fiber).unwrap();
        assert_eq!(fiber.id(), Some(id));
        assert_eq!(fiber.state(), FiberState::Init);
        assert!(fiber.is_registered());
        assert!(fiber.scheduler().unwrap().ptr_eq(&sched));
        assert!(sched.fiber(id).unwrap().ptr_eq(&fiber));
        assert_eq!(sched.start(&fiber), Err(Error::IllegalState(FiberState::Init)));
    }

    #[test]
    fn test_yield_lifetime() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |f| {
            f.yield_now().unwrap();
            f.yield_now().unwrap();
        });
        sched.cycle(0);
        assert_eq!(sched.numfibers(), 1);
        assert_eq!(fiber.state(), FiberState::Running);
        sched.cycle(1);
        assert_eq!(sched.numfibers(), 1);
        sched.cycle(2);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(fiber.state(), FiberState::Done);
        assert!(!fiber.is_registered());
        assert!(fiber.free().is_ok());
    }

    #[test]
    fn test_wait_times_out() {
        let sched = Scheduler::new();
        let status = Rc::new(Cell::new(None));
        let out = Rc::clone(&status);
        let fiber = spawn(&sched, move |f| out.set(Some(f.wait(1000))));

        sched.cycle(0);
        assert_eq!(fiber.state(), FiberState::Suspend);
        sched.cycle(500);
        sched.cycle(999);
        assert_eq!(sched.numfibers(), 1);
        assert_eq!(status.get(), None);

        sched.cycle(1000);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(status.get(), Some(Ok(WaitStatus::TimedOut)));
    }

    #[test]
    fn test_wait_zero_is_yield() {
        let sched = Scheduler::new();
        let status = Rc::new(Cell::new(None));
        let out = Rc::clone(&status);
        let fiber = spawn(&sched, move |f| out.set(Some(f.wait(0))));
        sched.cycle(0);
        assert_eq!(fiber.state(), FiberState::Running);
        sched.cycle(0);
        assert_eq!(status.get(), Some(Ok(WaitStatus::Ready)));
    }

    #[test]
    fn test_wait_for_var_timeout() {
        let sched = Scheduler::new();
        let var = Rc::new(Cell::new(0));
        let status = Rc::new(Cell::new(None));
        let (v, out) = (Rc::clone(&var), Rc::clone(&status));
        spawn(&sched, move |f| {
            let target = v.get() + 1;
            out.set(Some(f.wait_for_var(1000, &v, target)));
        });
        sched.cycle(0);
        sched.cycle(500);
        assert_eq!(sched.numfibers(), 1);
        sched.cycle(1000);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(status.get(), Some(Ok(WaitStatus::TimedOut)));
    }

    #[test]
    fn test_wait_for_var_realized() {
        let sched = Scheduler::new();
        let var = Rc::new(Cell::new(0));
        let status = Rc::new(Cell::new(None));
        let (v, out) = (Rc::clone(&var), Rc::clone(&status));
        spawn(&sched, move |f| {
            let target = v.get() + 1;
            out.set(Some(f.wait_for_var(1000, &v, target)));
        });
        sched.cycle(0);
        sched.cycle(100);
        assert_eq!(sched.numfibers(), 1);
        var.set(var.get() + 1);
        sched.cycle(200);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(status.get(), Some(Ok(WaitStatus::Ready)));
    }

    #[test]
    fn test_wait_for_cond_without_deadline() {
        let sched = Scheduler::new();
        let polls = Rc::new(Cell::new(0u32));
        let p = Rc::clone(&polls);
        let fiber = spawn(&sched, move |f| {
            let status = f.wait_for_cond(0, move |_| {
                p.set(p.get() + 1);
                p.get() >= 3
            });
            assert_eq!(status, Ok(WaitStatus::Ready));
        });
        sched.cycle(0);
        sched.cycle(1_000_000);
        sched.cycle(2_000_000);
        assert_eq!(fiber.state(), FiberState::Suspend);
        sched.cycle(3_000_000);
        assert_eq!(polls.get(), 3);
        assert_eq!(fiber.state(), FiberState::Done);
    }

    #[test]
    fn test_spawn_and_join() {
        let sched = Scheduler::new();
        let child_slot: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));
        let joined = Rc::new(Cell::new(None));
        let (slot, out) = (Rc::clone(&child_slot), Rc::clone(&joined));

        let parent = spawn(&sched, move |f| {
            let child = Fiber::new(|c| {
                let _ = c.yield_now();
            });
            f.scheduler().unwrap().start(&child).unwrap();
            *slot.borrow_mut() = Some(child.clone());
            f.yield_now().unwrap();
            out.set(Some(f.join(0, &child)));
        });

        sched.cycle(0);
        let child = child_slot.borrow().clone().unwrap();
        assert_eq!(parent.state(), FiberState::Running);
        assert_eq!(child.state(), FiberState::Init);
        assert_eq!(sched.numfibers(), 2);

        sched.cycle(1);
        assert_eq!(parent.state(), FiberState::Suspend);
        assert_eq!(child.state(), FiberState::Running);
        assert_eq!(sched.numfibers(), 2);

        sched.cycle(2);
        assert_eq!(child.state(), FiberState::Done);
        assert_eq!(parent.state(), FiberState::Suspend);
        assert_eq!(sched.numfibers(), 1);

        sched.cycle(3);
        assert_eq!(joined.get(), Some(Ok(WaitStatus::Ready)));
        assert_eq!(sched.numfibers(), 0);
    }

    #[test]
    fn test_join_unstarted_fiber() {
        let sched = Scheduler::new();
        let result = Rc::new(Cell::new(None));
        let out = Rc::clone(&result);
        spawn(&sched, move |f| {
            let egg = Fiber::new(|_| {});
            out.set(Some(f.join(0, &egg)));
        });
        sched.cycle(0);
        assert_eq!(result.get(), None);
        sched.cycle(1);
        assert_eq!(result.get(), Some(Err(Error::NoSuchFiber)));
    }

    #[test]
    fn test_stop_running_child_releases_joiner() {
        let sched = Scheduler::new();
        let child = spawn(&sched, |c| loop {
            if c.yield_now().is_err() {
                break;
            }
        });
        let target = child.clone();
        let joined = Rc::new(Cell::new(None));
        let out = Rc::clone(&joined);
        let parent = spawn(&sched, move |f| out.set(Some(f.join(0, &target))));

        sched.cycle(0);
        sched.cycle(1);
        assert_eq!(child.state(), FiberState::Running);
        assert_eq!(parent.state(), FiberState::Suspend);

        child.stop().unwrap();
        assert_eq!(child.state(), FiberState::Term);
        sched.cycle(2);
        assert_eq!(child.state(), FiberState::Done);
        assert_eq!(parent.state(), FiberState::Suspend);
        assert_eq!(sched.numfibers(), 1);

        sched.cycle(3);
        assert_eq!(joined.get(), Some(Ok(WaitStatus::Ready)));
        assert_eq!(sched.numfibers(), 0);
    }

    #[test]
    fn test_stop_suspended_fiber() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |f| {
            let _ = f.wait_for_cond(0, |_| false);
        });
        sched.cycle(0);
        assert_eq!(fiber.state(), FiberState::Suspend);
        assert!(fiber.clone().free().is_err());

        fiber.stop().unwrap();
        sched.cycle(1);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(fiber.state(), FiberState::Done);
        assert_eq!(fiber.stop(), Err(Error::NoSuchFiber));
    }

    #[test]
    fn test_stop_rejects_init() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |_| {});
        assert_eq!(fiber.stop(), Err(Error::IllegalState(FiberState::Init)));
    }

    #[test]
    fn test_configure_after_start() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |_| {});
        let illegal = Err(Error::IllegalState(FiberState::Init));
        assert_eq!(fiber.set_stack_size(32 * 1024), illegal);
        assert_eq!(fiber.set_init_func(|_| {}), illegal);
        assert_eq!(fiber.set_extra(1u8), illegal);
    }

    #[test]
    fn test_callback_order() {
        let sched = Scheduler::new();
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        let finished = {
            let (l, li, ld) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
            let fiber = Fiber::new(move |_| l.borrow_mut().push("body"));
            fiber.set_init_func(move |_| li.borrow_mut().push("init")).unwrap();
            fiber.set_term_func(|_| unreachable!()).unwrap();
            fiber.set_done_func(move |_| ld.borrow_mut().push("done")).unwrap();
            fiber
        };
        sched.start(&finished).unwrap();
        sched.cycle(0);
        assert_eq!(*log.borrow(), ["init", "body", "done"]);

        log.borrow_mut().clear();
        let stopped = {
            let (l, lt, ld) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
            let fiber = Fiber::new(move |f| {
                l.borrow_mut().push("body");
                let _ = f.wait_for_cond(0, |_| false);
                l.borrow_mut().push("never");
            });
            fiber.set_term_func(move |_| lt.borrow_mut().push("term")).unwrap();
            fiber.set_done_func(move |_| ld.borrow_mut().push("done")).unwrap();
            fiber
        };
        sched.start(&stopped).unwrap();
        sched.cycle(1);
        stopped.stop().unwrap();
        sched.cycle(2);
        assert_eq!(*log.borrow(), ["body", "term", "done"]);
    }

    #[test]
    fn test_panicking_fiber_terminates() {
        let sched = Scheduler::new();
        let termed = Rc::new(Cell::new(false));
        let t = Rc::clone(&termed);
        let fiber = Fiber::new(|_| panic!("boom"));
        fiber.set_term_func(move |_| t.set(true)).unwrap();
        sched.start(&fiber).unwrap();
        sched.cycle(0);
        assert!(termed.get());
        assert_eq!(fiber.state(), FiberState::Done);
        assert_eq!(sched.numfibers(), 0);
    }

    #[test]
    fn test_self_stop_never_resumes() {
        let sched = Scheduler::new();
        let after = Rc::new(Cell::new(false));
        let a = Rc::clone(&after);
        let fiber = spawn(&sched, move |f| {
            f.stop().unwrap();
            let _ = f.yield_now();
            a.set(true);
        });
        sched.cycle(0);
        assert_eq!(fiber.state(), FiberState::Done);
        sched.cycle(1);
        assert!(!after.get());
    }

    #[test]
    fn test_yield_outside_dispatch() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |f| loop {
            if f.yield_now().is_err() {
                break;
            }
        });
        sched.cycle(0);
        assert_eq!(fiber.yield_now(), Err(Error::IllegalState(FiberState::Running)));
        assert_eq!(fiber.wait(10), Err(Error::IllegalState(FiberState::Running)));
    }

    #[test]
    fn test_capacity() {
        let sched = Scheduler::with_config(SchedulerConfig::default().with_max_fibers(2));
        spawn(&sched, |_| {});
        spawn(&sched, |_| {});
        let third = Fiber::new(|_| {});
        assert_eq!(sched.start(&third), Err(Error::TooManyFibers(2)));
        assert_eq!(third.state(), FiberState::Egg);

        sched.cycle(0);
        assert_eq!(sched.numfibers(), 0);
        assert!(sched.start(&third).is_ok());
    }

    #[test]
    fn test_numfibers_matches_stats() {
        let sched = Scheduler::new();
        for n in 0..5u32 {
            spawn(&sched, move |f| {
                for _ in 0..n {
                    f.yield_now().unwrap();
                }
            });
        }
        for t in 0..6 {
            sched.cycle(t);
            let stats = sched.stats();
            assert_eq!(sched.numfibers() as u64, stats.started - stats.completed);
        }
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(sched.stats().completed, 5);
    }

    #[test]
    fn test_fifo_dispatch() {
        let sched = Scheduler::new();
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        for n in 0..4 {
            let o = Rc::clone(&order);
            spawn(&sched, move |f| {
                o.borrow_mut().push(n);
                f.yield_now().unwrap();
                o.borrow_mut().push(n);
            });
        }
        sched.cycle(0);
        sched.cycle(1);
        assert_eq!(*order.borrow(), [0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_scheduler_stop() {
        let sched = Scheduler::new();
        spawn(&sched, |f| {
            let _ = f.wait_for_cond(0, |_| false);
        });
        spawn(&sched, |f| loop {
            if f.yield_now().is_err() {
                break;
            }
        });
        sched.cycle(0);
        spawn(&sched, |_| {});
        assert_eq!(sched.stop(), 3);
        sched.cycle(1);
        assert_eq!(sched.numfibers(), 0);
    }

    #[test]
    fn test_hooks_bracket_cycle() {
        let sched = Scheduler::new();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let (pre, post, body) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
        sched.set_hooks(
            Some(Box::new(move |_| pre.borrow_mut().push("pre"))),
            Some(Box::new(move |_| post.borrow_mut().push("post"))),
        );
        spawn(&sched, move |_| body.borrow_mut().push("fiber"));
        sched.cycle(0);
        assert_eq!(*log.borrow(), ["pre", "fiber", "post"]);
    }

    #[test]
    fn test_nested_cycle_refused() {
        let sched = Scheduler::new();
        spawn(&sched, |f| {
            if let Some(s) = f.scheduler() {
                s.cycle(99);
            }
        });
        sched.cycle(0);
        assert_eq!(sched.stats().cycles, 1);
        assert_eq!(sched.now(), 0);
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let sched = Scheduler::new();
        sched.cycle(1234);
        sched.cycle(10);
        assert_eq!(sched.now(), 1234);
    }

    #[test]
    fn test_extra() {
        let sched = Scheduler::new();
        assert!(sched.extra().is_none());
        sched.set_extra(String::from("ctx"));
        assert_eq!(sched.extra_as::<String>().as_deref().map(String::as_str), Some("ctx"));
        assert!(sched.extra_as::<u32>().is_none());
    }

    #[test]
    fn test_drop_releases_suspended_fibers() {
        let sched = Scheduler::new();
        let fiber = spawn(&sched, |f| {
            let _ = f.wait_for_cond(0, |_| false);
        });
        sched.cycle(0);
        drop(sched);
        assert_eq!(fiber.state(), FiberState::Suspend);
        assert!(!fiber.is_registered());
        assert!(fiber.scheduler().is_none());
        assert_eq!(fiber.stop(), Err(Error::NoSuchFiber));
    }

    #[test]
    fn test_custom_stack_size() {
        let sched = Scheduler::with_config(SchedulerConfig::default().with_default_stack_size(32 * 1024));
        let small = Fiber::new(|_| {});
        small.set_stack_size(16 * 1024).unwrap();
        sched.start(&small).unwrap();
        let default = spawn(&sched, |_| {});
        assert_eq!(small.stack_size(), 16 * 1024);
        assert_eq!(default.stack_size(), 32 * 1024);
        sched.cycle(0);
        assert_eq!(sched.numfibers(), 0);
    }

    #[test]
    fn test_panicking_wait_test_terminates_fiber() {
        let sched = Scheduler::new();
        let resumed = Rc::new(Cell::new(false));
        let terminated = Rc::new(Cell::new(false));

        let r = Rc::clone(&resumed);
        let fiber = Fiber::new(move |f| {
            let _ = f.wait_for_cond(0, |_| panic!("bad wait test"));
            r.set(true);
        });
        let t = Rc::clone(&terminated);
        fiber.set_term_func(move |_| t.set(true)).unwrap();
        sched.start(&fiber).unwrap();

        sched.cycle(0);
        assert_eq!(fiber.state(), FiberState::Suspend);
        sched.cycle(1);
        assert!(!resumed.get());
        assert!(terminated.get());
        assert_eq!(fiber.state(), FiberState::Done);
        assert_eq!(sched.numfibers(), 0);
        assert_eq!(sched.stats().cycles, 2);
    }

    #[test]
    fn test_unresumed_fiber_frames_are_not_unwound() {
        let token = Rc::new(());
        let sched = Scheduler::new();
        let held = Rc::clone(&token);
        let stopped = spawn(&sched, move |f| {
            let _held = held;
            let _ = f.wait_for_cond(0, |_| false);
        });
        let held = Rc::clone(&token);
        spawn(&sched, move |f| {
            let _held = held;
            let _ = f.wait_for_cond(0, |_| false);
        });
        sched.cycle(0);
        assert_eq!(Rc::strong_count(&token), 3);

        stopped.stop().unwrap();
        sched.cycle(1);
        assert_eq!(stopped.state(), FiberState::Done);
        assert_eq!(sched.numfibers(), 1);
        drop(sched);

        // Neither frame ran its destructors
        assert_eq!(Rc::strong_count(&token), 3);
    }
}
