//! fiber-rt: cooperative fibers on one thread
//!
//! Many stackful tasks multiplexed onto a single OS thread, switching only
//! at explicit suspension points:
//! - Fibers with private stacks and a strict lifecycle (`Egg` → … → `Done`)
//! - A five-phase scheduler cycle driven by caller-supplied logical time
//! - Predicate waits: yield, timeout, condition, variable, join
//! - A bounded blocking channel and a predicate-matching input queue
//!
//! ```no_run
//! use fiber_rt::{Fiber, Scheduler};
//!
//! let sched = Scheduler::new();
//! let fiber = Fiber::new(|f| {
//!     for _ in 0..3 {
//!         f.yield_now().unwrap();
//!     }
//! });
//! sched.start(&fiber).unwrap();
//! while sched.numfibers() > 0 {
//!     sched.cycle(fiber_rt::timer::elapsed());
//! }
//! ```
//!
//! Author: Moroya Sakamoto

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod input_queue;
pub mod kernel;
pub mod predicate;
pub mod scheduler;
mod table;
pub mod timer;

pub use channel::Channel;
pub use config::{SchedulerConfig, MAX_FIBERS};
pub use context::{DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE};
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberFn, FiberId, FiberState};
pub use input_queue::{ElementState, InputQueue, InputQueueConfig, InputQueueElement, MAX_MATCH};
pub use kernel::{Kernel, KernelStats};
pub use predicate::{PredicateState, WaitStatus};
pub use scheduler::{CycleHook, Scheduler, SchedulerStats};
pub use timer::{elapsed, Deadline, SysTimer};
