//! Kernel: scheduler driver
//!
//! Pairs a scheduler with a timer and runs cycles at a fixed period.
//! With the software timer time only moves when the kernel advances it,
//! which makes whole runs deterministic.
//!
//! Author: Moroya Sakamoto

use std::thread;
use std::time::Duration;

use log::info;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::timer::SysTimer;

/// Scheduler plus the clock that feeds it
pub struct Kernel {
    /// Fiber scheduler
    pub scheduler: Scheduler,
    /// Timestamp source
    pub timer: SysTimer,
    /// Cycles run through this kernel
    pub total_cycles: u64,
}

impl Kernel {
    /// Kernel on the monotonic clock
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), SysTimer::monotonic())
    }

    /// Kernel on a software timer (testing, simulation)
    pub fn testing() -> Self {
        Self::with_config(SchedulerConfig::default(), SysTimer::software())
    }

    pub fn with_config(config: SchedulerConfig, timer: SysTimer) -> Self {
        Self {
            scheduler: Scheduler::with_config(config),
            timer,
            total_cycles: 0,
        }
    }

    /// Create and start a fiber
    pub fn spawn<F>(&self, entry: F) -> Result<Fiber>
    where
        F: FnOnce(&Fiber) + 'static,
    {
        let fiber = Fiber::new(entry);
        self.scheduler.start(&fiber)?;
        Ok(fiber)
    }

    /// Run one cycle
    ///
    /// Advances a software timer by `delta_ms` first. Returns the number of
    /// fibers still registered.
    pub fn tick(&mut self, delta_ms: u64) -> usize {
        self.timer.advance(delta_ms);
        self.total_cycles += 1;
        self.scheduler.cycle(self.timer.now_ms());
        self.scheduler.numfibers()
    }

    /// Run cycles every `period_ms` for `total_ms`
    ///
    /// A zero period counts as 1 ms, time must move between cycles.
    pub fn run_for(&mut self, total_ms: u64, period_ms: u64) -> KernelStats {
        let period_ms = period_ms.max(1);
        let start = self.timer.now_ms();
        let completed = self.scheduler.stats().completed;
        let mut cycles = 0u64;

        while self.timer.elapsed_since(start) < total_ms {
            self.step(period_ms);
            cycles += 1;
        }
        self.summary(start, cycles, completed)
    }

    /// Run cycles every `period_ms` until no fiber is left, or `max_cycles`
    ///
    /// A zero period counts as 1 ms, as in [`Kernel::run_for`].
    pub fn run_until_idle(&mut self, period_ms: u64, max_cycles: u64) -> KernelStats {
        let period_ms = period_ms.max(1);
        let start = self.timer.now_ms();
        let completed = self.scheduler.stats().completed;
        let mut cycles = 0u64;

        while self.scheduler.numfibers() > 0 && cycles < max_cycles {
            self.step(period_ms);
            cycles += 1;
        }
        self.summary(start, cycles, completed)
    }

    /// Terminate every fiber and run the one cycle needed to drain them
    pub fn shutdown(&mut self) -> usize {
        let stopped = self.scheduler.stop();
        self.tick(0);
        stopped
    }

    fn step(&mut self, period_ms: u64) {
        if self.timer.is_software() {
            self.tick(period_ms);
        } else {
            thread::sleep(Duration::from_millis(period_ms));
            self.tick(0);
        }
    }

    fn summary(&self, start: u64, cycles: u64, completed_before: u64) -> KernelStats {
        let stats = KernelStats {
            elapsed_ms: self.timer.elapsed_since(start),
            cycles,
            fibers_completed: self.scheduler.stats().completed - completed_before,
            fibers_remaining: self.scheduler.numfibers(),
        };
        info!(
            "kernel ran {} cycles in {} ms, {} fibers done, {} left",
            stats.cycles, stats.elapsed_ms, stats.fibers_completed, stats.fibers_remaining
        );
        stats
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel run statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// Elapsed time (ms)
    pub elapsed_ms: u64,
    /// Cycles run
    pub cycles: u64,
    /// Fibers that finished during the run
    pub fibers_completed: u64,
    /// Fibers still registered afterwards
    pub fibers_remaining: usize,
}
