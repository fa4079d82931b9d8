//! Time sources: monotonic millisecond clock, software timer, deadlines
//!
//! The scheduler never reads a clock itself: every cycle receives a logical
//! timestamp from its caller and keeps it fixed for the whole cycle.
//! This module provides the usual ways of producing that timestamp.
//!
//! Author: Moroya Sakamoto

use std::time::Instant;

use once_cell::sync::Lazy;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since the first call to this function (process-wide)
pub fn elapsed() -> u64 {
    START.elapsed().as_millis() as u64
}

/// Timestamp source for a scheduler driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysTimer {
    /// Follows [`elapsed`]
    Monotonic,
    /// Manually advanced counter, for tests and simulations
    Software { now_ms: u64 },
}

impl SysTimer {
    pub const fn monotonic() -> Self {
        SysTimer::Monotonic
    }

    pub const fn software() -> Self {
        SysTimer::Software { now_ms: 0 }
    }

    /// Advance a software timer. No effect on the monotonic clock.
    pub fn advance(&mut self, ms: u64) {
        if let SysTimer::Software { now_ms } = self {
            *now_ms = now_ms.saturating_add(ms);
        }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        match self {
            SysTimer::Monotonic => elapsed(),
            SysTimer::Software { now_ms } => *now_ms,
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self, SysTimer::Software { .. })
    }

    /// Elapsed milliseconds since a reference point
    pub fn elapsed_since(&self, reference: u64) -> u64 {
        self.now_ms().saturating_sub(reference)
    }
}

/// Absolute wake-up time of a wait, on the logical clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: u64,
    at: u64,
}

impl Deadline {
    /// Deadline `ms` after `now`
    pub fn after(now: u64, ms: u64) -> Self {
        Self {
            start: now,
            at: now.saturating_add(ms),
        }
    }

    /// Has the deadline been reached at `current`?
    pub fn is_expired(&self, current: u64) -> bool {
        current >= self.at
    }

    /// Remaining time until the deadline (0 once reached)
    pub fn remaining(&self, current: u64) -> u64 {
        self.at.saturating_sub(current)
    }

    /// Elapsed since the wait started
    pub fn elapsed(&self, current: u64) -> u64 {
        current.saturating_sub(self.start)
    }

    pub fn at(&self) -> u64 {
        self.at
    }
}
