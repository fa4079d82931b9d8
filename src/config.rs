//! Scheduler configuration
//!
//! Plain value with builder-style setters; every field has a working default.
//!
//! Author: Moroya Sakamoto

use crate::context::DEFAULT_STACK_SIZE;

/// Default upper bound on registered fibers per scheduler
pub const MAX_FIBERS: usize = 503;

/// Scheduler construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct SchedulerConfig {
    /// Maximum number of fibers registered at once
    pub max_fibers: usize,
    /// Stack size for fibers that never called `set_stack_size`
    pub default_stack_size: usize,
}

impl SchedulerConfig {
    pub fn with_max_fibers(self, max_fibers: usize) -> Self {
        Self { max_fibers, ..self }
    }

    pub fn with_default_stack_size(self, default_stack_size: usize) -> Self {
        Self {
            default_stack_size,
            ..self
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_fibers: MAX_FIBERS,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}
