//! Error taxonomy shared by every fallible fiber operation
//!
//! All operations return an explicit `Result`; nothing is reported by panicking.
//! Operations on a fiber that is not (or no longer) registered only return
//! `NoSuchFiber`, they never touch scheduler state.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::context::{MAX_STACK_SIZE, MIN_STACK_SIZE};
use crate::fiber::FiberState;

/// Failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Unspecified failure, with a short reason
    #[error("fiber operation failed: {0}")]
    Failed(&'static str),
    /// A wait's deadline fired before its condition became true
    #[error("deadline expired before the condition was met")]
    Timeout,
    /// The scheduler table is full
    #[error("scheduler already holds its maximum of {0} fibers")]
    TooManyFibers(usize),
    /// Null, never started, or already removed fiber
    #[error("no such fiber")]
    NoSuchFiber,
    /// Operation not valid in the fiber's current lifecycle state
    #[error("operation not allowed while the fiber is {0:?}")]
    IllegalState(FiberState),
    /// A fiber stack could not be allocated
    #[error("failed to allocate a {0} byte fiber stack")]
    MemoryAllocation(usize),
    /// Requested stack size outside the supported bounds
    #[error("stack size {0} outside [{min}, {max}]", min = MIN_STACK_SIZE, max = MAX_STACK_SIZE)]
    InvalidStackSize(usize),
    /// A wait was called with an unusable test or match count
    #[error("invalid wait predicate: {0}")]
    InvalidPredicate(&'static str),
}

/// Result alias used across the crate
pub type Result<T> = core::result::Result<T, Error>;
