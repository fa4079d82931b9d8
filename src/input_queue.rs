//! Input queue: predicate-matching mailbox
//!
//! Producers append timestamped elements; a fiber waits until up to
//! `max_match` elements satisfy its test and extracts them in one scan.
//! Each element carries a classification:
//!
//! - `Drop`: not used (default), removed by the next `clean`
//! - `Take`: claimed by a scan, removed by the next `clean`
//! - `Keep`: matched after the limit was reached, stays for a later scan
//!
//! Growth is bounded by high/low water marks (oldest non-`Keep` elements are
//! evicted) and by a maximum element lifetime applied through `expire`.
//!
//! A scan only claims elements. The payload leaves the queue when the woken
//! fiber resumes, so a waiter stopped in between leaves its claims behind
//! for `clean` to release.
//!
//! Author: Moroya Sakamoto

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::timer::Deadline;

/// Most elements a single wait can extract
pub const MAX_MATCH: usize = 8;

/// Default high water mark
pub const DEFAULT_HWM: usize = 64;
/// Default low water mark
pub const DEFAULT_LWM: usize = 60;
/// Default element lifetime (ms)
pub const DEFAULT_LIFETIME_MS: u64 = 32;

/// Element classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Drop,
    Take,
    Keep,
}

/// One queued payload with its ownership hooks.
///
/// Dropping an element that still owns its payload hands the payload to the
/// release function, if one was set.
pub struct InputQueueElement<T> {
    timestamp: u64,
    state: ElementState,
    payload: Option<T>,
    // Token of the wait that matched this element and has not collected yet
    claim: Option<u64>,
    copy: Option<fn(&T) -> T>,
    release: Option<Box<dyn FnOnce(T)>>,
}

impl<T> InputQueueElement<T> {
    pub fn new(timestamp: u64, payload: T) -> Self {
        Self {
            timestamp,
            state: ElementState::Drop,
            payload: Some(payload),
            claim: None,
            copy: None,
            release: None,
        }
    }

    /// Extract copies instead of moving the payload out
    pub fn with_copy(mut self, copy: fn(&T) -> T) -> Self {
        self.copy = Some(copy);
        self
    }

    /// Called with the payload when the element is discarded
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce(T) + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    /// Payload, unless a wait already moved it out
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    fn disposable(&self) -> bool {
        self.state != ElementState::Keep || self.payload.is_none()
    }
}

impl<T> Drop for InputQueueElement<T> {
    fn drop(&mut self) {
        if let (Some(payload), Some(release)) = (self.payload.take(), self.release.take()) {
            release(payload);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for InputQueueElement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputQueueElement")
            .field("timestamp", &self.timestamp)
            .field("state", &self.state)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Capacity-control knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct InputQueueConfig {
    /// Length at which eviction starts
    pub high_water_mark: usize,
    /// Length eviction brings the queue back to
    pub low_water_mark: usize,
    /// Maximum element age in ms, see [`InputQueue::expire`]
    pub max_lifetime_ms: u64,
}

impl InputQueueConfig {
    pub fn with_water_marks(self, high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            high_water_mark,
            low_water_mark,
            ..self
        }
    }

    pub fn with_max_lifetime(self, max_lifetime_ms: u64) -> Self {
        Self {
            max_lifetime_ms,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(Error::Failed("input queue high water mark is zero"));
        }
        if self.low_water_mark > self.high_water_mark {
            return Err(Error::Failed("input queue low water mark above high water mark"));
        }
        Ok(())
    }
}

impl Default for InputQueueConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HWM,
            low_water_mark: DEFAULT_LWM,
            max_lifetime_ms: DEFAULT_LIFETIME_MS,
        }
    }
}

struct Inner<T> {
    elements: VecDeque<InputQueueElement<T>>,
    config: InputQueueConfig,
    evicted: u64,
    next_claim: u64,
}

impl<T> Inner<T> {
    /// Pull out the oldest non-`Keep` elements until at most `target` remain
    fn shed_to(&mut self, target: usize) -> Vec<InputQueueElement<T>> {
        let mut shed = Vec::new();
        while self.elements.len() > target {
            let Some(idx) = self.elements.iter().position(|e| e.state != ElementState::Keep) else {
                break;
            };
            if let Some(e) = self.elements.remove(idx) {
                shed.push(e);
            }
        }
        self.evicted += shed.len() as u64;
        shed
    }

    fn enforce_water_marks(&mut self) -> Vec<InputQueueElement<T>> {
        if self.elements.len() < self.config.high_water_mark {
            return Vec::new();
        }
        let shed = self.shed_to(self.config.low_water_mark);
        if !shed.is_empty() {
            debug!("input queue over high water mark, evicted {}", shed.len());
        }
        shed
    }

    fn claim_token(&mut self) -> u64 {
        self.next_claim = self.next_claim.wrapping_add(1);
        self.next_claim
    }

    /// One matching pass: classify elements and claim up to `max_match` of
    /// them for `token`. Payloads stay in place. Returns the number claimed.
    fn scan(&mut self, test: &mut dyn FnMut(&T) -> bool, max_match: usize, token: u64) -> usize {
        let mut claimed = 0;
        for e in self.elements.iter_mut() {
            if e.claim.is_some() {
                continue;
            }
            let Some(payload) = e.payload.as_ref() else {
                continue;
            };
            if !test(payload) {
                continue;
            }
            if claimed < max_match {
                e.claim = Some(token);
                e.state = ElementState::Take;
                claimed += 1;
            } else {
                e.state = ElementState::Keep;
            }
        }
        claimed
    }

    /// Hand over the payloads claimed by `token`, oldest first
    fn collect(&mut self, token: u64) -> Vec<T> {
        let mut found = Vec::new();
        for e in self.elements.iter_mut().filter(|e| e.claim == Some(token)) {
            e.claim = None;
            let value = match (e.copy, e.payload.as_ref()) {
                (Some(copy), Some(payload)) => Some(copy(payload)),
                _ => e.payload.take(),
            };
            found.extend(value);
        }
        found
    }
}

/// Predicate-matching mailbox. Clones refer to the same queue.
pub struct InputQueue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> InputQueue<T> {
    pub fn new() -> Self {
        Self::from_config(InputQueueConfig::default())
    }

    pub fn with_config(config: InputQueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: InputQueueConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                elements: VecDeque::new(),
                config,
                evicted: 0,
                next_claim: 0,
            })),
        }
    }

    pub fn config(&self) -> InputQueueConfig {
        self.inner.borrow().config
    }

    /// Append at the tail, evicting old elements past the high water mark
    pub fn append(&self, element: InputQueueElement<T>) {
        let shed = {
            let mut inner = self.inner.borrow_mut();
            inner.elements.push_back(element);
            inner.enforce_water_marks()
        };
        // Release callbacks run with the queue unborrowed
        drop(shed);
    }

    /// Append a plain payload
    pub fn push(&self, timestamp: u64, payload: T) {
        self.append(InputQueueElement::new(timestamp, payload));
    }

    /// Remove every element not marked `Keep`. Returns how many were removed.
    pub fn clean(&self) -> usize {
        let removed: VecDeque<InputQueueElement<T>> = {
            let mut inner = self.inner.borrow_mut();
            let (gone, kept) = inner.elements.drain(..).partition(|e| e.disposable());
            inner.elements = kept;
            gone
        };
        let count = removed.len();
        drop(removed);
        trace!("input queue clean removed {count}");
        count
    }

    /// Move every element of `other` to the tail of this queue, leaving
    /// `other` empty
    pub fn move_from(&self, other: &InputQueue<T>) {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        let moved: VecDeque<_> = std::mem::take(&mut other.inner.borrow_mut().elements);
        let shed = {
            let mut inner = self.inner.borrow_mut();
            inner.elements.extend(moved);
            inner.enforce_water_marks()
        };
        drop(shed);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every element older than the configured lifetime at `now`
    pub fn expire(&self, now: u64) -> usize {
        let expired: VecDeque<InputQueueElement<T>> = {
            let mut inner = self.inner.borrow_mut();
            let life = inner.config.max_lifetime_ms;
            let (old, fresh) = inner
                .elements
                .drain(..)
                .partition(|e| now.saturating_sub(e.timestamp) > life);
            inner.elements = fresh;
            inner.evicted += old.len() as u64;
            old
        };
        let count = expired.len();
        drop(expired);
        count
    }

    /// Elements evicted by water marks or lifetime so far
    pub fn evicted(&self) -> u64 {
        self.inner.borrow().evicted
    }

    /// Classification of each queued element, oldest first
    pub fn states(&self) -> Vec<ElementState> {
        self.inner.borrow().elements.iter().map(|e| e.state).collect()
    }

    /// Suspend `fiber` until at least one element satisfies `test`, then
    /// extract up to `max_match` of them (oldest first).
    ///
    /// Matches past the limit are marked `Keep`. Extracted elements stay in
    /// the queue as `Take` until the next `clean`. A deadline (`ms > 0`)
    /// passing first yields `Timeout`. `max_match` outside
    /// `1..=MAX_MATCH` costs one yield and is `InvalidPredicate`.
    ///
    /// If the claimed elements are cleaned away before the fiber resumes, it
    /// waits again for whatever time is left.
    pub fn wait<F>(&self, fiber: &Fiber, ms: u64, max_match: usize, test: F) -> Result<Vec<T>>
    where
        F: FnMut(&T) -> bool + 'static,
    {
        if max_match == 0 || max_match > MAX_MATCH {
            error!("{fiber}: input queue wait with invalid match count {max_match}");
            fiber.yield_now()?;
            return Err(Error::InvalidPredicate("match count outside 1..=8"));
        }

        let now = || fiber.scheduler().map_or(0, |s| s.now());
        let deadline = (ms > 0).then(|| Deadline::after(now(), ms));
        let test = Rc::new(RefCell::new(test));
        let mut budget = ms;
        loop {
            let token = self.inner.borrow_mut().claim_token();
            let inner = Rc::clone(&self.inner);
            let test = Rc::clone(&test);
            let status = fiber.wait_for_cond(budget, move |_| {
                let mut test = test.borrow_mut();
                inner.borrow_mut().scan(&mut *test, max_match, token) > 0
            })?;
            if status.timed_out() {
                return Err(Error::Timeout);
            }

            let found = self.inner.borrow_mut().collect(token);
            if !found.is_empty() {
                trace!("{fiber}: input queue wait extracted {}", found.len());
                return Ok(found);
            }
            debug!("{fiber}: claimed input cleaned before pickup, waiting again");
            if let Some(deadline) = deadline {
                budget = deadline.remaining(now());
                if budget == 0 {
                    return Err(Error::Timeout);
                }
            }
        }
    }
}

impl<T: 'static> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for InputQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for InputQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("InputQueue")
            .field("len", &inner.elements.len())
            .field("config", &inner.config)
            .field("evicted", &inner.evicted)
            .finish()
    }
}
