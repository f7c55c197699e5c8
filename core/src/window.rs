//! Sliding windows of call outcomes
//!
//! This module provides the two window flavours a breaker can be configured with:
//! - `CountWindow`: keeps the last N completed calls
//! - `TimeWindow`: keeps the calls completed within the last N milliseconds
//!
//! Both keep running counters so rate queries never rescan the buffer.

use crate::CallOutcome;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Monotonic millisecond clock anchored at breaker creation
///
/// Immune to wall-clock adjustments (NTP, DST); all outcome timestamps and
/// state-change times of one breaker share the same anchor.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the anchor
    pub fn now_millis(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Consistent counts read from a window in one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub slow: usize,
}

impl WindowSnapshot {
    /// Failure percentage, `0.0` when nothing was recorded yet
    pub fn failure_rate(&self) -> f64 {
        percentage(self.failures, self.total)
    }

    /// Slow-call percentage, `0.0` when nothing was recorded yet
    pub fn slow_call_rate(&self) -> f64 {
        percentage(self.slow, self.total)
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Bounded record of recent call outcomes
///
/// Implementations synchronize internally; `record` may be called from any
/// thread. The `minimum_number_of_calls` gate is not the window's concern.
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Append an outcome, evicting whatever falls out of the window
    fn record(&self, outcome: CallOutcome);

    /// Read all counters at once
    fn snapshot(&self) -> WindowSnapshot;

    /// Drop every outcome and zero the counters
    fn reset(&self);

    /// Outcomes currently inside the window, oldest first
    fn outcomes(&self) -> Vec<CallOutcome>;

    fn total_calls(&self) -> usize {
        self.snapshot().total
    }

    fn failure_rate(&self) -> f64 {
        self.snapshot().failure_rate()
    }

    fn slow_call_rate(&self) -> f64 {
        self.snapshot().slow_call_rate()
    }
}

/// Running counters for the outcomes held in a buffer
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    successes: usize,
    failures: usize,
    slow: usize,
}

impl Tally {
    fn add(&mut self, outcome: &CallOutcome, slow_threshold_millis: u64) {
        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if outcome.is_slow(slow_threshold_millis) {
            self.slow += 1;
        }
    }

    fn remove(&mut self, outcome: &CallOutcome, slow_threshold_millis: u64) {
        if outcome.success {
            self.successes -= 1;
        } else {
            self.failures -= 1;
        }
        if outcome.is_slow(slow_threshold_millis) {
            self.slow -= 1;
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            total: self.successes + self.failures,
            successes: self.successes,
            failures: self.failures,
            slow: self.slow,
        }
    }
}

#[derive(Debug, Default)]
struct Buffer {
    outcomes: VecDeque<CallOutcome>,
    tally: Tally,
}

impl Buffer {
    fn push(&mut self, outcome: CallOutcome, slow_threshold_millis: u64) {
        self.tally.add(&outcome, slow_threshold_millis);
        self.outcomes.push_back(outcome);
    }

    fn evict_oldest(&mut self, slow_threshold_millis: u64) {
        if let Some(oldest) = self.outcomes.pop_front() {
            self.tally.remove(&oldest, slow_threshold_millis);
        }
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.tally = Tally::default();
    }
}

fn lock(buffer: &Mutex<Buffer>) -> MutexGuard<'_, Buffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the last `capacity` outcomes
#[derive(Debug)]
pub struct CountWindow {
    capacity: usize,
    slow_threshold_millis: u64,
    buffer: Mutex<Buffer>,
}

impl CountWindow {
    pub fn new(capacity: usize, slow_threshold_millis: u64) -> Self {
        Self {
            capacity,
            slow_threshold_millis,
            buffer: Mutex::new(Buffer {
                outcomes: VecDeque::new(),
                tally: Tally::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl SlidingWindow for CountWindow {
    fn record(&self, outcome: CallOutcome) {
        let mut buffer = lock(&self.buffer);
        buffer.push(outcome, self.slow_threshold_millis);
        while buffer.outcomes.len() > self.capacity {
            buffer.evict_oldest(self.slow_threshold_millis);
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        lock(&self.buffer).tally.snapshot()
    }

    fn reset(&self) {
        lock(&self.buffer).clear();
    }

    fn outcomes(&self) -> Vec<CallOutcome> {
        lock(&self.buffer).outcomes.iter().copied().collect()
    }
}

/// Keeps the outcomes completed within the last `span_millis`
///
/// Each entry expires on its own once `timestamp + span <= now`. Expired
/// entries are physically dropped on `record`; read paths only skip them, so
/// observing the window never changes it.
#[derive(Debug)]
pub struct TimeWindow {
    span_millis: u64,
    slow_threshold_millis: u64,
    clock: Clock,
    buffer: Mutex<Buffer>,
}

impl TimeWindow {
    pub fn new(span_millis: u64, slow_threshold_millis: u64, clock: Clock) -> Self {
        Self {
            span_millis,
            slow_threshold_millis,
            clock,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn span_millis(&self) -> u64 {
        self.span_millis
    }

    fn is_expired(&self, outcome: &CallOutcome, now: u64) -> bool {
        outcome.timestamp_millis.saturating_add(self.span_millis) <= now
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&self, outcome: CallOutcome) {
        let now = self.clock.now_millis().max(outcome.timestamp_millis);
        let mut buffer = lock(&self.buffer);
        buffer.push(outcome, self.slow_threshold_millis);
        while buffer
            .outcomes
            .front()
            .is_some_and(|oldest| self.is_expired(oldest, now))
        {
            buffer.evict_oldest(self.slow_threshold_millis);
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        let now = self.clock.now_millis();
        let buffer = lock(&self.buffer);
        let mut tally = buffer.tally;
        for expired in buffer
            .outcomes
            .iter()
            .take_while(|outcome| self.is_expired(outcome, now))
        {
            tally.remove(expired, self.slow_threshold_millis);
        }
        tally.snapshot()
    }

    fn reset(&self) {
        lock(&self.buffer).clear();
    }

    fn outcomes(&self) -> Vec<CallOutcome> {
        let now = self.clock.now_millis();
        lock(&self.buffer)
            .outcomes
            .iter()
            .filter(|outcome| !self.is_expired(outcome, now))
            .copied()
            .collect()
    }
}
