//! Per-worker batch accumulation.
//!
//! A worker appends items one at a time and asks the accumulator whether the
//! batch must go out. The timeout clock starts with the first item of a batch
//! and is cleared when the batch is taken, so idle time with an empty batch
//! never counts toward the timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the maximum export batch size
    Size,
    /// The batch timeout elapsed since its first item
    Timeout,
    /// The queue closed and the partial batch is forced out
    Drain,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Timeout => write!(f, "timeout"),
            FlushTrigger::Drain => write!(f, "drain"),
        }
    }
}

/// Bounded batch under construction
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    items: Vec<Arc<T>>,
    max_size: usize,
    timeout: Duration,
    /// Set when the first item of the current batch arrives
    started_at: Option<Instant>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self { items: Vec::with_capacity(max_size), max_size, timeout, started_at: None }
    }

    /// Append an item, starting the clock if it is the first of the batch
    pub fn push(&mut self, item: Arc<T>) {
        if self.items.is_empty() {
            self.started_at = Some(Instant::now());
        }
        self.items.push(item);
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// When the current batch times out.
    ///
    /// `None` for an empty batch, or when the timeout is too large for the
    /// clock to represent; such a batch only flushes on size or drain.
    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.and_then(|start| start.checked_add(self.timeout))
    }

    /// Check if the batch timed out as of `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Which trigger, if any, requires a flush as of `now`
    pub fn flush_trigger(&self, now: Instant) -> Option<FlushTrigger> {
        if self.is_full() {
            Some(FlushTrigger::Size)
        } else if self.is_expired(now) {
            Some(FlushTrigger::Timeout)
        } else {
            None
        }
    }

    /// Take the batch and reset the clock
    pub fn take(&mut self) -> Vec<Arc<T>> {
        self.started_at = None;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }
}
