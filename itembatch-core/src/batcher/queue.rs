//! Bounded item queue shared by producers and workers.
//!
//! Producers add item handles with [`ItemQueue::offer`] (drop what does not
//! fit) or [`ItemQueue::push_all`] (wait until everything fits). Workers take
//! one handle at a time with [`ItemQueue::pop`]. Closing the queue stops
//! admission immediately while letting workers drain what is left.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::metrics::BatchMetrics;
use crate::error::WriteError;

struct QueueState<T> {
    items: VecDeque<Arc<T>>,
    closed: bool,
}

/// Bounded FIFO of item handles
pub struct ItemQueue<T> {
    /// Processor name used as the metrics label
    name: Arc<str>,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    /// Signalled when items are added or the queue closes
    item_ready: Notify,
    /// Signalled when items are removed or the queue closes
    space_freed: Notify,
    metrics: Arc<dyn BatchMetrics>,
}

impl<T: Send + Sync + 'static> ItemQueue<T> {
    /// Create an empty queue holding at most `capacity` items
    pub fn new(name: Arc<str>, capacity: usize, metrics: Arc<dyn BatchMetrics>) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }),
            item_ready: Notify::new(),
            space_freed: Notify::new(),
            metrics,
        }
    }

    /// Enqueue as many leading items as fit without waiting.
    ///
    /// Returns the number of items admitted; the caller owns the decision of
    /// what to do with the rest.
    pub async fn offer(&self, items: &[Arc<T>]) -> Result<usize, WriteError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(WriteError::Shutdown);
        }

        let free = self.capacity - state.items.len();
        let accepted = free.min(items.len());
        if accepted > 0 {
            state.items.extend(items[..accepted].iter().cloned());
            self.metrics.set_items_queued(&self.name, state.items.len());
            drop(state);
            self.item_ready.notify_waiters();
        }

        Ok(accepted)
    }

    /// Enqueue all items, waiting for capacity if needed.
    ///
    /// Admission is all-or-nothing: nothing is enqueued unless everything
    /// fits at once. Returns early if `cancel` fires or the queue closes.
    pub async fn push_all(
        &self,
        items: &[Arc<T>],
        cancel: &CancellationToken,
    ) -> Result<(), WriteError> {
        if items.len() > self.capacity {
            return Err(WriteError::ExceedsCapacity {
                requested: items.len(),
                capacity: self.capacity,
            });
        }

        loop {
            // Register interest before checking so a pop between the check and
            // the await still wakes us.
            let freed = self.space_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(WriteError::Shutdown);
                }
                if self.capacity - state.items.len() >= items.len() {
                    state.items.extend(items.iter().cloned());
                    self.metrics.set_items_queued(&self.name, state.items.len());
                    drop(state);
                    self.item_ready.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut freed => {}
                _ = cancel.cancelled() => return Err(WriteError::Cancelled),
            }
        }
    }

    /// Take the next item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty. Safe to use in
    /// `select!`: an item is only removed in the poll that returns it.
    pub async fn pop(&self) -> Option<Arc<T>> {
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    self.metrics.set_items_queued(&self.name, state.items.len());
                    drop(state);
                    self.space_freed.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            ready.await;
        }
    }

    /// Stop admitting items and wake every waiter
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.item_ready.notify_waiters();
        self.space_freed.notify_waiters();
    }

    /// Remove and return everything still queued
    pub async fn drain(&self) -> Vec<Arc<T>> {
        let mut state = self.state.lock().await;
        let items: Vec<_> = state.items.drain(..).collect();
        self.metrics.set_items_queued(&self.name, 0);
        drop(state);
        self.space_freed.notify_waiters();
        items
    }

    /// Get current queue depth
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }
}
