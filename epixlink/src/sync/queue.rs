//! Unbounded multi-consumer FIFO for received data frames.
//!
//! The RX thread is the only producer; any number of caller threads may
//! block in [`DataQueue::pop_blocking`]. Closing the queue wakes every
//! waiter so callers notice link shutdown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Deadline `timeout` from now, or `None` if it lies beyond what the
/// clock can represent.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.as_nanos() > u128::from(u64::MAX) {
        return None;
    }
    Instant::now().checked_add(timeout)
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with blocking pop.
pub struct DataQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> fmt::Debug for DataQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DataQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Default for DataQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Items are plain values; a panicked holder cannot leave them torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item and wakes one waiter.
    ///
    /// Returns `Err(item)` once the queue is closed.
    ///
    /// # Errors
    /// Hands the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Pops without waiting.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Waits for an item.
    ///
    /// Returns `None` on timeout, or once the queue is closed and drained.
    /// A duration too large to form a deadline waits indefinitely.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => deadline_after(d),
        };
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = match deadline {
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return None;
                    }
                    self.ready
                        .wait_timeout(state, dl - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects further pushes and wakes every waiter.
    ///
    /// Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
