// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler queues.
//!
//! The ready queue is a plain FIFO owned by the scheduler thread. The
//! remote queue is the only structure other threads touch: host jobs and
//! foreign-waker wakeups land there and are drained at the top of each
//! scheduler iteration.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::task::TaskId;

/// FIFO of tasks waiting to be polled.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    deque: VecDeque<TaskId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskId) {
        self.deque.push_back(task);
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.deque.pop_front()
    }

    pub fn len(&self) -> usize {
        self.deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    /// Drop every queued task (used during shutdown).
    pub fn clear(&mut self) {
        self.deque.clear();
    }
}

/// Work submitted from outside the scheduler.
pub(crate) enum RemoteEvent {
    /// Run a closure on the scheduler thread.
    Job(Box<dyn FnOnce() + Send>),
    /// A foreign waker fired for this task.
    Wake(TaskId),
}

/// Injection queue shared with other threads.
///
/// `holds` counts outstanding keep-alive guards: while it is non-zero an
/// idle scheduler waits for events instead of finishing or reporting a
/// deadlock.
pub(crate) struct RemoteQueue {
    queue: Mutex<VecDeque<RemoteEvent>>,
    signal: Condvar,
    holds: AtomicUsize,
}

impl RemoteQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            holds: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RemoteEvent>> {
        // Jobs run outside the lock, so a poisoned queue is still consistent.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: RemoteEvent) {
        self.lock().push_back(event);
        self.signal.notify_all();
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<RemoteEvent> {
        self.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn holds(&self) -> usize {
        self.holds.load(Ordering::Acquire)
    }

    pub fn acquire_hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_hold(&self) {
        self.holds.fetch_sub(1, Ordering::AcqRel);
        // Notify under the lock: `wait` re-reads `holds` while holding it.
        let _queue = self.lock();
        self.signal.notify_all();
    }

    /// Block the scheduler thread until an event arrives, a hold is
    /// released, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) {
        let queue = self.lock();
        if !queue.is_empty() {
            return;
        }
        match timeout {
            Some(timeout) => {
                let (_queue, _timed_out) = self
                    .signal
                    .wait_timeout(queue, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                let _queue = self
                    .signal
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Like `wait(None)`, but returns at once when no hold is left. The
    /// hold count is re-read under the lock, so a hold released after the
    /// scheduler's idle check is never missed.
    pub fn wait_for_hold(&self) {
        let queue = self.lock();
        if !queue.is_empty() || self.holds() == 0 {
            return;
        }
        let _queue = self
            .signal
            .wait(queue)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
