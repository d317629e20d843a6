// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async read/write lock.
//!
//! Many readers or one writer. Waiters queue FIFO and a queued writer
//! blocks newly arriving readers, so writers cannot starve. On release
//! the head of the queue is granted: a single writer, or every reader up
//! to the next queued writer.
//!
//! Unlocking a lock that is not held is a reported error, not a panic.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{error, trace};

use crate::context;
use crate::error::LockError;
use crate::green::task::{LockMode, ObjectId, WaitTarget};
use crate::green::wait::{handoff, Handoff, Wait, Withdraw};

/// Who currently holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    ReadLocked(usize),
    WriteLocked,
}

/// Cooperative read/write lock. Clones share the lock.
#[derive(Clone)]
pub struct AsyncLock {
    inner: Rc<RefCell<LockState>>,
}

struct LockState {
    id: ObjectId,
    status: LockStatus,
    waiters: VecDeque<LockWaiter>,
}

struct LockWaiter {
    mode: LockMode,
    grant: Handoff<()>,
}

impl LockState {
    fn try_acquire(&mut self, mode: LockMode) -> bool {
        match (mode, self.status) {
            (LockMode::Write, LockStatus::Free) if self.waiters.is_empty() => {
                self.status = LockStatus::WriteLocked;
                true
            }
            (LockMode::Read, LockStatus::Free | LockStatus::ReadLocked(_))
                if !self.waiters.iter().any(|w| w.mode == LockMode::Write) =>
            {
                self.status = match self.status {
                    LockStatus::ReadLocked(n) => LockStatus::ReadLocked(n + 1),
                    _ => LockStatus::ReadLocked(1),
                };
                true
            }
            _ => false,
        }
    }

    /// Hand the lock to the head of the queue. Returns the grants to
    /// deliver once the state borrow is released.
    fn grant(&mut self) -> Vec<Handoff<()>> {
        let mut granted = Vec::new();
        while let Some(head) = self.waiters.front() {
            let next = match (head.mode, self.status) {
                (LockMode::Write, LockStatus::Free) => LockStatus::WriteLocked,
                (LockMode::Read, LockStatus::Free) => LockStatus::ReadLocked(1),
                (LockMode::Read, LockStatus::ReadLocked(n)) => LockStatus::ReadLocked(n + 1),
                _ => break,
            };
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.status = next;
            granted.push(waiter.grant);
            if next == LockStatus::WriteLocked {
                break;
            }
        }
        granted
    }
}

impl Withdraw for RefCell<LockState> {
    fn withdraw(&self, wait: &Rc<Wait>) {
        let granted = {
            let mut st = self.borrow_mut();
            st.waiters.retain(|w| !w.grant.belongs_to(wait));
            // A withdrawn writer may have been holding back readers.
            st.grant()
        };
        deliver(granted);
    }
}

fn deliver(granted: Vec<Handoff<()>>) {
    for grant in granted {
        grant.fulfill(());
    }
}

/// Releases a grant that was delivered to a task whose lock future was
/// dropped before it observed the grant.
struct AbandonGuard<'a> {
    lock: &'a AsyncLock,
    mode: LockMode,
    wait: Rc<Wait>,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.wait.fired().is_some() {
            self.lock.release(self.mode);
        }
    }
}

/// Create an unlocked lock.
pub fn make_lock() -> AsyncLock {
    AsyncLock::new()
}

impl AsyncLock {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LockState {
                id: ObjectId::next(),
                status: LockStatus::Free,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.borrow().id
    }

    pub fn status(&self) -> LockStatus {
        self.inner.borrow().status
    }

    /// Number of queued lock requests.
    pub fn waiting(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Acquire for writing, parking until granted.
    pub async fn lock(&self) {
        self.acquire(LockMode::Write).await;
    }

    /// Acquire for reading, parking until granted.
    pub async fn rlock(&self) {
        self.acquire(LockMode::Read).await;
    }

    pub fn try_lock(&self) -> bool {
        self.inner.borrow_mut().try_acquire(LockMode::Write)
    }

    pub fn try_rlock(&self) -> bool {
        self.inner.borrow_mut().try_acquire(LockMode::Read)
    }

    /// Release a write hold.
    pub fn unlock(&self) -> Result<(), LockError> {
        let granted = {
            let mut st = self.inner.borrow_mut();
            if st.status != LockStatus::WriteLocked {
                return Err(LockError::UnlockOfUnlocked);
            }
            st.status = LockStatus::Free;
            st.grant()
        };
        trace!(lock = %self.id(), granted = granted.len(), "unlocked");
        deliver(granted);
        Ok(())
    }

    /// Release one read hold.
    pub fn runlock(&self) -> Result<(), LockError> {
        let granted = {
            let mut st = self.inner.borrow_mut();
            st.status = match st.status {
                LockStatus::ReadLocked(1) => LockStatus::Free,
                LockStatus::ReadLocked(n) => LockStatus::ReadLocked(n - 1),
                _ => return Err(LockError::RUnlockOfUnlocked),
            };
            st.grant()
        };
        deliver(granted);
        Ok(())
    }

    /// Run `f` while holding the lock for writing.
    pub async fn write_with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock().await;
        let out = f();
        self.release(LockMode::Write);
        out
    }

    /// Run `f` while holding the lock for reading.
    pub async fn read_with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.rlock().await;
        let out = f();
        self.release(LockMode::Read);
        out
    }

    async fn acquire(&self, mode: LockMode) {
        if self.inner.borrow_mut().try_acquire(mode) {
            return;
        }
        let wait = {
            let task = context::expect_task(match mode {
                LockMode::Write => "AsyncLock::lock",
                LockMode::Read => "AsyncLock::rlock",
            });
            Wait::park(
                &task,
                WaitTarget::Lock {
                    lock: self.id(),
                    mode,
                },
            )
        };
        let (grant, parked) = handoff(&wait);
        grant.register(self.withdraw_handle());
        self.inner
            .borrow_mut()
            .waiters
            .push_back(LockWaiter { mode, grant });

        let mut guard = AbandonGuard {
            lock: self,
            mode,
            wait,
            armed: true,
        };
        parked.await;
        guard.armed = false;
    }

    fn release(&self, mode: LockMode) {
        let result = match mode {
            LockMode::Write => self.unlock(),
            LockMode::Read => self.runlock(),
        };
        if let Err(err) = result {
            error!(lock = %self.id(), %err, "releasing a granted lock failed");
        }
    }

    fn withdraw_handle(&self) -> Weak<dyn Withdraw> {
        let weak: Weak<RefCell<LockState>> = Rc::downgrade(&self.inner);
        weak
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.borrow();
        f.debug_struct("AsyncLock")
            .field("id", &st.id)
            .field("status", &st.status)
            .field("waiting", &st.waiters.len())
            .finish()
    }
}
