// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension points.
//!
//! A blocking operation parks its task on a [`Wait`] and registers the
//! wait in one or more queues (channel sender/receiver queues, lock
//! waiter queues, timers, joiners). Whoever completes the operation
//! writes the result into a typed slot through a [`Handoff`] and calls
//! [`Wait::complete`], which withdraws the wait from every other queue it
//! sits in and makes the task ready again.
//!
//! A wait completes at most once. Dropping the parked future before that
//! cancels the wait and withdraws it from all queues.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use super::scheduler::WeakScheduler;
use super::task::{TaskId, WaitTarget};
use crate::context::TaskRef;

/// A queue a wait can be registered in.
pub(crate) trait Withdraw {
    /// Remove every entry belonging to `wait`.
    fn withdraw(&self, wait: &Rc<Wait>);
}

pub(crate) struct Wait {
    task: TaskId,
    sched: WeakScheduler,
    fired: Cell<Option<usize>>,
    cancelled: Cell<bool>,
    registrations: RefCell<Vec<Weak<dyn Withdraw>>>,
}

impl Wait {
    /// Block `task` on `target`. The caller must register the returned
    /// wait with whatever will complete it before yielding.
    pub fn park(task: &TaskRef, target: WaitTarget) -> Rc<Self> {
        // A refused suspend is recorded as the scheduler fault and
        // surfaces from `run`.
        let _ = task.sched.suspend(task.id, target);
        Rc::new(Self {
            task: task.id,
            sched: task.sched.downgrade(),
            fired: Cell::new(None),
            cancelled: Cell::new(false),
            registrations: RefCell::new(Vec::new()),
        })
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Neither completed nor cancelled.
    pub fn is_pending(&self) -> bool {
        self.fired.get().is_none() && !self.cancelled.get()
    }

    /// The case index passed to `complete`, once fired.
    pub fn fired(&self) -> Option<usize> {
        self.fired.get()
    }

    pub fn register(&self, queue: Weak<dyn Withdraw>) {
        self.registrations.borrow_mut().push(queue);
    }

    /// Mark the wait fired for `case` and make its task ready.
    ///
    /// Must not be called while holding a borrow of a queue the wait is
    /// registered in.
    pub fn complete(self: &Rc<Self>, case: usize) {
        if !self.is_pending() {
            return;
        }
        self.fired.set(Some(case));
        self.withdraw_all();
        if let Some(sched) = self.sched.upgrade() {
            let _ = sched.resume(self.task);
        }
    }

    /// Abandon the wait without resuming the task.
    pub fn cancel(self: &Rc<Self>) {
        if !self.is_pending() {
            return;
        }
        self.cancelled.set(true);
        self.withdraw_all();
    }

    fn withdraw_all(self: &Rc<Self>) {
        let registrations = std::mem::take(&mut *self.registrations.borrow_mut());
        for queue in registrations {
            if let Some(queue) = queue.upgrade() {
                queue.withdraw(self);
            }
        }
    }
}

/// Completion side of a parked operation.
pub(crate) struct Handoff<X> {
    wait: Rc<Wait>,
    case: usize,
    slot: Rc<Cell<Option<X>>>,
}

impl<X> Handoff<X> {
    pub fn new(wait: &Rc<Wait>, case: usize, slot: &Rc<Cell<Option<X>>>) -> Self {
        Self {
            wait: wait.clone(),
            case,
            slot: slot.clone(),
        }
    }

    pub fn belongs_to(&self, wait: &Rc<Wait>) -> bool {
        Rc::ptr_eq(&self.wait, wait)
    }

    pub fn is_pending(&self) -> bool {
        self.wait.is_pending()
    }

    pub fn task(&self) -> TaskId {
        self.wait.task()
    }

    /// Register the underlying wait in `queue`.
    pub fn register(&self, queue: Weak<dyn Withdraw>) {
        self.wait.register(queue);
    }

    /// Deliver `value` and resume the parked task.
    pub fn fulfill(self, value: X) {
        if !self.wait.is_pending() {
            return;
        }
        self.slot.set(Some(value));
        self.wait.complete(self.case);
    }
}

/// Cancels its wait when dropped before the wait fired.
pub(crate) struct ParkGuard(Rc<Wait>);

impl ParkGuard {
    pub fn new(wait: &Rc<Wait>) -> Self {
        Self(wait.clone())
    }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Future side of a single-case parked operation.
pub(crate) struct Parked<X> {
    slot: Rc<Cell<Option<X>>>,
    _guard: ParkGuard,
}

impl<X> Future for Parked<X> {
    type Output = X;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<X> {
        match self.slot.take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

/// A connected `Handoff`/`Parked` pair for case 0 of `wait`.
pub(crate) fn handoff<X>(wait: &Rc<Wait>) -> (Handoff<X>, Parked<X>) {
    let slot = Rc::new(Cell::new(None));
    let parked = Parked {
        slot: slot.clone(),
        _guard: ParkGuard::new(wait),
    };
    (Handoff::new(wait, 0, &slot), parked)
}
