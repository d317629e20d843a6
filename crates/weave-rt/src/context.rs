// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context.
//!
//! The scheduler installs itself (and the task being polled) in a
//! thread-local before every poll, host job and timer callback. Guest
//! operations such as `spawn`, `select` or `defer` find their scheduler
//! and task through it instead of taking explicit parameters.

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;

use crate::green::scheduler::Scheduler;
use crate::green::task::TaskId;
use crate::unwind::UnwindStack;

/// The task currently being polled, with the scheduler that owns it.
#[derive(Clone)]
pub(crate) struct TaskRef {
    pub sched: Scheduler,
    pub id: TaskId,
}

#[derive(Clone)]
struct Entered {
    sched: Scheduler,
    task: Option<(TaskId, Rc<RefCell<UnwindStack>>)>,
}

thread_local! {
    static CURRENT: RefCell<Option<Entered>> = RefCell::new(None);

    /// Unwind stack for frames entered outside of any task.
    static DETACHED_UNWIND: Rc<RefCell<UnwindStack>> =
        Rc::new(RefCell::new(UnwindStack::default()));
}

/// Restores the previous context on drop.
pub(crate) struct EnterGuard {
    prev: Option<Entered>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        // Drop the replaced context outside the thread-local borrow.
        let _entered = CURRENT.with(|cell| cell.replace(prev));
    }
}

pub(crate) fn enter(
    sched: &Scheduler,
    task: Option<(TaskId, Rc<RefCell<UnwindStack>>)>,
) -> EnterGuard {
    let entered = Entered {
        sched: sched.clone(),
        task,
    };
    let prev = CURRENT.with(|cell| cell.replace(Some(entered)));
    EnterGuard { prev }
}

pub(crate) fn scheduler() -> Option<Scheduler> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|e| e.sched.clone()))
}

pub(crate) fn task() -> Option<TaskRef> {
    CURRENT.with(|cell| {
        cell.borrow().as_ref().and_then(|e| {
            e.task.as_ref().map(|(id, _)| TaskRef {
                sched: e.sched.clone(),
                id: *id,
            })
        })
    })
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(|e| e.task.as_ref().map(|(id, _)| *id))
    })
}

/// Panics when `op` is used outside a task.
pub(crate) fn expect_task(op: &str) -> TaskRef {
    match task() {
        Some(task) => task,
        None => panic!("`{op}` must be called from a task running on a weave scheduler"),
    }
}

/// Panics when `op` is used off the scheduler thread.
pub(crate) fn expect_scheduler(op: &str) -> Scheduler {
    match scheduler() {
        Some(sched) => sched,
        None => panic!("`{op}` must be called while a weave scheduler is running"),
    }
}

/// The current task's unwind stack, or this thread's detached stack.
pub(crate) fn unwind_stack() -> Rc<RefCell<UnwindStack>> {
    let task_stack = CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(|e| e.task.as_ref().map(|(_, stack)| stack.clone()))
    });
    match task_stack {
        Some(stack) => stack,
        None => DETACHED_UNWIND.with(Rc::clone),
    }
}

/// Uniform index in `0..n` from the scheduler's seeded generator.
pub(crate) fn pick_index(n: usize) -> usize {
    match scheduler() {
        Some(sched) => sched.pick(n),
        None => rand::thread_rng().gen_range(0..n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_outside_scheduler() {
        assert!(scheduler().is_none());
        assert!(task().is_none());
        assert!(current_task_id().is_none());
    }

    #[test]
    fn enter_restores_previous() {
        let sched = Scheduler::new();
        {
            let _outer = enter(&sched, None);
            assert!(scheduler().is_some());
            assert!(task().is_none());
        }
        assert!(scheduler().is_none());
    }

    #[test]
    fn detached_stack_is_per_thread() {
        let a = unwind_stack();
        let b = unwind_stack();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    #[should_panic(expected = "must be called from a task")]
    fn expect_task_outside_task_panics() {
        let _ = expect_task("recv");
    }
}
