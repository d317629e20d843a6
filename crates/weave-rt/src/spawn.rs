// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawn, yield and join for guest code.
//!
//! These free functions act on the scheduler driving the current task.
//! Host code holding a [`Scheduler`](crate::Scheduler) calls its methods
//! directly instead.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;

use crate::context;
use crate::error::SchedulerError;
use crate::green::handle::TaskHandle;
use crate::green::task::{TaskId, WaitTarget};
use crate::unwind::{Fallible, PanicPayload};

/// Error returned by `join()` when the task did not complete normally.
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// Task ended with an unrecovered panic.
    #[error("task panicked: {0}")]
    Panicked(PanicPayload),
    /// Task was dropped before finishing (scheduler shutdown).
    #[error("task was cancelled")]
    Cancelled,
}

/// Spawn `body` as a child of the current task.
///
/// # Panics
///
/// When called off the scheduler thread.
pub fn spawn<F>(body: F) -> Result<TaskHandle, SchedulerError>
where
    F: Future + 'static,
    F::Output: Fallible,
{
    context::expect_scheduler("spawn").spawn(body)
}

/// Id of the task being polled, if any.
pub fn current_task() -> Option<TaskId> {
    context::current_task_id()
}

/// Move the current task to the back of the ready queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        let task = context::expect_task("yield_now");
        // Both calls are infallible for the running task.
        let _ = task.sched.suspend(task.id, WaitTarget::Yield);
        let _ = task.sched.resume(task.id);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::green::scheduler::Scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn yield_interleaves_tasks() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let order = order.clone();
            sched
                .spawn(async move {
                    for step in 0..2 {
                        order.borrow_mut().push(format!("{name}{step}"));
                        yield_now().await;
                    }
                })
                .unwrap();
        }
        sched.run().unwrap();
        assert_eq!(*order.borrow(), ["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn spawned_child_records_parent() {
        let sched = Scheduler::new();
        let observed = Rc::new(RefCell::new(None));
        let slot = observed.clone();
        let parent = sched
            .spawn(async move {
                let me = current_task();
                let child = spawn(async {}).unwrap();
                let snapshot = crate::context::expect_scheduler("test")
                    .tasks()
                    .into_iter()
                    .find(|t| t.id == child.id());
                *slot.borrow_mut() = snapshot.map(|t| (t.parent, me));
            })
            .unwrap();
        sched.run().unwrap();
        let (child_parent, me) = observed.borrow().clone().unwrap();
        assert_eq!(child_parent, Some(parent.id()));
        assert_eq!(me, Some(parent.id()));
    }

    #[test]
    fn spawn_panic_returns_join_error() {
        let sched = Scheduler::new();
        let h = sched
            .spawn(async { crate::unwind::panic::<(), _>("boom") })
            .unwrap();
        sched.run().unwrap();
        match h.outcome() {
            Some(Err(JoinError::Panicked(payload))) => {
                assert!(payload.to_string().contains("boom"))
            }
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn join_error_messages() {
        let panicked = JoinError::Panicked(PanicPayload::new("boom"));
        assert_eq!(panicked.to_string(), "task panicked: boom");
        assert_eq!(JoinError::Cancelled.to_string(), "task was cancelled");
        let err: &dyn std::error::Error = &JoinError::Cancelled;
        assert!(err.source().is_none());
    }

    #[test]
    #[should_panic(expected = "must be called while a weave scheduler is running")]
    fn spawn_outside_scheduler_panics() {
        let _ = spawn(async {});
    }
}
