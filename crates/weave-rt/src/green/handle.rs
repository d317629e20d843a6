// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Handles onto scheduler state.
//!
//! [`TaskHandle`] observes and joins one task from the scheduler thread.
//! [`RemoteHandle`] is the only `Send` entry point: other threads use it
//! to run closures on the scheduler and to wake tasks parked on foreign
//! futures.

use std::fmt;
use std::sync::Arc;

use super::queue::{RemoteEvent, RemoteQueue};
use super::scheduler::{Scheduler, WeakScheduler};
use super::task::{TaskId, TaskState, WaitTarget};
use super::wait::{handoff, Wait};
use crate::context;
use crate::spawn::JoinError;

/// Handle to a spawned task.
///
/// Dropping the handle detaches the task. A finished task's record stays
/// queryable while at least one handle to it is alive.
pub struct TaskHandle {
    id: TaskId,
    sched: WeakScheduler,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, sched: &Scheduler) -> Self {
        sched.add_handle(id);
        Self {
            id,
            sched: sched.downgrade(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state, or `None` once the scheduler has dropped the task.
    pub fn state(&self) -> Option<TaskState> {
        self.sched.upgrade()?.task_state(self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.state().map_or(true, TaskState::is_terminal)
    }

    /// Outcome without waiting. `None` while the task is still live.
    pub fn outcome(&self) -> Option<Result<(), JoinError>> {
        match self.sched.upgrade() {
            Some(sched) => sched.outcome(self.id),
            None => Some(Err(JoinError::Cancelled)),
        }
    }

    /// Park the calling task until this task finishes.
    pub async fn join(&self) -> Result<(), JoinError> {
        let parked = {
            let Some(sched) = self.sched.upgrade() else {
                return Err(JoinError::Cancelled);
            };
            if let Some(outcome) = sched.outcome(self.id) {
                return outcome;
            }
            let task = context::expect_task("TaskHandle::join");
            let wait = Wait::park(&task, WaitTarget::Join { task: self.id });
            let (joiner, parked) = handoff(&wait);
            sched.add_joiner(self.id, joiner);
            parked
        };
        parked.await;
        self.outcome().unwrap_or(Err(JoinError::Cancelled))
    }

    /// Let the task run on without a handle.
    pub fn detach(self) {}
}

impl Clone for TaskHandle {
    fn clone(&self) -> Self {
        if let Some(sched) = self.sched.upgrade() {
            sched.add_handle(self.id);
        }
        Self {
            id: self.id,
            sched: self.sched.clone(),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.release_handle(self.id);
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Thread-safe handle for feeding work to a scheduler.
#[derive(Clone)]
pub struct RemoteHandle {
    queue: Arc<RemoteQueue>,
}

impl RemoteHandle {
    pub(crate) fn new(queue: Arc<RemoteQueue>) -> Self {
        Self { queue }
    }

    /// Run `job` on the scheduler thread at the start of its next
    /// iteration. The job may spawn tasks and use channels.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.push(RemoteEvent::Job(Box::new(job)));
    }

    /// Resume `task` if it is parked on a foreign future.
    pub fn wake(&self, task: TaskId) {
        self.queue.push(RemoteEvent::Wake(task));
    }

    /// Keep an idle scheduler waiting for host events until the guard is
    /// dropped, instead of finishing or reporting a deadlock.
    pub fn keep_alive(&self) -> KeepAlive {
        self.queue.acquire_hold();
        KeepAlive {
            queue: self.queue.clone(),
        }
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("holds", &self.queue.holds())
            .finish()
    }
}

/// Guard returned by [`RemoteHandle::keep_alive`].
#[must_use = "the scheduler stops waiting as soon as the guard is dropped"]
pub struct KeepAlive {
    queue: Arc<RemoteQueue>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.queue.release_hold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn assert_send<T: Send>() {}

    #[test]
    fn remote_handle_is_send() {
        assert_send::<RemoteHandle>();
        assert_send::<KeepAlive>();
    }

    #[test]
    fn join_waits_for_completion() {
        let sched = Scheduler::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = order.clone();
        let child = sched
            .spawn(async move {
                crate::spawn::yield_now().await;
                crate::spawn::yield_now().await;
                log.borrow_mut().push("child");
            })
            .unwrap();
        let log = order.clone();
        sched
            .spawn(async move {
                child.join().await.unwrap();
                log.borrow_mut().push("joined");
            })
            .unwrap();
        sched.run().unwrap();
        assert_eq!(*order.borrow(), ["child", "joined"]);
    }

    #[test]
    fn join_reports_panic() {
        let sched = Scheduler::new();
        let child = sched
            .spawn(async { crate::unwind::panic::<(), _>("child broke") })
            .unwrap();
        let msg = sched
            .block_on(async move {
                match child.join().await {
                    Err(JoinError::Panicked(payload)) => {
                        Ok(payload.message().map(str::to_string))
                    }
                    _ => Ok(None),
                }
            })
            .unwrap();
        assert_eq!(msg.as_deref(), Some("child broke"));
    }

    #[test]
    fn finished_record_kept_while_handle_alive() {
        let sched = Scheduler::new();
        let handle = sched.spawn(async {}).unwrap();
        let id = handle.id();
        sched.run().unwrap();
        assert_eq!(handle.state(), Some(TaskState::Completed));
        assert!(matches!(handle.outcome(), Some(Ok(()))));

        let copy = handle.clone();
        drop(handle);
        assert_eq!(sched.task_state(id), Some(TaskState::Completed));
        drop(copy);
        assert_eq!(sched.task_state(id), None);
    }

    #[test]
    fn posted_jobs_run_on_scheduler() {
        let sched = Scheduler::new();
        let remote = sched.remote();
        let guard = remote.keep_alive();
        let worker = std::thread::spawn(move || {
            remote.post(move || {
                let _ = crate::spawn::spawn(async {});
                drop(guard);
            });
        });
        let report = sched.run().unwrap();
        worker.join().unwrap();
        assert_eq!(report.completed, 1);
    }

    #[test]
    fn foreign_future_parks_on_host() {
        struct YieldOnce(bool);
        impl std::future::Future for YieldOnce {
            type Output = ();
            fn poll(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<()> {
                if self.0 {
                    return std::task::Poll::Ready(());
                }
                self.0 = true;
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
        }

        let sched = Scheduler::new();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        sched
            .spawn(async move {
                YieldOnce(false).await;
                flag.set(true);
            })
            .unwrap();
        sched.run().unwrap();
        assert!(done.get());
    }
}
