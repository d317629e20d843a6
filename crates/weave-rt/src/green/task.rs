// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation.
//!
//! A task is a boxed future driven by `poll()` plus a record the scheduler
//! keeps about it. The two live in separate tables so that a task being
//! polled can spawn, wake and inspect other tasks.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Wake;
use std::time::Duration;

use super::queue::{RemoteEvent, RemoteQueue};
use super::wait::Handoff;
use crate::unwind::{PanicPayload, Unwind, UnwindStack};

/// Scheduler-unique task identifier, assigned at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Hands out task ids in spawn order, starting at 1.
#[derive(Debug)]
pub(crate) struct TaskIdGenerator {
    next: u64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> TaskId {
        let id = TaskId(self.next);
        self.next += 1;
        id
    }
}

/// Task lifecycle states.
///
/// `Ready -> Running -> (Blocked -> Ready)* -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Queued, waiting to be polled.
    Ready,
    /// Currently being polled.
    Running,
    /// Parked on a channel, lock, timer, join or host event.
    Blocked,
    /// Body returned normally.
    Completed,
    /// Body ended with an unrecovered panic.
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Identity of a channel or lock, used to describe what a task waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Access mode requested from an [`AsyncLock`](crate::AsyncLock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    Send { channel: ObjectId },
    Recv { channel: ObjectId },
    Select { channels: Vec<ObjectId> },
    Lock { lock: ObjectId, mode: LockMode },
    Sleep { until: Duration },
    Join { task: TaskId },
    /// Gave up the processor, already requeued.
    Yield,
    /// A foreign future returned `Pending`; resumed through its waker.
    Host,
}

impl WaitTarget {
    /// Whether this wait can be completed by activity on `channel`.
    pub fn involves(&self, channel: ObjectId) -> bool {
        match self {
            Self::Send { channel: c } | Self::Recv { channel: c } => *c == channel,
            Self::Select { channels } => channels.contains(&channel),
            _ => false,
        }
    }
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send { channel } => write!(f, "send on channel {channel}"),
            Self::Recv { channel } => write!(f, "recv on channel {channel}"),
            Self::Select { channels } => {
                write!(f, "select over [")?;
                for (i, ch) in channels.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{ch}")?;
                }
                write!(f, "]")
            }
            Self::Lock { lock, mode } => write!(f, "{mode:?} lock {lock}"),
            Self::Sleep { until } => write!(f, "sleep until {until:?}"),
            Self::Join { task } => write!(f, "join of {task}"),
            Self::Yield => write!(f, "yield"),
            Self::Host => write!(f, "host event"),
        }
    }
}

/// Type-erased task body. The typed result, if any, is captured by the
/// closure and written to a slot owned by the caller.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Unwind>>>>;

/// Scheduler bookkeeping for one task.
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub parent: Option<TaskId>,
    pub wait: Option<WaitTarget>,
    pub unwind: Rc<RefCell<UnwindStack>>,
    pub failure: Option<PanicPayload>,
    /// Tasks parked in `TaskHandle::join`.
    pub joiners: Vec<Handoff<()>>,
    /// Live `TaskHandle`s. A terminal record is reclaimed once this is zero.
    pub handles: usize,
}

impl TaskRecord {
    pub fn new(id: TaskId, parent: Option<TaskId>) -> Self {
        Self {
            id,
            state: TaskState::Ready,
            parent,
            wait: None,
            unwind: Rc::new(RefCell::new(UnwindStack::default())),
            failure: None,
            joiners: Vec::new(),
            handles: 0,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            state: self.state,
            parent: self.parent,
            wait: self.wait.clone(),
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub parent: Option<TaskId>,
    pub wait: Option<WaitTarget>,
}

/// Waker handed to task polls. Foreign futures that park on it resume the
/// task through the scheduler's remote queue, which is safe to reach from
/// any thread.
pub(crate) struct TaskWaker {
    task: TaskId,
    remote: Arc<RemoteQueue>,
}

impl TaskWaker {
    pub fn new(task: TaskId, remote: Arc<RemoteQueue>) -> Self {
        Self { task, remote }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.remote.push(RemoteEvent::Wake(self.task));
    }
}
