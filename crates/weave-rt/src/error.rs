// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types reported by the runtime.
//!
//! Contract violations on channels, locks and shared memory are reported
//! synchronously to the calling operation. Only an explicit guest `panic`
//! enters the unwind path (see [`crate::unwind`]).

use thiserror::Error;

use crate::green::task::{TaskId, TaskState, WaitTarget};
use crate::unwind::PanicPayload;

/// A task that was blocked when the scheduler stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub task: TaskId,
    pub wait: WaitTarget,
}

impl std::fmt::Display for BlockedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} waiting on {}", self.task, self.wait)
    }
}

fn fmt_state(state: &Option<TaskState>) -> String {
    match state {
        Some(state) => format!("{state:?}"),
        None => "gone".to_string(),
    }
}

fn fmt_blocked(blocked: &[BlockedTask]) -> String {
    blocked
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures of the scheduler itself.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("scheduler is closed")]
    SchedulerClosed,

    #[error("deadlock: all tasks are blocked [{}]", fmt_blocked(.blocked))]
    Deadlock { blocked: Vec<BlockedTask> },

    #[error("internal error: resume of {task} while it is {}", fmt_state(.state))]
    InternalResumeViolation {
        task: TaskId,
        state: Option<TaskState>,
    },

    #[error("internal error: suspend of {task} while it is {}", fmt_state(.state))]
    InvalidSuspend {
        task: TaskId,
        state: Option<TaskState>,
    },

    #[error("root {task} panicked: {payload}")]
    RootPanicked { task: TaskId, payload: PanicPayload },

    #[error("root {task} recovered from a panic without producing a value")]
    RootRecovered { task: TaskId },

    #[error("step limit of {limit} task polls exceeded")]
    StepLimitExceeded { limit: u64 },

    #[error("scheduler is already running on this thread")]
    AlreadyRunning,
}

/// Channel contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("send on closed channel")]
    SendOnClosedChannel,
    #[error("close of closed channel")]
    CloseOfClosedChannel,
}

/// Lock contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("unlock of unlocked lock")]
    UnlockOfUnlocked,
    #[error("runlock of lock not held for reading")]
    RUnlockOfUnlocked,
}

/// Shared memory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("shared buffer requires a name and positive size (got {name:?}, {size})")]
    InvalidSegment { name: String, size: usize },

    #[error("access of {len} byte(s) at offset {offset} is out of bounds for buffer of {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Malformed configuration overrides.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}
