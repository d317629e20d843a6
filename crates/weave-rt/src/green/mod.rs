// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler internals.
//!
//! Components:
//! - `task`: task ids, states, records and the task waker
//! - `queue`: ready queue and the cross-thread remote queue
//! - `wait`: suspension points shared by every blocking primitive
//! - `reactor`: clock and timers
//! - `scheduler`: the run loop
//! - `handle`: `TaskHandle` (join/detach) and `RemoteHandle`

pub mod handle;
pub(crate) mod queue;
pub(crate) mod reactor;
pub mod scheduler;
pub mod task;
pub(crate) mod wait;
