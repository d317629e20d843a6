// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Weave runtime library.
//!
//! Cooperative tasks on a single host thread. Tasks talk over channels
//! (rendezvous or buffered), multiplex with `select`, guard shared state
//! with an async read/write lock, and unwind through scoped
//! `defer`/`panic`/`recover` frames. Nothing preempts a task: it runs
//! until it blocks, yields or finishes.
//!
//! Components:
//! - green: task records, ready queue, timers and the run loop
//! - spawn: spawn/yield/join for code running inside a task
//! - channel, select: message passing and multiplexing
//! - timeout: sleep, one-shot and periodic timers, receive with timeout
//! - mutex, shared, boxed: lock, named byte buffers, reference cells
//! - unwind: defer/panic/recover frames
//!
//! ```
//! use weave_rt::{buffered, spawn, Scheduler};
//!
//! let sched = Scheduler::new();
//! let total = sched
//!     .block_on(async {
//!         let ch = buffered::<u32>(4);
//!         let tx = ch.clone();
//!         spawn(async move {
//!             for n in 1..=3 {
//!                 let _ = tx.send(n).await;
//!             }
//!             let _ = tx.close();
//!         })
//!         .expect("scheduler open");
//!         let mut total = 0;
//!         while let Some(n) = ch.recv().await {
//!             total += n;
//!         }
//!         Ok(total)
//!     })
//!     .unwrap();
//! assert_eq!(total, 6);
//! ```

pub mod boxed;
pub mod channel;
pub mod config;
pub(crate) mod context;
pub mod error;
pub mod green;
pub mod logger;
pub mod mutex;
pub mod select;
pub mod shared;
pub mod spawn;
pub mod timeout;
pub mod unwind;

pub use boxed::{make_ref, Boxed};
pub use channel::{buffered, make_channel, unbuffered, Channel, TryRecvError, TrySendError};
pub use config::{ClockMode, SchedulerConfig};
pub use error::{BlockedTask, ChannelError, ConfigError, LockError, MemoryError, SchedulerError};
pub use green::handle::{KeepAlive, RemoteHandle, TaskHandle};
pub use green::scheduler::{RunReport, Scheduler, TaskFailure};
pub use green::task::{LockMode, ObjectId, TaskId, TaskSnapshot, TaskState, WaitTarget};
pub use mutex::{make_lock, AsyncLock, LockStatus};
pub use select::{select, Select};
pub use shared::{make_shared_buffer, SharedBuffer};
pub use spawn::{current_task, spawn, yield_now, JoinError, YieldNow};
pub use timeout::{after, now, recv_timeout, sleep, ticker, TimedOut, Ticker};
pub use unwind::{
    defer, frame, frame_async, is_panicking, panic, recover, Fallible, PanicPayload, Unwind,
};
