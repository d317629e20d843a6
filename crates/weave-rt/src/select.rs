// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select over channel operations.
//!
//! Cases are tried in a random permutation and the first one that can
//! proceed wins, so every ready case is equally likely. With no ready
//! case the default runs if there is one; otherwise the task parks on
//! every case at once and the first counterpart to arrive completes it.
//! The losing registrations are withdrawn before the task resumes.
//!
//! ```
//! # use weave_rt::{buffered, select, Scheduler};
//! let sched = Scheduler::new();
//! let ch = buffered::<u32>(1);
//! ch.try_send(5).unwrap();
//! let got = sched
//!     .block_on(async move {
//!         let got = select()
//!             .recv(&ch, |v| v)
//!             .default(|| None)
//!             .await;
//!         Ok(got)
//!     })
//!     .unwrap();
//! assert_eq!(got, Some(5));
//! ```

use std::cell::Cell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::Poll;

use crate::channel::Channel;
use crate::context;
use crate::error::ChannelError;
use crate::green::task::{ObjectId, WaitTarget};
use crate::green::wait::{Handoff, ParkGuard, Wait};

/// Start building a select.
pub fn select<'a, R: 'a>() -> Select<'a, R> {
    Select::new()
}

/// A set of channel cases, each with a handler producing `R`.
pub struct Select<'a, R> {
    arms: Vec<Box<dyn Arm<R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
}

trait Arm<R> {
    fn channel(&self) -> ObjectId;
    /// Complete the case now if it can proceed without blocking.
    fn try_fire(&mut self) -> Option<R>;
    fn park(&mut self, wait: &Rc<Wait>, case: usize);
    /// Run the handler if a counterpart completed this case.
    fn take_fired(&mut self) -> Option<R>;
}

struct RecvArm<T, F> {
    chan: Channel<T>,
    handler: Option<F>,
    slot: Rc<Cell<Option<Option<T>>>>,
}

impl<T, R, F> Arm<R> for RecvArm<T, F>
where
    T: 'static,
    F: FnOnce(Option<T>) -> R,
{
    fn channel(&self) -> ObjectId {
        self.chan.id()
    }

    fn try_fire(&mut self) -> Option<R> {
        if self.handler.is_none() {
            return None;
        }
        let value = self.chan.recv_now()?;
        self.handler.take().map(|handler| handler(value))
    }

    fn park(&mut self, wait: &Rc<Wait>, case: usize) {
        self.chan.park_recv(Handoff::new(wait, case, &self.slot));
    }

    fn take_fired(&mut self) -> Option<R> {
        let value = self.slot.take()?;
        self.handler.take().map(|handler| handler(value))
    }
}

struct SendArm<T, F> {
    chan: Channel<T>,
    value: Option<T>,
    handler: Option<F>,
    slot: Rc<Cell<Option<Result<(), ChannelError>>>>,
}

impl<T, R, F> Arm<R> for SendArm<T, F>
where
    T: 'static,
    F: FnOnce(Result<(), ChannelError>) -> R,
{
    fn channel(&self) -> ObjectId {
        self.chan.id()
    }

    fn try_fire(&mut self) -> Option<R> {
        let value = self.value.take()?;
        match self.chan.send_now(value) {
            Ok(result) => self.handler.take().map(|handler| handler(result)),
            Err(value) => {
                self.value = Some(value);
                None
            }
        }
    }

    fn park(&mut self, wait: &Rc<Wait>, case: usize) {
        if let Some(value) = self.value.take() {
            self.chan
                .park_send(value, Handoff::new(wait, case, &self.slot));
        }
    }

    fn take_fired(&mut self) -> Option<R> {
        let result = self.slot.take()?;
        self.handler.take().map(|handler| handler(result))
    }
}

impl<'a, R: 'a> Select<'a, R> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            default: None,
        }
    }

    /// Receive case. The handler gets `None` when the channel is closed.
    #[must_use]
    pub fn recv<T: 'static>(
        mut self,
        chan: &Channel<T>,
        handler: impl FnOnce(Option<T>) -> R + 'a,
    ) -> Self {
        self.arms.push(Box::new(RecvArm {
            chan: chan.clone(),
            handler: Some(handler),
            slot: Rc::new(Cell::new(None)),
        }));
        self
    }

    /// Send case. The handler gets the outcome of the send.
    #[must_use]
    pub fn send<T: 'static>(
        mut self,
        chan: &Channel<T>,
        value: T,
        handler: impl FnOnce(Result<(), ChannelError>) -> R + 'a,
    ) -> Self {
        self.arms.push(Box::new(SendArm {
            chan: chan.clone(),
            value: Some(value),
            handler: Some(handler),
            slot: Rc::new(Cell::new(None)),
        }));
        self
    }

    /// Run `handler` instead of blocking when no case is ready.
    #[must_use]
    pub fn default(mut self, handler: impl FnOnce() -> R + 'a) -> Self {
        self.default = Some(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    /// Wait for one case to complete and return its handler's result.
    ///
    /// With no cases and no default this never completes.
    pub async fn run(mut self) -> R {
        let mut order: Vec<usize> = (0..self.arms.len()).collect();
        for i in (1..order.len()).rev() {
            order.swap(i, context::pick_index(i + 1));
        }
        for &case in &order {
            if let Some(out) = self.arms[case].try_fire() {
                return out;
            }
        }
        if let Some(default) = self.default.take() {
            return default();
        }

        let channels = self.arms.iter().map(|arm| arm.channel()).collect();
        let wait = Wait::park(
            &context::expect_task("select"),
            WaitTarget::Select { channels },
        );
        let _guard = ParkGuard::new(&wait);
        for (case, arm) in self.arms.iter_mut().enumerate() {
            arm.park(&wait, case);
        }
        let mut arms = self.arms;
        std::future::poll_fn(move |_| match arms.iter_mut().find_map(|arm| arm.take_fired()) {
            Some(out) => Poll::Ready(out),
            None => Poll::Pending,
        })
        .await
    }
}

impl<'a, R: 'a> IntoFuture for Select<'a, R> {
    type Output = R;
    type IntoFuture = Pin<Box<dyn Future<Output = R> + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{buffered, unbuffered};
    use crate::green::scheduler::Scheduler;
    use crate::spawn::yield_now;

    #[test]
    fn single_ready_case_is_chosen() {
        let sched = Scheduler::new();
        let a = unbuffered::<u32>();
        let b = buffered::<u32>(1);
        b.try_send(9).unwrap();
        let got = sched
            .block_on(async move {
                let got = select()
                    .recv(&a, |v| ("a", v))
                    .recv(&b, |v| ("b", v))
                    .await;
                Ok(got)
            })
            .unwrap();
        assert_eq!(got, ("b", Some(9)));
    }

    #[test]
    fn default_runs_when_nothing_ready() {
        let sched = Scheduler::new();
        let a = unbuffered::<u32>();
        let got = sched
            .block_on(async move {
                Ok(select().recv(&a, |_| "recv").default(|| "default").await)
            })
            .unwrap();
        assert_eq!(got, "default");
    }

    #[test]
    fn parks_until_a_case_completes_and_withdraws_the_rest() {
        let sched = Scheduler::new();
        let a = unbuffered::<u32>();
        let b = unbuffered::<u32>();

        let tx = b.clone();
        sched
            .spawn(async move {
                yield_now().await;
                tx.send(4).await.unwrap();
            })
            .unwrap();
        let (ra, rb) = (a.clone(), b.clone());
        let got = sched
            .block_on(async move {
                let got = select()
                    .recv(&ra, |v| ("a", v))
                    .recv(&rb, |v| ("b", v))
                    .await;
                Ok((got, ra.waiting_receivers(), rb.waiting_receivers()))
            })
            .unwrap();
        assert_eq!(got, (("b", Some(4)), 0, 0));
    }

    #[test]
    fn send_case_hands_value_to_receiver() {
        let sched = Scheduler::new();
        let out = unbuffered::<&str>();
        let rx = out.clone();
        sched
            .spawn(async move {
                assert_eq!(rx.recv().await, Some("hello"));
            })
            .unwrap();
        let sent = sched
            .block_on(async move {
                Ok(select().send(&out, "hello", |r| r.is_ok()).await)
            })
            .unwrap();
        assert!(sent);
    }

    #[test]
    fn closed_channel_is_ready() {
        let sched = Scheduler::new();
        let ch = unbuffered::<u8>();
        ch.close().unwrap();
        let got = sched
            .block_on(async move { Ok(select().recv(&ch, |v| v).await) })
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn parked_send_case_withdrawn_when_recv_case_wins() {
        let sched = Scheduler::new();
        let full = buffered::<u32>(1);
        full.try_send(0).unwrap();
        let input = unbuffered::<u32>();

        let tx = input.clone();
        sched
            .spawn(async move {
                yield_now().await;
                tx.send(1).await.unwrap();
            })
            .unwrap();
        let (f, i) = (full.clone(), input.clone());
        let got = sched
            .block_on(async move {
                let got = select()
                    .send(&f, 99, |_| "sent")
                    .recv(&i, |_| "received")
                    .await;
                Ok(got)
            })
            .unwrap();
        assert_eq!(got, "received");
        assert_eq!(full.waiting_senders(), 0);
        assert_eq!(full.try_recv(), Ok(0));
    }

    #[test]
    fn empty_select_without_default_blocks() {
        let sched = Scheduler::new();
        let err = sched
            .block_on(async {
                select::<()>().await;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SchedulerError::Deadlock { ref blocked } if blocked.len() == 1
        ));
    }
}
