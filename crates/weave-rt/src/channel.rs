// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! A channel with capacity 0 is a rendezvous: a send completes only when
//! a receiver takes the value. A channel with capacity k buffers up to k
//! values. Values are delivered in FIFO order and each value reaches
//! exactly one receiver. Blocked senders and receivers are served in
//! arrival order.
//!
//! After `close`, receivers drain any buffered values and then observe
//! `None`. Sending on a closed channel returns
//! [`ChannelError::SendOnClosedChannel`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::context;
use crate::error::ChannelError;
use crate::green::task::{ObjectId, WaitTarget};
use crate::green::wait::{handoff, Handoff, Wait, Withdraw};

/// Error from [`Channel::try_send`]. The value is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Buffer is full and no receiver is waiting.
    Full(T),
    /// Channel is closed.
    Closed(T),
}

/// Error from [`Channel::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value available right now.
    Empty,
    /// Channel is closed and drained.
    Closed,
}

/// Create a buffered channel with capacity `n`.
pub fn buffered<T: 'static>(n: usize) -> Channel<T> {
    Channel::new(n)
}

/// Create a channel; capacity zero makes it a rendezvous channel.
pub fn make_channel<T: 'static>(capacity: usize) -> Channel<T> {
    Channel::new(capacity)
}

/// Create an unbuffered (rendezvous) channel.
pub fn unbuffered<T: 'static>() -> Channel<T> {
    Channel::new(0)
}

/// Multi-producer, multi-consumer channel. Clones share the channel.
pub struct Channel<T> {
    inner: Rc<RefCell<ChanState<T>>>,
}

struct ChanState<T> {
    id: ObjectId,
    capacity: usize,
    buffer: VecDeque<T>,
    closed: bool,
    senders: VecDeque<SendWaiter<T>>,
    receivers: VecDeque<Handoff<Option<T>>>,
}

struct SendWaiter<T> {
    value: T,
    done: Handoff<Result<(), ChannelError>>,
}

enum SendStep<T> {
    Buffered,
    Deliver(Handoff<Option<T>>, T),
    Closed(T),
    Full(T),
}

enum RecvStep<T> {
    /// A value, plus the sender whose value just moved into the buffer
    /// (or was taken directly) and must be released.
    Value(T, Option<Handoff<Result<(), ChannelError>>>),
    Closed,
    Empty,
}

impl<T> ChanState<T> {
    fn send_step(&mut self, value: T) -> SendStep<T> {
        if self.closed {
            return SendStep::Closed(value);
        }
        while let Some(receiver) = self.receivers.pop_front() {
            if receiver.is_pending() {
                return SendStep::Deliver(receiver, value);
            }
        }
        if self.buffer.len() < self.capacity {
            self.buffer.push_back(value);
            return SendStep::Buffered;
        }
        SendStep::Full(value)
    }

    fn recv_step(&mut self) -> RecvStep<T> {
        if let Some(value) = self.buffer.pop_front() {
            let released = self.senders.pop_front().map(|sender| {
                self.buffer.push_back(sender.value);
                sender.done
            });
            return RecvStep::Value(value, released);
        }
        if let Some(sender) = self.senders.pop_front() {
            return RecvStep::Value(sender.value, Some(sender.done));
        }
        if self.closed {
            return RecvStep::Closed;
        }
        RecvStep::Empty
    }
}

impl<T> Withdraw for RefCell<ChanState<T>> {
    fn withdraw(&self, wait: &Rc<Wait>) {
        let withdrawn = {
            let mut st = self.borrow_mut();
            let senders = std::mem::take(&mut st.senders);
            let (withdrawn, kept): (VecDeque<_>, VecDeque<_>) = senders
                .into_iter()
                .partition(|sender| sender.done.belongs_to(wait));
            st.senders = kept;
            st.receivers.retain(|receiver| !receiver.belongs_to(wait));
            withdrawn
        };
        // Values of abandoned sends are dropped outside the borrow.
        drop(withdrawn);
    }
}

impl<T: 'static> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        let id = ObjectId::next();
        trace!(channel = %id, capacity, "channel created");
        Self {
            inner: Rc::new(RefCell::new(ChanState {
                id,
                capacity,
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
            })),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.borrow().id
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn waiting_senders(&self) -> usize {
        self.inner.borrow().senders.len()
    }

    pub fn waiting_receivers(&self) -> usize {
        self.inner.borrow().receivers.len()
    }

    /// Whether both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send `value`, parking until a receiver or buffer slot takes it.
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        let value = match self.send_now(value) {
            Ok(result) => return result,
            Err(value) => value,
        };
        let parked = {
            let task = context::expect_task("Channel::send");
            let wait = Wait::park(&task, WaitTarget::Send { channel: self.id() });
            let (done, parked) = handoff(&wait);
            self.park_send(value, done);
            parked
        };
        parked.await
    }

    /// Receive the next value, parking while the channel is empty.
    /// `None` means the channel is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        if let Some(value) = self.recv_now() {
            return value;
        }
        let parked = {
            let task = context::expect_task("Channel::recv");
            let wait = Wait::park(&task, WaitTarget::Recv { channel: self.id() });
            let (receiver, parked) = handoff(&wait);
            self.park_recv(receiver);
            parked
        };
        parked.await
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let step = self.inner.borrow_mut().send_step(value);
        match step {
            SendStep::Buffered => Ok(()),
            SendStep::Deliver(receiver, value) => {
                receiver.fulfill(Some(value));
                Ok(())
            }
            SendStep::Full(value) => Err(TrySendError::Full(value)),
            SendStep::Closed(value) => Err(TrySendError::Closed(value)),
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.recv_now() {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Close the channel, waking every parked receiver (with `None`) and
    /// every parked sender (with `SendOnClosedChannel`).
    pub fn close(&self) -> Result<(), ChannelError> {
        let (id, receivers, senders) = {
            let mut st = self.inner.borrow_mut();
            if st.closed {
                return Err(ChannelError::CloseOfClosedChannel);
            }
            st.closed = true;
            (
                st.id,
                std::mem::take(&mut st.receivers),
                std::mem::take(&mut st.senders),
            )
        };
        trace!(channel = %id, receivers = receivers.len(), senders = senders.len(), "channel closed");
        for receiver in receivers {
            receiver.fulfill(None);
        }
        for sender in senders {
            sender.done.fulfill(Err(ChannelError::SendOnClosedChannel));
        }
        Ok(())
    }

    /// Attempt a send without parking. Hands the value back when the
    /// send would block.
    pub(crate) fn send_now(&self, value: T) -> Result<Result<(), ChannelError>, T> {
        let step = self.inner.borrow_mut().send_step(value);
        match step {
            SendStep::Buffered => Ok(Ok(())),
            SendStep::Deliver(receiver, value) => {
                receiver.fulfill(Some(value));
                Ok(Ok(()))
            }
            SendStep::Closed(_) => Ok(Err(ChannelError::SendOnClosedChannel)),
            SendStep::Full(value) => Err(value),
        }
    }

    /// Attempt a receive without parking. `None` when it would block,
    /// `Some(None)` when closed and drained.
    pub(crate) fn recv_now(&self) -> Option<Option<T>> {
        let step = self.inner.borrow_mut().recv_step();
        match step {
            RecvStep::Value(value, released) => {
                if let Some(sender) = released {
                    sender.fulfill(Ok(()));
                }
                Some(Some(value))
            }
            RecvStep::Closed => Some(None),
            RecvStep::Empty => None,
        }
    }

    pub(crate) fn park_send(&self, value: T, done: Handoff<Result<(), ChannelError>>) {
        done.register(self.withdraw_handle());
        self.inner
            .borrow_mut()
            .senders
            .push_back(SendWaiter { value, done });
    }

    pub(crate) fn park_recv(&self, receiver: Handoff<Option<T>>) {
        receiver.register(self.withdraw_handle());
        self.inner.borrow_mut().receivers.push_back(receiver);
    }

    fn withdraw_handle(&self) -> Weak<dyn Withdraw> {
        let weak: Weak<RefCell<ChanState<T>>> = Rc::downgrade(&self.inner);
        weak
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.borrow();
        f.debug_struct("Channel")
            .field("id", &st.id)
            .field("capacity", &st.capacity)
            .field("len", &st.buffer.len())
            .field("closed", &st.closed)
            .finish()
    }
}
