// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured unwinding: `defer`, `panic` and `recover`.
//!
//! A guest panic is an ordinary value. [`panic`] produces an
//! `Err(Unwind)` which the guest returns with `?`; every enclosing
//! [`frame`] then runs its deferred closures in LIFO order before
//! passing the unwind outward. A deferred closure may call [`recover`]
//! to stop the unwind, in which case its frame returns `Ok(None)`.
//!
//! Each task owns its own unwind stack. Frames entered outside any task
//! share a per-thread stack.
//!
//! Host Rust panics are not part of this model. They are caught at the
//! scheduler's poll boundary and fail the task directly, skipping defers.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use crate::context;

/// Value carried by a guest panic.
#[derive(Clone)]
pub struct PanicPayload(Rc<dyn Any>);

impl PanicPayload {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Convert a caught host panic, keeping only its message.
    pub(crate) fn from_host(err: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = err.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(msg)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// The payload as text, when it is a `&str` or `String`.
    pub fn message(&self) -> Option<&str> {
        if let Some(s) = self.downcast_ref::<&'static str>() {
            Some(s)
        } else {
            self.downcast_ref::<String>().map(String::as_str)
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.debug_tuple("PanicPayload").field(&msg).finish(),
            None => f.write_str("PanicPayload(..)"),
        }
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().unwrap_or("<non-string payload>"))
    }
}

/// An unwind in progress. Return it from the enclosing frame with `?`.
#[must_use = "an unwind only propagates when it is returned"]
#[derive(Debug, Clone)]
pub struct Unwind {
    payload: PanicPayload,
}

impl Unwind {
    pub fn payload(&self) -> &PanicPayload {
        &self.payload
    }

    pub fn into_payload(self) -> PanicPayload {
        self.payload
    }
}

impl From<PanicPayload> for Unwind {
    fn from(payload: PanicPayload) -> Self {
        Self { payload }
    }
}

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.payload)
    }
}

impl std::error::Error for Unwind {}

/// Start unwinding with `payload`.
///
/// ```
/// # use weave_rt::{frame, panic};
/// let result = frame(|| -> Result<(), _> { panic("boom") });
/// assert_eq!(result.unwrap_err().payload().message(), Some("boom"));
/// ```
pub fn panic<T, P: Any>(payload: P) -> Result<T, Unwind> {
    Err(Unwind {
        payload: PanicPayload::new(payload),
    })
}

/// Return types accepted from deferred closures and task bodies.
pub trait Fallible {
    fn into_result(self) -> Result<(), Unwind>;
}

impl Fallible for () {
    fn into_result(self) -> Result<(), Unwind> {
        Ok(())
    }
}

impl Fallible for Result<(), Unwind> {
    fn into_result(self) -> Result<(), Unwind> {
        self
    }
}

type Deferred = Box<dyn FnOnce() -> Result<(), Unwind>>;

struct Frame {
    defers: Vec<Deferred>,
    /// Payload of the unwind passing through this frame, if any.
    panic: Option<PanicPayload>,
    /// Set once the body has ended and defers are running.
    draining: bool,
}

/// Per-task stack of active frames.
#[derive(Default)]
pub(crate) struct UnwindStack {
    frames: Vec<Frame>,
}

impl UnwindStack {
    fn push_frame(&mut self) -> usize {
        self.frames.push(Frame {
            defers: Vec::new(),
            panic: None,
            draining: false,
        });
        self.frames.len() - 1
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_panicking(&self) -> bool {
        self.frames.iter().any(|f| f.panic.is_some())
    }
}

/// Register `f` to run when the innermost frame ends.
///
/// Deferred closures run in reverse registration order, on normal return
/// and while unwinding alike. A closure that returns `Err` replaces the
/// frame's panic payload; the remaining closures still run.
///
/// # Panics
///
/// When no frame is active. Every task body runs inside one.
pub fn defer<F, R>(f: F)
where
    F: FnOnce() -> R + 'static,
    R: Fallible,
{
    let stack = context::unwind_stack();
    let mut stack = stack.borrow_mut();
    match stack.frames.last_mut() {
        Some(frame) => frame.defers.push(Box::new(move || f().into_result())),
        None => panic!("`defer` called outside of a frame"),
    }
}

/// Stop the unwind passing through the innermost frame.
///
/// Returns the payload only when called from one of that frame's
/// deferred closures while it is unwinding. Everywhere else it returns
/// `None` and has no effect.
pub fn recover() -> Option<PanicPayload> {
    let stack = context::unwind_stack();
    let mut stack = stack.borrow_mut();
    let frame = stack.frames.last_mut()?;
    if !frame.draining {
        return None;
    }
    frame.panic.take()
}

/// Whether an unwind is passing through any active frame.
pub fn is_panicking() -> bool {
    context::unwind_stack().borrow().is_panicking()
}

/// Run `body` as a frame.
///
/// Returns `Ok(Some(value))` on normal completion, `Ok(None)` when a
/// deferred closure recovered an unwind, and `Err` when the unwind
/// continues past this frame.
pub fn frame<T>(body: impl FnOnce() -> Result<T, Unwind>) -> Result<Option<T>, Unwind> {
    let stack = context::unwind_stack();
    let depth = stack.borrow_mut().push_frame();
    let result = body();
    finish(&stack, depth, result)
}

/// Async form of [`frame`]. Deferred closures still run synchronously.
pub async fn frame_async<T, F>(body: F) -> Result<Option<T>, Unwind>
where
    F: Future<Output = Result<T, Unwind>>,
{
    let depth = context::unwind_stack().borrow_mut().push_frame();
    let result = body.await;
    finish(&context::unwind_stack(), depth, result)
}

fn finish<T>(
    stack: &Rc<RefCell<UnwindStack>>,
    depth: usize,
    result: Result<T, Unwind>,
) -> Result<Option<T>, Unwind> {
    let value = {
        let mut stack = stack.borrow_mut();
        // Inner frames abandoned without finishing lose their defers.
        stack.frames.truncate(depth + 1);
        let Some(frame) = stack.frames.get_mut(depth) else {
            return result.map(Some);
        };
        frame.draining = true;
        match result {
            Ok(value) => Some(value),
            Err(unwind) => {
                frame.panic = Some(unwind.payload);
                None
            }
        }
    };

    // The stack must not be borrowed while a deferred closure runs.
    loop {
        let next = stack
            .borrow_mut()
            .frames
            .get_mut(depth)
            .and_then(|f| f.defers.pop());
        let Some(deferred) = next else { break };
        if let Err(unwind) = deferred() {
            if let Some(frame) = stack.borrow_mut().frames.get_mut(depth) {
                frame.panic = Some(unwind.payload);
            }
        }
    }

    let frame = {
        let mut stack = stack.borrow_mut();
        stack.frames.truncate(depth + 1);
        stack.frames.pop()
    };
    match frame.and_then(|f| f.panic) {
        Some(payload) => Err(Unwind { payload }),
        None => Ok(value),
    }
}
