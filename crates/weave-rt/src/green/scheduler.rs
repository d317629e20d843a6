// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative scheduler.
//!
//! One loop on one thread polls ready tasks in FIFO order. A task runs
//! until it completes, fails, or parks on a wait; nothing preempts it.
//! When the ready queue runs dry the loop fires timers, waits for host
//! events, finishes, or reports a deadlock, in that order of preference.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, trace, warn};

use super::handle::{RemoteHandle, TaskHandle};
use super::queue::{ReadyQueue, RemoteEvent, RemoteQueue};
use super::reactor::{Reactor, TimerAction};
use super::task::{
    TaskFuture, TaskId, TaskIdGenerator, TaskRecord, TaskSnapshot, TaskState, TaskWaker,
    WaitTarget,
};
use super::wait::Handoff;
use crate::config::SchedulerConfig;
use crate::context;
use crate::error::{BlockedTask, MemoryError, SchedulerError};
use crate::shared::{SharedBuffer, SharedRegistry};
use crate::spawn::JoinError;
use crate::unwind::{frame_async, Fallible, PanicPayload, Unwind};

/// Handle to a scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

/// Non-owning handle held by waits, timers and task handles.
#[derive(Clone)]
pub(crate) struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.shared.upgrade().map(|shared| Scheduler { shared })
    }
}

struct Shared {
    config: SchedulerConfig,
    state: RefCell<State>,
    /// Task bodies, kept apart from `state` so a poll can mutate records.
    futures: RefCell<HashMap<TaskId, TaskFuture>>,
    rng: RefCell<StdRng>,
    remote: Arc<RemoteQueue>,
    segments: SharedRegistry,
}

struct State {
    tasks: BTreeMap<TaskId, TaskRecord>,
    ready: ReadyQueue,
    ids: TaskIdGenerator,
    reactor: Reactor,
    closed: bool,
    running: bool,
    root: Option<TaskId>,
    /// Internal contract violation; aborts the current run.
    fault: Option<SchedulerError>,
    steps: u64,
    completed: usize,
    failures: Vec<TaskFailure>,
}

/// A non-root task that ended with an unrecovered panic.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TaskId,
    pub payload: PanicPayload,
}

/// Summary of one `run`.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Task polls and timer rounds performed.
    pub steps: u64,
    pub completed: usize,
    pub failures: Vec<TaskFailure>,
}

enum Idle {
    Done,
    Continue,
    Timers,
    AwaitHost(Option<Duration>),
    AwaitHold,
    Deadlock(Vec<BlockedTask>),
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        debug!(seed = ?config.seed, clock = ?config.clock, max_steps = ?config.max_steps, "scheduler created");
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    tasks: BTreeMap::new(),
                    ready: ReadyQueue::new(),
                    ids: TaskIdGenerator::new(),
                    reactor: Reactor::new(config.clock),
                    closed: false,
                    running: false,
                    root: None,
                    fault: None,
                    steps: 0,
                    completed: 0,
                    failures: Vec::new(),
                }),
                config,
                futures: RefCell::new(HashMap::new()),
                rng: RefCell::new(rng),
                remote: Arc::new(RemoteQueue::new()),
                segments: SharedRegistry::default(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    /// Current scheduler time, measured from creation.
    pub fn now(&self) -> Duration {
        self.shared.state.borrow().reactor.now()
    }

    /// Create a ready task running `body`.
    ///
    /// The body runs inside a frame, so it may `defer` directly. Called
    /// from a task of this scheduler, that task becomes the parent.
    pub fn spawn<F>(&self, body: F) -> Result<TaskHandle, SchedulerError>
    where
        F: Future + 'static,
        F::Output: Fallible,
    {
        let parent = match context::scheduler() {
            Some(current) if current.ptr_eq(self) => context::current_task_id(),
            _ => None,
        };
        let body = async move {
            frame_async(async move { body.await.into_result() })
                .await
                .map(|_| ())
        };
        let id = self.spawn_task(Box::pin(body), parent)?;
        Ok(TaskHandle::new(id, self))
    }

    fn spawn_task(
        &self,
        body: TaskFuture,
        parent: Option<TaskId>,
    ) -> Result<TaskId, SchedulerError> {
        let id = {
            let mut st = self.shared.state.borrow_mut();
            if st.closed {
                return Err(SchedulerError::SchedulerClosed);
            }
            let id = st.ids.next();
            st.tasks.insert(id, TaskRecord::new(id, parent));
            st.ready.push(id);
            id
        };
        self.shared.futures.borrow_mut().insert(id, body);
        trace!(task = %id, parent = ?parent, "spawned");
        Ok(id)
    }

    /// Run `root` as the root task and drive the scheduler until it ends.
    ///
    /// The scheduler is closed afterwards: tasks still alive are dropped.
    /// A root whose own frame recovers from a panic has no value to
    /// return and yields [`SchedulerError::RootRecovered`].
    pub fn block_on<T, F>(&self, root: F) -> Result<T, SchedulerError>
    where
        T: 'static,
        F: Future<Output = Result<T, Unwind>> + 'static,
    {
        let slot: Rc<Cell<Option<Option<T>>>> = Rc::new(Cell::new(None));
        let out = slot.clone();
        let body = async move {
            let value = frame_async(root).await?;
            out.set(Some(value));
            Ok(())
        };
        let id = self.spawn_task(Box::pin(body), None)?;
        self.shared.state.borrow_mut().root = Some(id);
        self.run()?;
        match slot.take() {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(SchedulerError::RootRecovered { task: id }),
            None => Err(SchedulerError::SchedulerClosed),
        }
    }

    /// Drive tasks until no task is ready or blocked, the root task ends,
    /// or a deadlock is found.
    pub fn run(&self) -> Result<RunReport, SchedulerError> {
        {
            let mut st = self.shared.state.borrow_mut();
            if st.running {
                return Err(SchedulerError::AlreadyRunning);
            }
            if st.closed {
                return Err(SchedulerError::SchedulerClosed);
            }
            st.running = true;
            st.steps = 0;
            st.completed = 0;
            st.failures.clear();
        }
        debug!(tasks = self.shared.futures.borrow().len(), "scheduler running");
        let result = self.drive();
        self.shared.state.borrow_mut().running = false;
        match &result {
            Ok(report) => debug!(
                steps = report.steps,
                completed = report.completed,
                failed = report.failures.len(),
                "scheduler idle"
            ),
            Err(err) => debug!(%err, "scheduler stopped"),
        }
        result
    }

    fn drive(&self) -> Result<RunReport, SchedulerError> {
        loop {
            self.drain_remote();
            let fault = self.shared.state.borrow_mut().fault.take();
            if let Some(fault) = fault {
                error!(%fault, "scheduler fault");
                self.halt();
                return Err(fault);
            }
            if let Some(task) = self.next_ready()? {
                let terminal = self.poll_task(task);
                if terminal && self.shared.state.borrow().root == Some(task) {
                    return self.finish_root(task);
                }
                continue;
            }
            match self.idle() {
                Idle::Done => return Ok(self.report()),
                Idle::Continue => {}
                Idle::Timers => {
                    self.charge_step(&mut self.shared.state.borrow_mut())?;
                    self.fire_timers();
                }
                Idle::AwaitHost(timeout) => self.shared.remote.wait(timeout),
                Idle::AwaitHold => self.shared.remote.wait_for_hold(),
                Idle::Deadlock(blocked) => {
                    let err = SchedulerError::Deadlock { blocked };
                    error!(%err, "no runnable tasks");
                    self.halt();
                    return Err(err);
                }
            }
        }
    }

    fn next_ready(&self) -> Result<Option<TaskId>, SchedulerError> {
        let mut st = self.shared.state.borrow_mut();
        if st.ready.is_empty() {
            return Ok(None);
        }
        self.charge_step(&mut st)?;
        Ok(st.ready.pop())
    }

    /// Count one poll or timer round against `max_steps`.
    fn charge_step(&self, st: &mut State) -> Result<(), SchedulerError> {
        if let Some(limit) = self.shared.config.max_steps {
            if st.steps >= limit {
                warn!(limit, "step limit reached");
                return Err(SchedulerError::StepLimitExceeded { limit });
            }
        }
        st.steps += 1;
        Ok(())
    }

    /// Poll one task. Returns true if it reached a terminal state.
    fn poll_task(&self, id: TaskId) -> bool {
        let unwind = {
            let mut st = self.shared.state.borrow_mut();
            let Some(rec) = st.tasks.get_mut(&id) else {
                return false;
            };
            if rec.state != TaskState::Ready {
                return false;
            }
            rec.state = TaskState::Running;
            rec.unwind.clone()
        };
        let Some(mut body) = self.shared.futures.borrow_mut().remove(&id) else {
            return false;
        };

        let waker = Waker::from(Arc::new(TaskWaker::new(id, self.shared.remote.clone())));
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let _enter = context::enter(self, Some((id, unwind)));
            std::panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
        };

        match poll {
            Ok(Poll::Pending) => {
                if self.is_closed() {
                    drop(body);
                    return false;
                }
                self.park_on_host(id);
                self.shared.futures.borrow_mut().insert(id, body);
                false
            }
            Ok(Poll::Ready(result)) => {
                drop(body);
                self.finish_task(id, result.err().map(Unwind::into_payload));
                true
            }
            Err(host) => {
                drop(body);
                self.finish_task(id, Some(PanicPayload::from_host(host)));
                true
            }
        }
    }

    /// A poll returned `Pending` without parking through a runtime
    /// primitive: a foreign future is waiting on our waker.
    fn park_on_host(&self, id: TaskId) {
        let mut st = self.shared.state.borrow_mut();
        if let Some(rec) = st.tasks.get_mut(&id) {
            if rec.state == TaskState::Running {
                rec.state = TaskState::Blocked;
                rec.wait = Some(WaitTarget::Host);
                trace!(task = %id, "parked on host future");
            }
        }
    }

    fn finish_task(&self, id: TaskId, failure: Option<PanicPayload>) {
        let (joiners, reclaimed) = {
            let mut guard = self.shared.state.borrow_mut();
            let st = &mut *guard;
            let Some(rec) = st.tasks.get_mut(&id) else {
                return;
            };
            rec.wait = None;
            match failure {
                Some(payload) => {
                    rec.state = TaskState::Failed;
                    rec.failure = Some(payload.clone());
                    if st.root != Some(id) {
                        warn!(task = %id, %payload, "task panicked");
                        st.failures.push(TaskFailure { task: id, payload });
                    }
                }
                None => {
                    rec.state = TaskState::Completed;
                    st.completed += 1;
                    trace!(task = %id, "completed");
                }
            }
            let joiners = std::mem::take(&mut rec.joiners);
            let reclaim = rec.handles == 0 && st.root != Some(id);
            let reclaimed = if reclaim { st.tasks.remove(&id) } else { None };
            (joiners, reclaimed)
        };
        drop(reclaimed);
        for joiner in joiners {
            joiner.fulfill(());
        }
    }

    fn finish_root(&self, root: TaskId) -> Result<RunReport, SchedulerError> {
        let failure = {
            let st = self.shared.state.borrow();
            st.tasks.get(&root).and_then(|rec| rec.failure.clone())
        };
        let report = self.report();
        self.halt();
        match failure {
            Some(payload) => {
                error!(task = %root, %payload, "root task panicked");
                Err(SchedulerError::RootPanicked {
                    task: root,
                    payload,
                })
            }
            None => Ok(report),
        }
    }

    fn report(&self) -> RunReport {
        let st = self.shared.state.borrow();
        RunReport {
            steps: st.steps,
            completed: st.completed,
            failures: st.failures.clone(),
        }
    }

    fn idle(&self) -> Idle {
        if !self.shared.remote.is_empty() {
            return Idle::Continue;
        }
        let holds = self.shared.remote.holds();
        let mut st = self.shared.state.borrow_mut();

        let mut blocked = Vec::new();
        let mut host_waits = false;
        for rec in st.tasks.values() {
            if rec.state != TaskState::Blocked {
                continue;
            }
            if let Some(wait) = &rec.wait {
                host_waits |= *wait == WaitTarget::Host;
                blocked.push(BlockedTask {
                    task: rec.id,
                    wait: wait.clone(),
                });
            }
        }
        if blocked.is_empty() && holds == 0 {
            return Idle::Done;
        }

        // Periodic ticks feeding channels no blocked task watches cannot
        // unblock anything.
        if holds == 0 && !host_waits {
            if let Some(ticks) = st.reactor.tick_channels() {
                let watched = blocked
                    .iter()
                    .any(|b| ticks.iter().any(|&channel| b.wait.involves(channel)));
                if !watched {
                    return Idle::Deadlock(blocked);
                }
            }
        }

        if let Some(deadline) = st.reactor.next_deadline() {
            if st.reactor.is_virtual() {
                st.reactor.advance_to(deadline);
                return Idle::Timers;
            }
            let now = st.reactor.now();
            if deadline <= now {
                return Idle::Timers;
            }
            return Idle::AwaitHost(Some(deadline - now));
        }
        if host_waits {
            return Idle::AwaitHost(None);
        }
        if holds > 0 {
            return Idle::AwaitHold;
        }
        Idle::Deadlock(blocked)
    }

    fn fire_timers(&self) {
        let due = self.shared.state.borrow_mut().reactor.take_due();
        if due.is_empty() {
            return;
        }
        let _enter = context::enter(self, None);
        for action in due {
            trace!(?action, "timer fired");
            action.fire();
        }
    }

    fn drain_remote(&self) {
        let events = self.shared.remote.drain();
        if events.is_empty() {
            return;
        }
        let _enter = context::enter(self, None);
        for event in events {
            match event {
                RemoteEvent::Job(job) => {
                    if let Err(err) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                        error!(payload = %PanicPayload::from_host(err), "host job panicked");
                    }
                }
                RemoteEvent::Wake(task) => {
                    let parked = self.shared.state.borrow().tasks.get(&task).is_some_and(|rec| {
                        rec.state == TaskState::Blocked && rec.wait == Some(WaitTarget::Host)
                    });
                    if parked {
                        let _ = self.resume(task);
                    }
                }
            }
        }
    }

    /// Move a running task to `Blocked` on `target`.
    ///
    /// Suspending a task that is not running is an internal contract
    /// violation: it is recorded and aborts the current run.
    pub fn suspend(&self, task: TaskId, target: WaitTarget) -> Result<(), SchedulerError> {
        let mut guard = self.shared.state.borrow_mut();
        let st = &mut *guard;
        let state = st.tasks.get(&task).map(|rec| rec.state);
        let Some(rec) = st.tasks.get_mut(&task).filter(|rec| rec.state == TaskState::Running)
        else {
            let err = SchedulerError::InvalidSuspend { task, state };
            error!(%err, "scheduler contract violation");
            st.fault.get_or_insert_with(|| err.clone());
            return Err(err);
        };
        trace!(task = %task, wait = %target, "blocked");
        rec.state = TaskState::Blocked;
        rec.wait = Some(target);
        Ok(())
    }

    /// Move a blocked task back to the ready queue.
    ///
    /// Resuming a task that is not blocked is an internal contract
    /// violation: it is recorded and aborts the current run.
    pub fn resume(&self, task: TaskId) -> Result<(), SchedulerError> {
        let mut guard = self.shared.state.borrow_mut();
        let st = &mut *guard;
        let state = st.tasks.get(&task).map(|rec| rec.state);
        let Some(rec) = st.tasks.get_mut(&task).filter(|rec| rec.state == TaskState::Blocked)
        else {
            let err = SchedulerError::InternalResumeViolation { task, state };
            error!(%err, "scheduler contract violation");
            st.fault.get_or_insert_with(|| err.clone());
            return Err(err);
        };
        rec.state = TaskState::Ready;
        rec.wait = None;
        st.ready.push(task);
        trace!(task = %task, "resumed");
        Ok(())
    }

    /// Close the scheduler and drop every task that has not finished.
    ///
    /// Parked operations are withdrawn from their channels and locks
    /// first, so no queue keeps a reference to a dropped task.
    pub fn shutdown(&self) {
        debug!("scheduler shutdown");
        self.halt();
    }

    fn halt(&self) {
        let (bodies, timers) = {
            let mut st = self.shared.state.borrow_mut();
            st.closed = true;
            st.root = None;
            let bodies = std::mem::take(&mut *self.shared.futures.borrow_mut());
            (bodies, st.reactor.clear())
        };
        // Dropping parked futures withdraws their waits, which may grant
        // locks to other doomed tasks. Nothing here may hold a borrow.
        drop(timers);
        drop(bodies);
        let tasks = {
            let mut st = self.shared.state.borrow_mut();
            st.ready.clear();
            st.fault = None;
            std::mem::take(&mut st.tasks)
        };
        if !tasks.is_empty() {
            debug!(dropped = tasks.len(), "tasks dropped at close");
        }
        drop(tasks);
    }

    /// Snapshot of every task still known to the scheduler.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.shared
            .state
            .borrow()
            .tasks
            .values()
            .map(TaskRecord::snapshot)
            .collect()
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.shared.state.borrow().tasks.get(&task).map(|rec| rec.state)
    }

    /// Thread-safe handle for submitting work from other threads.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle::new(self.shared.remote.clone())
    }

    /// Shared buffer registered under `name`, created zero-filled on first
    /// use. Later calls with the same live name return the same memory.
    pub fn shared_buffer(&self, name: &str, size: usize) -> Result<SharedBuffer, MemoryError> {
        self.shared.segments.get_or_create(name, size)
    }

    pub(crate) fn schedule_timer(&self, deadline: Duration, action: TimerAction) {
        let mut st = self.shared.state.borrow_mut();
        if st.closed {
            drop(st);
            drop(action);
            return;
        }
        st.reactor.schedule(deadline, action);
    }

    pub(crate) fn pick(&self, n: usize) -> usize {
        self.shared.rng.borrow_mut().gen_range(0..n)
    }

    pub(crate) fn add_handle(&self, task: TaskId) {
        if let Some(rec) = self.shared.state.borrow_mut().tasks.get_mut(&task) {
            rec.handles += 1;
        }
    }

    pub(crate) fn release_handle(&self, task: TaskId) {
        let reclaimed = {
            let Ok(mut guard) = self.shared.state.try_borrow_mut() else {
                return;
            };
            let st = &mut *guard;
            let Some(rec) = st.tasks.get_mut(&task) else {
                return;
            };
            rec.handles = rec.handles.saturating_sub(1);
            if rec.handles == 0 && rec.state.is_terminal() && st.root != Some(task) {
                st.tasks.remove(&task)
            } else {
                None
            }
        };
        drop(reclaimed);
    }

    /// Terminal outcome of `task`, or `None` while it is still live.
    pub(crate) fn outcome(&self, task: TaskId) -> Option<Result<(), JoinError>> {
        let st = self.shared.state.borrow();
        let Some(rec) = st.tasks.get(&task) else {
            return Some(Err(JoinError::Cancelled));
        };
        match rec.state {
            TaskState::Completed => Some(Ok(())),
            TaskState::Failed => Some(Err(JoinError::Panicked(
                rec.failure
                    .clone()
                    .unwrap_or_else(|| PanicPayload::new("unknown panic")),
            ))),
            _ => None,
        }
    }

    pub(crate) fn add_joiner(&self, task: TaskId, joiner: Handoff<()>) {
        let mut st = self.shared.state.borrow_mut();
        match st.tasks.get_mut(&task) {
            Some(rec) if !rec.state.is_terminal() => rec.joiners.push(joiner),
            _ => {
                drop(st);
                joiner.fulfill(());
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.borrow();
        f.debug_struct("Scheduler")
            .field("tasks", &st.tasks.len())
            .field("ready", &st.ready.len())
            .field("timers", &st.reactor.pending())
            .field("closed", &st.closed)
            .finish()
    }
}
