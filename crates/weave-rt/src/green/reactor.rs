// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: clock and timer wheel.
//!
//! The scheduler consults the reactor whenever the ready queue runs dry.
//! With a virtual clock the reactor jumps straight to the next deadline;
//! with a wall clock the scheduler sleeps on the remote queue until the
//! deadline passes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use super::task::ObjectId;
use super::wait::Handoff;
use crate::config::ClockMode;

/// Scheduler time source. Time is measured from scheduler creation.
#[derive(Debug)]
pub(crate) enum Clock {
    Virtual { now: Duration },
    Wall { origin: Instant },
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Virtual => Self::Virtual {
                now: Duration::ZERO,
            },
            ClockMode::Wall => Self::Wall {
                origin: Instant::now(),
            },
        }
    }

    pub fn now(&self) -> Duration {
        match self {
            Self::Virtual { now } => *now,
            Self::Wall { origin } => origin.elapsed(),
        }
    }
}

/// What happens when a timer expires.
pub(crate) enum TimerAction {
    /// Resume a sleeping task.
    Resume(Handoff<()>),
    /// Run a callback on the scheduler thread.
    Call(Box<dyn FnOnce()>),
    /// One period of a ticker feeding `channel`.
    Tick {
        channel: ObjectId,
        call: Box<dyn FnOnce()>,
    },
}

impl TimerAction {
    pub fn fire(self) {
        match self {
            Self::Resume(handoff) => handoff.fulfill(()),
            Self::Call(callback) => callback(),
            Self::Tick { call, .. } => call(),
        }
    }
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume(handoff) => write!(f, "Resume({})", handoff.task()),
            Self::Call(_) => write!(f, "Call"),
            Self::Tick { channel, .. } => write!(f, "Tick({channel})"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Reactor {
    clock: Clock,
    /// Keyed by (deadline, insertion order) so equal deadlines fire FIFO.
    timers: BTreeMap<(Duration, u64), TimerAction>,
    seq: u64,
}

impl Reactor {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            clock: Clock::new(mode),
            timers: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.clock, Clock::Virtual { .. })
    }

    pub fn schedule(&mut self, deadline: Duration, action: TimerAction) {
        self.seq += 1;
        self.timers.insert((deadline, self.seq), action);
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Channels fed by pending ticks, when ticks are all that is pending.
    pub fn tick_channels(&self) -> Option<Vec<ObjectId>> {
        if self.timers.is_empty() {
            return None;
        }
        self.timers
            .values()
            .map(|action| match action {
                TimerAction::Tick { channel, .. } => Some(*channel),
                _ => None,
            })
            .collect()
    }

    /// Move virtual time forward to `deadline`. Wall time is not movable.
    pub fn advance_to(&mut self, deadline: Duration) {
        if let Clock::Virtual { now } = &mut self.clock {
            if deadline > *now {
                *now = deadline;
            }
        }
    }

    /// Remove and return every timer whose deadline has passed, in
    /// deadline order.
    pub fn take_due(&mut self) -> Vec<TimerAction> {
        let now = self.clock.now();
        let mut due = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Remove every timer (used during shutdown).
    pub fn clear(&mut self) -> Vec<TimerAction> {
        std::mem::take(&mut self.timers).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> TimerAction {
        let log = log.clone();
        TimerAction::Call(Box::new(move || log.borrow_mut().push(n)))
    }

    #[test]
    fn virtual_clock_starts_at_zero() {
        let reactor = Reactor::new(ClockMode::Virtual);
        assert!(reactor.is_virtual());
        assert_eq!(reactor.now(), Duration::ZERO);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reactor = Reactor::new(ClockMode::Virtual);
        reactor.schedule(Duration::from_millis(30), recorder(&log, 3));
        reactor.schedule(Duration::from_millis(10), recorder(&log, 1));
        reactor.schedule(Duration::from_millis(10), recorder(&log, 2));
        assert_eq!(reactor.next_deadline(), Some(Duration::from_millis(10)));

        assert!(reactor.take_due().is_empty());

        reactor.advance_to(Duration::from_millis(10));
        for action in reactor.take_due() {
            action.fire();
        }
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert_eq!(reactor.pending(), 1);

        reactor.advance_to(Duration::from_millis(50));
        for action in reactor.take_due() {
            action.fire();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(reactor.now(), Duration::from_millis(50));
    }

    #[test]
    fn tick_channels_only_when_all_ticks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reactor = Reactor::new(ClockMode::Virtual);
        assert_eq!(reactor.tick_channels(), None);

        let channel = ObjectId::next();
        reactor.schedule(
            Duration::from_millis(1),
            TimerAction::Tick {
                channel,
                call: Box::new(|| {}),
            },
        );
        assert_eq!(reactor.tick_channels(), Some(vec![channel]));

        reactor.schedule(Duration::from_millis(2), recorder(&log, 1));
        assert_eq!(reactor.tick_channels(), None);
    }

    #[test]
    fn virtual_time_never_goes_backwards() {
        let mut reactor = Reactor::new(ClockMode::Virtual);
        reactor.advance_to(Duration::from_secs(5));
        reactor.advance_to(Duration::from_secs(1));
        assert_eq!(reactor.now(), Duration::from_secs(5));
    }

    #[test]
    fn clear_returns_pending_timers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reactor = Reactor::new(ClockMode::Wall);
        reactor.schedule(Duration::from_secs(60), recorder(&log, 1));
        assert_eq!(reactor.clear().len(), 1);
        assert_eq!(reactor.pending(), 0);
        assert!(log.borrow().is_empty());
    }
}
