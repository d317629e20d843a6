// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep, timers and timeouts.
//!
//! Time is the scheduler clock: virtual by default, so a sleeping task
//! costs nothing and tests run instantly. Timeouts are built from the
//! channel primitives: `after` gives a channel that becomes ready at a
//! deadline, and `recv_timeout` races it against a receive in a select.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

use crate::channel::Channel;
use crate::context;
use crate::green::reactor::TimerAction;
use crate::green::scheduler::{Scheduler, WeakScheduler};
use crate::green::task::WaitTarget;
use crate::green::wait::{handoff, Wait};
use crate::select::select;
use crate::spawn::yield_now;

/// Current scheduler time, or zero outside a scheduler.
pub fn now() -> Duration {
    context::scheduler().map_or(Duration::ZERO, |sched| sched.now())
}

/// Suspend the current task for `duration`. A zero duration yields.
///
/// # Panics
///
/// When called outside a task.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        yield_now().await;
        return;
    }
    let parked = {
        let task = context::expect_task("sleep");
        let until = task.sched.now().saturating_add(duration);
        let wait = Wait::park(&task, WaitTarget::Sleep { until });
        let (wake, parked) = handoff(&wait);
        task.sched.schedule_timer(until, TimerAction::Resume(wake));
        parked
    };
    parked.await;
}

/// A channel that receives one `()` once `duration` has passed.
///
/// # Panics
///
/// When called off the scheduler thread.
pub fn after(duration: Duration) -> Channel<()> {
    let sched = context::expect_scheduler("after");
    let chan = Channel::new(1);
    let tx = chan.clone();
    sched.schedule_timer(
        sched.now().saturating_add(duration),
        TimerAction::Call(Box::new(move || {
            let _ = tx.try_send(());
        })),
    );
    chan
}

/// Periodic timer. Ticks land in a capacity-1 channel; a tick that finds
/// the channel full is dropped. Dropping the ticker stops it.
pub struct Ticker {
    chan: Channel<()>,
    period: Duration,
    stopped: Rc<Cell<bool>>,
}

/// Start a ticker firing every `period` (at least one nanosecond).
///
/// # Panics
///
/// When called off the scheduler thread.
pub fn ticker(period: Duration) -> Ticker {
    let sched = context::expect_scheduler("ticker");
    let period = period.max(Duration::from_nanos(1));
    let ticker = Ticker {
        chan: Channel::new(1),
        period,
        stopped: Rc::new(Cell::new(false)),
    };
    arm_tick(
        &sched,
        sched.now().saturating_add(period),
        period,
        ticker.chan.clone(),
        ticker.stopped.clone(),
    );
    ticker
}

fn arm_tick(
    sched: &Scheduler,
    deadline: Duration,
    period: Duration,
    chan: Channel<()>,
    stopped: Rc<Cell<bool>>,
) {
    let weak: WeakScheduler = sched.downgrade();
    let channel = chan.id();
    let call = Box::new(move || {
        if stopped.get() {
            return;
        }
        let _ = chan.try_send(());
        if let Some(sched) = weak.upgrade() {
            arm_tick(&sched, deadline.saturating_add(period), period, chan, stopped);
        }
    });
    sched.schedule_timer(deadline, TimerAction::Tick { channel, call });
}

impl Ticker {
    pub fn channel(&self) -> &Channel<()> {
        &self.chan
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop ticking. A tick already in the channel stays there.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("channel", &self.chan.id())
            .field("period", &self.period)
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

/// Receive from `chan`, giving up after `duration`.
///
/// `Ok(None)` means the channel was closed.
pub async fn recv_timeout<T: 'static>(
    chan: &Channel<T>,
    duration: Duration,
) -> Result<Option<T>, TimedOut> {
    let timer = after(duration);
    select()
        .recv(chan, Ok)
        .recv(&timer, |_| Err(TimedOut))
        .await
}

/// Timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out")]
pub struct TimedOut;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::error::SchedulerError;
    use crate::spawn::spawn;
    use std::cell::RefCell;

    fn sched() -> Scheduler {
        Scheduler::with_config(SchedulerConfig::new().seed(7))
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let sched = sched();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (name, ms) in [("slow", 30), ("fast", 10), ("mid", 20)] {
            let log = log.clone();
            sched
                .spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                    log.borrow_mut().push((name, now()));
                })
                .unwrap();
        }
        sched.run().unwrap();
        assert_eq!(
            *log.borrow(),
            [
                ("fast", Duration::from_millis(10)),
                ("mid", Duration::from_millis(20)),
                ("slow", Duration::from_millis(30)),
            ]
        );
    }

    #[test]
    fn zero_sleep_yields() {
        let sched = sched();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let log = log.clone();
            sched
                .spawn(async move {
                    log.borrow_mut().push(format!("{name}1"));
                    sleep(Duration::ZERO).await;
                    log.borrow_mut().push(format!("{name}2"));
                })
                .unwrap();
        }
        sched.run().unwrap();
        assert_eq!(*log.borrow(), ["a1", "b1", "a2", "b2"]);
        assert_eq!(sched.now(), Duration::ZERO);
    }

    #[test]
    fn after_delivers_once() {
        let got = sched()
            .block_on(async {
                let timer = after(Duration::from_secs(2));
                assert!(timer.try_recv().is_err());
                timer.recv().await;
                Ok((now(), timer.try_recv().is_err()))
            })
            .unwrap();
        assert_eq!(got, (Duration::from_secs(2), true));
    }

    #[test]
    fn ticker_ticks_until_stopped() {
        let ticks = sched()
            .block_on(async {
                let ticker = ticker(Duration::from_millis(5));
                let mut at = Vec::new();
                for _ in 0..3 {
                    ticker.channel().recv().await;
                    at.push(now());
                }
                ticker.stop();
                sleep(Duration::from_millis(50)).await;
                assert!(ticker.channel().is_empty());
                Ok(at)
            })
            .unwrap();
        assert_eq!(
            ticks,
            [
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(15),
            ]
        );
    }

    #[test]
    fn ticker_drops_ticks_when_full() {
        sched()
            .block_on(async {
                let ticker = ticker(Duration::from_millis(1));
                sleep(Duration::from_millis(10)).await;
                assert_eq!(ticker.channel().len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn recv_timeout_expires() {
        let got = sched()
            .block_on(async {
                let ch = Channel::<u8>::new(0);
                let res = recv_timeout(&ch, Duration::from_millis(100)).await;
                Ok((res, now()))
            })
            .unwrap();
        assert_eq!(got, (Err(TimedOut), Duration::from_millis(100)));
    }

    #[test]
    fn recv_timeout_gets_value_in_time() {
        let got = sched()
            .block_on(async {
                let ch = Channel::<u8>::new(0);
                let tx = ch.clone();
                spawn(async move {
                    sleep(Duration::from_millis(10)).await;
                    let _ = tx.send(4).await;
                })
                .unwrap();
                Ok(recv_timeout(&ch, Duration::from_secs(1)).await)
            })
            .unwrap();
        assert_eq!(got, Ok(Some(4)));
    }

    #[test]
    fn unwatched_ticker_does_not_hide_deadlock() {
        let sched = sched();
        let stuck = Channel::<u8>::new(0);
        let id = stuck.id();
        sched
            .spawn(async move {
                let _ticker = ticker(Duration::from_millis(1));
                stuck.recv().await;
            })
            .unwrap();
        match sched.run() {
            Err(SchedulerError::Deadlock { blocked }) => {
                assert_eq!(blocked.len(), 1);
                assert_eq!(blocked[0].wait, WaitTarget::Recv { channel: id });
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn watched_ticker_keeps_running() {
        let got = sched()
            .block_on(async {
                let ticker = ticker(Duration::from_millis(2));
                let idle = Channel::<u8>::new(0);
                let mut ticks = 0;
                while ticks < 3 {
                    select()
                        .recv(&idle, |_| ())
                        .recv(ticker.channel(), |_| ticks += 1)
                        .await;
                }
                Ok(now())
            })
            .unwrap();
        assert_eq!(got, Duration::from_millis(6));
    }

    #[test]
    fn timer_rounds_count_toward_step_limit() {
        let sched = Scheduler::with_config(SchedulerConfig::new().seed(7).max_steps(50));
        let remote = sched.remote();
        let hold = remote.keep_alive();
        sched
            .spawn(async {
                let _ticker = ticker(Duration::from_millis(1));
                Channel::<u8>::new(0).recv().await;
            })
            .unwrap();
        assert!(matches!(
            sched.run(),
            Err(SchedulerError::StepLimitExceeded { limit: 50 })
        ));
        drop(hold);
    }

    #[test]
    fn now_outside_scheduler_is_zero() {
        assert_eq!(now(), Duration::ZERO);
    }
}
