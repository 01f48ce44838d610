//! Time sources: wall-clock with scheduler pumping, or a simulated clock.
//!
//! The waiter measures deadlines and advances time exclusively through the
//! [`TimeSource`] trait, so the same polling loop runs unchanged against:
//! - [`RealTimeSource`]: `Instant`-based; advancing means pumping the
//!   injected [`Scheduler`] for one step.
//! - [`SimulatedTimeSource`]: backed by a [`SimulatedClock`]; advancing
//!   moves virtual time forward and fires any timers that fall due.
//!
//! Simulated time makes "nothing arrived within 5 s" tests finish instantly
//! and deterministically.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::scheduler::Scheduler;

/// Step used by [`SimulatedClock::wait_until`].
const SIM_WAIT_STEP: Duration = Duration::from_millis(1);

/// A monotonic clock the waiter can read and advance.
pub trait TimeSource: Send + Sync {
    /// Time elapsed since this source's epoch.
    fn now(&self) -> Duration;

    /// Let roughly `step` of time pass, dispatching whatever work falls
    /// due in the meantime.
    fn advance(&self, step: Duration);
}

// ---------------------------------------------------------------------------
// RealTimeSource
// ---------------------------------------------------------------------------

/// Wall-clock time; advancing pumps the injected scheduler.
pub struct RealTimeSource {
    epoch: Instant,
    scheduler: Arc<dyn Scheduler>,
}

impl RealTimeSource {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            epoch: Instant::now(),
            scheduler,
        }
    }
}

impl TimeSource for RealTimeSource {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn advance(&self, step: Duration) {
        self.scheduler.tick(step);
    }
}

// ---------------------------------------------------------------------------
// SimulatedClock
// ---------------------------------------------------------------------------

type TimerTask = Box<dyn FnOnce() + Send>;

struct Timer {
    at: Duration,
    /// Insertion order; breaks ties between timers due at the same instant.
    seq: u64,
    task: TimerTask,
}

#[derive(Default)]
struct ClockInner {
    now: Duration,
    timers: Vec<Timer>,
    next_seq: u64,
}

/// Virtual time that only moves when advanced.
///
/// Cloning yields another handle to the same clock, so a test can keep one
/// handle for scheduling events while the waiter holds another.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    inner: Arc<Mutex<ClockInner>>,
}

impl SimulatedClock {
    /// A clock starting at zero with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Run `task` once the clock reaches `at`.
    ///
    /// A time already in the past fires on the next advance.
    pub fn schedule_at(&self, at: Duration, task: impl FnOnce() + Send + 'static) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.timers.push(Timer {
            at,
            seq,
            task: Box::new(task),
        });
    }

    /// Run `task` once `delay` of virtual time has passed.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let at = self.now().saturating_add(delay);
        self.schedule_at(at, task);
    }

    /// Timers registered but not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Move time forward by `step`, firing due timers in deadline order.
    ///
    /// Each timer observes `now()` equal to its own deadline.  Timers run
    /// with the clock unlocked and may schedule further timers; those fire
    /// in the same call if they fall within `step`.
    pub fn advance(&self, step: Duration) {
        let target = self.now().saturating_add(step);
        loop {
            let task = {
                let mut inner = self.lock();
                let due = inner
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.at <= target)
                    .min_by_key(|(_, t)| (t.at, t.seq))
                    .map(|(i, _)| i);
                match due {
                    Some(i) => {
                        let timer = inner.timers.swap_remove(i);
                        inner.now = inner.now.max(timer.at);
                        timer.task
                    }
                    None => {
                        inner.now = inner.now.max(target);
                        return;
                    }
                }
            };
            task();
        }
    }

    /// Advance in 1 ms steps until `cond` holds or `timeout` elapses.
    ///
    /// For tests that drive the clock themselves rather than through a
    /// waiter, e.g. to let a scripted peer reach some state before the
    /// waiter is consulted.  Returns the final value of `cond`.
    pub fn wait_until(&self, mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let end = self.now().saturating_add(timeout);
        while !cond() {
            let now = self.now();
            if now >= end {
                return false;
            }
            self.advance(SIM_WAIT_STEP.min(end - now));
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, ClockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SimulatedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SimulatedClock")
            .field("now", &inner.now)
            .field("pending_timers", &inner.timers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SimulatedTimeSource
// ---------------------------------------------------------------------------

/// Simulated time, optionally draining a scheduler after every step.
pub struct SimulatedTimeSource {
    clock: SimulatedClock,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl SimulatedTimeSource {
    pub fn new(clock: SimulatedClock) -> Self {
        Self {
            clock,
            scheduler: None,
        }
    }

    /// Also run work queued on `scheduler` (without waiting) after each step.
    pub fn with_scheduler(clock: SimulatedClock, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            clock,
            scheduler: Some(scheduler),
        }
    }

    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }
}

impl TimeSource for SimulatedTimeSource {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn advance(&self, step: Duration) {
        self.clock.advance(step);
        if let Some(scheduler) = &self.scheduler {
            scheduler.tick(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::EventQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn advance_moves_time_exactly() {
        let clock = SimulatedClock::new();
        clock.advance(ms(3));
        clock.advance(ms(4));
        assert_eq!(clock.now(), ms(7));
    }

    #[test]
    fn timers_fire_in_deadline_order_at_their_deadline() {
        let clock = SimulatedClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for at in [30, 10, 20] {
            let (c, f) = (clock.clone(), Arc::clone(&fired));
            clock.schedule_at(ms(at), move || f.lock().unwrap().push((at, c.now())));
        }

        clock.advance(ms(25));
        assert_eq!(*fired.lock().unwrap(), vec![(10, ms(10)), (20, ms(20))]);
        assert_eq!(clock.now(), ms(25));
        assert_eq!(clock.pending_timers(), 1);

        clock.advance(ms(5));
        assert_eq!(fired.lock().unwrap().len(), 3);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn same_deadline_fires_in_insertion_order() {
        let clock = SimulatedClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let f = Arc::clone(&fired);
            clock.schedule_at(ms(5), move || f.lock().unwrap().push(i));
        }
        clock.advance(ms(5));
        assert_eq!(*fired.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn timer_may_reschedule_within_same_advance() {
        let clock = SimulatedClock::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (c, h) = (clock.clone(), Arc::clone(&hits));
        clock.schedule_after(ms(2), move || {
            h.fetch_add(1, Ordering::SeqCst);
            let h2 = Arc::clone(&h);
            c.schedule_after(ms(2), move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
        });
        clock.advance(ms(10));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_until_stops_when_condition_holds() {
        let clock = SimulatedClock::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        clock.schedule_at(ms(40), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(clock.wait_until(|| hits.load(Ordering::SeqCst) > 0, ms(100)));
        assert_eq!(clock.now(), ms(40));
    }

    #[test]
    fn wait_until_times_out_exactly() {
        let clock = SimulatedClock::new();
        assert!(!clock.wait_until(|| false, ms(50)));
        assert_eq!(clock.now(), ms(50));
    }

    #[test]
    fn huge_durations_saturate_instead_of_overflowing() {
        let clock = SimulatedClock::new();
        clock.advance(ms(1));
        assert!(clock.wait_until(|| true, Duration::MAX));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        clock.schedule_after(Duration::MAX, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        clock.advance(Duration::MAX);
        assert_eq!(clock.now(), Duration::MAX);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn simulated_source_drains_scheduler_each_step() {
        let clock = SimulatedClock::new();
        let queue = EventQueue::new();
        let source = SimulatedTimeSource::with_scheduler(clock.clone(), Arc::new(queue.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        queue.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        source.advance(ms(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(source.now(), ms(1));
        assert_eq!(source.clock().now(), clock.now());
    }

    #[test]
    fn real_source_reports_elapsed_time() {
        let source = RealTimeSource::new(Arc::new(EventQueue::new()));
        let before = source.now();
        source.advance(ms(5));
        assert!(source.now() >= before + ms(5));
    }
}
