//! Cooperative schedulers the waiter can pump while it waits.
//!
//! The waiter never reaches for a thread-local "current" event loop.  It is
//! handed a [`Scheduler`] at construction and calls [`Scheduler::tick`] once
//! per polling step.  Two implementations are provided:
//!
//! | Scheduler          | One tick                                          |
//! |--------------------|---------------------------------------------------|
//! | [`EventQueue`]     | Run the closures queued so far, waiting up to `max_wait`. |
//! | [`TokioScheduler`] | Drive a current-thread tokio runtime for `max_wait`. |
//!
//! Both only make progress on the thread that ticks them, so socket
//! notifications routed through them are dispatched on the consumer's
//! thread and nowhere else.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};

/// A single-threaded event loop that can be advanced in bounded steps.
pub trait Scheduler: Send + Sync {
    /// Dispatch pending work, waiting at most `max_wait` for some to arrive.
    ///
    /// A zero `max_wait` dispatches whatever is ready and returns.
    fn tick(&self, max_wait: Duration);
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// A FIFO message queue drained by whichever thread ticks it.
///
/// Any thread may [`post`](EventQueue::post); tasks run only inside
/// [`Scheduler::tick`], in posting order, with the queue unlocked.
#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    tasks: Mutex<VecDeque<Task>>,
    posted: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to run on the next tick.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks().push_back(Box::new(task));
        self.inner.posted.notify_one();
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks().len()
    }

    /// Run every queued task without waiting.  Returns how many ran.
    ///
    /// Tasks posted by those tasks wait for the next call.
    pub fn run_pending(&self) -> usize {
        self.process(Duration::ZERO)
    }

    /// Wait up to `max_wait` for the queue to become non-empty, then run the
    /// batch that was queued at that moment.
    fn process(&self, max_wait: Duration) -> usize {
        // `None` means the wait has no representable end.
        let deadline = Instant::now().checked_add(max_wait);
        let mut tasks = self.tasks();
        while tasks.is_empty() {
            tasks = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    self.inner
                        .posted
                        .wait_timeout(tasks, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .posted
                    .wait(tasks)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        let batch = tasks.len();
        drop(tasks);

        let mut ran = 0;
        while ran < batch {
            let Some(task) = self.tasks().pop_front() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for EventQueue {
    fn tick(&self, max_wait: Duration) {
        let ran = self.process(max_wait);
        if ran > 0 {
            log::trace!("[sched] dispatched {ran} task(s)");
        }
    }
}

// ---------------------------------------------------------------------------
// TokioScheduler
// ---------------------------------------------------------------------------

/// A current-thread tokio runtime driven only by [`Scheduler::tick`].
///
/// Tasks spawned on [`TokioScheduler::handle`] (such as the receive loop of
/// [`crate::udp::UdpPacketSocket`]) make progress only while some thread is
/// inside `tick`.  Ticking from within an async context panics, as any
/// nested `block_on` does.
#[derive(Debug)]
pub struct TokioScheduler {
    runtime: Runtime,
}

impl TokioScheduler {
    /// Build a current-thread runtime with I/O and timers enabled.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime })
    }

    /// Handle for spawning tasks and registering I/O with this runtime.
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}

impl Scheduler for TokioScheduler {
    fn tick(&self, max_wait: Duration) {
        if max_wait.is_zero() {
            self.runtime.block_on(tokio::task::yield_now());
        } else {
            self.runtime.block_on(tokio::time::sleep(max_wait));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_only_on_tick() {
        let queue = EventQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        queue.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 1);

        queue.tick(Duration::ZERO);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn tasks_run_in_posting_order() {
        let queue = EventQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            queue.post(move || order.lock().unwrap().push(i));
        }
        assert_eq!(queue.run_pending(), 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn follow_up_task_waits_for_next_tick() {
        let queue = EventQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (q, h) = (queue.clone(), Arc::clone(&hits));
        queue.post(move || {
            let h2 = Arc::clone(&h);
            q.post(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            });
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    fn repost_forever(queue: EventQueue, runs: Arc<AtomicUsize>) {
        let q = queue.clone();
        queue.post(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            repost_forever(q, runs);
        });
    }

    #[test]
    fn self_reposting_task_cannot_stall_a_tick() {
        let queue = EventQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        repost_forever(queue.clone(), Arc::clone(&runs));

        for expected in 1..=3 {
            queue.tick(Duration::from_millis(10));
            assert_eq!(runs.load(Ordering::SeqCst), expected);
        }
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn unbounded_max_wait_still_dispatches() {
        let queue = EventQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        queue.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        queue.tick(Duration::MAX);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_tick_waits_at_most_max_wait() {
        let queue = EventQueue::new();
        let start = Instant::now();
        queue.tick(Duration::from_millis(20));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(2), "tick overslept: {elapsed:?}");
    }

    #[test]
    fn tick_wakes_for_cross_thread_post() {
        let queue = EventQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (q, h) = (queue.clone(), Arc::clone(&hits));
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            q.post(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        });

        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            queue.tick(Duration::from_millis(100));
        }
        producer.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tokio_tick_drives_spawned_tasks() {
        let scheduler = TokioScheduler::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        scheduler.handle().spawn(async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            scheduler.tick(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
