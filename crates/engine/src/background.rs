//! Background work scheduler.
//!
//! A priority queue drained by a fixed pool of worker threads. The cluster
//! uses it for coordinator recovery after a failover (high priority) and for
//! the periodic session reaper (low priority).

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tessera_core::{Deadline, Error, Result};
use thiserror::Error;
use tracing::{debug, error};

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Session reaping
    Low = 0,
    /// Ordinary deferred work
    Normal = 1,
    /// Coordinator recovery
    High = 2,
}

/// Returned when the queue is full or the scheduler shut down.
#[derive(Debug, Error)]
#[error("background scheduler queue is full or shut down")]
pub struct BackpressureError;

impl From<BackpressureError> for Error {
    fn from(e: BackpressureError) -> Self {
        Error::TemporarilyUnavailable(e.to_string())
    }
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting in the queue
    pub queue_depth: usize,
    /// Tasks currently running
    pub active_tasks: usize,
    /// Tasks finished since creation
    pub tasks_completed: u64,
    /// Worker threads
    pub worker_count: usize,
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Box<dyn FnOnce() + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then older first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

impl SchedulerInner {
    fn push(&self, priority: TaskPriority, work: Box<dyn FnOnce() + Send>) -> std::result::Result<(), BackpressureError> {
        if self.shutdown.load(AtomicOrdering::Acquire)
            || self.queue_depth.load(AtomicOrdering::Acquire) >= self.max_queue_depth
        {
            return Err(BackpressureError);
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut queue = self.queue.lock();
            queue.push(TaskEnvelope {
                priority,
                sequence,
                work,
            });
            self.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.work_ready.notify_one();
        Ok(())
    }
}

/// Priority task scheduler backed by worker threads.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BackgroundScheduler {
    /// Start `num_threads` workers named `tessera-bg-N`.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let num_threads = num_threads.max(1);
        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("tessera-bg-{}", i))
                .spawn(move || worker_loop(&inner))?;
            threads.push(handle);
        }

        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            num_threads,
        })
    }

    /// Queue `work`.
    pub fn submit(
        &self,
        priority: TaskPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> std::result::Result<(), BackpressureError> {
        self.inner.push(priority, Box::new(work))
    }

    /// Queue `work` every `interval` until shutdown.
    ///
    /// A ticker thread submits one run per interval; a run is skipped when
    /// the queue is full.
    pub fn schedule_every(
        &self,
        name: &str,
        priority: TaskPriority,
        interval: Duration,
        work: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let work = Arc::new(work);
        let task_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("tessera-tick-{}", name))
            .spawn(move || {
                while !inner.shutdown.load(AtomicOrdering::Acquire) {
                    let tick = Deadline::after(interval);
                    while !tick.expired() && !inner.shutdown.load(AtomicOrdering::Acquire) {
                        std::thread::sleep(tick.remaining(Duration::from_millis(20)));
                    }
                    if inner.shutdown.load(AtomicOrdering::Acquire) {
                        break;
                    }
                    let run = Arc::clone(&work);
                    if inner.push(priority, Box::new(move || run())).is_err() {
                        debug!(target: "tessera::background", task = %task_name, "Skipped periodic run");
                    }
                }
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Block until all queued and running tasks finished. Workers keep running.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting work, let workers finish the queue, and join them.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            // Held so a worker between its shutdown check and wait() cannot miss the wakeup.
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Metrics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` even if the task panics, so `drain` cannot hang.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner.tasks_completed.fetch_add(1, AtomicOrdering::Relaxed);
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            error!(
                target: "tessera::background",
                "background task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_submit_and_drain() {
        let scheduler = BackgroundScheduler::new(2, 64).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        assert_eq!(scheduler.stats().tasks_completed, 10);
    }

    #[test]
    fn test_recovery_runs_before_reaping() {
        let scheduler = BackgroundScheduler::new(1, 64).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler.submit(TaskPriority::Low, move || {
            b.wait();
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        scheduler.submit(TaskPriority::Low, move || o.lock().push("reap")).unwrap();
        let o = Arc::clone(&order);
        scheduler.submit(TaskPriority::High, move || o.lock().push("recover")).unwrap();

        barrier.wait();
        scheduler.drain();
        assert_eq!(*order.lock(), vec!["recover", "reap"]);
    }

    #[test]
    fn test_backpressure_and_shutdown() {
        let scheduler = BackgroundScheduler::new(1, 1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler.submit(TaskPriority::Normal, move || {
            b.wait();
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        scheduler.submit(TaskPriority::Normal, || {}).unwrap();
        assert!(scheduler.submit(TaskPriority::Normal, || {}).is_err());

        barrier.wait();
        scheduler.shutdown();
        assert!(scheduler.submit(TaskPriority::Normal, || {}).is_err());
    }

    #[test]
    fn test_panicking_task_does_not_wedge_drain() {
        let scheduler = BackgroundScheduler::new(1, 8).unwrap();
        scheduler.submit(TaskPriority::Normal, || panic!("boom")).unwrap();
        scheduler.drain();
        assert_eq!(scheduler.stats().active_tasks, 0);
    }

    #[test]
    fn test_periodic_work_repeats() {
        let scheduler = BackgroundScheduler::new(1, 8).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        scheduler
            .schedule_every("count", TaskPriority::Low, Duration::from_millis(5), move || {
                r.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        scheduler.shutdown();
        assert!(runs.load(AtomicOrdering::Relaxed) >= 2);
    }
}
