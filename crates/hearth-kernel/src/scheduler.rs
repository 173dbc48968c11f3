//! Priority task queue with a worker thread pool.
//!
//! A single binary heap, guarded by one mutex and paired with a condition
//! variable, feeds a fixed pool of OS worker threads.  The heap's ordering
//! key is `(priority, submission sequence)`: higher priorities first, FIFO
//! within a priority.  The sequence number matters -- a heap keyed on
//! priority alone does not preserve insertion order among equal priorities.
//!
//! # Task lifecycle
//!
//! ```text
//! Pending --> Running --> Completed
//!        \            \-> Failed
//!         \-> Cancelled   (flag observed before execution)
//! ```
//!
//! Cancellation is cooperative: a worker honors the flag before it starts
//! running the work; once running, only work that polls the flag itself can
//! stop early.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};

use crate::task::{StatusCell, TaskHandle, TaskId, TaskPriority, TaskStatus};

/// Boxed unit of work.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

struct QueuedTask {
    id: TaskId,
    priority: TaskPriority,
    /// Monotonic submission sequence; breaks priority ties FIFO.
    seq: u64,
    queued_at: DateTime<Utc>,
    work: TaskFn,
    status: Arc<StatusCell>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins, then the *lower* sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct QueueInner {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    available: Condvar,
    state: AtomicU8,
}

/// Thread-safe priority task queue with a fixed worker pool.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl TaskQueue {
    /// Create a queue with `num_workers` worker threads.  Zero means the
    /// hardware parallelism hint.
    pub fn new(num_workers: usize) -> Self {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            num_workers
        };

        Self {
            inner: Arc::new(QueueInner {
                heap: Mutex::new(BinaryHeap::new()),
                available: Condvar::new(),
                state: AtomicU8::new(STATE_CREATED),
            }),
            workers: Mutex::new(Vec::new()),
            num_workers,
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Start the worker threads.  Tasks submitted before `start` stay queued
    /// until a worker picks them up.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let mut workers = self.workers.lock();
        workers.reserve(self.num_workers);
        for worker_id in 0..self.num_workers {
            let inner = Arc::clone(&self.inner);
            workers.push(std::thread::spawn(move || worker_loop(&inner, worker_id)));
        }

        tracing::info!(workers = self.num_workers, "task queue started");
    }

    /// Stop all workers and drop remaining pending tasks without executing
    /// them.  Callers that need durable completion must hold a [`TaskHandle`]
    /// and check its status.  Idempotent.
    pub fn stop(&self) {
        let prev = self.inner.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev == STATE_STOPPED {
            return;
        }

        self.inner.available.notify_all();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }

        let dropped = {
            let mut heap = self.inner.heap.lock();
            let dropped = heap.len();
            heap.clear();
            dropped
        };
        if dropped > 0 {
            tracing::debug!(dropped, "pending tasks dropped at shutdown");
        }

        tracing::info!("task queue stopped");
    }

    /// Submit a unit of work.
    ///
    /// After [`stop`](Self::stop) the work is not enqueued; the returned
    /// handle is already in the `Failed` state so callers observe a terminal
    /// status instead of an exception.
    pub fn submit<F>(&self, work: F, priority: TaskPriority) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if self.inner.state.load(Ordering::Acquire) == STATE_STOPPED {
            tracing::warn!(task_id = id, "task submitted after queue shutdown");
            return TaskHandle::failed(id);
        }

        let status = Arc::new(StatusCell::new(TaskStatus::Pending));
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = QueuedTask {
            id,
            priority,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            queued_at: Utc::now(),
            work: Box::new(work),
            status: Arc::clone(&status),
            cancelled: Arc::clone(&cancelled),
        };

        tracing::trace!(task_id = id, ?priority, "task submitted");

        self.inner.heap.lock().push(task);
        self.inner.available.notify_one();

        TaskHandle::new(id, status, cancelled)
    }

    /// Submit work that produces a value; the receiver completes with the
    /// result, or closes without a value if the work panicked or was
    /// cancelled before execution.
    pub fn submit_with_result<F, R>(&self, work: F, priority: TaskPriority) -> (TaskHandle, Receiver<R>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = self.submit(
            move || {
                let _ = tx.send(work());
            },
            priority,
        );
        (handle, rx)
    }

    /// Number of tasks waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Size of the worker pool.
    pub fn worker_count(&self) -> usize {
        self.num_workers
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: &QueueInner, worker_id: usize) {
    tracing::debug!(worker_id, "worker started");

    loop {
        let task = {
            let mut heap = inner.heap.lock();
            loop {
                if inner.state.load(Ordering::Acquire) == STATE_STOPPED {
                    tracing::debug!(worker_id, "worker stopped");
                    return;
                }
                if let Some(task) = heap.pop() {
                    break task;
                }
                inner.available.wait(&mut heap);
            }
        };

        // The lock is released; run the task.
        execute(task, worker_id);
    }
}

fn execute(task: QueuedTask, worker_id: usize) {
    let QueuedTask {
        id,
        status,
        cancelled,
        work,
        queued_at,
        ..
    } = task;

    if cancelled.load(Ordering::Acquire) {
        status.store(TaskStatus::Cancelled);
        tracing::debug!(task_id = id, "task cancelled before execution");
        return;
    }

    status.store(TaskStatus::Running);
    let waited_ms = (Utc::now() - queued_at).num_milliseconds();
    tracing::trace!(task_id = id, worker_id, waited_ms, "task running");

    match std::panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(()) => status.store(TaskStatus::Completed),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task_id = id, %reason, "task failed");
            status.store(TaskStatus::Failed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn wait_done(handle: &TaskHandle) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_done() {
            assert!(std::time::Instant::now() < deadline, "task never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn submit_and_complete() {
        let queue = TaskQueue::new(2);
        queue.start();

        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let handle = queue.submit(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            TaskPriority::Normal,
        );

        wait_done(&handle);
        assert_eq!(handle.status(), TaskStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        queue.stop();
    }

    #[test]
    fn priority_then_fifo_ordering() {
        // One worker, started only after all submissions, so the execution
        // order is exactly the heap order.
        let queue = TaskQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        let submissions = [
            ("low-1", TaskPriority::Low),
            ("normal-1", TaskPriority::Normal),
            ("normal-2", TaskPriority::Normal),
            ("critical-1", TaskPriority::Critical),
            ("normal-3", TaskPriority::Normal),
            ("high-1", TaskPriority::High),
            ("critical-2", TaskPriority::Critical),
        ];
        for (name, priority) in submissions {
            let order = Arc::clone(&order);
            handles.push(queue.submit(
                move || {
                    order.lock().push(name);
                },
                priority,
            ));
        }

        queue.start();
        for handle in &handles {
            wait_done(handle);
        }
        queue.stop();

        assert_eq!(
            *order.lock(),
            vec![
                "critical-1",
                "critical-2",
                "high-1",
                "normal-1",
                "normal-2",
                "normal-3",
                "low-1",
            ]
        );
    }

    #[test]
    fn cancel_before_execution_skips_work() {
        let queue = TaskQueue::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&ran);
        let handle = queue.submit(
            move || {
                r.store(true, Ordering::SeqCst);
            },
            TaskPriority::Normal,
        );

        // Workers have not started; the flag is observed before Running.
        handle.cancel();
        queue.start();
        wait_done(&handle);
        queue.stop();

        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_during_execution_is_cooperative() {
        let queue = TaskQueue::new(1);
        queue.start();

        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let polled = Arc::new(AtomicBool::new(false));

        let p = Arc::clone(&polled);
        let handle = queue.submit(
            move || {
                let _ = started_tx.send(());
                // Spin until someone flips our shared flag.
                while !p.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            },
            TaskPriority::Normal,
        );

        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task should start");
        handle.cancel();
        // Running work is not preempted; it finishes on its own terms.
        polled.store(true, Ordering::Release);
        wait_done(&handle);
        assert_eq!(handle.status(), TaskStatus::Completed);

        queue.stop();
    }

    #[test]
    fn panicking_work_is_marked_failed() {
        let queue = TaskQueue::new(1);
        queue.start();

        let handle = queue.submit(
            || panic!("task exploded"),
            TaskPriority::Normal,
        );
        wait_done(&handle);
        assert_eq!(handle.status(), TaskStatus::Failed);

        // The worker survives and keeps serving tasks.
        let ok = queue.submit(|| {}, TaskPriority::Normal);
        wait_done(&ok);
        assert_eq!(ok.status(), TaskStatus::Completed);

        queue.stop();
    }

    #[test]
    fn submit_after_stop_yields_failed_handle() {
        let queue = TaskQueue::new(1);
        queue.start();
        queue.stop();

        let handle = queue.submit(|| {}, TaskPriority::Normal);
        assert_eq!(handle.status(), TaskStatus::Failed);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn stop_is_idempotent_and_drops_pending() {
        let queue = TaskQueue::new(1);
        let handle = queue.submit(|| {}, TaskPriority::Normal);
        assert_eq!(queue.pending_count(), 1);

        queue.stop();
        queue.stop();

        assert_eq!(queue.pending_count(), 0);
        // Dropped work never ran; the handle still reads Pending.
        assert_eq!(handle.status(), TaskStatus::Pending);
    }

    #[test]
    fn submit_with_result_delivers_value() {
        let queue = TaskQueue::new(1);
        queue.start();

        let (handle, rx) = queue.submit_with_result(|| 6 * 7, TaskPriority::High);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        wait_done(&handle);
        assert_eq!(handle.status(), TaskStatus::Completed);

        queue.stop();
    }

    #[test]
    fn submit_with_result_panic_closes_channel() {
        let queue = TaskQueue::new(1);
        queue.start();

        let (handle, rx) =
            queue.submit_with_result(|| -> u32 { panic!("no result") }, TaskPriority::Normal);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
        wait_done(&handle);
        assert_eq!(handle.status(), TaskStatus::Failed);

        queue.stop();
    }

    #[test]
    fn worker_count_defaults_to_parallelism() {
        let queue = TaskQueue::new(0);
        assert!(queue.worker_count() >= 1);

        let queue = TaskQueue::new(3);
        assert_eq!(queue.worker_count(), 3);
    }
}
