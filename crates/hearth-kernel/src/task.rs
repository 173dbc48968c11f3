//! Task identity, status, and caller-side handles.
//!
//! A task's status cell and cancel flag are shared between the queue's
//! enqueued entry and every [`TaskHandle`] pointing at it; either side may
//! outlive the other.  Status only moves forward: `Pending` -> `Running` ->
//! one of the terminal states, or straight to `Cancelled` when the flag is
//! observed before execution starts.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Unique, monotonically increasing task identifier.
pub type TaskId = u64;

/// Priority level; `Critical` is scheduled before everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Lifecycle state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    /// Sitting in the queue, waiting for a worker.
    Pending = 0,
    /// Currently executing.
    Running = 1,
    /// Finished successfully.
    Completed = 2,
    /// Skipped because the cancel flag was set before execution.
    Cancelled = 3,
    /// The work panicked, or the task was submitted after shutdown.
    Failed = 4,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Shared atomic status cell.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Caller-side reference to a submitted task.
///
/// The handle exposes status inspection and cooperative cancellation.
/// Cancellation is advisory: setting the flag does not interrupt work that
/// is already running; the work itself decides where (and whether) to poll.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    status: Arc<StatusCell>,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, status: Arc<StatusCell>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            id,
            status,
            cancelled,
        }
    }

    /// Build a handle that is already terminally failed.  Used for
    /// submissions rejected after queue shutdown.
    pub(crate) fn failed(id: TaskId) -> Self {
        Self {
            id,
            status: Arc::new(StatusCell::new(TaskStatus::Failed)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TaskStatus::Pending
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Request cancellation of this task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The shared cancel flag, for wiring into an [`InferenceRequest`]
    /// or other work that polls cooperatively.
    ///
    /// [`InferenceRequest`]: crate::engine::InferenceRequest
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn handle_observes_shared_cell() {
        let status = Arc::new(StatusCell::new(TaskStatus::Pending));
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle::new(7, Arc::clone(&status), Arc::clone(&cancelled));

        assert_eq!(handle.id(), 7);
        assert!(handle.is_pending());

        status.store(TaskStatus::Running);
        assert!(handle.is_running());

        status.store(TaskStatus::Completed);
        assert!(handle.is_done());
    }

    #[test]
    fn cancel_sets_shared_flag() {
        let status = Arc::new(StatusCell::new(TaskStatus::Pending));
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle::new(1, status, Arc::clone(&cancelled));

        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(cancelled.load(Ordering::Acquire));
    }

    #[test]
    fn failed_handle_is_terminal() {
        let handle = TaskHandle::failed(99);
        assert_eq!(handle.status(), TaskStatus::Failed);
        assert!(handle.is_done());
    }
}
