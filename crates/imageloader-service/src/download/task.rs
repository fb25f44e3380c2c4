use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{DownloadCompletedFn, FetchRequest, ProgressFn};
use crate::types::DownloadOptions;

/// The lifecycle of a [`FetchTask`].
///
/// A task moves from `Ready` to `Running` exactly once, and ends in one of the terminal states.
/// Terminal states are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, waiting for a free download slot.
    Ready = 0,
    /// The transfer is in flight.
    Running = 1,
    /// The transfer finished and the payload decoded.
    Completed = 2,
    /// The transfer or decoding failed.
    Failed = 3,
    /// All waiters went away before the task finished.
    Cancelled = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// One waiter of a [`FetchTask`].
pub(super) struct Registration {
    pub id: u64,
    pub progress: Option<ProgressFn>,
    pub completed: DownloadCompletedFn,
}

/// The single in-flight fetch of one URL, shared by every caller waiting for it.
pub(super) struct FetchTask {
    key: String,
    request: FetchRequest,
    state: AtomicU8,
    token: CancellationToken,
    registrations: RwLock<Vec<Registration>>,
}

impl std::fmt::Debug for FetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTask")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("waiters", &self.registrations.read().len())
            .finish()
    }
}

impl FetchTask {
    pub fn new(key: String, request: FetchRequest) -> Self {
        Self {
            key,
            request,
            state: AtomicU8::new(TaskState::Ready as u8),
            token: CancellationToken::new(),
            registrations: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn options(&self) -> DownloadOptions {
        self.request.options
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the task as running. Fails if it was cancelled while queued.
    pub fn start(&self) -> bool {
        self.transition(TaskState::Ready, TaskState::Running)
    }

    /// Moves a running task into its terminal state. Fails if it was cancelled in the meantime.
    pub fn complete(&self, success: bool) -> bool {
        let to = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.transition(TaskState::Running, to)
    }

    /// Cancels the task unless it already reached a terminal state.
    pub fn cancel(&self) -> bool {
        let mut current = self.state();
        loop {
            if current.is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current as u8,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = TaskState::from_u8(actual),
            }
        }
        self.token.cancel();
        true
    }

    /// Resolves once the task is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn register(&self, registration: Registration) {
        self.registrations.write().push(registration);
    }

    /// Removes the waiter `id`, returning the number of remaining waiters.
    pub fn unregister(&self, id: u64) -> usize {
        let mut registrations = self.registrations.write();
        registrations.retain(|registration| registration.id != id);
        registrations.len()
    }

    pub fn take_registrations(&self) -> Vec<Registration> {
        std::mem::take(&mut *self.registrations.write())
    }

    pub fn waiters(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn progress_listeners(&self) -> Vec<ProgressFn> {
        self.registrations
            .read()
            .iter()
            .filter_map(|registration| registration.progress.clone())
            .collect()
    }

    pub fn completion_listeners(&self) -> Vec<DownloadCompletedFn> {
        self.registrations
            .read()
            .iter()
            .map(|registration| Arc::clone(&registration.completed))
            .collect()
    }
}
