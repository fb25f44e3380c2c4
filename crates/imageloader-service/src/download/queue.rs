use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::types::{ExecutionOrder, Priority};
use crate::utils::defer::defer;

struct QueuedJob {
    priority: Priority,
    /// Ordering within a priority class, higher runs first.
    ///
    /// Derived from the submission counter when the job is queued: negated for FIFO, as is for
    /// LIFO. Switching the execution order therefore only affects jobs submitted afterwards.
    rank: i64,
    job: BoxFuture<'static, ()>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.rank).cmp(&(other.priority, other.rank))
    }
}

struct QueueState {
    pending: BinaryHeap<QueuedJob>,
    running: usize,
    max_concurrent: usize,
    suspended: bool,
    order: ExecutionOrder,
    next_seq: i64,
}

/// A bounded pool of download jobs.
///
/// Queued jobs start by priority class first, then by submission order according to the
/// configured [`ExecutionOrder`]. At most `max_concurrent` jobs run at the same time, and none
/// start while the queue is suspended.
#[derive(Clone)]
pub struct DownloadQueue {
    state: Arc<Mutex<QueueState>>,
    runtime: Handle,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DownloadQueue")
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("max_concurrent", &state.max_concurrent)
            .field("suspended", &state.suspended)
            .field("order", &state.order)
            .finish()
    }
}

impl DownloadQueue {
    pub fn new(max_concurrent: usize, order: ExecutionOrder, runtime: Handle) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                running: 0,
                max_concurrent: max_concurrent.max(1),
                suspended: false,
                order,
                next_seq: 0,
            })),
            runtime,
        }
    }

    /// Queues `job`, starting it right away if the concurrency bound allows.
    pub fn submit<F>(&self, priority: Priority, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let rank = match state.order {
                ExecutionOrder::Fifo => -seq,
                ExecutionOrder::Lifo => seq,
            };
            state.pending.push(QueuedJob {
                priority,
                rank,
                job: job.boxed(),
            });
        }
        self.pump();
    }

    /// Starts as many queued jobs as the current bound allows.
    fn pump(&self) {
        let jobs = {
            let mut state = self.state.lock();
            let mut jobs = Vec::new();
            while !state.suspended && state.running < state.max_concurrent {
                let Some(queued) = state.pending.pop() else {
                    break;
                };
                state.running += 1;
                jobs.push(queued.job);
            }
            jobs
        };

        for job in jobs {
            let queue = self.clone();
            self.runtime.spawn(async move {
                let _finished = defer(move || queue.finish());
                job.await;
            });
        }
    }

    fn finish(&self) {
        self.state.lock().running -= 1;
        self.pump();
    }

    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        self.state.lock().max_concurrent = max_concurrent.max(1);
        self.pump();
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    pub fn set_execution_order(&self, order: ExecutionOrder) {
        self.state.lock().order = order;
    }

    pub fn execution_order(&self) -> ExecutionOrder {
        self.state.lock().order
    }

    /// Suspends or resumes starting queued jobs. Running jobs are not affected.
    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
        if !suspended {
            self.pump();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// The number of jobs currently running.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// The number of jobs waiting to start.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    async fn run_suspended(
        queue: &DownloadQueue,
        jobs: &[(Priority, &'static str)],
    ) -> Vec<&'static str> {
        queue.set_suspended(true);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for &(priority, name) in jobs {
            let sender = sender.clone();
            queue.submit(priority, async move {
                sender.send(name).ok();
            });
        }
        assert_eq!(queue.pending(), jobs.len());
        queue.set_suspended(false);

        let mut seen = Vec::new();
        for _ in jobs {
            seen.push(receiver.recv().await.unwrap());
        }
        seen
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DownloadQueue::new(1, ExecutionOrder::Fifo, Handle::current());
        let jobs = [
            (Priority::Normal, "A"),
            (Priority::Normal, "B"),
            (Priority::Normal, "C"),
        ];
        assert_eq!(run_suspended(&queue, &jobs).await, ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let queue = DownloadQueue::new(1, ExecutionOrder::Lifo, Handle::current());
        let jobs = [
            (Priority::Normal, "A"),
            (Priority::Normal, "B"),
            (Priority::Normal, "C"),
        ];
        assert_eq!(run_suspended(&queue, &jobs).await, ["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_priority_classes() {
        let queue = DownloadQueue::new(1, ExecutionOrder::Fifo, Handle::current());
        let jobs = [
            (Priority::Low, "low"),
            (Priority::Normal, "normal-1"),
            (Priority::High, "high"),
            (Priority::Normal, "normal-2"),
        ];
        assert_eq!(
            run_suspended(&queue, &jobs).await,
            ["high", "normal-1", "normal-2", "low"]
        );

        queue.set_execution_order(ExecutionOrder::Lifo);
        assert_eq!(
            run_suspended(&queue, &jobs).await,
            ["high", "normal-2", "normal-1", "low"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound() {
        let queue = DownloadQueue::new(2, ExecutionOrder::Fifo, Handle::current());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (sender, mut receiver) = mpsc::unbounded_channel();

        for _ in 0..8 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let sender = sender.clone();
            queue.submit(Priority::Normal, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                sender.send(()).ok();
            });
        }
        assert!(queue.running() <= 2);

        for _ in 0..8 {
            receiver.recv().await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.pending(), 0);
    }
}
