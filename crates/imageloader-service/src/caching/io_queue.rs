use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type IoJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking file system jobs one at a time, in submission order.
///
/// Every job runs on the blocking thread pool of the runtime. Serializing them keeps writes,
/// removals and housekeeping of the disk tier from racing each other.
#[derive(Debug, Clone)]
pub struct IoQueue {
    sender: mpsc::UnboundedSender<IoJob>,
}

impl IoQueue {
    pub fn new(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<IoJob>();

        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    tracing::error!(error = %err, "Cache I/O job failed");
                }
            }
        });

        Self { sender }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::warn!("Dropping cache I/O job, the I/O task is gone");
        }
    }

    /// Waits until every job submitted before this call has finished.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.submit(move || {
            sender.send(()).ok();
        });
        receiver.await.ok();
    }
}
