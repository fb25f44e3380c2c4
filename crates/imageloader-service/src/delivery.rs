//! The context on which caller visible callbacks run.
//!
//! All progress and completion callbacks of the cache, the downloader and the manager are
//! dispatched through a [`Delivery`]. The default [`SerialDelivery`] runs them one after another
//! on a dedicated task, so callers observe callbacks in dispatch order and never concurrently.
//! Hosts with their own event loop can plug it in through [`DeliveryContext`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// A callback queued for delivery.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An executor for callbacks.
///
/// Implementations must run jobs in the order they were dispatched.
pub trait DeliveryContext: Send + Sync + 'static {
    fn dispatch(&self, job: Job);
}

/// Runs dispatched jobs sequentially on a dedicated task.
#[derive(Debug)]
pub struct SerialDelivery {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialDelivery {
    pub fn new(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Callback panicked during delivery");
                }
            }
        });

        Self { sender }
    }
}

impl DeliveryContext for SerialDelivery {
    fn dispatch(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::warn!("Dropping callback, the delivery task is gone");
        }
    }
}

/// Runs dispatched jobs immediately on the dispatching thread.
///
/// Callbacks may then run concurrently to each other, this is mostly useful for tests and
/// for callers that do their own synchronization.
#[derive(Debug, Default)]
pub struct InlineDelivery;

impl DeliveryContext for InlineDelivery {
    fn dispatch(&self, job: Job) {
        job()
    }
}

/// A cheaply cloneable handle to a [`DeliveryContext`].
#[derive(Clone)]
pub struct Delivery(Arc<dyn DeliveryContext>);

impl Delivery {
    /// Creates a [`SerialDelivery`] running on the given runtime.
    pub fn serial(runtime: &Handle) -> Self {
        Self(Arc::new(SerialDelivery::new(runtime)))
    }

    /// Creates an [`InlineDelivery`].
    pub fn inline() -> Self {
        Self(Arc::new(InlineDelivery))
    }

    pub fn from_context(context: impl DeliveryContext) -> Self {
        Self(Arc::new(context))
    }

    /// Schedules `f` to run on the delivery context.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        self.0.dispatch(Box::new(f))
    }

    /// Waits until every job dispatched before this call has run.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.dispatch(move || {
            sender.send(()).ok();
        });
        receiver.await.ok();
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Delivery").finish_non_exhaustive()
    }
}
