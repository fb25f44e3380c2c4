//! # Downloading
//!
//! The [`Downloader`] runs at most one transfer per URL at any time. Every call to
//! [`Downloader::download`] registers a waiter on the in-flight [`FetchTask`] for its URL,
//! creating and queueing a new task only when none exists. Progress, partial images and the final
//! outcome of a task are fanned out to all of its waiters on the [`Delivery`] context.
//!
//! Cancelling a [`DownloadToken`] only detaches its own waiter. The transfer itself is cancelled
//! once no waiters remain.
//!
//! Tasks are run by the [`DownloadQueue`], which bounds the number of concurrent transfers and
//! orders queued ones by priority and [`ExecutionOrder`]. The actual transfer is done by a
//! [`Transport`], by default the [`HttpTransport`].
//!
//! ### Metrics
//!
//! - `downloader.task.created`: New fetch tasks.
//! - `downloader.coalesced`: Downloads that joined an in-flight task.
//! - `downloader.failure`: Failed tasks, tagged with the failure kind.
//! - `downloader.duration`: Time from starting a transfer until it finished.
//! - `downloader.size`: Size of successfully downloaded payloads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use url::Url;

use crate::config::DownloaderConfig;
use crate::delivery::Delivery;
use crate::error::{ImageError, TransportError, TransportErrorKind};
use crate::types::{DownloadOptions, ExecutionOrder, Image, ImageCodec};

mod http;
mod queue;
mod task;

pub use http::{HttpTransport, USER_AGENT};
pub use queue::DownloadQueue;
pub use task::TaskState;

use task::{FetchTask, Registration};

/// Receives the number of bytes received so far and the expected total, if announced.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Receives partial images and the final outcome of a download.
pub type DownloadCompletedFn = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

/// Rewrites the request headers for a URL right before a transfer is created.
pub type HeadersFilter =
    Arc<dyn Fn(&Url, BTreeMap<String, String>) -> BTreeMap<String, String> + Send + Sync>;

/// Credentials for HTTP basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Everything a [`Transport`] needs to perform one transfer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub options: DownloadOptions,
    pub headers: BTreeMap<String, String>,
    pub credentials: Option<Credentials>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            options: DownloadOptions::empty(),
            headers: BTreeMap::new(),
            credentials: None,
        }
    }
}

/// A successful response of a [`Transport`], with the body still streaming.
pub struct Response {
    /// The announced length of the body.
    pub expected_len: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("expected_len", &self.expected_len)
            .finish_non_exhaustive()
    }
}

/// Performs the transfers of the [`Downloader`].
///
/// Unsuccessful responses must be reported as [`TransportErrorKind::BadStatus`].
pub trait Transport: Send + Sync + 'static {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<Response, TransportError>>;
}

/// A downloaded and decoded image, along with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub image: Image,
    pub data: Bytes,
}

/// An event delivered to the waiters of a download.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A partially decoded image of a progressive download.
    Partial(Image),
    /// The final outcome. Each waiter receives this exactly once, after all other events.
    Finished(Result<Downloaded, ImageError>),
}

type TaskMap = Arc<RwLock<HashMap<String, Arc<FetchTask>>>>;

/// A waiter's handle to a download.
///
/// Dropping the token does not cancel the download.
pub struct DownloadToken {
    id: u64,
    task: Arc<FetchTask>,
    tasks: TaskMap,
}

impl fmt::Debug for DownloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadToken")
            .field("id", &self.id)
            .field("task", &self.task)
            .finish()
    }
}

impl DownloadToken {
    /// The URL this token is waiting for.
    pub fn url(&self) -> &Url {
        &self.task.request().url
    }

    /// The state of the underlying task.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Detaches this waiter from the download.
    ///
    /// The waiter receives no further events. When it was the last one, the transfer is
    /// cancelled and the URL is free for a new task.
    pub fn cancel(&self) {
        let mut tasks = self.tasks.write();
        if self.task.unregister(self.id) > 0 {
            return;
        }
        if self.task.cancel() {
            let key = self.task.key();
            if tasks.get(key).is_some_and(|task| Arc::ptr_eq(task, &self.task)) {
                tasks.remove(key);
            }
            tracing::debug!(url = %self.url(), "Cancelled download without waiters");
        }
    }
}

struct DownloaderInner {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn ImageCodec>,
    delivery: Delivery,
    queue: DownloadQueue,
    tasks: TaskMap,
    next_id: AtomicU64,
    download_timeout: RwLock<Duration>,
    headers: RwLock<BTreeMap<String, String>>,
    headers_filter: RwLock<Option<HeadersFilter>>,
    credentials: RwLock<Option<Credentials>>,
}

impl DownloaderInner {
    fn request_for(&self, url: &Url, options: DownloadOptions) -> FetchRequest {
        let mut headers = self.headers.read().clone();
        if let Some(filter) = self.headers_filter.read().as_ref() {
            headers = filter(url, headers);
        }

        FetchRequest {
            url: url.clone(),
            options,
            headers,
            credentials: self.credentials.read().clone(),
        }
    }

    async fn run(self: Arc<Self>, task: Arc<FetchTask>) {
        if !task.start() {
            // cancelled while queued
            return;
        }

        let url = &task.request().url;
        tracing::trace!(%url, "Starting download");
        let timeout = *self.download_timeout.read();
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = task.cancelled() => {
                tracing::trace!(%url, "Download cancelled");
                return;
            }
            result = tokio::time::timeout(timeout, self.fetch(&task)) => match result {
                Ok(result) => result,
                Err(_) => Err(ImageError::Transport(TransportError::new(
                    TransportErrorKind::TimedOut,
                    format!(
                        "no response within {}",
                        humantime::format_duration(timeout)
                    ),
                ))),
            },
        };

        metric!(timer("downloader.duration") = start.elapsed());
        self.finish(&task, result);
    }

    async fn fetch(&self, task: &FetchTask) -> Result<Downloaded, ImageError> {
        let response = self.transport.fetch(task.request()).await?;
        let expected_len = response.expected_len;
        let progressive = task.options().contains(DownloadOptions::PROGRESSIVE);

        self.broadcast_progress(task, 0, expected_len);

        let mut body = response.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await.transpose()? {
            buf.extend_from_slice(&chunk);
            let received = buf.len() as u64;
            self.broadcast_progress(task, received, expected_len);

            if progressive && expected_len != Some(received) {
                if let Some(image) = self.codec.decode_partial(&buf, expected_len) {
                    self.broadcast_partial(task, image);
                }
            }
        }

        if buf.is_empty() {
            let error = TransportError::new(TransportErrorKind::EmptyBody, "no data received");
            return Err(error.into());
        }

        let data = buf.freeze();
        let codec = self.codec.clone();
        let payload = data.clone();
        let image = tokio::task::spawn_blocking(move || codec.decode(&payload))
            .await
            .ok()
            .flatten()
            .ok_or(ImageError::DecodeFailure)?;

        Ok(Downloaded { image, data })
    }

    fn broadcast_progress(&self, task: &FetchTask, received: u64, expected_len: Option<u64>) {
        for progress in task.progress_listeners() {
            self.delivery
                .dispatch(move || progress(received, expected_len));
        }
    }

    fn broadcast_partial(&self, task: &FetchTask, image: Image) {
        for completed in task.completion_listeners() {
            let image = image.clone();
            self.delivery
                .dispatch(move || completed(DownloadEvent::Partial(image)));
        }
    }

    fn finish(&self, task: &Arc<FetchTask>, result: Result<Downloaded, ImageError>) {
        if !task.complete(result.is_ok()) {
            // the last waiter went away concurrently
            return;
        }

        let registrations = {
            let mut tasks = self.tasks.write();
            let key = task.key();
            if tasks.get(key).is_some_and(|t| Arc::ptr_eq(t, task)) {
                tasks.remove(key);
            }
            task.take_registrations()
        };

        let url = &task.request().url;
        match &result {
            Ok(downloaded) => {
                tracing::trace!(%url, waiters = registrations.len(), "Download finished");
                metric!(time_raw("downloader.size") = downloaded.data.len() as u64);
            }
            Err(err) => {
                tracing::debug!(%url, error = %err, "Download failed");
                let kind = match err {
                    ImageError::Transport(err) => match err.kind {
                        TransportErrorKind::BadStatus(_) => "status",
                        TransportErrorKind::TimedOut => "timeout",
                        kind if kind.is_transient() => "network",
                        _ => "transport",
                    },
                    _ => "decode",
                };
                metric!(counter("downloader.failure") += 1, "kind" => kind);
            }
        }

        for registration in registrations {
            let completed = registration.completed;
            let result = result.clone();
            self.delivery
                .dispatch(move || completed(DownloadEvent::Finished(result)));
        }
    }
}

/// Downloads images, coalescing concurrent downloads of the same URL.
///
/// This is a cheaply cloneable handle, all clones share the same tasks and queue.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("queue", &self.inner.queue)
            .field("tasks", &self.inner.tasks.read().len())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        config: &DownloaderConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ImageCodec>,
        delivery: Delivery,
        runtime: Handle,
    ) -> Self {
        let credentials = config.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: config.password.clone(),
        });

        Self {
            inner: Arc::new(DownloaderInner {
                transport,
                codec,
                delivery,
                queue: DownloadQueue::new(
                    config.max_concurrent_downloads,
                    config.execution_order,
                    runtime,
                ),
                tasks: Default::default(),
                next_id: AtomicU64::new(0),
                download_timeout: RwLock::new(config.download_timeout),
                headers: RwLock::new(config.headers.clone()),
                headers_filter: RwLock::new(None),
                credentials: RwLock::new(credentials),
            }),
        }
    }

    /// Creates a downloader using the [`HttpTransport`].
    pub fn from_config(
        config: &DownloaderConfig,
        codec: Arc<dyn ImageCodec>,
        delivery: Delivery,
        runtime: Handle,
    ) -> reqwest::Result<Self> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(
            config,
            Arc::new(transport),
            codec,
            delivery,
            runtime,
        ))
    }

    pub fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    /// Downloads `url`, joining an in-flight download of the same URL if there is one.
    ///
    /// `progress` and `completed` are invoked on the delivery context. When joining, the
    /// `options` of the original download stay in effect.
    pub fn download(
        &self,
        url: &Url,
        options: DownloadOptions,
        progress: Option<ProgressFn>,
        completed: DownloadCompletedFn,
    ) -> DownloadToken {
        let key = url.as_str().to_owned();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            progress,
            completed,
        };

        let (task, created) = {
            let mut tasks = self.inner.tasks.write();
            match tasks.get(&key) {
                Some(task) if task.state() != TaskState::Cancelled => {
                    task.register(registration);
                    (task.clone(), false)
                }
                _ => {
                    let request = self.inner.request_for(url, options);
                    let task = Arc::new(FetchTask::new(key.clone(), request));
                    task.register(registration);
                    tasks.insert(key, task.clone());
                    (task, true)
                }
            }
        };

        if created {
            metric!(counter("downloader.task.created") += 1);
            let inner = self.inner.clone();
            let queued = task.clone();
            self.inner
                .queue
                .submit(options.priority(), inner.run(queued));
        } else {
            metric!(counter("downloader.coalesced") += 1);
            tracing::trace!(%url, "Joined in-flight download");
        }

        DownloadToken {
            id,
            task,
            tasks: self.inner.tasks.clone(),
        }
    }

    /// Cancels every download and drops all of their waiters.
    pub fn cancel_all(&self) {
        let tasks: Vec<_> = self.inner.tasks.write().drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.cancel();
            task.take_registrations();
        }
        tracing::debug!(count = tasks.len(), "Cancelled all downloads");
    }

    /// Cancels every download that may not continue in the background.
    ///
    /// Waiters that are still attached to a cancelled download finish with a transient
    /// [`TransportErrorKind::Cancelled`] error.
    pub fn cancel_foreground(&self) {
        let mut cancelled = Vec::new();
        self.inner.tasks.write().retain(|_, task| {
            let keep = task
                .options()
                .contains(DownloadOptions::CONTINUE_IN_BACKGROUND);
            if !keep {
                cancelled.push(task.clone());
            }
            keep
        });
        for task in &cancelled {
            // a task that completed concurrently delivers its own result
            if !task.cancel() {
                continue;
            }
            let error = ImageError::from(TransportError::new(
                TransportErrorKind::Cancelled,
                "cancelled in the background",
            ));
            for registration in task.take_registrations() {
                let completed = registration.completed;
                let result = Err(error.clone());
                self.inner
                    .delivery
                    .dispatch(move || completed(DownloadEvent::Finished(result)));
            }
        }
        tracing::debug!(count = cancelled.len(), "Cancelled foreground downloads");
    }

    /// The number of downloads that are queued or running.
    pub fn current_download_count(&self) -> usize {
        self.inner.tasks.read().len()
    }

    pub fn set_max_concurrent_downloads(&self, max_concurrent: usize) {
        self.inner.queue.set_max_concurrent(max_concurrent)
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.queue.max_concurrent()
    }

    /// Sets the order in which downloads queued from now on are started.
    pub fn set_execution_order(&self, order: ExecutionOrder) {
        self.inner.queue.set_execution_order(order)
    }

    pub fn execution_order(&self) -> ExecutionOrder {
        self.inner.queue.execution_order()
    }

    /// Suspends or resumes starting queued downloads.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.queue.set_suspended(suspended)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.queue.is_suspended()
    }

    /// Sets the timeout of downloads started from now on.
    pub fn set_download_timeout(&self, timeout: Duration) {
        *self.inner.download_timeout.write() = timeout;
    }

    pub fn download_timeout(&self) -> Duration {
        *self.inner.download_timeout.read()
    }

    /// Sets or, with `None`, removes a header sent with every download.
    pub fn set_header(&self, name: &str, value: Option<&str>) {
        let mut headers = self.inner.headers.write();
        match value {
            Some(value) => headers.insert(name.to_owned(), value.to_owned()),
            None => headers.remove(name),
        };
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner.headers.read().get(name).cloned()
    }

    pub fn set_headers_filter(&self, filter: Option<HeadersFilter>) {
        *self.inner.headers_filter.write() = filter;
    }

    /// Sets the credentials for basic authentication, or removes them with `None`.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.inner.credentials.write() = credentials;
    }
}
