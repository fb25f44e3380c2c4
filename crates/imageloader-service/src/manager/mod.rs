//! # Image requests
//!
//! The [`ImageManager`] is the entry point for loading images. Every call to
//! [`ImageManager::load_image`] first consults the [`ImageCache`], and falls back to the
//! [`Downloader`] on a miss. Successful downloads are stored in the cache before they are
//! delivered. URLs that fail permanently are remembered and refused on subsequent loads, unless
//! the caller asks to retry them.
//!
//! The manager keeps track of all outstanding requests, so they can be cancelled at once with
//! [`ImageManager::cancel_all`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use url::Url;

use crate::caching::ImageCache;
use crate::config::Config;
use crate::delivery::Delivery;
use crate::download::{Downloader, HttpTransport, ProgressFn, Transport};
use crate::error::ImageError;
use crate::types::{Image, ImageCodec, LoadOptions};
use crate::utils::defer::defer;

mod failed_urls;
mod load;
mod request;

pub use failed_urls::FailedUrls;
pub use request::{ImageRequest, LoadedImage};

use load::Load;
use request::{RequestState, RunningRequests};

/// Receives every image delivered for a request, and finally its outcome.
///
/// Non-final images have [`LoadedImage::finished`] unset. The completion is invoked exactly once
/// with a finished image or an error, unless the request is cancelled first.
pub type CompletedFn = Arc<dyn Fn(Result<LoadedImage, ImageError>) + Send + Sync>;

/// Derives the cache key of a URL.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Hooks into the loading of images.
pub trait ManagerDelegate: Send + Sync + 'static {
    /// Whether an image that is not cached should be downloaded.
    fn should_download(&self, url: &Url) -> bool {
        let _ = url;
        true
    }

    /// Transforms a freshly downloaded image before it is cached and delivered.
    ///
    /// This runs on a blocking worker thread. Returning `None` keeps the image as is.
    fn transform(&self, image: &Image, url: &Url) -> Option<Image> {
        let _ = (image, url);
        None
    }
}

/// Loads images through the cache and the downloader.
pub struct ImageManager {
    cache: ImageCache,
    downloader: Downloader,
    failed: FailedUrls,
    running: RunningRequests,
    delegate: RwLock<Option<Arc<dyn ManagerDelegate>>>,
    cache_key_filter: RwLock<Option<CacheKeyFilter>>,
    next_id: AtomicU64,
    runtime: Handle,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("cache", &self.cache)
            .field("downloader", &self.downloader)
            .field("running", &self.running.lock().len())
            .finish_non_exhaustive()
    }
}

impl ImageManager {
    /// Creates a manager with its own cache and downloader, delivering on a [`Delivery::serial`]
    /// context.
    pub fn new(
        config: &Config,
        codec: Arc<dyn ImageCodec>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> io::Result<Self> {
        let delivery = Delivery::serial(&runtime);
        let cache = ImageCache::from_config(config, codec.clone(), delivery.clone(), &runtime)?;
        let downloader = Downloader::new(
            &config.downloader,
            transport,
            codec,
            delivery,
            runtime.clone(),
        );
        Ok(Self::with_parts(config, cache, downloader, runtime))
    }

    /// Creates a manager downloading over HTTP.
    pub fn from_config(
        config: &Config,
        codec: Arc<dyn ImageCodec>,
        runtime: Handle,
    ) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(&config.downloader)?;
        Ok(Self::new(config, codec, Arc::new(transport), runtime)?)
    }

    /// Creates a manager from an existing cache and downloader.
    ///
    /// Both should share the same [`Delivery`] context, the cache's one is used for the
    /// completions of the manager.
    pub fn with_parts(
        config: &Config,
        cache: ImageCache,
        downloader: Downloader,
        runtime: Handle,
    ) -> Self {
        Self {
            cache,
            downloader,
            failed: FailedUrls::new(config.failed_url_ttl),
            running: RunningRequests::default(),
            delegate: RwLock::new(None),
            cache_key_filter: RwLock::new(None),
            next_id: AtomicU64::new(0),
            runtime,
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn failed_urls(&self) -> &FailedUrls {
        &self.failed
    }

    fn delivery(&self) -> &Delivery {
        self.cache.delivery()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn ManagerDelegate>>) {
        *self.delegate.write() = delegate;
    }

    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        *self.cache_key_filter.write() = filter;
    }

    /// The cache key of `url`, by default the URL itself.
    pub fn cache_key_for_url(&self, url: &Url) -> String {
        match self.cache_key_filter.read().as_ref() {
            Some(filter) => filter(url),
            None => url.as_str().to_owned(),
        }
    }

    /// Loads the image at `url`.
    ///
    /// `progress` and `completed` are invoked on the delivery context. Invalid URLs and URLs
    /// that failed permanently before complete with an error right away, and the returned
    /// request is already finished.
    pub fn load_image(
        &self,
        url: &str,
        options: LoadOptions,
        progress: Option<ProgressFn>,
        completed: CompletedFn,
    ) -> ImageRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(RequestState::new(id, options));
        let request = ImageRequest::new(state.clone(), self.running.clone());

        let url = match parse_url(url) {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!(error = %err, "Refusing to load image");
                state.finish();
                self.delivery().dispatch(move || completed(Err(err)));
                return request;
            }
        };

        if !options.contains(LoadOptions::RETRY_FAILED) && self.failed.contains(&url) {
            tracing::debug!(%url, "Refusing to load failed url");
            state.finish();
            self.delivery()
                .dispatch(move || completed(Err(ImageError::Blacklisted)));
            return request;
        }

        self.running.lock().insert(id, state.clone());

        let key = self.cache_key_for_url(&url);
        let load = Arc::new(Load {
            state: state.clone(),
            url,
            key: key.clone(),
            options,
            progress,
            completed,
            delegate: self.delegate.read().clone(),
            cache: self.cache.clone(),
            failed: self.failed.clone(),
            running: self.running.clone(),
            runtime: self.runtime.clone(),
        });

        let downloader = self.downloader.clone();
        let query = self.cache.query(&key, move |image, source| {
            load.on_cache_result(image, source, &downloader)
        });
        state.attach_query(query);

        request
    }

    /// Loads the image at `url`, resolving to the final outcome.
    ///
    /// Dropping the future cancels the request.
    pub async fn load(&self, url: &str, options: LoadOptions) -> Result<LoadedImage, ImageError> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));

        let request = self.load_image(
            url,
            options,
            None,
            Arc::new(move |result: Result<LoadedImage, ImageError>| {
                if matches!(&result, Ok(loaded) if !loaded.finished) {
                    return;
                }
                if let Some(sender) = sender.lock().take() {
                    sender.send(result).ok();
                }
            }),
        );
        let _cancel = defer(move || request.cancel());

        receiver.await.unwrap_or(Err(ImageError::Cancelled))
    }

    /// Cancels every outstanding request.
    pub fn cancel_all(&self) {
        let requests: Vec<_> = self.running.lock().drain().map(|(_, s)| s).collect();
        tracing::debug!(count = requests.len(), "Cancelling all image requests");
        for request in requests {
            request.cancel();
        }
    }

    /// Whether any request is outstanding.
    pub fn is_running(&self) -> bool {
        !self.running.lock().is_empty()
    }

    /// Stores `image` as the cached image of `url`, in memory and on disk.
    pub fn save_image_to_cache(&self, image: Image, url: &Url) {
        let key = self.cache_key_for_url(url);
        self.cache.store(&key, image, None, true);
    }

    /// Checks both cache tiers for `url`, blocking on file system access.
    pub fn cached_image_exists(&self, url: &Url) -> bool {
        let key = self.cache_key_for_url(url);
        self.cache.exists_in_memory(&key) || self.cache.exists_on_disk(&key)
    }

    /// Checks both cache tiers for `url`, invoking `done` on the delivery context.
    pub fn cached_image_exists_async<F>(&self, url: &Url, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = self.cache_key_for_url(url);
        if self.cache.exists_in_memory(&key) {
            self.delivery().dispatch(move || done(true));
        } else {
            self.cache.exists_on_disk_async(&key, done);
        }
    }

    /// Checks the disk tier for `url`, blocking on file system access.
    pub fn disk_image_exists(&self, url: &Url) -> bool {
        self.cache.exists_on_disk(&self.cache_key_for_url(url))
    }

    /// Checks the disk tier for `url`, invoking `done` on the delivery context.
    pub fn disk_image_exists_async<F>(&self, url: &Url, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.cache
            .exists_on_disk_async(&self.cache_key_for_url(url), done);
    }

    /// Handles memory pressure of the host.
    pub fn on_memory_warning(&self) {
        self.cache.on_memory_warning();
    }

    /// Handles the host moving to the background.
    ///
    /// Runs disk housekeeping and cancels all requests and downloads that may not continue in
    /// the background.
    pub fn on_background(&self) {
        self.cache.clean_expired();

        let mut cancelled = Vec::new();
        self.running.lock().retain(|_, state| {
            let keep = state
                .options()
                .contains(LoadOptions::CONTINUE_IN_BACKGROUND);
            if !keep {
                cancelled.push(state.clone());
            }
            keep
        });
        for state in cancelled {
            state.cancel();
        }

        self.downloader.cancel_foreground();
    }
}

fn parse_url(url: &str) -> Result<Url, ImageError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ImageError::MalformedRequest("empty url".into()));
    }
    Url::parse(url).map_err(|err| ImageError::MalformedRequest(format!("{err}: `{url}`")))
}
