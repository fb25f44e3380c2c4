use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::runtime::Handle;
use url::Url;

use crate::caching::ImageCache;
use crate::download::{DownloadEvent, Downloaded, Downloader, ProgressFn};
use crate::error::ImageError;
use crate::types::{CacheSource, DownloadOptions, Image, LoadOptions};

use super::failed_urls::FailedUrls;
use super::request::{LoadedImage, RequestState, RunningRequests};
use super::{CompletedFn, ManagerDelegate};

/// One image load, from the cache lookup to the final completion.
///
/// All methods run on the delivery context, except the delegate's transform. The load only
/// holds handles to the parts of the manager it needs, never the manager itself.
pub(super) struct Load {
    pub state: Arc<RequestState>,
    pub url: Url,
    pub key: String,
    pub options: LoadOptions,
    pub progress: Option<ProgressFn>,
    pub completed: CompletedFn,
    pub delegate: Option<Arc<dyn ManagerDelegate>>,
    pub cache: ImageCache,
    pub failed: FailedUrls,
    pub running: RunningRequests,
    pub runtime: Handle,
}

impl Load {
    fn loaded(&self, image: Image, source: CacheSource, finished: bool) -> LoadedImage {
        LoadedImage {
            image,
            data: None,
            source,
            finished,
            url: self.url.clone(),
        }
    }

    /// Delivers a non-final image.
    fn deliver(&self, loaded: LoadedImage) {
        if self.state.is_live() {
            (self.completed)(Ok(loaded));
        }
    }

    /// Delivers the final outcome and retires the request.
    fn complete(&self, result: Result<LoadedImage, ImageError>) {
        if !self.state.finish() {
            return;
        }
        self.running.lock().remove(&self.state.id());
        (self.completed)(result);
    }

    /// Progress of the download, suppressed once the request is done.
    fn progress(&self) -> Option<ProgressFn> {
        let progress = self.progress.clone()?;
        let state = self.state.clone();
        Some(Arc::new(move |received: u64, expected: Option<u64>| {
            if state.is_live() {
                progress(received, expected);
            }
        }))
    }

    pub fn on_cache_result(
        self: Arc<Self>,
        cached: Option<Image>,
        source: CacheSource,
        downloader: &Downloader,
    ) {
        if !self.state.is_live() {
            return;
        }

        let refresh = self.options.contains(LoadOptions::REFRESH_CACHED);
        if let Some(image) = &cached {
            if !refresh {
                self.complete(Ok(self.loaded(image.clone(), source, true)));
                return;
            }
            self.deliver(self.loaded(image.clone(), source, false));
        }

        let should_download = self
            .delegate
            .as_ref()
            .is_none_or(|delegate| delegate.should_download(&self.url));
        if !should_download {
            tracing::debug!(url = %self.url, "Download declined by the delegate");
            match cached {
                Some(image) => self.complete(Ok(self.loaded(image, source, true))),
                None => self.complete(Err(ImageError::Declined)),
            }
            return;
        }

        let mut options = DownloadOptions::from(self.options);
        if cached.is_some() {
            options.remove(DownloadOptions::PROGRESSIVE);
        }
        let progressive = options.contains(DownloadOptions::PROGRESSIVE);

        let load = self.clone();
        let token = downloader.download(
            &self.url,
            options,
            self.progress(),
            Arc::new(move |event: DownloadEvent| {
                load.clone().on_download_event(event, progressive)
            }),
        );
        self.state.attach_download(token);
    }

    fn on_download_event(self: Arc<Self>, event: DownloadEvent, progressive: bool) {
        let result = match event {
            DownloadEvent::Partial(image) => {
                if progressive {
                    self.deliver(self.loaded(image, CacheSource::None, false));
                }
                return;
            }
            DownloadEvent::Finished(result) => result,
        };

        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(err) => {
                if err.is_permanent() {
                    self.failed.insert(&self.url);
                }
                self.complete(Err(err));
                return;
            }
        };

        if self.options.contains(LoadOptions::RETRY_FAILED) {
            self.failed.remove(&self.url);
        }
        if !self.state.is_live() {
            return;
        }

        let Some(delegate) = self.delegate.clone() else {
            self.store_and_complete(downloaded, None);
            return;
        };

        let runtime = self.runtime.clone();
        runtime.spawn_blocking(move || {
            let transform = || delegate.transform(&downloaded.image, &self.url);
            let transformed = catch_unwind(AssertUnwindSafe(transform)).unwrap_or_else(|_| {
                tracing::error!(url = %self.url, "Image transform panicked, keeping the original");
                None
            });
            let delivery = self.cache.delivery().clone();
            delivery.dispatch(move || self.store_and_complete(downloaded, transformed));
        });
    }

    fn store_and_complete(&self, downloaded: Downloaded, transformed: Option<Image>) {
        if !self.state.is_live() {
            return;
        }

        // transformed images are re-encoded, their original payload no longer applies
        let (image, data) = match transformed {
            Some(image) => (image, None),
            None => (downloaded.image, Some(downloaded.data)),
        };

        let to_disk = !self.options.contains(LoadOptions::CACHE_MEMORY_ONLY);
        self.cache
            .store(&self.key, image.clone(), data.clone(), to_disk);

        self.complete(Ok(LoadedImage {
            image,
            data,
            source: CacheSource::None,
            finished: true,
            url: self.url.clone(),
        }));
    }
}
