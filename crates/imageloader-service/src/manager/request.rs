use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::caching::CacheQuery;
use crate::download::DownloadToken;
use crate::types::{CacheSource, Image, LoadOptions};

/// The outstanding requests of a manager, by request id.
pub(super) type RunningRequests = Arc<Mutex<HashMap<u64, Arc<RequestState>>>>;

/// An image delivered to the completion of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedImage {
    pub image: Image,
    /// The downloaded payload. `None` for cached or transformed images.
    pub data: Option<Bytes>,
    pub source: CacheSource,
    /// `false` for partial images and for cached images that are about to be refreshed.
    pub finished: bool,
    pub url: Url,
}

const LIVE: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

/// The shared state of one request.
///
/// A request is either live, finished or cancelled. It leaves the live state exactly once, so
/// of a racing [`finish`](Self::finish) and [`cancel`](Self::cancel) only one succeeds.
pub(super) struct RequestState {
    id: u64,
    options: LoadOptions,
    state: AtomicU8,
    query: Mutex<Option<CacheQuery>>,
    download: Mutex<Option<DownloadToken>>,
}

impl RequestState {
    pub fn new(id: u64, options: LoadOptions) -> Self {
        Self {
            id,
            options,
            state: AtomicU8::new(LIVE),
            query: Mutex::new(None),
            download: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(LIVE, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// Whether events may still be delivered for this request.
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == LIVE
    }

    /// Marks the request as finished, returning `false` if it was already finished or cancelled.
    pub fn finish(&self) -> bool {
        self.transition(FINISHED)
    }

    /// Cancels the pending cache query and detaches from the download.
    ///
    /// Returns `false` if the request was already finished or cancelled.
    pub fn cancel(&self) -> bool {
        if !self.transition(CANCELLED) {
            return false;
        }
        if let Some(query) = self.query.lock().take() {
            query.cancel();
        }
        if let Some(download) = self.download.lock().take() {
            download.cancel();
        }
        true
    }

    pub fn attach_query(&self, query: CacheQuery) {
        let mut slot = self.query.lock();
        if self.is_cancelled() {
            query.cancel();
        } else {
            *slot = Some(query);
        }
    }

    pub fn attach_download(&self, download: DownloadToken) {
        let mut slot = self.download.lock();
        if self.is_cancelled() {
            download.cancel();
        } else {
            *slot = Some(download);
        }
    }
}

/// A handle to a request started by [`ImageManager::load_image`].
///
/// Dropping the handle does not cancel the request.
///
/// [`ImageManager::load_image`]: super::ImageManager::load_image
pub struct ImageRequest {
    state: Arc<RequestState>,
    running: RunningRequests,
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("id", &self.state.id)
            .field("options", &self.state.options)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ImageRequest {
    pub(super) fn new(state: Arc<RequestState>, running: RunningRequests) -> Self {
        Self { state, running }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Cancels the request. Its completion will not be invoked anymore.
    ///
    /// Other requests for the same image are not affected.
    pub fn cancel(&self) {
        if self.state.cancel() {
            self.running.lock().remove(&self.state.id);
            tracing::trace!(id = self.state.id, "Cancelled image request");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Whether the final completion was delivered, or is about to be.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_once() {
        let running = RunningRequests::default();
        let state = Arc::new(RequestState::new(1, LoadOptions::empty()));
        running.lock().insert(1, state.clone());

        let request = ImageRequest::new(state.clone(), running.clone());
        let query = CacheQuery::default();
        state.attach_query(query.clone());

        request.cancel();
        assert!(request.is_cancelled());
        assert!(query.is_cancelled());
        assert!(running.lock().is_empty());
        assert!(!state.cancel());

        // late attachments are cancelled right away
        let late = CacheQuery::default();
        state.attach_query(late.clone());
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_finished_requests_ignore_cancel() {
        let state = RequestState::new(1, LoadOptions::empty());
        assert!(state.is_live());
        assert!(state.finish());
        assert!(!state.finish());

        assert!(!state.cancel());
        assert!(!state.is_cancelled());
        assert!(!state.is_live());

        // and cancelled requests can no longer finish
        let state = RequestState::new(2, LoadOptions::empty());
        assert!(state.cancel());
        assert!(!state.finish());
        assert!(state.is_cancelled());
        assert!(!state.is_finished());
    }

    #[test]
    fn test_cancel_races_finish() {
        for id in 0..200 {
            let state = Arc::new(RequestState::new(id, LoadOptions::empty()));
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let cancel = std::thread::spawn({
                let state = state.clone();
                let barrier = barrier.clone();
                move || {
                    barrier.wait();
                    state.cancel()
                }
            });
            barrier.wait();
            let finished = state.finish();
            let cancelled = cancel.join().unwrap();

            assert_ne!(finished, cancelled);
            assert_eq!(state.is_finished(), finished);
            assert_eq!(state.is_cancelled(), cancelled);
        }
    }
}
