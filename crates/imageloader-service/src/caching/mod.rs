//! # Image caching
//!
//! Images pass through two cache tiers before anything is downloaded:
//!
//! - The memory tier keeps decoded [`Image`]s, bounded by the summed cost of all images and by
//!   their count. When either bound is exceeded, the least recently used images are evicted.
//! - The disk tier keeps the raw payloads, one file per key, bounded by age and by total size.
//!   Its housekeeping runs on demand, see [`ImageCache::clean_expired`].
//!
//! A lookup first consults the memory tier synchronously. On a miss, the disk tier is read on the
//! serial I/O queue, the payload is decoded and promoted into memory. Disk read errors and
//! undecodable files count as misses. Stores insert into memory immediately, while the disk write
//! happens asynchronously. Failed disk writes are logged and otherwise ignored.
//!
//! All completion callbacks are invoked on the [`Delivery`] context.
//!
//! ### Metrics
//!
//! - `caches.memory.hit`: Lookups served by the memory tier.
//! - `caches.memory.evicted`: Images evicted from the memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Lookups reaching the disk tier.
//! - `caches.file.write`: Files written to the disk tier, with `caches.file.size` their sizes.
//! - `caches.size.*`: Gauges and counters emitted by housekeeping.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::delivery::Delivery;
use crate::types::{CacheSource, Image, ImageCodec};

mod cache_key;
mod cleanup;
mod disk;
mod io_queue;
mod memory;

pub use cache_key::{cache_file_name, cache_path_for_key};
pub use cleanup::CleanupStats;
pub use disk::DiskCache;
pub use io_queue::IoQueue;
pub use memory::MemoryCache;

/// A handle to a pending cache lookup.
#[derive(Debug, Clone, Default)]
pub struct CacheQuery {
    token: CancellationToken,
}

impl CacheQuery {
    /// Cancels the lookup. Its completion will not be invoked anymore.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct CacheInner {
    memory: MemoryCache,
    disk: DiskCache,
    io: IoQueue,
    codec: Arc<dyn ImageCodec>,
    delivery: Delivery,
    memory_enabled: AtomicBool,
}

impl CacheInner {
    /// Reads and decodes `key` from disk, promoting it into memory.
    ///
    /// This blocks on file system access.
    fn load_from_disk(&self, key: &str) -> Option<Image> {
        let data = match self.disk.read(key) {
            Ok(Some(data)) => data,
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
            Err(err) => {
                tracing::warn!(%key, error = %err, "Failed to read cache file");
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
        };

        let Some(image) = self.codec.decode(&data) else {
            tracing::debug!(%key, "Cache file is not a valid image");
            metric!(counter("caches.file.miss") += 1);
            return None;
        };
        metric!(counter("caches.file.hit") += 1);

        if self.memory_enabled.load(Ordering::Relaxed) {
            self.memory.insert(key.to_owned(), image.clone());
        }
        Some(image)
    }

    fn get(&self, key: &str) -> Option<Image> {
        if !self.memory_enabled.load(Ordering::Relaxed) {
            return None;
        }
        let image = self.memory.get(key)?;
        metric!(counter("caches.memory.hit") += 1);
        Some(image)
    }
}

/// The tiered image cache.
///
/// This is a cheaply cloneable handle, all clones share the same tiers.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Creates the cache tiers, creating the cache directory if needed.
    ///
    /// Leftover temporary files of a previous process are removed.
    pub fn from_config(
        config: &Config,
        codec: Arc<dyn ImageCodec>,
        delivery: Delivery,
        runtime: &Handle,
    ) -> io::Result<Self> {
        let disk = DiskCache::from_config(config)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                memory: MemoryCache::new(&config.caches.memory),
                disk,
                io: IoQueue::new(runtime),
                codec,
                delivery,
                memory_enabled: AtomicBool::new(config.caches.memory.enabled),
            }),
        })
    }

    pub fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// Looks up `key` in the memory tier only.
    pub fn get(&self, key: &str) -> Option<Image> {
        self.inner.get(key)
    }

    /// Looks up `key` in the memory tier, then synchronously in the disk tier.
    pub fn get_or_load(&self, key: &str) -> Option<Image> {
        self.inner
            .get(key)
            .or_else(|| self.inner.load_from_disk(key))
    }

    /// Looks up `key` in both tiers, invoking `done` on the delivery context.
    ///
    /// The memory tier is checked right away, the disk tier on the I/O queue. Cancelling the
    /// returned query suppresses `done`.
    pub fn query<F>(&self, key: &str, done: F) -> CacheQuery
    where
        F: FnOnce(Option<Image>, CacheSource) + Send + 'static,
    {
        let query = CacheQuery::default();

        if let Some(image) = self.inner.get(key) {
            let token = query.token.clone();
            self.inner.delivery.dispatch(move || {
                if !token.is_cancelled() {
                    done(Some(image), CacheSource::Memory)
                }
            });
            return query;
        }

        if !self.inner.disk.is_enabled() {
            let token = query.token.clone();
            self.inner.delivery.dispatch(move || {
                if !token.is_cancelled() {
                    done(None, CacheSource::None)
                }
            });
            return query;
        }

        let inner = self.inner.clone();
        let token = query.token.clone();
        let key = key.to_owned();
        self.inner.io.submit(move || {
            if token.is_cancelled() {
                return;
            }
            // a panicking codec counts as a miss
            let image = catch_unwind(AssertUnwindSafe(|| inner.load_from_disk(&key)))
                .unwrap_or_else(|_| {
                    tracing::error!(%key, "Reading cache file panicked");
                    metric!(counter("caches.file.miss") += 1);
                    None
                });
            let source = match image {
                Some(_) => CacheSource::Disk,
                None => CacheSource::None,
            };
            inner.delivery.dispatch(move || {
                if !token.is_cancelled() {
                    done(image, source)
                }
            });
        });

        query
    }

    /// Looks up `key` in both tiers.
    pub async fn lookup(&self, key: &str) -> (Option<Image>, CacheSource) {
        let (sender, receiver) = oneshot::channel();
        self.query(key, move |image, source| {
            sender.send((image, source)).ok();
        });
        receiver.await.unwrap_or((None, CacheSource::None))
    }

    /// Stores `image` for `key`.
    ///
    /// The image is inserted into the memory tier right away. With `to_disk`, `data` is written
    /// to the disk tier in the background. Without `data`, the image is encoded with the codec
    /// first, and not persisted at all if the codec cannot encode.
    pub fn store(&self, key: &str, image: Image, data: Option<Bytes>, to_disk: bool) {
        if self.inner.memory_enabled.load(Ordering::Relaxed) {
            self.inner.memory.insert(key.to_owned(), image.clone());
        }

        if !to_disk || !self.inner.disk.is_enabled() {
            return;
        }

        let inner = self.inner.clone();
        let key = key.to_owned();
        self.inner.io.submit(move || {
            let Some(data) = data.or_else(|| inner.codec.encode(&image)) else {
                tracing::debug!(%key, "Image cannot be encoded, not persisting it");
                return;
            };
            if let Err(err) = inner.disk.write(&key, &data) {
                tracing::error!(%key, error = %err, "Failed to write cache file");
            }
        });
    }

    /// Removes `key` from memory, and optionally from disk in the background.
    pub fn remove(&self, key: &str, from_disk: bool) {
        self.inner.memory.remove(key);

        if from_disk {
            let inner = self.inner.clone();
            let key = key.to_owned();
            self.inner.io.submit(move || {
                if let Err(err) = inner.disk.remove(&key) {
                    tracing::error!(%key, error = %err, "Failed to remove cache file");
                }
            });
        }
    }

    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Removes all files of the disk tier in the background.
    pub fn clear_disk(&self) {
        let inner = self.inner.clone();
        self.inner.io.submit(move || {
            if let Err(err) = inner.disk.clear() {
                tracing::error!(error = %err, "Failed to clear disk cache");
            }
        });
    }

    /// Runs housekeeping of the disk tier in the background.
    pub fn clean_expired(&self) {
        let inner = self.inner.clone();
        self.inner.io.submit(move || {
            if let Err(err) = inner.disk.cleanup() {
                tracing::error!(error = %err, "Failed to clean up disk cache");
            }
        });
    }

    /// Waits for all background disk work scheduled so far.
    pub async fn flush(&self) {
        self.inner.io.flush().await
    }

    pub fn exists_in_memory(&self, key: &str) -> bool {
        self.inner.memory.contains(key)
    }

    /// Checks the disk tier for `key`, blocking on file system access.
    pub fn exists_on_disk(&self, key: &str) -> bool {
        self.inner.disk.exists(key)
    }

    /// Checks the disk tier for `key` on the I/O queue, invoking `done` on the delivery context.
    pub fn exists_on_disk_async<F>(&self, key: &str, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let inner = self.inner.clone();
        let key = key.to_owned();
        self.inner.io.submit(move || {
            let exists = inner.disk.exists(&key);
            inner.delivery.dispatch(move || done(exists));
        });
    }

    /// The total size of the disk tier in bytes.
    pub fn disk_size(&self) -> u64 {
        self.disk_stats().1
    }

    /// The number of files in the disk tier.
    pub fn disk_count(&self) -> usize {
        self.disk_stats().0
    }

    fn disk_stats(&self) -> (usize, u64) {
        self.inner.disk.stats().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to list disk cache");
            (0, 0)
        })
    }

    /// Computes the file count and total size of the disk tier on the I/O queue.
    pub fn calculate_size<F>(&self, done: F)
    where
        F: FnOnce(usize, u64) + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.io.submit(move || {
            let (count, size) = inner.disk.stats().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Failed to list disk cache");
                (0, 0)
            });
            inner.delivery.dispatch(move || done(count, size));
        });
    }

    /// The path of the cache file for `key` below `root`.
    pub fn cache_path_for_key(&self, key: &str, root: &Path) -> PathBuf {
        cache_path_for_key(key, root)
    }

    /// The path the disk tier stores `key` at, if it is enabled.
    pub fn default_cache_path_for_key(&self, key: &str) -> Option<PathBuf> {
        self.inner.disk.path_for_key(key)
    }

    /// Adds a pre-populated directory that is searched on disk misses.
    pub fn add_read_only_cache_path(&self, path: impl Into<PathBuf>) {
        self.inner.disk.add_read_only_path(path.into())
    }

    /// Enables or disables the memory tier. Disabling it also clears it.
    pub fn set_should_cache_in_memory(&self, enabled: bool) {
        self.inner.memory_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.inner.memory.clear();
        }
    }

    /// Handles memory pressure of the host.
    pub fn on_memory_warning(&self) {
        tracing::debug!("Clearing memory cache due to memory pressure");
        self.clear_memory();
    }
}

#[cfg(test)]
mod tests;
