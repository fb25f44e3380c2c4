use std::fs::remove_file;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Result;

use super::disk::{DiskCache, catch_not_found};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskCache {
    /// Applies the configured retention to the disk tier.
    ///
    /// Files older than `max_age` are removed first. If the remaining files still exceed
    /// `max_size`, the oldest files are removed until the total size drops to half of
    /// `max_size`.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let Some(cache_dir) = self.cache_dir.as_deref() else {
            return Ok(stats);
        };
        tracing::info!("Cleaning up `{}`", cache_dir.display());

        let now = SystemTime::now();
        let mut retained = Vec::new();
        for (path, metadata) in self.entries()? {
            let size = metadata.len();
            let mtime = metadata.modified()?;
            let age = now.duration_since(mtime).unwrap_or_default();

            let expired = self.config.max_age.is_some_and(|max_age| age > max_age);
            if expired {
                if try_remove(&path)? {
                    stats.removed_files += 1;
                    stats.removed_bytes += size;
                }
            } else {
                retained.push((path, mtime, size));
            }
        }

        let mut total_size: u64 = retained.iter().map(|(_, _, size)| size).sum();
        if let Some(max_size) = self.config.max_size {
            if total_size > max_size {
                let target_size = max_size / 2;
                tracing::debug!(total_size, target_size, "Cache exceeds its size limit");

                // oldest files first
                retained.sort_by_key(|(_, mtime, _)| *mtime);
                let mut remaining = retained.into_iter();
                for (path, _, size) in remaining.by_ref() {
                    if try_remove(&path)? {
                        stats.removed_files += 1;
                        stats.removed_bytes += size;
                        total_size -= size;
                    }
                    if total_size <= target_size {
                        break;
                    }
                }
                retained = remaining.collect();
            }
        }

        stats.retained_files = retained.len();
        stats.retained_bytes = total_size;

        tracing::info!("Cleaning up `{}` complete", cache_dir.display());
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

/// Removes the file at `path`, returning `false` if it was already gone.
fn try_remove(path: &Path) -> Result<bool> {
    tracing::debug!("Removing file `{}`", path.display());
    Ok(catch_not_found(|| remove_file(path))?.is_some())
}
