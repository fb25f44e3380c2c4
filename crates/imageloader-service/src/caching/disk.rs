//! The on-disk tier.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::config::{Config, DiskCacheConfig, TMP_DIR};

use super::cache_key::cache_path_for_key;

/// One file per key, below `<cache_dir>/<namespace>`.
///
/// Files are written to `<cache_dir>/tmp` first and atomically moved into place, so readers
/// never observe partially written files. The modification time of a file is its age: it is set
/// when the file is written and never touched on reads.
#[derive(Debug)]
pub struct DiskCache {
    /// Directory to store cache files in. Will be created if it does not exist.
    ///
    /// Leaving this as None will disable this tier.
    pub(super) cache_dir: Option<PathBuf>,

    /// Directory to use for temporary files.
    ///
    /// Just like for `cache_dir` when this tier is disabled this will be `None`.
    tmp_dir: Option<PathBuf>,

    /// Pre-populated directories which are searched after `cache_dir`, but never written to.
    read_only_paths: RwLock<Vec<PathBuf>>,

    /// Retention limits applied by housekeeping.
    pub(super) config: DiskCacheConfig,
}

impl DiskCache {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let tmp_dir = config.cache_dir(TMP_DIR);
        let cache_dir = config.cache_dir(&config.namespace);

        if let Some(ref dir) = cache_dir {
            fs::create_dir_all(dir)?;
        }

        let cache = DiskCache {
            cache_dir,
            tmp_dir,
            read_only_paths: RwLock::new(config.caches.disk.read_only_paths.clone()),
            config: config.caches.disk.clone(),
        };
        cache.clear_tmp()?;

        Ok(cache)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some()
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// The path `key` is written to.
    pub fn path_for_key(&self, key: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_deref()
            .map(|dir| cache_path_for_key(key, dir))
    }

    pub fn add_read_only_path(&self, path: PathBuf) {
        let mut paths = self.read_only_paths.write();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// All paths `key` may be read from, in lookup order.
    fn lookup_paths(&self, key: &str) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.path_for_key(key).into_iter().collect();
        paths.extend(
            self.read_only_paths
                .read()
                .iter()
                .map(|dir| cache_path_for_key(key, dir)),
        );
        paths
    }

    /// Reads the data stored for `key`.
    pub fn read(&self, key: &str) -> io::Result<Option<Bytes>> {
        for path in self.lookup_paths(key) {
            if let Some(data) = catch_not_found(|| fs::read(&path))? {
                tracing::trace!("Read cache file `{}`", path.display());
                return Ok(Some(data.into()));
            }
        }
        Ok(None)
    }

    /// Checks whether data for `key` exists, without reading it.
    pub fn exists(&self, key: &str) -> bool {
        self.lookup_paths(key).iter().any(|path| path.is_file())
    }

    /// Atomically replaces the data stored for `key`.
    pub fn write(&self, key: &str, data: &[u8]) -> io::Result<()> {
        let Some(path) = self.path_for_key(key) else {
            return Ok(());
        };

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(data)?;
        temp_file.flush()?;
        persist_tempfile(temp_file, &path)?;

        tracing::trace!("Wrote {} bytes to `{}`", data.len(), path.display());
        metric!(counter("caches.file.write") += 1);
        metric!(time_raw("caches.file.size") = data.len() as u64);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        if let Some(path) = self.path_for_key(key) {
            catch_not_found(|| fs::remove_file(&path))?;
        }
        Ok(())
    }

    /// Removes all files of this cache, leaving an empty cache directory.
    pub fn clear(&self) -> io::Result<()> {
        if let Some(ref dir) = self.cache_dir {
            catch_not_found(|| fs::remove_dir_all(dir))?;
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Clear the temporary files.
    ///
    /// This is done on startup to avoid leaking temporary files which survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if let Some(ref tmp) = self.tmp_dir {
            if tmp.exists() {
                fs::remove_dir_all(tmp)?;
            }
            fs::create_dir_all(tmp)?;
        }
        Ok(())
    }

    /// Lists all files of this cache with their metadata.
    pub(super) fn entries(&self) -> io::Result<Vec<(PathBuf, fs::Metadata)>> {
        let Some(ref dir) = self.cache_dir else {
            return Ok(Vec::new());
        };
        let Some(read_dir) = catch_not_found(|| fs::read_dir(dir))? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            // files might be removed concurrently
            if let Some(metadata) = catch_not_found(|| path.metadata())? {
                if metadata.is_file() {
                    entries.push((path, metadata));
                }
            }
        }
        Ok(entries)
    }

    /// The number of files and their total size in bytes.
    pub fn stats(&self) -> io::Result<(usize, u64)> {
        let entries = self.entries()?;
        let size = entries.iter().map(|(_, metadata)| metadata.len()).sum();
        Ok((entries.len(), size))
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        match self.tmp_dir {
            Some(ref path) => {
                // Housekeeping could remove the directories we are operating in, so retry the
                // fs operations.
                const MAX_RETRIES: usize = 2;
                let mut retries = 0;
                loop {
                    retries += 1;

                    if let Err(e) = fs::create_dir_all(path) {
                        tracing::error!(
                            path = %path.display(),
                            "Failed to create cache directory: {:?}",
                            e
                        );
                        if retries > MAX_RETRIES {
                            return Err(e);
                        }
                        continue;
                    }

                    match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                        Ok(temp_file) => return Ok(temp_file),
                        Err(e) => {
                            tracing::error!(
                                path = %path.display(),
                                "Failed to create cache file: {:?}",
                                e
                            );
                            if retries > MAX_RETRIES {
                                return Err(e);
                            }
                        }
                    }
                }
            }
            None => NamedTempFile::new(),
        }
    }
}

/// Moves a finished temporary file to its final location.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                path = %parent.display(),
                "Failed to create cache directory: {:?}",
                e
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    path = %cache_path.display(),
                    "Failed to persist cache file: {:?}",
                    err
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Maps `NotFound` errors of `f` to `Ok(None)`.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
