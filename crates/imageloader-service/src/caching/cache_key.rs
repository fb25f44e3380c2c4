use std::fmt::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Returns the file name a cache key is persisted under.
///
/// This is the sha-256 hash of the key, hex-formatted, so arbitrary keys map to flat and
/// file system safe names.
pub fn cache_file_name(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());

    let mut name = String::with_capacity(hash.len() * 2);
    for b in hash {
        // writing into a `String` is infallible
        let _ = write!(name, "{b:02x}");
    }
    name
}

/// Returns the path of the cache file for `key` below `root`.
pub fn cache_path_for_key(key: &str, root: &Path) -> PathBuf {
    root.join(cache_file_name(key))
}
