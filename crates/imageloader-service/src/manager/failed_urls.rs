use std::time::Duration;

use url::Url;

/// The set of URLs that failed permanently.
///
/// Loads of these URLs are refused without touching the network, unless the caller asks to
/// retry them. With a `ttl`, URLs are forgiven after that time.
#[derive(Clone, Debug)]
pub struct FailedUrls {
    urls: moka::sync::Cache<Url, ()>,
}

impl FailedUrls {
    pub fn new(ttl: Option<Duration>) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .eviction_listener(|url, _, _| tracing::info!(%url, "Unblocking url"));
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            urls: builder.build(),
        }
    }

    pub fn insert(&self, url: &Url) {
        if self.urls.contains_key(url) {
            return;
        }
        tracing::info!(%url, "Blocking url after a permanent failure");
        self.urls.insert(url.clone(), ());
        metric!(gauge("manager.blacklisted") = self.urls.entry_count());
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.urls.contains_key(url)
    }

    pub fn remove(&self, url: &Url) {
        self.urls.invalidate(url);
    }

    pub fn clear(&self) {
        self.urls.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_urls() {
        let failed = FailedUrls::new(None);
        let url: Url = "http://example.com/image.png".parse().unwrap();
        let other: Url = "http://example.com/other.png".parse().unwrap();

        failed.insert(&url);
        assert!(failed.contains(&url));
        assert!(!failed.contains(&other));

        failed.remove(&url);
        assert!(!failed.contains(&url));

        failed.insert(&url);
        failed.insert(&other);
        failed.clear();
        assert!(!failed.contains(&url));
        assert!(!failed.contains(&other));
    }

    #[test]
    fn test_failed_urls_expire() {
        let failed = FailedUrls::new(Some(Duration::from_millis(100)));
        let url: Url = "http://example.com/image.png".parse().unwrap();

        failed.insert(&url);
        assert!(failed.contains(&url));

        std::thread::sleep(Duration::from_millis(150));

        // should be forgiven after 100ms have passed
        assert!(!failed.contains(&url));
    }
}
