use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::redirect;

use crate::config::DownloaderConfig;

/// Various timeouts for the HTTP transport.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Duration::from_secs(15),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `accept_invalid_certs` determines whether the client accepts invalid
///   TLS certificates.
/// * `cookies` is the cookie store shared by all clients that handle cookies. Without it,
///   cookies are neither sent nor stored.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    accept_invalid_certs: bool,
    cookies: Option<Arc<Jar>>,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .redirect(redirect::Policy::limited(10));

    if let Some(jar) = cookies {
        builder = builder.cookie_provider(jar);
    }

    builder.build()
}
