//! Support to download images over HTTP.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::cookie::Jar;
use reqwest::{Client, header};

use crate::config::DownloaderConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::types::DownloadOptions;
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{FetchRequest, Response, Transport};

/// The default user agent string to use for HTTP requests.
pub const USER_AGENT: &str = concat!("imageloader/", env!("CARGO_PKG_VERSION"));

/// Transport implementation based on [`reqwest`].
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    cookie_client: Client,
    no_ssl_client: Client,
    no_ssl_cookie_client: Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn from_config(config: &DownloaderConfig) -> reqwest::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let jar = Arc::new(Jar::default());

        Ok(Self {
            client: create_client(&timeouts, false, None)?,
            cookie_client: create_client(&timeouts, false, Some(jar.clone()))?,
            no_ssl_client: create_client(&timeouts, true, None)?,
            no_ssl_cookie_client: create_client(&timeouts, true, Some(jar))?,
            user_agent: config
                .user_agent
                .clone()
                .unwrap_or_else(|| USER_AGENT.to_owned()),
        })
    }

    fn client(&self, options: DownloadOptions) -> &Client {
        let cookies = options.contains(DownloadOptions::HANDLE_COOKIES);
        let no_ssl = options.contains(DownloadOptions::ALLOW_INVALID_CERTIFICATES);
        match (no_ssl, cookies) {
            (false, false) => &self.client,
            (false, true) => &self.cookie_client,
            (true, false) => &self.no_ssl_client,
            (true, true) => &self.no_ssl_cookie_client,
        }
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> BoxFuture<'static, Result<Response, TransportError>> {
        tracing::debug!("Fetching image from `{}`", request.url);

        let mut builder = self.client(request.options).get(request.url.clone());

        let mut has_user_agent = false;
        for (key, value) in &request.headers {
            if let Ok(key) = header::HeaderName::from_bytes(key.as_bytes()) {
                has_user_agent |= key == header::USER_AGENT;
                builder = builder.header(key, value.as_str());
            }
        }
        if !has_user_agent {
            builder = builder.header(header::USER_AGENT, self.user_agent.as_str());
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }

        async move {
            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                let reason = status.canonical_reason().unwrap_or("unexpected status");
                return Err(TransportError::new(
                    TransportErrorKind::BadStatus(status.as_u16()),
                    reason,
                ));
            }

            Ok(Response {
                expected_len: response.content_length(),
                body: response
                    .bytes_stream()
                    .map_err(TransportError::from)
                    .boxed(),
            })
        }
        .boxed()
    }
}
