//! Helpers for testing the image loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = imageloader_test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to it
//!    have been made. Dropping it stops the server, and all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Router, middleware};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `imageloader_service` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("imageloader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates the payload of an uncompressed RGBA image.
///
/// The payload starts with the width and height as little-endian `u32`, followed by
/// `width * height * 4` bytes of pixel data.
pub fn raw_image(width: u32, height: u32) -> Vec<u8> {
    let pixels = width as usize * height as usize * 4;
    let mut data = Vec::with_capacity(8 + pixels);
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend((0..pixels).map(|i| (i % 251) as u8));
    data
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Streams an image as created by [`raw_image`] one row at a time.
async fn chunked_image(
    extract::Path((width, height, delay)): extract::Path<(u32, u32, String)>,
) -> impl IntoResponse {
    let delay = humantime::parse_duration(&delay).unwrap();
    let data = Bytes::from(raw_image(width, height));
    let row_len = (width as usize * 4).max(1);

    let mut chunks = vec![data.slice(..8)];
    chunks.extend(
        (8..data.len())
            .step_by(row_len)
            .map(|start| data.slice(start..(start + row_len).min(data.len()))),
    );
    let body = futures::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::convert::Infallible>(chunk)
    });

    (
        [(header::CONTENT_LENGTH, data.len().to_string())],
        Body::from_stream(body),
    )
}

/// A test server that counts the requests it receives, by path.
///
/// It serves the following routes:
///
///  - `/image/{width}/{height}`: an image as created by [`raw_image`].
///  - `/chunked/{width}/{height}/{delay}`: the same image streamed one row at a time, sleeping
///    for `delay` before each chunk.
///  - `/delay/{time}/{path}`: redirects to `/{path}` after sleeping for `time`.
///  - `/redirect/{path}`: redirects to `/{path}`.
///  - `/respond_statuscode/{code}/{tail}`: responds with the given status code.
///  - `/garbage_data/{tail}`: responds with `tail`, which is not a valid image.
///  - `/empty/{tail}`: responds with an empty body.
///  - `/echo_header/{name}`: responds with the value of the given request header.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/image/:width/:height",
                get(
                    |extract::Path((width, height)): extract::Path<(u32, u32)>| async move {
                        raw_image(width, height)
                    },
                ),
            )
            .route("/chunked/:width/:height/:delay", get(chunked_image))
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route("/empty/*tail", get(|| async { StatusCode::OK }))
            .route(
                "/echo_header/:name",
                get(
                    |extract::Path(name): extract::Path<String>, headers: HeaderMap| async move {
                        headers
                            .get(name.as_str())
                            .map(|value| value.as_bytes().to_vec())
                            .unwrap_or_default()
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the number of requests per path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
