//! Helpers for testing the cache and its transports.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function (e.g.
//!    `let cache_dir = test::tempdir()`), otherwise the directory is deleted right away.
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fetch_cache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetch_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
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
    /// Creates a new test server serving the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
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

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

async fn count_hits(
    State(hits): State<Hits>,
    OriginalUri(uri): OriginalUri,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        let hits = hits.entry(uri.path().to_owned()).or_default();
        *hits += 1;
    }

    next.run(request).await
}

/// A test server that counts how often each path was requested.
///
/// It serves the following routes:
///
///  - `/echo/*text` responds with `text` as the body.
///  - `/hits/*tail` responds with the number of requests to this path so far, so every
///    response is distinguishable.
///  - `/empty/*tail` responds with an empty body.
///  - `/inspect/*tail` responds with a JSON document describing the request, with the `method`,
///    the `body`, and every request header.
///  - `/redirect/*path` redirects to `/path`.
///  - `/delay/:time/*path` waits for the given `humantime` duration, then responds with `path`
///    as the body.
///  - `/respond_statuscode/:num/*tail` responds with the given status code.
///
/// Everything else responds with `404 Not Found`.
pub struct HitCounter {
    server: Server,
    hits: Hits,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Hits::default();

        let router = Router::new()
            .route(
                "/echo/*text",
                get(|extract::Path(text): extract::Path<String>| async move { text }),
            )
            .route(
                "/hits/*tail",
                get(
                    |State(hits): State<Hits>, OriginalUri(uri): OriginalUri| async move {
                        let hits = hits.lock().unwrap();
                        hits.get(uri.path()).copied().unwrap_or_default().to_string()
                    },
                ),
            )
            .route("/empty/*tail", get(|| async { "" }))
            .route(
                "/inspect/*tail",
                any(
                    |method: Method, headers: HeaderMap, body: String| async move {
                        let mut inspected = serde_json::Map::new();
                        for (name, value) in &headers {
                            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                            inspected.insert(name.as_str().to_owned(), value.into());
                        }
                        inspected.insert("method".to_owned(), method.as_str().into());
                        inspected.insert("body".to_owned(), body.into());
                        Json(serde_json::Value::Object(inspected))
                    },
                ),
            )
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [("Location", format!("/{}", path))])
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        path
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
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits))
            .with_state(hits.clone());

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests since the last call, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of requests per path since the last call, and resets the counters.
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
