//! Helpers for testing the locator cache and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`LocatorServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out. To avoid this, assign it to a variable: `let server =
//!    LocatorServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// The path prefix under which [`LocatorServer`] answers lookups.
pub const SERVICES_PATH: &str = "services/";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the locator crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("locator_cache=trace,locator_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
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
    /// Creates a new test server serving the given `router`.
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
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A service locator that answers lookups for a fixed set of services.
///
/// Lookups are served under [`SERVICES_PATH`]:
///
/// - `cached`: `307` to `http://cached.example:9000/api`, cacheable for 30 seconds
/// - `uncached`: `307` to `http://uncached.example:9000/` without a `Cache-Control` header
/// - `relative`: `307` to `/relative/path`, cacheable for 30 seconds
/// - `slow`: like `cached`, but answers after 200 milliseconds
/// - `no-location`: `307` without a `Location` header
/// - `broken`: `500`
/// - any other service: `404`
///
/// Every request is counted, see [`hits`](Self::hits).
pub struct LocatorServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl LocatorServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/services/*name",
                get(|extract::Path(name): extract::Path<String>| async move {
                    locate(name.trim_start_matches('/')).await
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The base URL of the locator, to be configured as the service locator.
    pub fn locator_url(&self) -> Url {
        self.server.url(SERVICES_PATH)
    }

    /// The number of lookups that reached the server for `service`.
    pub fn hits(&self, service: &str) -> usize {
        let path = format!("/{SERVICES_PATH}{}", service.trim_start_matches('/'));
        let hits = self.hits.lock().unwrap();
        hits.get(&path).copied().unwrap_or_default()
    }

    /// The total number of requests that reached the server.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

impl Default for LocatorServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn locate(name: &str) -> Response {
    match name {
        "cached" => redirect("http://cached.example:9000/api", Some("private, max-age=30")),
        "uncached" => redirect("http://uncached.example:9000/", None),
        "relative" => redirect("/relative/path", Some("max-age=30")),
        "slow" => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            redirect("http://slow.example:9000/", Some("max-age=30"))
        }
        "no-location" => StatusCode::TEMPORARY_REDIRECT.into_response(),
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn redirect(location: &str, cache_control: Option<&str>) -> Response {
    let mut response = (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location.to_owned())],
    )
        .into_response();
    if let Some(cache_control) = cache_control {
        if let Ok(value) = cache_control.parse() {
            response.headers_mut().insert(header::CACHE_CONTROL, value);
        }
    }
    response
}
