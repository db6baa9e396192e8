//! Transports that execute lookup requests.
//!
//! A transport only performs the request and hands back the status and headers. Interpreting
//! the response is up to [`interpret`](crate::response::interpret).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};

use crate::config::Config;
use crate::error::LookupError;
use crate::payload::HttpPayload;
use crate::utils::http::{Timeouts, create_client};

/// The parts of an HTTP response relevant to a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// Executes an [`HttpPayload`].
///
/// Failures to obtain any response are reported as [`LookupError::Transport`] or
/// [`LookupError::Timeout`]. Any response, regardless of its status, is a success.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn execute(&self, payload: &HttpPayload) -> Result<Response, LookupError>;
}

/// A [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    no_redirect_client: reqwest::Client,
    timeouts: Timeouts,
}

impl HttpTransport {
    pub fn new(timeouts: Timeouts) -> reqwest::Result<Self> {
        Ok(Self {
            client: create_client(&timeouts, true)?,
            no_redirect_client: create_client(&timeouts, false)?,
            timeouts,
        })
    }

    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        Self::new(Timeouts::from_config(config))
    }

    fn map_error(&self, payload: &HttpPayload, error: reqwest::Error) -> LookupError {
        if error.is_timeout() {
            return LookupError::Timeout(self.timeouts.request);
        }

        let mut details = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(err) = source {
            details.push_str(": ");
            details.push_str(&err.to_string());
            source = err.source();
        }

        LookupError::Transport {
            url: payload.url().to_string(),
            details,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, payload: &HttpPayload) -> Result<Response, LookupError> {
        let client = if payload.follows_redirects() {
            &self.client
        } else {
            &self.no_redirect_client
        };

        tracing::trace!(url = %payload.url(), method = %payload.method(), "Sending request");
        let response = client
            .request(payload.method().clone(), payload.url().clone())
            .headers(payload.headers().clone())
            .send()
            .await
            .map_err(|e| self.map_error(payload, e))?;

        Ok(Response {
            status: response.status(),
            headers: response.headers().clone(),
        })
    }
}

/// A [`Transport`] running a synchronous request function on the blocking thread pool.
///
/// The function never runs on a runtime worker thread, so it may block freely.
pub struct BlockingTransport<F> {
    request: Arc<F>,
}

impl<F> BlockingTransport<F>
where
    F: Fn(&HttpPayload) -> Result<Response, LookupError> + Send + Sync + 'static,
{
    pub fn new(request: F) -> Self {
        Self {
            request: Arc::new(request),
        }
    }
}

impl<F> fmt::Debug for BlockingTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Transport for BlockingTransport<F>
where
    F: Fn(&HttpPayload) -> Result<Response, LookupError> + Send + Sync + 'static,
{
    async fn execute(&self, payload: &HttpPayload) -> Result<Response, LookupError> {
        let request = Arc::clone(&self.request);
        let payload = payload.clone();

        tokio::task::spawn_blocking(move || request(&payload))
            .await
            .map_err(|_| LookupError::Interrupted)?
    }
}
