//! Request descriptors handed to a [`Transport`](crate::transport::Transport).

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::error::PayloadError;

/// The request methods a payload may use.
pub const METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::HEAD,
    Method::OPTIONS,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
];

/// A validated description of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPayload {
    url: Url,
    method: Method,
    follow_redirects: bool,
    headers: HeaderMap,
}

impl HttpPayload {
    /// Creates a `GET` request to `url` that follows redirects.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            follow_redirects: true,
            headers: HeaderMap::new(),
        }
    }

    /// Sets the request method.
    ///
    /// The method is matched case-insensitively and stored in upper case.
    pub fn with_method(mut self, method: &str) -> Result<Self, PayloadError> {
        let upper = method.to_ascii_uppercase();
        self.method = METHODS
            .iter()
            .find(|m| m.as_str() == upper)
            .cloned()
            .ok_or_else(|| PayloadError::InvalidMethod(method.to_owned()))?;
        Ok(self)
    }

    /// Sets whether the transport should follow redirects.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Returns a payload with the additional header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn follows_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Normalizes a service name to exactly one leading `/`.
pub fn normalize_service_name(name: &str) -> Result<String, PayloadError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(PayloadError::EmptyServiceName);
    }
    Ok(format!("/{trimmed}"))
}

/// Builds the URL under which `locator` answers lookups for the service `name`.
pub fn lookup_url(locator: &Url, name: &str) -> Result<Url, PayloadError> {
    let name = normalize_service_name(name)?;
    let base = locator.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{base}{name}"))?)
}
