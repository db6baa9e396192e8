use std::time::Duration;

use http::StatusCode;
use locator_cache::Interrupted;
use thiserror::Error;

/// An error that happens while looking up a service.
///
/// Errors are shared between all callers waiting on the same lookup, which is why they are
/// cheaply clonable and only carry rendered details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The locator answered with a status code other than `307` or `404`.
    #[error("illegal response code {0}")]
    IllegalStatus(StatusCode),
    /// The locator redirected without a `Location` header.
    #[error("redirect without a location header")]
    MissingLocation,
    /// The `Location` header of a redirect could not be parsed as a URI.
    #[error("malformed location {location:?}: {details}")]
    MalformedLocation { location: String, details: String },
    /// The request did not produce a response, because of connection loss, DNS resolution
    /// or similar problems.
    #[error("connection failed for {url}: {details}")]
    Transport { url: String, details: String },
    /// The locator did not respond in time.
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    /// The lookup request could not be created.
    #[error("invalid lookup request: {0}")]
    InvalidRequest(String),
    /// The lookup was dropped before it completed.
    #[error("lookup interrupted")]
    Interrupted,
}

impl LookupError {
    /// Returns `true` if the locator responded, but violated the lookup protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalStatus(_) | Self::MissingLocation | Self::MalformedLocation { .. }
        )
    }

    /// A short name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::IllegalStatus(_) => "illegal_status",
            Self::MissingLocation => "missing_location",
            Self::MalformedLocation { .. } => "malformed_location",
            Self::Transport { .. } => "transport",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Interrupted => "interrupted",
        }
    }
}

impl From<Interrupted> for LookupError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl From<PayloadError> for LookupError {
    fn from(err: PayloadError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// An error creating an [`HttpPayload`](crate::payload::HttpPayload).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The request method is not one of the supported methods.
    #[error("invalid request method {0}")]
    InvalidMethod(String),
    /// The service name is empty.
    #[error("empty service name")]
    EmptyServiceName,
    /// The request URL could not be constructed.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
