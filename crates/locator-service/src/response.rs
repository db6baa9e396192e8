//! Interpretation of service locator responses.
//!
//! If the service is available, the locator responds with `307 Temporary Redirect` and the
//! address of the service in the `Location` header. A `Cache-Control` header may indicate the
//! `max-age` for which the location can be cached. If the service is unknown, the locator
//! responds with `404 Not Found`. All other response codes are illegal.

use std::time::Duration;

use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};
use iri_string::types::{UriReferenceStr, UriReferenceString};
use locator_cache::CacheEntry;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::LookupError;

static MAX_AGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"max-age=(\d+)").unwrap());

/// An absolute or relative URI reference, kept exactly as the locator sent it.
pub type Location = UriReferenceString;

/// The outcome of a successful service lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The locator knows the service.
    Found {
        /// The address of the service, either absolute or relative to the locator.
        location: Location,
        /// How long the location may be cached.
        max_age: Option<Duration>,
    },
    /// The locator does not know the service.
    NotFound,
}

impl Lookup {
    /// Converts this lookup into the location of the service, if it was found.
    pub fn into_location(self) -> Option<Location> {
        match self {
            Self::Found { location, .. } => Some(location),
            Self::NotFound => None,
        }
    }
}

impl CacheEntry for Lookup {
    fn time_to_live(&self) -> Option<Duration> {
        match self {
            Self::Found { max_age, .. } => *max_age,
            // Not found services are not retained, so that newly registered services can be
            // discovered right away.
            Self::NotFound => None,
        }
    }
}

/// Interprets the status code and headers of a locator response.
///
/// Protocol violations are returned as errors and never turned into [`Lookup::NotFound`].
pub fn interpret(status: StatusCode, headers: &HeaderMap) -> Result<Lookup, LookupError> {
    match status {
        StatusCode::TEMPORARY_REDIRECT => {
            let location =
                last_value(headers, header::LOCATION).ok_or(LookupError::MissingLocation)?;
            Ok(Lookup::Found {
                location: location_from_header(location)?,
                max_age: max_age(headers),
            })
        }
        StatusCode::NOT_FOUND => Ok(Lookup::NotFound),
        status => Err(LookupError::IllegalStatus(status)),
    }
}

/// Returns the last value of a header that was sent multiple times.
fn last_value(headers: &HeaderMap, name: HeaderName) -> Option<&HeaderValue> {
    headers.get_all(name).iter().last()
}

/// Parses an RFC 3986 URI reference, either absolute or relative.
///
/// Fragments are preserved. An empty reference is rejected.
pub fn parse_location(location: &str) -> Result<Location, LookupError> {
    let malformed = |details: String| LookupError::MalformedLocation {
        location: location.to_owned(),
        details,
    };

    if location.is_empty() {
        return Err(malformed("empty location".to_owned()));
    }

    UriReferenceStr::new(location)
        .map(|reference| reference.to_owned())
        .map_err(|e| malformed(e.to_string()))
}

fn location_from_header(value: &HeaderValue) -> Result<Location, LookupError> {
    match value.to_str() {
        Ok(location) => parse_location(location),
        Err(e) => Err(LookupError::MalformedLocation {
            location: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            details: e.to_string(),
        }),
    }
}

/// Extracts the `max-age` directive from the `Cache-Control` header.
///
/// The directive may appear anywhere in the header. Values that do not fit a `u64` of seconds
/// are ignored.
fn max_age(headers: &HeaderMap) -> Option<Duration> {
    let cache_control = last_value(headers, header::CACHE_CONTROL)?.to_str().ok()?;
    let seconds = MAX_AGE.captures(cache_control)?.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
