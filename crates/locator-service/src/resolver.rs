//! Resolution of service names through the service locator.

use std::sync::Arc;
use std::time::Instant;

use locator_cache::CoalescingCache;
use sentry::{Hub, SentryFutureExt};
use url::Url;

use crate::config::Config;
use crate::error::LookupError;
use crate::payload::{self, HttpPayload};
use crate::platform::Platform;
use crate::response::{Location, Lookup, interpret};
use crate::transport::{HttpTransport, Transport};

/// Lookups in flight or cached, keyed by normalized service name.
pub type LocationCache = CoalescingCache<String, Lookup, LookupError>;

/// Creates an empty [`LocationCache`].
pub fn location_cache() -> LocationCache {
    CoalescingCache::new("locations")
}

/// Resolves service names to the locations the service locator redirects to.
///
/// In development mode, that is when not running on the platform, no lookups are made and every
/// service resolves to its fallback.
#[derive(Debug, Clone)]
pub struct LocationService {
    platform: Platform,
    transport: Arc<dyn Transport>,
}

impl LocationService {
    pub fn new(platform: Platform, transport: Arc<dyn Transport>) -> Self {
        Self {
            platform,
            transport,
        }
    }

    /// Creates a service that reads the platform from the environment and looks up services
    /// over HTTP.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(Platform::from_config(config), Arc::new(transport)))
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Resolves `name` to the location of the service, or to `fallback` if the locator does not
    /// know it.
    ///
    /// Concurrent calls for the same service share one lookup. Failures are returned to every
    /// waiting caller and are not retried.
    pub async fn resolve(
        &self,
        name: &str,
        fallback: Location,
        cache: &LocationCache,
    ) -> Result<Location, LookupError> {
        Ok(self.lookup(name, cache).await?.unwrap_or(fallback))
    }

    /// Looks up the location of the service `name`.
    ///
    /// Returns `None` if the service is not known to the locator, and always in development mode.
    pub async fn lookup(
        &self,
        name: &str,
        cache: &LocationCache,
    ) -> Result<Option<Location>, LookupError> {
        metric!(counter("lookup.access") += 1);

        let Some(payload) = self.create_lookup_payload(name)? else {
            metric!(counter("lookup.development_mode") += 1);
            tracing::debug!(service = name, "Not running on the platform, skipping lookup");
            return Ok(None);
        };

        let key = payload::normalize_service_name(name)?;
        let transport = Arc::clone(&self.transport);
        let computation = cache.get_or_create(key, move || {
            fetch_location(transport, payload).bind_hub(Hub::new_from_top(Hub::current()))
        });

        Ok(computation.await?.into_location())
    }

    /// Creates the request that looks up `name`, or `None` in development mode.
    pub fn create_lookup_payload(&self, name: &str) -> Result<Option<HttpPayload>, LookupError> {
        if !self.platform.is_platform() {
            return Ok(None);
        }

        let url = payload::lookup_url(self.service_locator()?, name)?;
        Ok(Some(HttpPayload::new(url).follow_redirects(false)))
    }

    /// The URL under which the locator answers lookups for `name`, or `fallback` in development
    /// mode.
    pub fn lookup_url(&self, name: &str, fallback: Url) -> Result<Url, LookupError> {
        if !self.platform.is_platform() {
            return Ok(fallback);
        }

        Ok(payload::lookup_url(self.service_locator()?, name)?)
    }

    fn service_locator(&self) -> Result<&Url, LookupError> {
        self.platform.service_locator().ok_or_else(|| {
            LookupError::InvalidRequest("no service locator configured".to_owned())
        })
    }
}

async fn fetch_location(
    transport: Arc<dyn Transport>,
    payload: HttpPayload,
) -> Result<Lookup, LookupError> {
    let start = Instant::now();
    let result = match transport.execute(&payload).await {
        Ok(response) => interpret(response.status, &response.headers),
        Err(err) => Err(err),
    };
    metric!(timer("lookup.duration") = start.elapsed());

    match &result {
        Ok(Lookup::Found { location, max_age }) => {
            metric!(counter("lookup.result") += 1, "result" => "found");
            tracing::debug!(url = %payload.url(), %location, ?max_age, "Service found");
        }
        Ok(Lookup::NotFound) => {
            metric!(counter("lookup.result") += 1, "result" => "not_found");
            tracing::debug!(url = %payload.url(), "Service not found");
        }
        Err(err) => {
            metric!(
                counter("lookup.result") += 1,
                "result" => "error",
                "error" => err.metrics_tag(),
            );
            tracing::error!(
                error = err as &dyn std::error::Error,
                url = %payload.url(),
                "Service lookup failed"
            );
        }
    }

    result
}
