//! Detection of the orchestrating platform.
//!
//! When running as a bundle on the platform, the environment carries the bundle identity and the
//! URL of the service locator. Without a bundle identity, the process runs in development mode
//! and all lookups resolve to their fallbacks.

use std::env;

use url::Url;

use crate::config::Config;

/// The environment variable holding the identity of the running bundle.
pub const BUNDLE_ID_ENV: &str = "BUNDLE_ID";

/// The environment variable holding the base URL of the service locator.
pub const SERVICE_LOCATOR_ENV: &str = "SERVICE_LOCATOR";

/// The environment this process runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Platform {
    bundle_id: Option<String>,
    service_locator: Option<Url>,
}

impl Platform {
    pub fn new(bundle_id: Option<String>, service_locator: Option<Url>) -> Self {
        Self {
            bundle_id,
            service_locator,
        }
    }

    /// A platform in development mode.
    pub fn development() -> Self {
        Self::default()
    }

    /// Reads the platform from the process environment.
    ///
    /// A `SERVICE_LOCATOR` that is not a valid URL is ignored with a warning.
    pub fn from_env() -> Self {
        let bundle_id = env::var(BUNDLE_ID_ENV).ok().filter(|id| !id.is_empty());
        let service_locator = env::var(SERVICE_LOCATOR_ENV)
            .ok()
            .and_then(|value| match value.parse() {
                Ok(url) => Some(url),
                Err(error) => {
                    tracing::warn!(%value, %error, "Ignoring invalid {SERVICE_LOCATOR_ENV}");
                    None
                }
            });

        Self::new(bundle_id, service_locator)
    }

    /// Reads the platform from the environment, preferring the locator URL from `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut platform = Self::from_env();
        if let Some(url) = &config.service_locator {
            platform.service_locator = Some(url.clone());
        }
        platform
    }

    /// Returns `true` when running on the platform, `false` in development mode.
    pub fn is_platform(&self) -> bool {
        self.bundle_id.is_some()
    }

    pub fn bundle_id(&self) -> Option<&str> {
        self.bundle_id.as_deref()
    }

    pub fn service_locator(&self) -> Option<&Url> {
        self.service_locator.as_ref()
    }
}
