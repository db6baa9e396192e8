//! Service lookups against a service locator.
//!
//! The [`LocationService`](resolver::LocationService) resolves service names to the address the
//! locator redirects to. Lookups are deduplicated and cached in a
//! [`LocationCache`](resolver::LocationCache) for as long as the locator allows.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod platform;
pub mod resolver;
pub mod response;
pub mod transport;
pub mod utils;
