use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// The `User-Agent` sent with every lookup.
pub const USER_AGENT: &str = concat!("locator-service/", env!("CARGO_PKG_VERSION"));

/// Timeouts for requests to the service locator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request, including the connection.
    pub request: Duration,
}

impl Timeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            request: config.request_timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            request: Duration::from_secs(5),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and request timeouts.
/// * `follow_redirects` determines whether the client follows redirects. Clients used for
///   lookups must not, since the redirect is the answer of the locator.
pub fn create_client(
    timeouts: &Timeouts,
    follow_redirects: bool,
) -> reqwest::Result<reqwest::Client> {
    let policy = if follow_redirects {
        redirect::Policy::default()
    } else {
        redirect::Policy::none()
    };

    reqwest::ClientBuilder::new()
        .hickory_dns(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(policy)
        .build()
}
