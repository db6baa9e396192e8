use std::sync::Arc;
use std::time::Duration;

use locator_service::platform::Platform;
use locator_service::resolver::LocationService;
use locator_service::transport::HttpTransport;
use locator_service::utils::http::Timeouts;
use locator_test::LocatorServer;

/// Creates a [`LocationService`] running on the platform, looking up services on `server`.
pub fn setup_service(server: &LocatorServer) -> LocationService {
    setup_service_with_timeouts(server, Timeouts::default())
}

pub fn setup_service_with_timeouts(server: &LocatorServer, timeouts: Timeouts) -> LocationService {
    locator_test::setup();

    let platform = Platform::new(Some("test-bundle".into()), Some(server.locator_url()));
    let transport = HttpTransport::new(timeouts).unwrap();
    LocationService::new(platform, Arc::new(transport))
}

pub fn short_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_millis(500),
        request: Duration::from_millis(50),
    }
}
