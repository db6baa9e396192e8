use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use http::StatusCode;
use locator_service::error::LookupError;
use locator_service::platform::Platform;
use locator_service::resolver::{LocationService, location_cache};
use locator_service::response::{Location, parse_location};
use locator_service::transport::HttpTransport;
use locator_test::LocatorServer;

use crate::utils::{setup_service, setup_service_with_timeouts, short_timeouts};

fn location(location: &str) -> Location {
    parse_location(location).unwrap()
}

fn fallback() -> Location {
    location("http://fallback.example:1234/")
}

#[tokio::test]
async fn test_cached_location() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    for _ in 0..3 {
        let resolved = service.resolve("cached", fallback(), &cache).await;
        assert_eq!(resolved, Ok(location("http://cached.example:9000/api")));
    }

    assert_eq!(server.hits("cached"), 1);
    assert!(cache.contains_key(&"/cached".to_owned()));

    // invalidating forces another lookup
    assert!(cache.invalidate(&"/cached".to_owned()).is_some());
    service.resolve("cached", fallback(), &cache).await.unwrap();
    assert_eq!(server.hits("cached"), 2);
}

#[tokio::test]
async fn test_uncached_location() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    for _ in 0..3 {
        let resolved = service.resolve("/uncached", fallback(), &cache).await;
        assert_eq!(resolved, Ok(location("http://uncached.example:9000/")));
    }

    assert_eq!(server.hits("uncached"), 3);
    assert!(!cache.contains_key(&"/uncached".to_owned()));
}

#[tokio::test]
async fn test_relative_location() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    let found = service.lookup("relative", &cache).await.unwrap();
    assert_eq!(found, Some(location("/relative/path")));
}

#[tokio::test]
async fn test_unknown_service() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    let resolved = service.resolve("unknown", fallback(), &cache).await;
    assert_eq!(resolved, Ok(fallback()));
    assert_eq!(service.lookup("unknown", &cache).await, Ok(None));

    assert_eq!(server.hits("unknown"), 2);
}

#[tokio::test]
async fn test_illegal_status() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    let resolved = service.resolve("broken", fallback(), &cache).await;
    assert_eq!(
        resolved,
        Err(LookupError::IllegalStatus(StatusCode::INTERNAL_SERVER_ERROR))
    );

    service.resolve("broken", fallback(), &cache).await.unwrap_err();
    assert_eq!(server.hits("broken"), 2);
}

#[tokio::test]
async fn test_missing_location() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    let resolved = service.resolve("no-location", fallback(), &cache).await;
    assert_eq!(resolved, Err(LookupError::MissingLocation));
}

#[tokio::test]
async fn test_concurrent_lookups_coalesce() {
    let server = LocatorServer::new();
    let service = setup_service(&server);
    let cache = location_cache();

    let lookups = (0..8).map(|_| service.resolve("slow", fallback(), &cache));
    let results = join_all(lookups).await;

    for result in results {
        assert_eq!(result, Ok(location("http://slow.example:9000/")));
    }
    assert_eq!(server.hits("slow"), 1);
}

#[tokio::test]
async fn test_timeout() {
    let server = LocatorServer::new();
    let service = setup_service_with_timeouts(&server, short_timeouts());
    let cache = location_cache();

    let resolved = service.resolve("slow", fallback(), &cache).await;
    assert_eq!(resolved, Err(LookupError::Timeout(Duration::from_millis(50))));
    assert!(!cache.contains_key(&"/slow".to_owned()));
}

#[tokio::test]
async fn test_development_mode() {
    locator_test::setup();

    let server = LocatorServer::new();
    let transport = HttpTransport::new(Default::default()).unwrap();
    let service = LocationService::new(Platform::development(), Arc::new(transport));
    let cache = location_cache();

    let resolved = service.resolve("cached", fallback(), &cache).await;
    assert_eq!(resolved, Ok(fallback()));
    assert_eq!(server.accesses(), 0);
}
