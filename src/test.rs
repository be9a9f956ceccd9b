use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::clock::test_support::FixedClock;
use crate::{
    AsyncCacheTransport, AsyncInMemoryStorage, AsyncMockTransport,
    AsyncTransport, CacheTransport, Controller, Error, ExtensionValue,
    FileStorage, InMemoryStorage, MockTransport, Request, Response,
    Transport, TransportError,
};

// Mon, 25 Aug 2015 12:00:00 GMT
const DATE_SECS: u64 = 1_440_504_000;
const DATE: &str = "Mon, 25 Aug 2015 12:00:00 GMT";

fn get(url: &str) -> Request {
    Request::new("GET", Url::parse(url).unwrap())
}

fn cacheable_response() -> Response {
    Response::new(200)
        .header("Cache-Control", "max-age=3600")
        .header("Date", DATE)
        .body(Bytes::from_static(b"test"))
}

#[test]
fn permanent_redirect_is_reused() {
    let transport = MockTransport::new();
    transport.add_responses([Response::new(301)
        .header("Location", "https://example.com")]);
    let cache = CacheTransport::new(transport, InMemoryStorage::new());

    let first = cache.handle(get("https://www.example.com")).unwrap();
    assert!(!first.from_cache());
    let second = cache.handle(get("https://www.example.com")).unwrap();
    assert!(second.from_cache());
    assert_eq!(second.status, 301);
}

#[test]
fn revalidation_merges_headers_from_304() {
    let transport = MockTransport::new();
    transport.add_responses([
        cacheable_response(),
        Response::new(304)
            .header("Cache-Control", "max-age=3600")
            .header("Date", DATE)
            .header("Content-Type", "application/json"),
    ]);
    // past max-age relative to the stored Date
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 3601)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let response = cache.handle(get("https://www.example.com")).unwrap();
    assert_eq!(response.status, 200);
    assert!(response.from_cache());
    assert_eq!(
        response.headers.get("content-type").unwrap().as_ref(),
        b"application/json"
    );
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"test");
}

#[test]
fn stale_entry_is_refetched_when_origin_answers() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response(), cacheable_response()]);
    let controller = Controller::new().with_allow_stale(true);
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    // the stored Date is far in the past, so the entry is already stale
    let response = cache.handle(get("https://www.example.com")).unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.status, 200);
}

#[test]
fn stale_entry_is_served_on_connect_error() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response()]);
    transport.add_error(Error::Transport(TransportError::Connect(
        "test".to_string(),
    )));
    let controller = Controller::new().with_allow_stale(true);
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let response = cache.handle(get("https://www.example.com")).unwrap();
    assert!(response.from_cache());
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"test");
}

#[test]
fn connect_error_propagates_without_allow_stale() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response()]);
    transport.add_error(Error::Transport(TransportError::Connect(
        "test".to_string(),
    )));
    let cache = CacheTransport::new(transport, InMemoryStorage::new());

    cache.handle(get("https://www.example.com")).unwrap();
    let err = cache.handle(get("https://www.example.com")).unwrap_err();
    assert!(err.is_connect());
}

#[test]
fn only_if_cached_without_entry_synthesizes_504() {
    // no scripted response: dispatching would fail loudly
    let transport = MockTransport::new();
    let cache = CacheTransport::new(transport, InMemoryStorage::new());

    let request = get("https://www.example.com")
        .header("Cache-Control", "only-if-cached");
    let response = cache.handle(request).unwrap();
    assert_eq!(response.status, 504);
    assert_eq!(response.body.bytes().unwrap().len(), 0);
}

#[test]
fn only_if_cached_with_stale_entry_synthesizes_504() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response()]);
    let cache = CacheTransport::new(transport, InMemoryStorage::new());

    cache.handle(get("https://www.example.com")).unwrap();
    let request = get("https://www.example.com")
        .header("Cache-Control", "only-if-cached");
    let response = cache.handle(request).unwrap();
    assert_eq!(response.status, 504);
}

#[test]
fn only_if_cached_with_fresh_entry_is_served() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response()]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 1)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let request = get("https://www.example.com")
        .header("Cache-Control", "only-if-cached");
    let response = cache.handle(request).unwrap();
    assert_eq!(response.status, 200);
    assert!(response.from_cache());
}

#[test]
fn cache_disabled_extension_bypasses_the_store() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response(), Response::new(201)]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 1)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let hit = cache.handle(get("https://www.example.com")).unwrap();
    assert!(hit.from_cache());

    let disabled = get("https://www.example.com")
        .extension("cache_disabled", ExtensionValue::Bool(true));
    let response = cache.handle(disabled).unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.status, 201);

    // the originally admitted entry is still there
    let still_cached = cache.handle(get("https://www.example.com")).unwrap();
    assert!(still_cached.from_cache());
    assert_eq!(still_cached.status, 200);
}

#[test]
fn custom_key_generator_is_used_verbatim() {
    let transport = MockTransport::new();
    transport.add_responses([Response::new(301)]);
    let controller = Controller::new().with_key_generator(Arc::new(
        |request: &Request, _body: Option<&[u8]>| {
            request.url.host_str().unwrap_or_default().to_string()
        },
    ));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let response = cache.handle(get("https://www.example.com")).unwrap();
    assert!(response.from_cache());
    assert_eq!(
        response.cache_metadata().unwrap().cache_key,
        "www.example.com"
    );
}

#[test]
fn post_keys_are_body_sensitive() {
    let transport = MockTransport::new();
    transport.add_responses([Response::new(301), Response::new(200)]);
    let controller = Controller::new().with_cacheable_methods(&["POST"]);
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    let post = |body: &'static [u8]| {
        Request::new("POST", Url::parse("https://www.example.com").unwrap())
            .body(Bytes::from_static(body))
    };

    cache.handle(post(b"{\"request\": 1}")).unwrap();
    let hit = cache.handle(post(b"{\"request\": 1}")).unwrap();
    assert!(hit.from_cache());

    // same method and URL, different body: a different fingerprint
    let miss = cache.handle(post(b"{\"request\": 2}")).unwrap();
    assert_eq!(miss.status, 200);
    assert!(!miss.from_cache());
}

#[test]
fn use_counter_counts_hits() {
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response()]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 1)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let first_hit = cache.handle(get("https://www.example.com")).unwrap();
    assert_eq!(first_hit.cache_metadata().unwrap().number_of_uses, 1);
    let second_hit = cache.handle(get("https://www.example.com")).unwrap();
    assert_eq!(second_hit.cache_metadata().unwrap().number_of_uses, 2);
}

#[test]
fn use_counter_resets_on_full_replacement() {
    let transport = MockTransport::new();
    transport.add_responses([
        cacheable_response(),
        // replacement carries a fresh Date so the follow-up is a hit
        Response::new(200)
            .header("Cache-Control", "max-age=3600")
            .header(
                "Date",
                crate::fmt_http_date(
                    std::time::SystemTime::UNIX_EPOCH
                        + Duration::from_secs(DATE_SECS + 7200),
                ),
            )
            .body(Bytes::from_static(b"replaced")),
    ]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 7200)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    // stale: the 200 answer replaces the entry outright
    let replaced = cache.handle(get("https://www.example.com")).unwrap();
    assert!(!replaced.from_cache());
    assert_eq!(replaced.body.bytes().unwrap().as_ref(), b"replaced");

    let hit = cache.handle(get("https://www.example.com")).unwrap();
    assert!(hit.from_cache());
    assert_eq!(hit.cache_metadata().unwrap().number_of_uses, 1);
}

#[test]
fn revalidation_bumps_the_use_counter() {
    let transport = MockTransport::new();
    transport.add_responses([
        cacheable_response(),
        Response::new(304)
            .header("Cache-Control", "max-age=3600")
            .header("Date", DATE),
    ]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 3601)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();
    let revalidated = cache.handle(get("https://www.example.com")).unwrap();
    assert!(revalidated.from_cache());
    assert_eq!(revalidated.cache_metadata().unwrap().number_of_uses, 1);
}

#[test]
fn zero_byte_entry_is_tolerated_and_readmitted() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.add_responses([cacheable_response(), cacheable_response()]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 1)));
    let cache = CacheTransport::new(
        transport,
        FileStorage::in_dir(dir.path()).unwrap(),
    )
    .with_controller(controller);

    cache.handle(get("https://www.example.com")).unwrap();

    // corrupt the single on-disk entry down to zero bytes
    let entry_path = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    std::fs::write(&entry_path, b"").unwrap();

    // absent now, so the origin is asked again and the entry re-admitted
    let refetched = cache.handle(get("https://www.example.com")).unwrap();
    assert!(!refetched.from_cache());
    let hit = cache.handle(get("https://www.example.com")).unwrap();
    assert!(hit.from_cache());
}

#[test]
fn vary_mismatch_is_a_miss() {
    let transport = MockTransport::new();
    transport.add_responses([
        Response::new(200)
            .header("Cache-Control", "max-age=3600")
            .header("Date", DATE)
            .header("Vary", "Accept")
            .body(Bytes::from_static(b"json")),
        Response::new(200)
            .header("Cache-Control", "max-age=3600")
            .header("Date", DATE)
            .header("Vary", "Accept")
            .body(Bytes::from_static(b"html")),
    ]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 1)));
    let cache = CacheTransport::new(transport, InMemoryStorage::new())
        .with_controller(controller);

    let json_request = get("https://www.example.com")
        .header("Accept", "application/json");
    cache.handle(json_request).unwrap();

    let html_request =
        get("https://www.example.com").header("Accept", "text/html");
    let response = cache.handle(html_request).unwrap();
    assert!(!response.from_cache());
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"html");

    let html_again = cache
        .handle(
            get("https://www.example.com")
                .header("Accept", "text/html"),
        )
        .unwrap();
    assert!(html_again.from_cache());
    assert_eq!(html_again.body.bytes().unwrap().as_ref(), b"html");
}

#[tokio::test]
async fn async_permanent_redirect_is_reused() {
    let transport = AsyncMockTransport::new();
    transport.add_responses([Response::new(301)
        .header("Location", "https://example.com")]);
    let cache =
        AsyncCacheTransport::new(transport, AsyncInMemoryStorage::new());

    let first =
        cache.handle(get("https://www.example.com")).await.unwrap();
    assert!(!first.from_cache());
    let second =
        cache.handle(get("https://www.example.com")).await.unwrap();
    assert!(second.from_cache());
    assert_eq!(second.status, 301);
    cache.close().await.unwrap();
}

#[tokio::test]
async fn async_revalidation_merges_headers_from_304() {
    let transport = AsyncMockTransport::new();
    transport.add_responses([
        cacheable_response(),
        Response::new(304)
            .header("Cache-Control", "max-age=3600")
            .header("Date", DATE)
            .header("Content-Type", "application/json"),
    ]);
    let controller = Controller::new()
        .with_clock(Arc::new(FixedClock(DATE_SECS + 3601)));
    let cache =
        AsyncCacheTransport::new(transport, AsyncInMemoryStorage::new())
            .with_controller(controller);

    cache.handle(get("https://www.example.com")).await.unwrap();
    let response =
        cache.handle(get("https://www.example.com")).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.from_cache());
    assert_eq!(
        response.headers.get("content-type").unwrap().as_ref(),
        b"application/json"
    );
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"test");
}

#[tokio::test]
async fn async_stale_entry_is_served_on_connect_error() {
    let transport = AsyncMockTransport::new();
    transport.add_responses([cacheable_response()]);
    transport.add_error(Error::Transport(TransportError::Connect(
        "test".to_string(),
    )));
    let controller = Controller::new().with_allow_stale(true);
    let cache =
        AsyncCacheTransport::new(transport, AsyncInMemoryStorage::new())
            .with_controller(controller);

    cache.handle(get("https://www.example.com")).await.unwrap();
    let response =
        cache.handle(get("https://www.example.com")).await.unwrap();
    assert!(response.from_cache());
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"test");
}
