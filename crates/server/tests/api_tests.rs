//! Integration tests for the HTTP data-object API.

mod common;

use axum::http::StatusCode;
use base64::Engine;
use common::{TestServer, poll_until, request};
use irobot_core::units::{DurationLimit, SizeLimit};
use md5::{Digest, Md5};
use serde_json::Value;
use sha2::Digest as _;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

#[tokio::test]
async fn unknown_object_is_404_with_json_body() {
    let server = TestServer::new().await;

    let (status, _, body) = request(&server.router, "GET", "/zone/absent", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 404);
    assert_eq!(body["reason"], "Not Found");
    assert!(body["description"].as_str().unwrap().contains("/zone/absent"));
}

#[tokio::test]
async fn cold_admission_returns_eta_then_data() {
    let server = TestServer::new().await;
    let body = payload(3000);
    server.upstream.put("/zone/alpha", body.clone());
    server.upstream.set_fetch_delay(Duration::from_millis(50));

    // First request primes the precache and reports an ETA response
    let (status, headers, _) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers.get("content-type").unwrap(),
        "application/vnd.irobot.eta"
    );

    // Polling eventually yields the object itself
    let (headers, served) = poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;
    assert_eq!(served.as_ref(), body.as_slice());
    assert_eq!(
        headers.get("etag").unwrap().to_str().unwrap(),
        format!("\"{}\"", md5_hex(&body))
    );
    assert_eq!(headers.get("content-length").unwrap(), "3000");
    assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
}

#[tokio::test]
async fn eta_header_appears_once_rates_are_known() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(2000));
    server.upstream.put("/zone/beta", payload(2000));

    // Prime the rate estimator with one completed transfer
    request(&server.router, "GET", "/zone/alpha", &[]).await;
    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    server.upstream.set_fetch_delay(Duration::from_millis(200));
    let (status, headers, _) = request(&server.router, "GET", "/zone/beta", &[]).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let eta = headers
        .get("irobot-eta")
        .expect("ETA header once rates are known")
        .to_str()
        .unwrap();
    // "<ISO8601 UTC> +/- <integer seconds>"
    let (stamp, stderr) = eta.split_once(" +/- ").unwrap();
    assert!(stamp.ends_with('Z'), "timestamp {stamp} should be UTC");
    let _: i64 = stderr.parse().unwrap();
}

#[tokio::test]
async fn head_matches_get_without_a_body() {
    let server = TestServer::new().await;
    let body = payload(1000);
    server.upstream.put("/zone/alpha", body.clone());

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    let (status, headers, served) = request(&server.router, "HEAD", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-length").unwrap(), "1000");
    assert!(served.is_empty());
}

#[tokio::test]
async fn metadata_representation_is_negotiated() {
    let server = TestServer::new().await;
    let body = payload(1500);
    server.upstream.put("/zone/alpha", body.clone());

    let accept = [("accept", "application/vnd.irobot.metadata+json")];
    let (status, headers, served) = request(&server.router, "GET", "/zone/alpha", &accept).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("content-type").unwrap(),
        "application/vnd.irobot.metadata+json"
    );

    let metadata: Value = serde_json::from_slice(&served).unwrap();
    assert_eq!(metadata["size"], 1500);
    assert_eq!(metadata["checksum"], md5_hex(&body));

    // Metadata-only requests never start a data transfer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.upstream.data_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unacceptable_media_type_is_406() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(100));

    let (status, _, body) =
        request(&server.router, "GET", "/zone/alpha", &[("accept", "text/html")]).await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 406);
}

#[tokio::test]
async fn matching_etag_returns_304() {
    let server = TestServer::new().await;
    let body = payload(500);
    server.upstream.put("/zone/alpha", body.clone());

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    let etag = format!("\"{}\"", md5_hex(&body));
    let (status, _, served) = request(
        &server.router,
        "GET",
        "/zone/alpha",
        &[("if-none-match", &etag)],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(served.is_empty());
}

#[tokio::test]
async fn range_requests_are_served_chunk_aligned() {
    let server = TestServer::new().await;
    let body = payload(2000); // two 1 KiB chunks
    server.upstream.put("/zone/alpha", body.clone());

    request(&server.router, "GET", "/zone/alpha", &[]).await;
    // Ranges additionally gate on the checksum table
    let range = [("range", "bytes=0-0,1500-1500")];
    let (headers, served) = poll_until(
        &server.router,
        "/zone/alpha",
        &range,
        StatusCode::PARTIAL_CONTENT,
    )
    .await;

    let content_type = headers.get("content-type").unwrap().to_str().unwrap();
    let boundary = content_type
        .strip_prefix("multipart/byteranges; boundary=")
        .expect("multipart content type");

    let text = String::from_utf8_lossy(&served);
    let delimiter = format!("--{boundary}");
    let parts: Vec<&str> = text
        .split(&delimiter)
        .filter(|part| part.contains("Content-Range"))
        .collect();
    assert_eq!(parts.len(), 2, "exactly two chunk-aligned parts");

    assert!(parts[0].contains("Content-Range: bytes 0-1023/2000"));
    assert!(parts[0].contains(&format!("ETag: \"{}\"", md5_hex(&body[..1024]))));
    assert!(parts[1].contains("Content-Range: bytes 1024-1999/2000"));
    assert!(parts[1].contains(&format!("ETag: \"{}\"", md5_hex(&body[1024..]))));
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let server = TestServer::new().await;
    let body = payload(1000);
    server.upstream.put("/zone/alpha", body);

    request(&server.router, "GET", "/zone/alpha", &[]).await;
    poll_until(
        &server.router,
        "/zone/alpha",
        &[("range", "bytes=0-0")],
        StatusCode::PARTIAL_CONTENT,
    )
    .await;

    let (status, headers, _) = request(
        &server.router,
        "GET",
        "/zone/alpha",
        &[("range", "bytes=5000-6000")],
    )
    .await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers.get("content-range").unwrap(), "bytes */1000");
}

#[tokio::test]
async fn post_primes_and_reports_progress() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(800));

    // Cold POST primes the fetch
    let (status, _, _) = request(&server.router, "POST", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    // Unchanged upstream: the precache already holds the object
    let (status, _, _) = request(&server.router, "POST", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(server.upstream.data_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_cache_directive_refetches_changed_objects() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(800));

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    // Upstream changes; a plain GET still serves the cached copy
    let newer = payload(900);
    server.upstream.put("/zone/alpha", newer.clone());
    let (status, _, served) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(served.len(), 800);

    // no-cache forces the refetch
    let no_cache = [("cache-control", "no-cache")];
    request(&server.router, "GET", "/zone/alpha", &no_cache).await;
    let (_, served) = poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;
    assert_eq!(served.as_ref(), newer.as_slice());
}

#[tokio::test]
async fn delete_evicts_a_cached_object() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(600));

    // A 206 means both data and checksums have settled, so no job can still
    // be in flight to make the delete conflict
    request(&server.router, "GET", "/zone/alpha", &[]).await;
    poll_until(
        &server.router,
        "/zone/alpha",
        &[("range", "bytes=0-0")],
        StatusCode::PARTIAL_CONTENT,
    )
    .await;

    let (status, _, _) = request(&server.router, "DELETE", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = request(&server.router, "DELETE", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A fresh GET re-admits from the upstream
    let (status, _, _) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn options_advertises_the_method_set() {
    let server = TestServer::new().await;
    let (status, headers, _) = request(&server.router, "OPTIONS", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("allow").unwrap(), "GET, HEAD, POST, DELETE, OPTIONS");

    let (status, headers, _) = request(&server.router, "OPTIONS", "/status", &[]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("allow").unwrap(), "GET, HEAD, OPTIONS");
}

#[tokio::test]
async fn mismatched_transfer_is_retried_transparently() {
    let server = TestServer::new().await;
    let body = payload(1200);
    server.upstream.put("/zone/alpha", body.clone());
    server.upstream.corrupt_next_fetch();

    request(&server.router, "GET", "/zone/alpha", &[]).await;
    // A 206 gates on the checksum table, which only lands once a transfer
    // has verified against the upstream checksum
    poll_until(
        &server.router,
        "/zone/alpha",
        &[("range", "bytes=0-0")],
        StatusCode::PARTIAL_CONTENT,
    )
    .await;
    let (status, headers, served) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::OK);

    // The served bytes survived the retry and match the upstream checksum
    assert_eq!(served.as_ref(), body.as_slice());
    assert_eq!(
        headers.get("etag").unwrap().to_str().unwrap(),
        format!("\"{}\"", md5_hex(&body))
    );
    assert_eq!(server.upstream.data_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn overflow_with_age_threshold_is_507() {
    let server = TestServer::with_config(|config| {
        config.precache.size = SizeLimit::bytes(10_000);
        config.precache.age_threshold = DurationLimit::parse("1h").unwrap();
    })
    .await;

    server.upstream.put("/zone/alpha", payload(6000));
    server.upstream.put("/zone/beta", payload(6000));

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    let (status, _, body) = request(&server.router, "GET", "/zone/beta", &[]).await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 507);

    // Alpha is untouched
    let (status, _, _) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn eviction_admits_new_objects_when_allowed() {
    let server = TestServer::with_config(|config| {
        config.precache.size = SizeLimit::bytes(10_000);
        config.precache.age_threshold = DurationLimit::parse("0h").unwrap();
    })
    .await;

    server.upstream.put("/zone/alpha", payload(6000));
    server.upstream.put("/zone/beta", payload(6000));

    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;
    poll_until(&server.router, "/zone/beta", &[], StatusCode::OK).await;

    let (_, _, body) = request(&server.router, "GET", "/manifest", &[]).await;
    let manifest: Value = serde_json::from_slice(&body).unwrap();
    let entries = manifest.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["path"], "/zone/beta");
}

#[tokio::test]
async fn slow_upstream_metadata_hits_the_deadline() {
    let server = TestServer::with_config(|config| {
        config.httpd.timeout_ms = 100;
    })
    .await;
    server.upstream.put("/zone/alpha", payload(100));
    server.upstream.set_metadata_delay(Duration::from_millis(500));

    let (status, _, body) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 504);
}

#[tokio::test]
async fn status_and_config_endpoints_report_state() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(700));
    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    let (status, _, body) = request(&server.router, "GET", "/status", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["commitment"].as_u64().unwrap() >= 700);
    assert!(body["production_rates"]["fetch"]["rate"].as_f64().unwrap() > 0.0);
    assert!(body["total_requests"].as_u64().unwrap() >= 1);
    assert!(body["since"].as_str().is_some());

    let (status, _, body) = request(&server.router, "GET", "/config", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["precache"]["chunk_size"], 1024);
    assert_eq!(body["upstream"]["max_connections"], 4);
}

#[tokio::test]
async fn manifest_reports_availability_and_contention() {
    let server = TestServer::new().await;
    server.upstream.put("/zone/alpha", payload(300));
    poll_until(&server.router, "/zone/alpha", &[], StatusCode::OK).await;

    let (status, _, body) = request(&server.router, "GET", "/manifest", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let manifest: Value = serde_json::from_slice(&body).unwrap();
    let entry = &manifest.as_array().unwrap()[0];
    assert_eq!(entry["path"], "/zone/alpha");
    assert_eq!(entry["availability"]["data"], true);
    assert_eq!(entry["availability"]["metadata"], true);
    assert_eq!(entry["contention"], 0);
}

#[tokio::test]
async fn basic_authentication_guards_every_endpoint() {
    let server = TestServer::with_config(|config| {
        let credentials = config.precache.location.parent().unwrap().join("credentials");
        let hash = format!("{:x}", sha2::Sha256::digest(b"sekrit"));
        std::fs::write(&credentials, format!("alice:{hash}\n")).unwrap();
        config.httpd.authentication = vec!["basic".to_string()];
        config.httpd.credentials = Some(credentials);
    })
    .await;
    server.upstream.put("/zone/alpha", payload(100));

    // No credentials: challenged
    let (status, headers, _) = request(&server.router, "GET", "/zone/alpha", &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        headers.get("www-authenticate").unwrap(),
        "Basic realm=\"irobot\""
    );

    // Wrong password: still challenged
    let bad = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("alice:wrong")
    );
    let (status, _, _) = request(&server.router, "GET", "/zone/alpha", &[("authorization", &bad)]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Valid credentials pass through to the precache
    let good = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("alice:sekrit")
    );
    let (status, _, _) =
        request(&server.router, "GET", "/zone/alpha", &[("authorization", &good)]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
