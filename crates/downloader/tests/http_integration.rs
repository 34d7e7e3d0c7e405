// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_test::TestServer;
use futures::StreamExt;
use pixload_common_telemetry::init_default_ut_logging;
use pixload_downloader::{
    Credentials, Downloader, DownloaderConfig, FetchContext, FetchError, FetchEvent,
    FetchOptions, Url,
};
use pixload_error::{ErrorExt, StatusCode as ErrorCode};
use tempfile::TempDir;
use tokio::runtime::Handle;

const LARGE_LEN: usize = 256 * 1024;

async fn handle_image() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        Bytes::from_static(b"\x89PNG\r\n\x1a\nimage-bytes"),
    )
        .into_response()
}

async fn handle_echo(headers: HeaderMap) -> Response {
    let value = |name: header::HeaderName| {
        headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let body = [
        format!("accept={}", value(header::ACCEPT)),
        format!("user-agent={}", value(header::USER_AGENT)),
        format!("x-custom={}", value(header::HeaderName::from_static("x-custom"))),
        format!("authorization={}", value(header::AUTHORIZATION)),
        format!("cache-control={}", value(header::CACHE_CONTROL)),
    ]
    .join("\n");
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn handle_large() -> Response {
    let content = vec![7_u8; LARGE_LEN];
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&content.len().to_string()).unwrap(),
    );
    (StatusCode::OK, headers, content).into_response()
}

async fn handle_slow() -> Response {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Bytes::from_static(b"late").into_response()
}

fn create_test_server() -> TestServer {
    let app = Router::new()
        .route("/image.png", get(handle_image))
        .route("/echo", get(handle_echo))
        .route("/large.jpg", get(handle_large))
        .route("/slow", get(handle_slow))
        .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }))
        .route("/cached.png", get(|| async { StatusCode::NOT_MODIFIED }))
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        );

    TestServer::builder()
        .http_transport()
        .build(app)
}

/// Full URL for `path` on the test server.
fn get_url(server: &TestServer, path: &str) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    if base.ends_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn downloader(config: DownloaderConfig) -> Downloader {
    init_default_ut_logging();
    Downloader::new(DownloaderConfig {
        runtime: Some(Handle::current()),
        callback_runtime: Some(Handle::current()),
        ..config
    })
}

fn echoed(payload: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(payload)
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn echoed_value(payload: &[u8], name: &str) -> String {
    echoed(payload)
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .unwrap_or_default()
}

#[tokio::test]
async fn fetches_an_image_over_http() {
    let server = create_test_server();
    server.get("/image.png").await.assert_status_ok();

    let downloader = downloader(DownloaderConfig::default());
    let payload = downloader
        .fetch_url(&get_url(&server, "image.png"))
        .await
        .unwrap();

    assert!(payload.data.starts_with(b"\x89PNG"));
    let response = payload.response.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.content_type().as_deref(), Some("image/png"));
    let decoded = payload.decoded.unwrap();
    assert_eq!(decoded.downcast_ref::<Bytes>().unwrap(), &payload.data);
}

#[tokio::test]
async fn sends_default_and_custom_headers() {
    let server = create_test_server();
    let downloader = downloader(
        DownloaderConfig::builder()
            .user_agent("pixload-it/1.0".to_string())
            .credentials(Credentials {
                username: "alice".to_string(),
                password: Some("secret".to_string()),
            })
            .build(),
    );
    downloader.set_header("X-Custom", Some("42")).unwrap();

    let payload = downloader.fetch_url(&get_url(&server, "echo")).await.unwrap();
    assert_eq!(
        echoed_value(&payload.data, "accept"),
        pixload_downloader::DEFAULT_ACCEPT
    );
    assert_eq!(echoed_value(&payload.data, "user-agent"), "pixload-it/1.0");
    assert_eq!(echoed_value(&payload.data, "x-custom"), "42");
    // base64("alice:secret")
    assert_eq!(
        echoed_value(&payload.data, "authorization"),
        "Basic YWxpY2U6c2VjcmV0"
    );

    downloader.set_header("X-Custom", None).unwrap();
    let payload = downloader.fetch_url(&get_url(&server, "echo")).await.unwrap();
    assert_eq!(echoed_value(&payload.data, "x-custom"), "-");
}

#[tokio::test]
async fn url_cache_controls_revalidation_header() {
    let server = create_test_server();
    let downloader = downloader(DownloaderConfig::default());

    let payload = downloader.fetch_url(&get_url(&server, "echo")).await.unwrap();
    assert_eq!(echoed_value(&payload.data, "cache-control"), "no-cache");

    let events: Vec<FetchEvent> = downloader
        .fetch_events(
            &get_url(&server, "echo"),
            FetchOptions::builder().use_url_cache(true).build(),
            FetchContext::default(),
        )
        .collect()
        .await;
    let Some(FetchEvent::Finished(Ok(payload))) = events.last() else {
        panic!("fetch failed: {events:?}");
    };
    assert_eq!(echoed_value(&payload.data, "cache-control"), "-");
}

#[tokio::test]
async fn missing_resource_is_not_found() {
    let server = create_test_server();
    let downloader = downloader(DownloaderConfig::default());

    let err = downloader
        .fetch_url(&get_url(&server, "missing.png"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, FetchError::InvalidResponse { status: Some(404), .. }),
        "{err:?}"
    );
    assert_eq!(err.status_code(), ErrorCode::NotFound);
    assert_eq!(err.status_code().exit_code(), 66);
}

#[tokio::test]
async fn not_modified_maps_to_cache_not_modified() {
    let server = create_test_server();
    let downloader = downloader(DownloaderConfig::default());

    let err = downloader
        .fetch_url(&get_url(&server, "cached.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::CacheNotModified { .. }), "{err:?}");
}

#[tokio::test]
async fn rejects_unacceptable_content_type() {
    let server = create_test_server();
    let downloader = downloader(
        DownloaderConfig::builder()
            .acceptable_content_types(vec!["image/*".to_string()])
            .build(),
    );

    let err = downloader
        .fetch_url(&get_url(&server, "page"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidResponse { .. }), "{err:?}");
    assert!(
        downloader
            .fetch_url(&get_url(&server, "image.png"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn large_body_reports_monotonic_progress() {
    let server = create_test_server();
    let downloader = downloader(DownloaderConfig::default());

    let events: Vec<FetchEvent> = downloader
        .fetch_events(
            &get_url(&server, "large.jpg"),
            FetchOptions::default(),
            FetchContext::default(),
        )
        .collect()
        .await;

    let reports: Vec<(u64, Option<u64>)> = events
        .iter()
        .filter_map(|event| match event {
            FetchEvent::Progress { received, expected } => Some((*received, *expected)),
            _ => None,
        })
        .collect();
    assert!(!reports.is_empty());
    assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(reports.iter().all(|(_, expected)| *expected == Some(LARGE_LEN as u64)));
    assert_eq!(reports.last().unwrap().0, LARGE_LEN as u64);

    match events.last() {
        Some(FetchEvent::Finished(Ok(payload))) => {
            assert_eq!(payload.data.len(), LARGE_LEN);
            assert!(payload.data.iter().all(|b| *b == 7));
        }
        other => panic!("unexpected final event: {other:?}"),
    }
}

#[tokio::test]
async fn request_timeout_is_a_transport_failure() {
    let server = create_test_server();
    let downloader = downloader(
        DownloaderConfig::builder()
            .timeout(jiff::SignedDuration::from_millis(200))
            .build(),
    );

    let err = downloader
        .fetch_url(&get_url(&server, "slow"))
        .await
        .unwrap_err();
    match &err {
        FetchError::TransportFailure { source, .. } => assert!(source.is_timeout(), "{source}"),
        other => panic!("expected a transport failure, got {other:?}"),
    }
    assert_eq!(err.status_code(), ErrorCode::Unavailable);
}

#[tokio::test]
async fn loads_local_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.gif");
    tokio::fs::write(&path, b"GIF89a-local").await.unwrap();
    let downloader = downloader(DownloaderConfig::default());

    let url = Url::from_file_path(&path).unwrap();
    assert!(downloader.can_request(url.as_str()));
    let payload = downloader.fetch_url(url.as_str()).await.unwrap();
    assert_eq!(payload.data, Bytes::from_static(b"GIF89a-local"));
    assert_eq!(payload.response.unwrap().expected_len, Some(12));

    let missing = Url::from_file_path(dir.path().join("missing.gif")).unwrap();
    let err = downloader.fetch_url(missing.as_str()).await.unwrap_err();
    assert!(matches!(err, FetchError::TransportFailure { .. }), "{err:?}");

    let directory = Url::from_directory_path(dir.path()).unwrap();
    let err = downloader.fetch_url(directory.as_str()).await.unwrap_err();
    assert!(matches!(err, FetchError::TransportFailure { .. }), "{err:?}");
}

#[tokio::test]
async fn unsupported_scheme_fails_the_fetch() {
    let downloader = downloader(DownloaderConfig::default());
    assert!(!downloader.can_request("ftp://example.com/a.png"));

    let err = downloader
        .fetch_url("ftp://example.com/a.png")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::TransportFailure { .. }), "{err:?}");
}
