//! HTTP routing and status mapping through the request handler

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use http_body_util::BodyExt;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, ETAG, IF_NONE_MATCH, RANGE,
};
use hyper::{Method, Request, Response, StatusCode};

use blob_relay::cache::CacheStore;
use blob_relay::config::Args;
use blob_relay::routes::BoxBody;
use blob_relay::server::{handle_request, AppState};
use blob_relay::services::{NoMetadata, Origin};

use common::{payload, ScriptedOrigin, KEY_A};

async fn app(dir: &Path, origin: Origin) -> Arc<AppState> {
    let args = Args::parse_from([
        "blob-relay",
        "--origin-url",
        "http://127.0.0.1:9",
        "--scratch-dir",
        dir.to_str().unwrap(),
    ]);
    let cache = Arc::new(CacheStore::open(args.cache_config()).await.unwrap());
    Arc::new(AppState::assemble(args, cache, origin, Arc::new(NoMetadata)))
}

async fn send(state: &Arc<AppState>, request: Request<()>) -> Response<BoxBody> {
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    handle_request(Arc::clone(state), addr, request).await.unwrap()
}

fn request(method: Method, uri: &str) -> Request<()> {
    Request::builder().method(method).uri(uri).body(()).unwrap()
}

async fn body_bytes(response: Response<BoxBody>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

fn resource(key: &str) -> String {
    format!("/resource/{}", key)
}

#[tokio::test]
async fn test_get_serves_object_with_cors() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(5000);
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(data.clone())))).await;

    let response = send(&state, request(Method::GET, &resource(KEY_A))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(response.headers()[CONTENT_TYPE], "application/octet-stream");
    assert!(response.headers().contains_key(CONTENT_DISPOSITION));
    assert_eq!(body_bytes(response).await, data);
}

#[tokio::test]
async fn test_malformed_key_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(payload(10)));
    let state = app(dir.path(), Origin::Destination(origin.clone())).await;

    let unprefixed = resource(&KEY_A[2..]);
    for path in ["/resource/nothex", "/resource/0x1234", unprefixed.as_str()] {
        let response = send(&state, request(Method::GET, path)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", path);
    }
    assert_eq!(origin.calls(), 0);
}

#[tokio::test]
async fn test_unsatisfiable_range_has_total() {
    let dir = tempfile::tempdir().unwrap();
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(payload(10))))).await;

    let mut req = request(Method::GET, &resource(KEY_A));
    req.headers_mut().insert(RANGE, "bytes=50-60".parse().unwrap());
    let response = send(&state, req).await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes */10");
}

#[tokio::test]
async fn test_partial_content() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(data.clone())))).await;

    let mut req = request(Method::GET, &resource(KEY_A));
    req.headers_mut().insert(RANGE, "bytes=100-199".parse().unwrap());
    let response = send(&state, req).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(response.headers()[CONTENT_LENGTH], "100");
    assert_eq!(body_bytes(response).await, &data[100..200]);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let state = app(
        dir.path(),
        Origin::Destination(Arc::new(ScriptedOrigin::new(payload(10)).failing())),
    )
    .await;

    let response = send(&state, request(Method::GET, &resource(KEY_A))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let head = send(&state, request(Method::HEAD, &resource(KEY_A))).await;
    assert_eq!(head.status(), StatusCode::BAD_GATEWAY);
    assert!(body_bytes(head).await.is_empty());
}

#[tokio::test]
async fn test_head_and_conditional_get() {
    let dir = tempfile::tempdir().unwrap();
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(payload(300))))).await;

    // Populate the cache
    let first = send(&state, request(Method::GET, &resource(KEY_A))).await;
    body_bytes(first).await;
    if let Some(task) = state.coordinator.pending(&common::key(KEY_A)).await {
        task.wait().await.unwrap();
    }

    let head = send(&state, request(Method::HEAD, &resource(KEY_A))).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers()[CONTENT_LENGTH], "300");
    let etag = head.headers()[ETAG].clone();
    assert!(body_bytes(head).await.is_empty());

    let mut req = request(Method::GET, &resource(KEY_A));
    req.headers_mut().insert(IF_NONE_MATCH, etag);
    let response = send(&state, req).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_method_handling() {
    let dir = tempfile::tempdir().unwrap();
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(payload(10))))).await;

    let preflight = send(&state, request(Method::OPTIONS, &resource(KEY_A))).await;
    assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
    assert_eq!(preflight.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let post = send(&state, request(Method::POST, &resource(KEY_A))).await;
    assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(post.headers().contains_key(ALLOW));
}

#[tokio::test]
async fn test_health_and_unknown_paths() {
    let dir = tempfile::tempdir().unwrap();
    let state = app(dir.path(), Origin::Destination(Arc::new(ScriptedOrigin::new(payload(10))))).await;

    let health = send(&state, request(Method::GET, "/health")).await;
    assert_eq!(health.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(health).await).unwrap();
    assert_eq!(json["healthy"], true);
    assert_eq!(json["originMode"], "destination");
    assert_eq!(json["cache"]["entries"], 0);

    let version = send(&state, request(Method::GET, "/version")).await;
    assert_eq!(version.status(), StatusCode::OK);

    let missing = send(&state, request(Method::GET, "/nope")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
