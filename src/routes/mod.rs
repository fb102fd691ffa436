//! HTTP routes for blob-relay

pub mod health;
pub mod range;
pub mod resource;

pub use health::{health_check, version_info};
pub use resource::{handle_resource_request, RESOURCE_PREFIX};

use std::convert::Infallible;
use std::io;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;

/// Body type for every response the server produces
pub type BoxBody = UnsyncBoxBody<Bytes, io::Error>;

fn never(never: Infallible) -> io::Error {
    match never {}
}

pub fn full(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into()).map_err(never).boxed_unsync()
}

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new().map_err(never).boxed_unsync()
}

/// Body fed from a channel of chunks; an `Err` item aborts the response
pub fn channel_body(mut rx: mpsc::Receiver<io::Result<Bytes>>) -> BoxBody {
    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value)
        .unwrap_or_else(|_| br#"{"error":"serialization failed"}"#.to_vec());

    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// JSON error response: `{"error": message}`
pub fn error_json(status: StatusCode, message: &str) -> Response<BoxBody> {
    json_response(status, &ErrorBody { error: message })
}

pub fn not_found(path: &str) -> Response<BoxBody> {
    error_json(StatusCode::NOT_FOUND, &format!("No route for {}", path))
}

#[cfg(test)]
pub(crate) async fn collect_body(body: BoxBody) -> io::Result<Bytes> {
    Ok(body.collect().await?.to_bytes())
}
