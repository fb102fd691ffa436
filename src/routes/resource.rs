//! Resource routes with HTTP 206 Range request support
//!
//! - `GET /resource/{key}` - whole object or a byte range
//! - `HEAD /resource/{key}` - same headers, no body
//! - `OPTIONS /resource/{key}` - CORS preflight
//!
//! `{key}` is `0x` followed by 64 hex digits. Responses carry permissive
//! cross-origin headers so media elements on any site can seek in them.
//!
//! ```bash
//! # Partial content (video seeking)
//! curl -H "Range: bytes=1000000-2000000" http://localhost:8080/resource/0xa7ff...434a
//! ```

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_MAX_AGE, ALLOW, CONTENT_RANGE, CONTENT_TYPE, IF_NONE_MATCH, RANGE,
};
use hyper::{Method, Response, StatusCode};
use tracing::{debug, info, warn};

use super::{channel_body, empty, error_json, BoxBody};
use crate::retrieval::headers::cors_headers;
use crate::retrieval::{
    RequestMethod, ResponseBody, Retrieval, RetrievalOrchestrator, RetrievalRequest,
};
use crate::types::{ContentKey, RelayError};

/// Path prefix served by this module
pub const RESOURCE_PREFIX: &str = "/resource/";

const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS";

/// Handle a request under [`RESOURCE_PREFIX`]; `raw_key` is the rest of the path.
pub async fn handle_resource_request(
    method: &Method,
    headers: &HeaderMap,
    raw_key: &str,
    orchestrator: &RetrievalOrchestrator,
) -> Response<BoxBody> {
    let method = match *method {
        Method::GET => RequestMethod::Get,
        Method::HEAD => RequestMethod::Head,
        Method::OPTIONS => return preflight_response(),
        _ => return error_response(RelayError::MethodNotAllowed, false),
    };
    let is_head = method == RequestMethod::Head;

    let key = match ContentKey::parse(raw_key) {
        Ok(key) => key,
        Err(e) => {
            debug!(raw_key = raw_key, error = %e, "Rejected resource key");
            return error_response(e, is_head);
        }
    };

    let request = RetrievalRequest {
        method,
        key,
        range: header_text(headers, RANGE),
        if_none_match: header_text(headers, IF_NONE_MATCH),
    };

    match orchestrator.retrieve(&request).await {
        Ok(retrieval) => {
            info!(
                key = request.key.short(),
                status = retrieval.status.as_u16(),
                path = retrieval.path.as_str(),
                range = request.range.as_deref().unwrap_or("-"),
                "Resource served"
            );
            into_response(retrieval)
        }
        Err(e) => {
            if e.status_code() == StatusCode::RANGE_NOT_SATISFIABLE {
                debug!(key = request.key.short(), error = %e, "Resource request rejected");
            } else {
                warn!(key = request.key.short(), error = %e, "Resource request failed");
            }
            error_response(e, is_head)
        }
    }
}

fn header_text(headers: &HeaderMap, name: hyper::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn into_response(retrieval: Retrieval) -> Response<BoxBody> {
    let body = match retrieval.body {
        ResponseBody::Empty => empty(),
        ResponseBody::Stream(rx) => channel_body(rx),
    };

    let mut response = Response::new(body);
    *response.status_mut() = retrieval.status;
    *response.headers_mut() = retrieval.headers;
    response
}

/// CORS preflight for resource paths
fn preflight_response() -> Response<BoxBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::NO_CONTENT;

    let headers = response.headers_mut();
    cors_headers(headers);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, If-None-Match, Content-Type"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

/// Map a relay error onto an HTTP response with CORS headers.
pub fn error_response(err: RelayError, is_head: bool) -> Response<BoxBody> {
    let range_total = match &err {
        RelayError::RangeNotSatisfiable { total } => Some(*total),
        _ => None,
    };
    let is_method_error = matches!(err, RelayError::MethodNotAllowed);

    let (status, message) = err.into_status_code_and_body();
    let mut response = if is_head {
        let mut response = Response::new(empty());
        *response.status_mut() = status;
        response
    } else {
        error_json(status, &message)
    };

    let headers = response.headers_mut();
    cors_headers(headers);
    if let Some(total) = range_total {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
            headers.insert(CONTENT_RANGE, value);
        }
    }
    if is_method_error {
        headers.insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    }
    if is_head {
        headers.remove(CONTENT_TYPE);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::collect_body;
    use crate::types::FetchError;

    #[tokio::test]
    async fn test_range_error_carries_total() {
        let response = error_response(RelayError::RangeNotSatisfiable { total: 1000 }, false);
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */1000");
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway() {
        let response = error_response(FetchError::Status(500).into(), false);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = collect_body(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_head_error_has_no_body() {
        let response = error_response(RelayError::InvalidKey("bad".into()), true);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        let body = collect_body(response.into_body()).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_preflight() {
        let response = preflight_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
