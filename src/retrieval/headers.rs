//! Response header assembly for resource responses

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH,
    CONTENT_RANGE, CONTENT_TYPE, ETAG, LAST_MODIFIED,
};
use tracing::warn;

use crate::cache::CacheEntry;
use crate::routes::range::ByteRange;
use crate::services::metadata::{ResolvedType, OCTET_STREAM};
use crate::types::ContentKey;

/// Objects are immutable, so clients may keep them indefinitely
pub const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Headers scripts on other origins may read
pub const EXPOSED_HEADERS: &str =
    "Content-Length, Content-Range, Content-Type, Accept-Ranges, ETag, Last-Modified";

pub const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");

/// Cross-origin headers carried by every resource response, errors included
pub fn cors_headers(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    headers.insert(
        CROSS_ORIGIN_RESOURCE_POLICY,
        HeaderValue::from_static("cross-origin"),
    );
}

/// Headers shared by every successful response for `key`
pub fn base_headers(key: &ContentKey, resolved: &ResolvedType) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = HeaderValue::from_str(&resolved.content_type).unwrap_or_else(|_| {
        warn!(key = key.short(), content_type = %resolved.content_type, "Unusable content type");
        HeaderValue::from_static(OCTET_STREAM)
    });
    headers.insert(CONTENT_TYPE, content_type);
    set(&mut headers, CONTENT_DISPOSITION, &resolved.disposition(key));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_IMMUTABLE));
    cors_headers(&mut headers);
    headers
}

/// Validators for responses backed by a complete cache entry
pub fn validator_headers(headers: &mut HeaderMap, entry: &CacheEntry) {
    set(headers, ETAG, &entry.etag());
    set(headers, LAST_MODIFIED, &entry.last_modified());
}

pub fn content_length(headers: &mut HeaderMap, len: u64) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

pub fn content_range(headers: &mut HeaderMap, range: &ByteRange) {
    set(headers, CONTENT_RANGE, &range.content_range());
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Dropping header with invalid value"),
    }
}

/// Whether an `If-None-Match` header matches `etag`.
///
/// Accepts `*`, comma-separated lists and weak validators.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || tag.trim_start_matches("W/") == etag)
}
