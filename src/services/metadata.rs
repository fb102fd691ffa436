//! Metadata resolution
//!
//! Content type and file extension are looked up from an external metadata
//! service. The lookup is best-effort: any failure falls back to a type
//! guessed from the extension, and finally to `application/octet-stream`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use super::parse_base_url;
use crate::types::{ContentKey, RelayError};

/// Fallback content type
pub const OCTET_STREAM: &str = "application/octet-stream";

/// What the metadata service knows about an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub content_type: Option<String>,
    pub extension: Option<String>,
}

/// Source of per-object metadata
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// `Ok(None)` when the service has nothing for the key
    async fn resolve(&self, key: &ContentKey) -> Result<Option<ResourceMetadata>, RelayError>;
}

/// Resolver used when no metadata service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataResolver for NoMetadata {
    async fn resolve(&self, _key: &ContentKey) -> Result<Option<ResourceMetadata>, RelayError> {
        Ok(None)
    }
}

/// Metadata service reached at `GET {base_url}/{key}`
pub struct HttpMetadataResolver {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpMetadataResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RelayError> {
        let base_url = parse_base_url(base_url).map_err(RelayError::Config)?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("blob-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Config(format!("metadata client: {}", e)))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, key: &ContentKey) -> Result<Option<ResourceMetadata>, RelayError> {
        let url = self
            .base_url
            .join(key.as_str())
            .map_err(|e| RelayError::MetadataResolutionFailure(e.to_string()))?;

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::MetadataResolutionFailure(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RelayError::MetadataResolutionFailure(format!(
                "metadata service returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let metadata = response
            .json::<ResourceMetadata>()
            .await
            .map_err(|e| RelayError::MetadataResolutionFailure(e.to_string()))?;
        Ok(Some(metadata))
    }
}

/// Content type and download extension settled for one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub content_type: String,
    pub extension: Option<String>,
}

impl ResolvedType {
    fn from_metadata(metadata: Option<ResourceMetadata>) -> Self {
        let metadata = metadata.unwrap_or_default();
        let extension = metadata
            .extension
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| is_plain_extension(ext));

        let content_type = metadata
            .content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| {
                extension
                    .as_deref()
                    .map(guess_content_type)
                    .unwrap_or(OCTET_STREAM)
                    .to_string()
            });

        Self {
            content_type,
            extension,
        }
    }

    /// `Content-Disposition` value naming the file after the key
    pub fn disposition(&self, key: &ContentKey) -> String {
        match &self.extension {
            Some(ext) => format!("inline; filename=\"{}.{}\"", key, ext),
            None => format!("inline; filename=\"{}\"", key),
        }
    }
}

/// Extensions end up inside a quoted header parameter; only `[a-z0-9]` is allowed.
fn is_plain_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= 16
        && ext.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Resolve metadata for `key`, never failing the request over it.
pub async fn resolve_content_type(resolver: &dyn MetadataResolver, key: &ContentKey) -> ResolvedType {
    let metadata = match resolver.resolve(key).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(key = key.short(), error = %e, "Metadata lookup failed, using fallback type");
            None
        }
    };
    let resolved = ResolvedType::from_metadata(metadata);
    debug!(key = key.short(), content_type = %resolved.content_type, "Resolved content type");
    resolved
}

/// Content type for a file extension
pub fn guess_content_type(extension: &str) -> &'static str {
    match extension {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "webm" => "video/webm",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "wasm" => "application/wasm",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => OCTET_STREAM,
    }
}
