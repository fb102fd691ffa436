//! Services layer for blob-relay
//!
//! Concrete clients for the two external collaborators:
//!
//! - **Origin**: the remote content store objects are fetched from
//! - **Metadata**: best-effort content type and extension lookup

pub mod metadata;
pub mod origin;

pub use metadata::{
    guess_content_type, resolve_content_type, HttpMetadataResolver, MetadataResolver, NoMetadata,
    ResolvedType, ResourceMetadata,
};
pub use origin::{drain_into, DestinationFetch, HttpOrigin, Origin, OriginStream, StreamFetch};

use reqwest::Url;

/// Parse the base URL of an HTTP collaborator.
///
/// Only http(s) URLs with a host are accepted. The path always ends in `/`
/// so that joining a key appends to it instead of replacing its last segment.
pub fn parse_base_url(raw: &str) -> Result<Url, String> {
    let mut url = Url::parse(raw).map_err(|e| format!("invalid URL {:?}: {}", raw, e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("{:?} must use http or https", raw));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("{:?} has no host", raw));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
