//! Origin access
//!
//! The remote store is reached through one of two contracts, chosen at
//! configuration time:
//!
//! - [`DestinationFetch`]: the origin writes the object into an artifact
//!   writer it is handed. All delivery goes through the local artifact.
//! - [`StreamFetch`]: the origin returns a byte stream with an optional
//!   declared length. Whole-object requests with no fetch in flight can be
//!   piped straight to the client; everything else drains the stream into an
//!   artifact exactly like the destination contract.
//!
//! [`HttpOrigin`] implements both against `GET {base}/{key}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::Url;
use tracing::debug;

use crate::cache::{ArtifactWriter, FetchFn};
use super::parse_base_url;
use crate::types::{ContentKey, FetchError, RelayError};

/// Origin that writes an object into a destination artifact
#[async_trait]
pub trait DestinationFetch: Send + Sync {
    async fn fetch(&self, key: &ContentKey, destination: &mut ArtifactWriter) -> Result<(), FetchError>;
}

/// An open byte stream from the origin
pub struct OriginStream {
    /// Total length, when the origin announces it up front
    pub declared_len: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for OriginStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginStream")
            .field("declared_len", &self.declared_len)
            .finish_non_exhaustive()
    }
}

/// Origin that hands back a byte stream
#[async_trait]
pub trait StreamFetch: Send + Sync {
    async fn open_stream(&self, key: &ContentKey) -> Result<OriginStream, FetchError>;
}

/// Copy an origin stream into an artifact writer.
pub async fn drain_into(stream: OriginStream, writer: &mut ArtifactWriter) -> Result<(), FetchError> {
    if let Some(len) = stream.declared_len {
        writer.declare_len(len);
    }

    let mut body = stream.body;
    while let Some(chunk) = body.next().await {
        writer.write_chunk(&chunk?).await?;
    }
    Ok(())
}

/// The configured origin capability
#[derive(Clone)]
pub enum Origin {
    Destination(Arc<dyn DestinationFetch>),
    Streaming(Arc<dyn StreamFetch>),
}

impl Origin {
    /// The stream contract, if this origin offers it
    pub fn streaming(&self) -> Option<&Arc<dyn StreamFetch>> {
        match self {
            Origin::Streaming(stream) => Some(stream),
            Origin::Destination(_) => None,
        }
    }

    /// Build the one-shot fetch the coordinator runs for `key`.
    pub fn fetch_fn(&self, key: &ContentKey) -> FetchFn {
        let key = key.clone();
        match self.clone() {
            Origin::Destination(origin) => Box::new(move |mut writer: ArtifactWriter| {
                async move {
                    origin.fetch(&key, &mut writer).await?;
                    Ok::<_, FetchError>(writer)
                }
                .boxed()
            }),
            Origin::Streaming(origin) => Box::new(move |mut writer: ArtifactWriter| {
                async move {
                    let stream = origin.open_stream(&key).await?;
                    drain_into(stream, &mut writer).await?;
                    Ok::<_, FetchError>(writer)
                }
                .boxed()
            }),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Origin::Destination(_) => "destination",
            Origin::Streaming(_) => "stream",
        }
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Origin({})", self.mode_name())
    }
}

/// HTTP origin serving objects at `{base_url}/{key}`
pub struct HttpOrigin {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let base_url = parse_base_url(base_url).map_err(RelayError::Config)?;
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("blob-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Config(format!("origin client: {}", e)))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    fn url_for(&self, key: &ContentKey) -> Result<Url, FetchError> {
        self.base_url
            .join(key.as_str())
            .map_err(|e| FetchError::Transport(format!("bad object URL: {}", e)))
    }
}

#[async_trait]
impl StreamFetch for HttpOrigin {
    async fn open_stream(&self, key: &ContentKey) -> Result<OriginStream, FetchError> {
        let url = self.url_for(key)?;
        debug!(key = key.short(), url = %url, "Requesting object from origin");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(OriginStream {
            declared_len: response.content_length(),
            body: response
                .bytes_stream()
                .map_err(|e| FetchError::Transport(e.to_string()))
                .boxed(),
        })
    }
}

#[async_trait]
impl DestinationFetch for HttpOrigin {
    async fn fetch(&self, key: &ContentKey, destination: &mut ArtifactWriter) -> Result<(), FetchError> {
        let stream = self.open_stream(key).await?;
        drain_into(stream, destination).await
    }
}
