//! Retrieval orchestration
//!
//! Decides how one request for a content key is served. Strategies are tried
//! in order, each only after the previous one has explicitly failed:
//!
//! 1. **Cache**: a live entry whose file is confirmed on disk
//! 2. **Direct**: with a stream-capable origin, a whole-object GET that
//!    starts a fetch receives the origin stream as it arrives, while the
//!    same bytes are written to the artifact for everyone else
//! 3. **Progressive**: join or start the fetch and stream the growing
//!    artifact
//! 4. **Buffered**: wait for the fetch to finish and serve the cache entry
//!
//! A cache entry whose file has vanished is a desync: it is dropped, logged,
//! and the request continues as a miss.
//!
//! Conditional requests (`If-None-Match`) are answered with 304 only when a
//! complete entry backs the response, since only then is there an ETag.

pub mod headers;

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use hyper::header::HeaderMap;
use hyper::StatusCode;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::{
    ArtifactReader, ArtifactWriter, CacheEntry, CacheStore, FetchCoordinator, FetchFn, FetchTask,
    Obtained,
};
use crate::delivery::{ProgressiveDeliverer, SINK_CAPACITY};
use crate::routes::range::{negotiate, Negotiated};
use crate::services::{resolve_content_type, MetadataResolver, Origin, ResolvedType, StreamFetch};
use crate::types::{ContentKey, FetchError, RelayError, Result};

// =============================================================================
// Request / Response
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// One resource request, already validated by the route layer
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub method: RequestMethod,
    pub key: ContentKey,
    /// Raw `Range` header
    pub range: Option<String>,
    /// Raw `If-None-Match` header
    pub if_none_match: Option<String>,
}

impl RetrievalRequest {
    pub fn get(key: ContentKey) -> Self {
        Self {
            method: RequestMethod::Get,
            key,
            range: None,
            if_none_match: None,
        }
    }

    pub fn head(key: ContentKey) -> Self {
        Self {
            method: RequestMethod::Head,
            ..Self::get(key)
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    fn wants_body(&self) -> bool {
        self.method == RequestMethod::Get
    }
}

/// Response body as produced by the orchestrator
#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Stream(mpsc::Receiver<io::Result<Bytes>>),
}

/// Which strategy produced the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Cache,
    Direct,
    Progressive,
    Buffered,
}

impl DeliveryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryPath::Cache => "cache",
            DeliveryPath::Direct => "direct",
            DeliveryPath::Progressive => "progressive",
            DeliveryPath::Buffered => "buffered",
        }
    }
}

/// Everything the HTTP layer needs to build the response
#[derive(Debug)]
pub struct Retrieval {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub path: DeliveryPath,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Serves resource requests from the cache, the origin, or a fetch in flight
pub struct RetrievalOrchestrator {
    cache: Arc<CacheStore>,
    coordinator: Arc<FetchCoordinator>,
    origin: Origin,
    metadata: Arc<dyn MetadataResolver>,
    deliverer: ProgressiveDeliverer,
}

impl RetrievalOrchestrator {
    pub fn new(
        coordinator: Arc<FetchCoordinator>,
        origin: Origin,
        metadata: Arc<dyn MetadataResolver>,
        deliverer: ProgressiveDeliverer,
    ) -> Self {
        Self {
            cache: Arc::clone(coordinator.cache()),
            coordinator,
            origin,
            metadata,
            deliverer,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    /// Serve one request.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Retrieval> {
        let key = &request.key;
        let resolved = resolve_content_type(self.metadata.as_ref(), key).await;

        if let Some(entry) = self.confirmed_lookup(key).await {
            return self
                .serve_entry(request, entry, &resolved, DeliveryPath::Cache)
                .await;
        }

        let task = match self.direct_or_obtain(request, &resolved).await? {
            Attempt::Served(retrieval) => return Ok(retrieval),
            Attempt::Pending(task) => task,
        };

        match self.serve_progressive(request, &task, &resolved).await {
            Ok(retrieval) => return Ok(retrieval),
            Err(e @ RelayError::UpstreamFetchFailure(_))
            | Err(e @ RelayError::RangeNotSatisfiable { .. }) => return Err(e),
            Err(e) => {
                warn!(key = key.short(), error = %e, "Progressive delivery unavailable, waiting for full download");
            }
        }

        let entry = task.wait().await?;
        self.serve_entry(request, entry, &resolved, DeliveryPath::Buffered)
            .await
    }

    /// Cache lookup that also checks the artifact is still on disk.
    async fn confirmed_lookup(&self, key: &ContentKey) -> Option<CacheEntry> {
        let entry = self.cache.lookup(key)?;

        match tokio::fs::metadata(entry.artifact.path()).await {
            Ok(meta) if meta.len() == entry.size => Some(entry),
            Ok(meta) => {
                let err = RelayError::CacheDesync(key.to_string());
                warn!(
                    key = key.short(),
                    expected = entry.size,
                    actual = meta.len(),
                    error = %err,
                    "Cached artifact has the wrong size, treating as miss"
                );
                self.cache.invalidate(&entry);
                None
            }
            Err(e) => {
                let err = RelayError::CacheDesync(key.to_string());
                warn!(key = key.short(), io_error = %e, error = %err, "Cached artifact missing, treating as miss");
                self.cache.invalidate(&entry);
                None
            }
        }
    }

    /// Start or join the fetch for the key, piping the origin stream straight
    /// to this client when it is the one starting a whole-object GET.
    async fn direct_or_obtain(&self, request: &RetrievalRequest, resolved: &ResolvedType) -> Result<Attempt> {
        let key = &request.key;

        let direct_origin = match self.origin.streaming() {
            Some(origin) if request.wants_body() && request.range.is_none() => Some(Arc::clone(origin)),
            _ => None,
        };

        let Some(origin) = direct_origin else {
            return match self.coordinator.obtain(key, self.origin.fetch_fn(key)).await {
                Obtained::Cached(entry) => self
                    .serve_entry(request, entry, resolved, DeliveryPath::Cache)
                    .await
                    .map(Attempt::Served),
                Obtained::Joined(task) | Obtained::Started(task) => Ok(Attempt::Pending(task)),
            };
        };

        let (client_tx, client_rx) = mpsc::channel(SINK_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let fetch = direct_fetch(origin, key.clone(), client_tx, ready_tx);

        match self.coordinator.obtain(key, fetch).await {
            Obtained::Cached(entry) => self
                .serve_entry(request, entry, resolved, DeliveryPath::Cache)
                .await
                .map(Attempt::Served),
            Obtained::Joined(task) => Ok(Attempt::Pending(task)),
            Obtained::Started(task) => {
                let declared_len = match ready_rx.await {
                    Ok(ready) => ready?,
                    // The origin was never opened; the task knows why
                    Err(_) => {
                        task.wait().await?;
                        return Ok(Attempt::Pending(task));
                    }
                };

                let mut headers = headers::base_headers(key, resolved);
                if let Some(len) = declared_len {
                    headers::content_length(&mut headers, len);
                }
                debug!(key = key.short(), declared_len = ?declared_len, "Streaming directly from origin");
                Ok(Attempt::Served(Retrieval {
                    status: StatusCode::OK,
                    headers,
                    body: ResponseBody::Stream(relay_direct(self.deliverer, task, client_rx)),
                    path: DeliveryPath::Direct,
                }))
            }
        }
    }

    /// Stream from the artifact of a fetch that may still be running.
    async fn serve_progressive(
        &self,
        request: &RetrievalRequest,
        task: &Arc<FetchTask>,
        resolved: &ResolvedType,
    ) -> Result<Retrieval> {
        let key = &request.key;
        let mut headers = headers::base_headers(key, resolved);

        // Whole-object GET: start streaming at the first byte, size or not
        if request.wants_body() && request.range.is_none() {
            task.wait_for_data().await?;
            let reader = ProgressiveDeliverer::open_reader(task, 0).await?;
            if let Some(total) = task.artifact().growth().known_len() {
                headers::content_length(&mut headers, total);
            }
            let body = self.deliverer.spawn_delivery(Arc::clone(task), reader, None);
            return Ok(Retrieval {
                status: StatusCode::OK,
                headers,
                body: ResponseBody::Stream(body),
                path: DeliveryPath::Progressive,
            });
        }

        // Ranges and HEAD need the total size first
        let total = task.wait_for_size().await?;
        if let Some(Ok(entry)) = task.state().outcome() {
            return self
                .serve_entry(request, entry, resolved, DeliveryPath::Buffered)
                .await;
        }

        let (status, start, end) = match negotiate(request.range.as_deref(), total) {
            Ok(Negotiated::Whole) => {
                headers::content_length(&mut headers, total);
                (StatusCode::OK, 0, total.checked_sub(1))
            }
            Ok(Negotiated::Partial(range)) => {
                headers::content_length(&mut headers, range.len());
                headers::content_range(&mut headers, &range);
                (StatusCode::PARTIAL_CONTENT, range.start, Some(range.end))
            }
            Err(e) => {
                debug!(key = key.short(), error = %e, "Range not satisfiable");
                return Err(RelayError::RangeNotSatisfiable { total });
            }
        };

        let body = match end {
            Some(end) if request.wants_body() => {
                let reader = ProgressiveDeliverer::open_reader(task, start).await?;
                ResponseBody::Stream(self.deliverer.spawn_delivery(Arc::clone(task), reader, Some(end)))
            }
            _ => ResponseBody::Empty,
        };

        Ok(Retrieval {
            status,
            headers,
            body,
            path: DeliveryPath::Progressive,
        })
    }

    /// Serve a complete cache entry, honouring Range and If-None-Match.
    async fn serve_entry(
        &self,
        request: &RetrievalRequest,
        entry: CacheEntry,
        resolved: &ResolvedType,
        path: DeliveryPath,
    ) -> Result<Retrieval> {
        let key = &request.key;
        let mut headers = headers::base_headers(key, resolved);
        headers::validator_headers(&mut headers, &entry);

        if let Some(if_none_match) = &request.if_none_match {
            if headers::etag_matches(if_none_match, &entry.etag()) {
                debug!(key = key.short(), path = path.as_str(), "ETag matched, not modified");
                return Ok(Retrieval {
                    status: StatusCode::NOT_MODIFIED,
                    headers,
                    body: ResponseBody::Empty,
                    path,
                });
            }
        }

        let total = entry.size;
        let (status, start, end) = match negotiate(request.range.as_deref(), total) {
            Ok(Negotiated::Whole) => {
                headers::content_length(&mut headers, total);
                (StatusCode::OK, 0, total.checked_sub(1))
            }
            Ok(Negotiated::Partial(range)) => {
                headers::content_length(&mut headers, range.len());
                headers::content_range(&mut headers, &range);
                (StatusCode::PARTIAL_CONTENT, range.start, Some(range.end))
            }
            Err(e) => {
                debug!(key = key.short(), error = %e, "Range not satisfiable");
                return Err(RelayError::RangeNotSatisfiable { total });
            }
        };

        let body = match end {
            Some(end) if request.wants_body() => {
                let reader = ArtifactReader::open(Arc::clone(&entry.artifact), start).await?;
                ResponseBody::Stream(self.deliverer.spawn_complete(entry, reader, Some(end)))
            }
            _ => ResponseBody::Empty,
        };

        debug!(key = key.short(), status = status.as_u16(), path = path.as_str(), "Serving cached object");
        Ok(Retrieval {
            status,
            headers,
            body,
            path,
        })
    }
}

enum Attempt {
    Served(Retrieval),
    Pending(Arc<FetchTask>),
}

/// Feed the direct client: first the chunks the fetch handed over, then the
/// rest of the object from the artifact at the offset reached.
///
/// The fetch stops handing chunks over once this client falls behind, so
/// the artifact read also covers slow clients. A fetch failure ends the body
/// with an error.
fn relay_direct(
    deliverer: ProgressiveDeliverer,
    task: Arc<FetchTask>,
    mut upstream: mpsc::Receiver<io::Result<Bytes>>,
) -> mpsc::Receiver<io::Result<Bytes>> {
    let (mut tx, rx) = mpsc::channel(SINK_CAPACITY);
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        while let Some(item) = upstream.recv().await {
            let failed = item.is_err();
            let len = item.as_ref().map_or(0, |chunk| chunk.len() as u64);
            if tx.send(item).await.is_err() || failed {
                return;
            }
            forwarded += len;
        }

        let key = task.key().short().to_string();
        let reader = match ArtifactReader::open(Arc::clone(task.artifact().file()), forwarded).await {
            Ok(reader) => reader,
            Err(e) => {
                let err = task.wait().await.err().map_or(e.to_string(), |err| err.to_string());
                let _ = tx.send(Err(io::Error::other(err))).await;
                return;
            }
        };
        match deliverer.deliver(&task, reader, None, &mut tx).await {
            Ok(outcome) => debug!(key = %key, forwarded = forwarded, outcome = ?outcome, "Direct delivery finished"),
            Err(e) => debug!(key = %key, error = %e, "Direct delivery ended early"),
        }
    });
    rx
}

/// Fetch that drains the origin stream into the artifact and forwards chunks
/// to the client that started it.
///
/// `ready` reports the declared length once the origin has answered. Chunks
/// are only handed over while the client keeps up. The first time its buffer
/// is full the client is let go and catches up from the artifact instead, so
/// the fetch never waits on it.
fn direct_fetch(
    origin: Arc<dyn StreamFetch>,
    key: ContentKey,
    client: mpsc::Sender<io::Result<Bytes>>,
    ready: oneshot::Sender<std::result::Result<Option<u64>, FetchError>>,
) -> FetchFn {
    Box::new(move |mut writer: ArtifactWriter| {
        async move {
            let stream = match origin.open_stream(&key).await {
                Ok(stream) => {
                    let _ = ready.send(Ok(stream.declared_len));
                    stream
                }
                Err(e) => {
                    let _ = ready.send(Err(e.clone()));
                    return Err(e);
                }
            };

            if let Some(len) = stream.declared_len {
                writer.declare_len(len);
            }

            let mut client = Some(client);
            let mut body = stream.body;
            while let Some(chunk) = body.next().await {
                let written = match chunk {
                    Ok(chunk) => writer.write_chunk(&chunk).await.map(|_| chunk).map_err(FetchError::from),
                    Err(e) => Err(e),
                };
                let chunk = match written {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        if let Some(client) = client.take() {
                            let _ = client.try_send(Err(io::Error::other(e.to_string())));
                        }
                        return Err(e);
                    }
                };

                if let Some(tx) = &client {
                    match tx.try_send(Ok(chunk)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!(key = key.short(), "Direct client fell behind, handing it to the artifact");
                            client = None;
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(key = key.short(), "Direct client went away, fetch continues");
                            client = None;
                        }
                    }
                }
            }

            Ok::<_, FetchError>(writer)
        }
        .boxed()
    })
}
