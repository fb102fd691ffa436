//! Progressive delivery
//!
//! Streams bytes from an artifact to one client while the fetch that fills
//! it may still be running. Each client gets its own reader and cursor over
//! the shared artifact, so slow clients never hold up fast ones or the fetch.
//!
//! The reading loop:
//! - reads only up to the length the writer has flushed and published
//! - sleeps on growth and state notifications when it has caught up
//! - aborts the response as soon as the fetch fails, without sending
//!   anything read after the failure
//! - stops quietly when the client goes away; the fetch carries on
//!
//! A complete cached file goes through the same loop as a sealed artifact
//! that never grows.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::cache::{ArtifactReader, CacheEntry, FetchState, FetchTask, Growth, PartialArtifact};
use crate::types::{ContentKey, RelayError};

/// Default read size per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Buffered chunks per client before the reader waits on the client
pub const SINK_CAPACITY: usize = 8;

/// Where delivered bytes go
#[async_trait]
pub trait DeliverySink: Send {
    /// Hand one chunk to the client. Fails with
    /// [`RelayError::StreamAborted`] once the client is gone.
    async fn push(&mut self, chunk: Bytes) -> Result<(), RelayError>;

    /// Terminate the response with an error instead of a clean end.
    async fn abort(&mut self, error: io::Error);
}

#[async_trait]
impl DeliverySink for mpsc::Sender<io::Result<Bytes>> {
    async fn push(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        self.send(Ok(chunk))
            .await
            .map_err(|_| RelayError::StreamAborted)
    }

    async fn abort(&mut self, error: io::Error) {
        let _ = self.send(Err(error)).await;
    }
}

/// How a delivery ended, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every requested byte was handed to the sink
    Completed { bytes: u64 },
    /// The client stopped reading
    ClientGone { bytes: u64 },
}

/// Streams artifact bytes to clients in fixed-size reads
#[derive(Debug, Clone, Copy)]
pub struct ProgressiveDeliverer {
    chunk_size: usize,
}

impl Default for ProgressiveDeliverer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ProgressiveDeliverer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Open a reader on the artifact of a running fetch at `offset`.
    ///
    /// Waits for the fetch to create its file first. Fails if the fetch fails
    /// before that happens.
    pub async fn open_reader(task: &FetchTask, offset: u64) -> Result<ArtifactReader, RelayError> {
        let mut growth = task.artifact().subscribe();
        let mut state = task.subscribe();

        loop {
            let outcome = state.borrow_and_update().outcome();
            if let Some(Err(err)) = outcome {
                return Err(RelayError::UpstreamFetchFailure(err));
            }
            if growth.borrow_and_update().created {
                break;
            }

            tokio::select! {
                changed = growth.changed() => {
                    if changed.is_err() {
                        // Writer gone before the file existed
                        task.wait().await?;
                        break;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        task.wait().await?;
                        break;
                    }
                }
            }
        }

        Ok(ArtifactReader::open(Arc::clone(task.artifact().file()), offset).await?)
    }

    /// Stream from a running fetch up to `end` (inclusive), or to completion.
    pub async fn deliver<S>(
        &self,
        task: &FetchTask,
        reader: ArtifactReader,
        end: Option<u64>,
        sink: &mut S,
    ) -> Result<DeliveryOutcome, RelayError>
    where
        S: DeliverySink + ?Sized,
    {
        self.pump(reader, task.artifact().subscribe(), Some(task.subscribe()), end, sink)
            .await
    }

    /// Stream a complete cached file up to `end` (inclusive), or to its end.
    pub async fn serve_complete<S>(
        &self,
        entry: &CacheEntry,
        reader: ArtifactReader,
        end: Option<u64>,
        sink: &mut S,
    ) -> Result<DeliveryOutcome, RelayError>
    where
        S: DeliverySink + ?Sized,
    {
        let artifact = PartialArtifact::complete(Arc::clone(&entry.artifact), entry.size);
        self.pump(reader, artifact.subscribe(), None, end, sink).await
    }

    async fn pump<S>(
        &self,
        mut reader: ArtifactReader,
        mut growth: watch::Receiver<Growth>,
        mut state: Option<watch::Receiver<FetchState>>,
        end: Option<u64>,
        sink: &mut S,
    ) -> Result<DeliveryOutcome, RelayError>
    where
        S: DeliverySink + ?Sized,
    {
        let start = reader.position();
        let mut growth_open = true;
        let mut state_open = state.is_some();

        loop {
            if let Some(err) = failure(&state) {
                sink.abort(io::Error::other(err.to_string())).await;
                return Err(err);
            }

            let published = *growth.borrow_and_update();
            let limit = match end {
                Some(end) => published.flushed_len.min(end + 1),
                None => published.flushed_len,
            };

            if reader.position < limit {
                let want = (limit - reader.position).min(self.chunk_size as u64) as usize;
                let mut buf = vec![0u8; want];
                let n = reader.file.read(&mut buf).await?;
                if n == 0 {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "artifact shorter than its published length",
                    );
                    sink.abort(io::Error::new(err.kind(), err.to_string())).await;
                    return Err(err.into());
                }
                buf.truncate(n);

                // Nothing read after a failure reaches the client
                if let Some(err) = failure(&state) {
                    sink.abort(io::Error::other(err.to_string())).await;
                    return Err(err);
                }

                reader.position += n as u64;
                match sink.push(Bytes::from(buf)).await {
                    Ok(()) => continue,
                    Err(RelayError::StreamAborted) => {
                        return Ok(DeliveryOutcome::ClientGone {
                            bytes: reader.position - start,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            let reached_end = end.is_some_and(|end| reader.position > end);
            let drained = published.sealed && reader.position >= published.flushed_len;
            if reached_end || drained {
                return Ok(DeliveryOutcome::Completed {
                    bytes: reader.position - start,
                });
            }

            if !growth_open && !state_open {
                return Err(RelayError::Internal(
                    "artifact stopped growing before completion".to_string(),
                ));
            }

            tokio::select! {
                changed = growth.changed(), if growth_open => {
                    growth_open = changed.is_ok();
                }
                changed = state_changed(&mut state), if state_open => {
                    state_open = changed.is_ok();
                }
            }
        }
    }

    /// Run [`deliver`](Self::deliver) on its own task, feeding a bounded channel.
    pub fn spawn_delivery(
        self,
        task: Arc<FetchTask>,
        reader: ArtifactReader,
        end: Option<u64>,
    ) -> mpsc::Receiver<io::Result<Bytes>> {
        let (mut tx, rx) = mpsc::channel(SINK_CAPACITY);
        tokio::spawn(async move {
            let result = self.deliver(&task, reader, end, &mut tx).await;
            log_outcome(task.key(), "progressive", result);
        });
        rx
    }

    /// Run [`serve_complete`](Self::serve_complete) on its own task.
    pub fn spawn_complete(
        self,
        entry: CacheEntry,
        reader: ArtifactReader,
        end: Option<u64>,
    ) -> mpsc::Receiver<io::Result<Bytes>> {
        let (mut tx, rx) = mpsc::channel(SINK_CAPACITY);
        tokio::spawn(async move {
            let result = self.serve_complete(&entry, reader, end, &mut tx).await;
            log_outcome(&entry.key, "cache", result);
        });
        rx
    }
}

fn failure(state: &Option<watch::Receiver<FetchState>>) -> Option<RelayError> {
    let state = state.as_ref()?;
    match &*state.borrow() {
        FetchState::Failed(err) => Some(RelayError::UpstreamFetchFailure(err.clone())),
        _ => None,
    }
}

async fn state_changed(
    state: &mut Option<watch::Receiver<FetchState>>,
) -> Result<(), watch::error::RecvError> {
    match state {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

fn log_outcome(key: &ContentKey, path: &str, result: Result<DeliveryOutcome, RelayError>) {
    match result {
        Ok(DeliveryOutcome::Completed { bytes }) => {
            debug!(key = key.short(), path = path, bytes = bytes, "Delivery completed")
        }
        Ok(DeliveryOutcome::ClientGone { bytes }) => {
            debug!(key = key.short(), path = path, bytes = bytes, "Client went away mid-transfer")
        }
        Err(e) => debug!(key = key.short(), path = path, error = %e, "Delivery aborted"),
    }
}
