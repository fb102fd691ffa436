//! Shared fixtures for integration tests: scripted origins and helpers to
//! assemble an orchestrator over a temporary scratch directory.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use blob_relay::cache::{ArtifactWriter, CacheConfig, CacheStore, FetchCoordinator};
use blob_relay::delivery::ProgressiveDeliverer;
use blob_relay::retrieval::{ResponseBody, RetrievalOrchestrator};
use blob_relay::services::{
    DestinationFetch, MetadataResolver, NoMetadata, Origin, OriginStream, StreamFetch,
};
use blob_relay::types::{ContentKey, FetchError};

pub const KEY_A: &str = "0xa7ff3c2b5d7e1f0a9b8c6d4e2f1a3b5c7d9e0f1a2b3c4d5e6f708192a3b4c5d6";
pub const KEY_B: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

pub fn key(raw: &str) -> ContentKey {
    ContentKey::parse(raw).unwrap()
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Scripted origin usable under either contract
pub struct ScriptedOrigin {
    pub data: Vec<u8>,
    pub chunk_size: usize,
    /// Delay before the first byte
    pub latency: Duration,
    /// Delay between chunks
    pub pace: Duration,
    pub declare_len: bool,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl ScriptedOrigin {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            chunk_size: 4096,
            latency: Duration::ZERO,
            pace: Duration::ZERO,
            declare_len: true,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn paced(mut self, chunk_size: usize, pace: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.pace = pace;
        self
    }

    pub fn undeclared(mut self) -> Self {
        self.declare_len = false;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn chunks(&self) -> Vec<Bytes> {
        self.data
            .chunks(self.chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect()
    }
}

#[async_trait]
impl DestinationFetch for ScriptedOrigin {
    async fn fetch(&self, _key: &ContentKey, destination: &mut ArtifactWriter) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(FetchError::Status(503));
        }

        if self.declare_len {
            destination.declare_len(self.data.len() as u64);
        }
        for chunk in self.chunks() {
            destination.write_chunk(&chunk).await?;
            tokio::time::sleep(self.pace).await;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamFetch for ScriptedOrigin {
    async fn open_stream(&self, _key: &ContentKey) -> Result<OriginStream, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(FetchError::Status(503));
        }

        let pace = self.pace;
        let body = futures::stream::iter(self.chunks())
            .then(move |chunk| async move {
                tokio::time::sleep(pace).await;
                Ok::<_, FetchError>(chunk)
            })
            .boxed();

        Ok(OriginStream {
            declared_len: self.declare_len.then_some(self.data.len() as u64),
            body,
        })
    }
}

/// An orchestrator wired to `origin`, with its cache in `dir`
pub struct Relay {
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub cache: Arc<CacheStore>,
    pub coordinator: Arc<FetchCoordinator>,
}

pub async fn relay(dir: &Path, origin: Origin) -> Relay {
    relay_with(CacheConfig::with_scratch_dir(dir), origin, Arc::new(NoMetadata), None).await
}

pub async fn relay_with(
    config: CacheConfig,
    origin: Origin,
    metadata: Arc<dyn MetadataResolver>,
    timeout: Option<Duration>,
) -> Relay {
    let cache = Arc::new(CacheStore::open(config).await.unwrap());
    let coordinator = Arc::new(FetchCoordinator::new(Arc::clone(&cache), timeout));
    let orchestrator = Arc::new(RetrievalOrchestrator::new(
        Arc::clone(&coordinator),
        origin,
        metadata,
        ProgressiveDeliverer::new(1024),
    ));

    Relay {
        orchestrator,
        cache,
        coordinator,
    }
}

/// Drain a response body, surfacing a mid-stream error
pub async fn collect(body: ResponseBody) -> io::Result<Vec<u8>> {
    let mut rx = match body {
        ResponseBody::Empty => return Ok(Vec::new()),
        ResponseBody::Stream(rx) => rx,
    };

    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Number of artifact files in the scratch directory
pub fn artifact_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0)
}

/// Wait until the in-flight fetch for `key`, if any, has finished
pub async fn settle(relay: &Relay, key: &ContentKey) {
    if let Some(task) = relay.coordinator.pending(key).await {
        let _ = task.wait().await;
    }
}
