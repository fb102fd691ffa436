//! Fetch Coordinator - single-flight origin fetches
//!
//! At most one origin fetch runs per content key. The first request for an
//! uncached key starts a [`FetchTask`]; every request that arrives while it
//! is pending joins the same task and can either stream from its growing
//! artifact or wait for the outcome.
//!
//! ## Lifecycle
//!
//! ```text
//! obtain(key) ──► cached?  ──yes──► Obtained::Cached(entry)
//!                   │ no
//!                   ▼
//!             task pending? ──yes──► Obtained::Joined(task)
//!                   │ no
//!                   ▼
//!             spawn fetch job ─────► Obtained::Started(task)
//!                   │
//!                   ▼
//!   success: register in CacheStore, then publish Succeeded
//!   failure: delete partial artifact, then publish Failed
//!   either:  remove task from the table
//! ```
//!
//! The job runs on its own tokio task, so a client disconnecting never
//! cancels a fetch that other clients may be waiting on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::artifact::{ArtifactWriter, Growth, PartialArtifact};
use super::store::{CacheEntry, CacheStore};
use crate::types::{ContentKey, FetchError};

/// One invocation of the origin's fetch primitive.
///
/// Receives the writer for the new artifact and hands it back once the
/// origin has written everything it is going to write.
pub type FetchFn =
    Box<dyn FnOnce(ArtifactWriter) -> BoxFuture<'static, Result<ArtifactWriter, FetchError>> + Send>;

// =============================================================================
// Fetch Task
// =============================================================================

/// Observable state of a fetch
#[derive(Debug, Clone)]
pub enum FetchState {
    Pending,
    Succeeded(CacheEntry),
    Failed(FetchError),
}

impl FetchState {
    pub fn is_pending(&self) -> bool {
        matches!(self, FetchState::Pending)
    }

    /// Final outcome, or `None` while pending
    pub fn outcome(&self) -> Option<Result<CacheEntry, FetchError>> {
        match self {
            FetchState::Pending => None,
            FetchState::Succeeded(entry) => Some(Ok(entry.clone())),
            FetchState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

/// A single origin fetch shared by every request for its key
#[derive(Debug)]
pub struct FetchTask {
    id: u64,
    key: ContentKey,
    artifact: PartialArtifact,
    state: watch::Receiver<FetchState>,
    started_at: Instant,
}

impl FetchTask {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// The artifact the fetch is writing into
    pub fn artifact(&self) -> &PartialArtifact {
        &self.artifact
    }

    /// Current state snapshot
    pub fn state(&self) -> FetchState {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    /// Independent receiver for waiting on state transitions
    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.state.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the fetch to finish.
    pub async fn wait(&self) -> Result<CacheEntry, FetchError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map_err(|_| FetchError::Aborted("fetch ended without a result".to_string()))?;
        state
            .outcome()
            .unwrap_or_else(|| Err(FetchError::Aborted("fetch ended without a result".to_string())))
    }

    /// Wait until the object's total size is known.
    ///
    /// Resolves as soon as the origin declares a length, or when the fetch
    /// completes if it never does.
    pub async fn wait_for_size(&self) -> Result<u64, FetchError> {
        let mut growth = self.artifact.subscribe();
        let mut state = self.state.clone();

        loop {
            let outcome = state.borrow_and_update().outcome();
            if let Some(outcome) = outcome {
                return outcome.map(|entry| entry.size);
            }
            let known = growth.borrow_and_update().known_len();
            if let Some(len) = known {
                return Ok(len);
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return self.wait().await.map(|entry| entry.size);
                    }
                }
                changed = growth.changed() => {
                    if changed.is_err() {
                        // Writer is gone; only the final state can tell us more
                        return self.wait().await.map(|entry| entry.size);
                    }
                }
            }
        }
    }

    /// Wait until the first bytes are readable or the fetch has finished.
    ///
    /// A fetch that fails before producing anything reports its error here,
    /// so callers can still answer with an error status.
    pub async fn wait_for_data(&self) -> Result<(), FetchError> {
        let mut growth = self.artifact.subscribe();
        let mut state = self.state.clone();

        loop {
            let outcome = state.borrow_and_update().outcome();
            if let Some(outcome) = outcome {
                return outcome.map(|_| ());
            }
            let current = *growth.borrow_and_update();
            if current.flushed_len > 0 || current.sealed {
                return Ok(());
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return self.wait().await.map(|_| ());
                    }
                }
                changed = growth.changed() => {
                    if changed.is_err() {
                        return self.wait().await.map(|_| ());
                    }
                }
            }
        }
    }
}

/// Result of [`FetchCoordinator::obtain`]
#[derive(Debug, Clone)]
pub enum Obtained {
    /// The key was already cached
    Cached(CacheEntry),
    /// A fetch was already pending; this caller joined it
    Joined(Arc<FetchTask>),
    /// This caller started a new fetch
    Started(Arc<FetchTask>),
}

// =============================================================================
// Coordinator
// =============================================================================

/// Single-flight coordinator for origin fetches
pub struct FetchCoordinator {
    cache: Arc<CacheStore>,
    scratch_dir: PathBuf,
    timeout: Option<Duration>,
    /// Pending fetches (key -> task)
    tasks: Arc<RwLock<HashMap<ContentKey, Arc<FetchTask>>>>,
    next_id: AtomicU64,
    fetches_started: AtomicU64,
}

impl FetchCoordinator {
    /// Create a coordinator writing artifacts into the cache's scratch directory
    pub fn new(cache: Arc<CacheStore>, timeout: Option<Duration>) -> Self {
        let scratch_dir = cache.config().scratch_dir.clone();
        info!(
            timeout = ?timeout,
            "FetchCoordinator initialized"
        );

        Self {
            cache,
            scratch_dir,
            timeout,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            fetches_started: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Join the pending fetch for `key`, or start one with `fetch`.
    ///
    /// `fetch` is invoked at most once, and only when this call starts the
    /// fetch. A key that became cached while waiting for the table lock is
    /// returned as [`Obtained::Cached`] instead.
    pub async fn obtain(&self, key: &ContentKey, fetch: FetchFn) -> Obtained {
        let mut tasks = self.tasks.write().await;

        if let Some(task) = tasks.get(key) {
            if task.is_pending() {
                debug!(key = key.short(), "Joining in-flight fetch");
                return Obtained::Joined(Arc::clone(task));
            }
        }

        // A fetch may have completed between the caller's lookup and now
        if self.cache.contains(key) {
            if let Some(entry) = self.cache.lookup(key) {
                return Obtained::Cached(entry);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (artifact, growth_tx) = PartialArtifact::prepare(&self.scratch_dir, key);
        let (state_tx, state_rx) = watch::channel(FetchState::Pending);

        let task = Arc::new(FetchTask {
            id,
            key: key.clone(),
            artifact,
            state: state_rx,
            started_at: Instant::now(),
        });
        tasks.insert(key.clone(), Arc::clone(&task));
        drop(tasks);

        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        debug!(key = key.short(), task_id = id, "Starting origin fetch");

        tokio::spawn(run_fetch(
            Arc::clone(&task),
            fetch,
            growth_tx,
            state_tx,
            Arc::clone(&self.cache),
            Arc::clone(&self.tasks),
            self.timeout,
        ));

        Obtained::Started(task)
    }

    /// The pending fetch for `key`, if any
    pub async fn pending(&self, key: &ContentKey) -> Option<Arc<FetchTask>> {
        let tasks = self.tasks.read().await;
        tasks.get(key).filter(|t| t.is_pending()).cloned()
    }

    /// Number of fetches currently in flight
    pub async fn in_flight_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Total origin fetches started since startup
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::Relaxed)
    }
}

/// Drive one fetch to completion and publish its outcome.
async fn run_fetch(
    task: Arc<FetchTask>,
    fetch: FetchFn,
    growth_tx: watch::Sender<Growth>,
    state_tx: watch::Sender<FetchState>,
    cache: Arc<CacheStore>,
    tasks: Arc<RwLock<HashMap<ContentKey, Arc<FetchTask>>>>,
    timeout: Option<Duration>,
) {
    let key = task.key.clone();
    let artifact = Arc::clone(task.artifact.file());

    // Run the origin call on its own task so a panic surfaces as a JoinError
    let job = tokio::spawn(async move {
        let writer = ArtifactWriter::create(&artifact, growth_tx).await?;
        let writer = fetch(writer).await?;
        if let Some(declared) = writer.declared_len() {
            if declared != writer.written() {
                return Err(FetchError::Truncated {
                    declared,
                    received: writer.written(),
                });
            }
        }
        Ok::<u64, FetchError>(writer.finish().await?)
    });
    let abort = job.abort_handle();

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, job).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                Ok(Err(FetchError::Timeout(limit)))
            }
        },
        None => job.await,
    };
    let result = joined.unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())));

    let state = match result {
        Ok(size) => {
            let entry = cache.insert(key.clone(), Arc::clone(task.artifact.file()), size);
            info!(
                key = key.short(),
                size = size,
                duration_ms = task.elapsed().as_millis() as u64,
                "Origin fetch completed"
            );
            FetchState::Succeeded(entry)
        }
        Err(err) => {
            task.artifact.file().discard();
            warn!(key = key.short(), error = %err, "Origin fetch failed");
            FetchState::Failed(err)
        }
    };

    // Waiters already hold the task; publishing does not depend on the table
    state_tx.send_replace(state);

    let mut tasks = tasks.write().await;
    if tasks.get(&key).is_some_and(|t| t.id == task.id) {
        tasks.remove(&key);
    }
}
