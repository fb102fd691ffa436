//! Cache store implementation
//!
//! Bounded index from content key to a complete on-disk artifact, with LRU
//! eviction over capacity and TTL eviction by age.
//!
//! Entries hold their artifact through `Arc<ArtifactFile>`. Removing an entry
//! only drops the index's reference; the file itself goes away when the last
//! reader that opened it is done.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactFile, ARTIFACT_EXTENSION};
use super::CacheConfig;
use crate::types::ContentKey;

/// A complete, readable object in the cache
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: ContentKey,
    pub artifact: Arc<ArtifactFile>,
    pub size: u64,
    /// When the entry was registered; TTL counts from here
    pub created_at: Instant,
    /// Last lookup or touch
    pub last_accessed: Instant,
    /// Wall-clock registration time, for ETag and Last-Modified
    pub modified_at: SystemTime,
    access_seq: u64,
}

impl CacheEntry {
    /// ETag derived from size and modification time
    pub fn etag(&self) -> String {
        let millis = self
            .modified_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("\"{:x}-{:x}\"", self.size, millis)
    }

    /// `Last-Modified` header value
    pub fn last_modified(&self) -> String {
        let datetime: DateTime<Utc> = self.modified_at.into();
        datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// What one eviction sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

/// Disk-backed content cache index
pub struct CacheStore {
    entries: DashMap<ContentKey, CacheEntry>,
    config: CacheConfig,
    access_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStore {
    /// Prepare the scratch directory and create an empty store.
    ///
    /// Artifacts left behind by a previous process are deleted; the cache
    /// never survives a restart.
    pub async fn open(config: CacheConfig) -> io::Result<Self> {
        tokio::fs::create_dir_all(&config.scratch_dir).await?;
        let purged = purge_scratch_dir(&config).await?;

        info!(
            scratch_dir = %config.scratch_dir.display(),
            max_entries = config.max_entries,
            ttl_secs = config.ttl.as_secs(),
            purged = purged,
            "Cache store opened"
        );

        Ok(Self {
            entries: DashMap::new(),
            config,
            access_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a live entry and mark it as recently used.
    ///
    /// An entry past its TTL counts as absent and is dropped on the spot.
    pub fn lookup(&self, key: &ContentKey) -> Option<CacheEntry> {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(self.config.ttl, now) {
                entry.last_accessed = now;
                entry.access_seq = self.next_seq();
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.short(), "Cache hit");
                return Some(entry.clone());
            }
            // Release the shard lock before removing
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired(self.config.ttl, now))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.short(), "Cache entry expired on lookup");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = key.short(), "Cache miss");
        None
    }

    /// Check for a live entry without touching recency or counters.
    pub fn contains(&self, key: &ContentKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|e| !e.is_expired(self.config.ttl, now))
    }

    /// Register a complete artifact. Replaces any previous entry for the key.
    pub fn insert(&self, key: ContentKey, artifact: Arc<ArtifactFile>, size: u64) -> CacheEntry {
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            artifact,
            size,
            created_at: now,
            last_accessed: now,
            modified_at: SystemTime::now(),
            access_seq: self.next_seq(),
        };

        debug!(key = key.short(), size = size, "Cache insert");
        self.entries.insert(key, entry.clone());

        self.evict_over_capacity();
        entry
    }

    /// Mark an entry as recently used. Returns false if it is not cached.
    pub fn touch(&self, key: &ContentKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_accessed = Instant::now();
                entry.access_seq = self.next_seq();
                true
            }
            None => false,
        }
    }

    /// Remove `entry` only if it is still the one registered for its key.
    pub fn invalidate(&self, entry: &CacheEntry) -> bool {
        self.entries
            .remove_if(&entry.key, |_, e| Arc::ptr_eq(&e.artifact, &entry.artifact))
            .is_some()
    }

    /// Drop expired entries, then least recently used ones over capacity.
    pub fn eviction_sweep(&self) -> SweepReport {
        let now = Instant::now();
        let ttl = self.config.ttl;

        let expired: Vec<ContentKey> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(ttl, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, e| e.is_expired(ttl, now))
                .is_some()
            {
                report.expired += 1;
            }
        }
        self.expirations
            .fetch_add(report.expired as u64, Ordering::Relaxed);

        report.evicted = self.evict_over_capacity();

        if report.expired > 0 || report.evicted > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                entries = self.entries.len(),
                "Eviction sweep completed"
            );
        }
        report
    }

    /// Evict least recently used entries until within capacity
    fn evict_over_capacity(&self) -> usize {
        let max = self.config.max_entries;
        if self.entries.len() <= max {
            return 0;
        }

        let mut by_recency: Vec<(ContentKey, u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.access_seq))
            .collect();
        by_recency.sort_by_key(|(_, seq)| *seq);

        let excess = by_recency.len().saturating_sub(max);
        let mut evicted = 0;
        for (key, seq) in by_recency.into_iter().take(excess) {
            // Skip entries touched since the snapshot
            if self.entries.remove_if(&key, |_, e| e.access_seq == seq).is_some() {
                debug!(key = key.short(), "Evicted least recently used entry");
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

async fn purge_scratch_dir(config: &CacheConfig) -> io::Result<usize> {
    let mut dir = tokio::fs::read_dir(&config.scratch_dir).await?;
    let mut purged = 0;

    while let Some(item) = dir.next_entry().await? {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => purged += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge stale artifact"),
        }
    }
    Ok(purged)
}

/// Spawn a background task that periodically runs the eviction sweep
pub fn spawn_sweep_task(store: Arc<CacheStore>) -> JoinHandle<()> {
    let interval = store.config.sweep_interval;

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let report = store.eviction_sweep();
            let stats = store.stats();
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                entries = stats.entries,
                hit_rate = format!("{:.1}%", stats.hit_rate()),
                "Cache sweep completed"
            );
        }
    });

    info!(interval_secs = interval.as_secs(), "Cache sweep task started");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn key(n: u8) -> ContentKey {
        ContentKey::parse(&format!("0x{}", hex::encode([n; 32]))).unwrap()
    }

    async fn store(dir: &Path, max_entries: usize, ttl: Duration) -> CacheStore {
        CacheStore::open(CacheConfig {
            max_entries,
            ttl,
            sweep_interval: Duration::from_secs(60),
            scratch_dir: dir.to_path_buf(),
        })
        .await
        .unwrap()
    }

    fn artifact(dir: &Path, name: &str, body: &[u8]) -> Arc<ArtifactFile> {
        let path = dir.join(format!("{}.{}", name, ARTIFACT_EXTENSION));
        std::fs::write(&path, body).unwrap();
        ArtifactFile::adopt(path)
    }

    #[tokio::test]
    async fn test_lookup_insert_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 4, Duration::from_secs(60)).await;

        assert!(cache.lookup(&key(1)).is_none());

        cache.insert(key(1), artifact(dir.path(), "one", b"hello"), 5);
        let entry = cache.lookup(&key(1)).expect("Should have entry");
        assert_eq!(entry.size, 5);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_deletes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 2, Duration::from_secs(60)).await;

        let a = artifact(dir.path(), "a", b"a");
        let b = artifact(dir.path(), "b", b"b");
        let c = artifact(dir.path(), "c", b"c");
        let b_path = b.path().to_path_buf();

        cache.insert(key(1), a, 1);
        cache.insert(key(2), b, 1);
        assert!(cache.lookup(&key(1)).is_some());
        cache.insert(key(3), c, 1);

        assert!(cache.lookup(&key(2)).is_none());
        assert!(cache.lookup(&key(1)).is_some());
        assert!(cache.lookup(&key(3)).is_some());
        assert!(!b_path.exists(), "evicted artifact should be deleted");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_touch_counts_as_use() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 2, Duration::from_secs(60)).await;

        cache.insert(key(1), artifact(dir.path(), "a", b"a"), 1);
        cache.insert(key(2), artifact(dir.path(), "b", b"b"), 1);
        assert!(cache.touch(&key(1)));
        assert!(!cache.touch(&key(9)));
        cache.insert(key(3), artifact(dir.path(), "c", b"c"), 1);

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
    }

    #[tokio::test]
    async fn test_evicted_artifact_survives_active_reader() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 1, Duration::from_secs(60)).await;

        cache.insert(key(1), artifact(dir.path(), "a", b"aaaa"), 4);
        let held = cache.lookup(&key(1)).unwrap();
        let path = held.artifact.path().to_path_buf();

        cache.insert(key(2), artifact(dir.path(), "b", b"b"), 1);
        assert!(!cache.contains(&key(1)));
        assert!(path.exists(), "reader still holds the evicted artifact");

        drop(held);
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_not_reset_by_access() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 8, Duration::from_secs(10)).await;

        let a = artifact(dir.path(), "a", b"a");
        let path = a.path().to_path_buf();
        cache.insert(key(1), a, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.lookup(&key(1)).is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = cache.eviction_sweep();
        assert_eq!(report.expired, 1);
        assert!(cache.lookup(&key(1)).is_none());
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_drops_expired_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 8, Duration::from_secs(10)).await;

        cache.insert(key(1), artifact(dir.path(), "a", b"a"), 1);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(cache.lookup(&key(1)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_open_purges_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stale.blob"), b"old").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let cache = store(dir.path(), 4, Duration::from_secs(60)).await;
        assert!(cache.is_empty());
        assert!(!dir.path().join("stale.blob").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_etag_and_last_modified() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 4, Duration::from_secs(60)).await;
        let mut entry = cache.insert(key(1), artifact(dir.path(), "a", b"abc"), 255);

        entry.modified_at = UNIX_EPOCH + Duration::from_millis(4096);
        assert_eq!(entry.etag(), "\"ff-1000\"");
        assert_eq!(entry.last_modified(), "Thu, 01 Jan 1970 00:00:04 GMT");
    }

    #[tokio::test]
    async fn test_invalidate_only_current_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = store(dir.path(), 4, Duration::from_secs(60)).await;
        cache.insert(key(2), artifact(dir.path(), "b", b"b"), 1);

        // A stale handle does not remove a newer entry for the same key
        let stale = cache.lookup(&key(2)).unwrap();
        cache.insert(key(2), artifact(dir.path(), "b2", b"b2"), 2);
        assert!(!cache.invalidate(&stale));
        let fresh = cache.lookup(&key(2)).unwrap();
        assert!(cache.invalidate(&fresh));
        assert!(!cache.contains(&key(2)));
        assert!(cache.is_empty());
    }
}
