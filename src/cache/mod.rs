//! Caching layer for blob-relay
//!
//! Keeps fetched objects on local disk so repeated requests never reach the
//! origin, and makes sure concurrent requests for an uncached key share one
//! origin fetch.
//!
//! ## Pieces
//!
//! - [`artifact`]: scratch files, growth publication and reference-counted
//!   deletion
//! - [`store`]: the bounded key index with LRU and TTL eviction
//! - [`coordinator`]: single-flight execution of origin fetches

pub mod artifact;
pub mod coordinator;
pub mod store;

pub use artifact::{ArtifactFile, ArtifactReader, ArtifactWriter, Growth, PartialArtifact};
pub use coordinator::{FetchCoordinator, FetchFn, FetchState, FetchTask, Obtained};
pub use store::{spawn_sweep_task, CacheEntry, CacheStats, CacheStore, SweepReport};

use std::path::PathBuf;
use std::time::Duration;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub max_entries: usize,
    /// Entries older than this are evicted regardless of use
    pub ttl: Duration,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
    /// Directory holding artifact files
    pub scratch_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl: Duration::from_secs(3600),           // 1 hour
            sweep_interval: Duration::from_secs(60),  // Sweep every minute
            scratch_dir: PathBuf::from("./scratch"),
        }
    }
}

impl CacheConfig {
    /// Default settings rooted at a different scratch directory
    pub fn with_scratch_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: dir.into(),
            ..Self::default()
        }
    }
}
