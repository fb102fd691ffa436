//! On-disk artifacts
//!
//! Every origin fetch lands in its own file in the scratch directory. The
//! file is named after the key plus a random suffix, so a new fetch of a key
//! never collides with an older artifact that a slow reader still holds.
//!
//! ## Lifetime
//!
//! [`ArtifactFile`] is shared through `Arc` by the cache index, the fetch
//! task and every active reader. The file is unlinked when the last `Arc` is
//! dropped, so evicting an entry never pulls the file out from under a
//! stream that is still reading it. A failed fetch unlinks immediately with
//! [`ArtifactFile::discard`].
//!
//! ## Growth
//!
//! While a fetch runs, [`ArtifactWriter`] publishes a [`Growth`] snapshot on
//! a `watch` channel after each chunk has been written *and flushed*.
//! Readers bound every read by `Growth::flushed_len`, so they never see a
//! half-written chunk, and they sleep on the channel instead of polling.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ContentKey;

/// File extension used for every artifact in the scratch directory
pub const ARTIFACT_EXTENSION: &str = "blob";

/// A file in the scratch directory, deleted when the last holder drops it
#[derive(Debug)]
pub struct ArtifactFile {
    path: PathBuf,
    removed: AtomicBool,
}

impl ArtifactFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: AtomicBool::new(false),
        }
    }

    /// Wrap an existing file; used for artifacts not produced by a writer.
    pub fn adopt(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(path.into()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the file now instead of waiting for the last holder.
    pub fn discard(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Blocking unlink: also runs from Drop, and the file must be gone on
        // return. Only directory metadata is touched.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Artifact removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove artifact"),
        }
    }
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        self.discard();
    }
}

/// What a reader may safely consume from a growing artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Growth {
    /// The file exists and can be opened
    pub created: bool,
    /// Bytes written and flushed; reads never go past this
    pub flushed_len: u64,
    /// Total length announced by the origin up front, if any
    pub declared_len: Option<u64>,
    /// No more bytes will be written
    pub sealed: bool,
}

impl Growth {
    /// Final size, once it is known from either a declaration or completion
    pub fn known_len(&self) -> Option<u64> {
        if self.sealed {
            Some(self.flushed_len)
        } else {
            self.declared_len
        }
    }
}

/// Read side of an artifact that may still be growing
#[derive(Debug, Clone)]
pub struct PartialArtifact {
    file: Arc<ArtifactFile>,
    growth: watch::Receiver<Growth>,
}

impl PartialArtifact {
    /// Reserve an artifact path for `key` without touching the disk.
    ///
    /// Returns the shared read side and the sender the writer publishes on.
    pub fn prepare(dir: &Path, key: &ContentKey) -> (Self, watch::Sender<Growth>) {
        let name = format!(
            "{}-{}.{}",
            key.hex(),
            Uuid::new_v4().simple(),
            ARTIFACT_EXTENSION
        );
        let file = Arc::new(ArtifactFile::new(dir.join(name)));
        let (tx, rx) = watch::channel(Growth::default());
        (Self { file, growth: rx }, tx)
    }

    /// View a finished file of `size` bytes as an already-sealed artifact.
    pub fn complete(file: Arc<ArtifactFile>, size: u64) -> Self {
        // The sender is dropped immediately; receivers keep the final value.
        let (_, rx) = watch::channel(Growth {
            created: true,
            flushed_len: size,
            declared_len: Some(size),
            sealed: true,
        });
        Self { file, growth: rx }
    }

    pub fn file(&self) -> &Arc<ArtifactFile> {
        &self.file
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Current growth snapshot
    pub fn growth(&self) -> Growth {
        *self.growth.borrow()
    }

    /// Independent receiver for waiting on growth
    pub fn subscribe(&self) -> watch::Receiver<Growth> {
        self.growth.clone()
    }
}

/// Write side of an artifact, handed to the origin's fetch primitive
#[derive(Debug)]
pub struct ArtifactWriter {
    file: File,
    written: u64,
    declared: Option<u64>,
    growth: watch::Sender<Growth>,
}

impl ArtifactWriter {
    /// Create the artifact file and announce it to readers.
    pub async fn create(artifact: &ArtifactFile, growth: watch::Sender<Growth>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(artifact.path())
            .await?;

        growth.send_modify(|g| g.created = true);

        Ok(Self {
            file,
            written: 0,
            declared: None,
            growth,
        })
    }

    /// Record the total length the origin announced before sending the body.
    pub fn declare_len(&mut self, len: u64) {
        self.declared = Some(len);
        self.growth.send_modify(|g| g.declared_len = Some(len));
    }

    /// Append a chunk and publish the new readable length once it is flushed.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.file.write_all(chunk).await?;
        self.file.flush().await?;
        self.written += chunk.len() as u64;

        let written = self.written;
        self.growth.send_modify(|g| g.flushed_len = written);
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn declared_len(&self) -> Option<u64> {
        self.declared
    }

    /// Sync the file and mark it sealed. Returns the final size.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.file.flush().await?;
        self.file.sync_data().await?;

        let written = self.written;
        self.growth.send_modify(|g| {
            g.flushed_len = written;
            g.declared_len = Some(written);
            g.sealed = true;
        });
        Ok(written)
    }
}

/// Sequential reader over an artifact, positioned at a byte offset
#[derive(Debug)]
pub struct ArtifactReader {
    pub(crate) file: File,
    pub(crate) position: u64,
    // Keeps the file alive for as long as this reader exists
    _artifact: Arc<ArtifactFile>,
}

impl ArtifactReader {
    /// Open `artifact` and seek to `offset`.
    pub async fn open(artifact: Arc<ArtifactFile>, offset: u64) -> io::Result<Self> {
        let mut file = File::open(artifact.path()).await?;
        if offset > 0 {
            file.seek(io::SeekFrom::Start(offset)).await?;
        }
        Ok(Self {
            file,
            position: offset,
            _artifact: artifact,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}
