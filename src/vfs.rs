//! Read-only virtual filesystems backing the archive decoders
//!
//! Archive decoders expect to open files by name and read them with
//! seeks. [`NzbFs`] presents an NZB document as a flat directory of its
//! files, each opened as a [`FileStream`]; [`ArchiveFs`] presents a list
//! of already-listed archive entries the same way, which is what makes
//! nested archive opens possible.
//!
//! Both consult an alias map (`alias → canonical name`) before failing a
//! lookup: NZB filenames are often placeholders ("spam.001") while the
//! archive header declares the real volume names, and the persisted
//! content-file record carries that mapping.

use crate::archive::ArchiveFile;
use crate::error::{Error, Result};
use crate::nzb::{Nzb, NzbFile};
use crate::pool::Pool;
use crate::stream::FileStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle returned by virtual filesystem opens: a seekable reader that
/// knows its own decoded size
pub trait VfsFile: AsyncRead + AsyncSeek + Send + Unpin {
    /// Total size of the underlying file in bytes
    fn size(&self) -> u64;
}

impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsFile").field("size", &self.size()).finish()
    }
}

impl VfsFile for FileStream {
    fn size(&self) -> u64 {
        FileStream::size(self)
    }
}

/// File metadata returned by `stat`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Decoded size in bytes
    pub size: u64,
}

/// Read-only filesystem view used by archive adapters
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Open a file by name (case-insensitive, aliases consulted)
    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>>;

    /// File metadata by name
    async fn stat(&self, name: &str) -> Result<FileStat>;

    /// Canonical names of all files in this view
    fn names(&self) -> Vec<String>;
}

/// Flat view over the files of an NZB document
pub struct NzbFs {
    nzb: Arc<Nzb>,
    pool: Pool,
    buffer_size: u64,
    aliases: HashMap<String, String>,
    cancel: CancellationToken,
}

impl NzbFs {
    /// Create a view over `nzb`; streams opened through it are children
    /// of `parent` for cancellation
    pub fn new(
        nzb: Arc<Nzb>,
        pool: Pool,
        buffer_size: u64,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            nzb,
            pool,
            buffer_size,
            aliases: HashMap::new(),
            cancel: parent.child_token(),
        }
    }

    /// Install the alias map (`alias → canonical name`)
    pub fn set_aliases(&mut self, aliases: HashMap<String, String>) {
        self.aliases = aliases
            .into_iter()
            .map(|(alias, canonical)| (alias.to_ascii_lowercase(), canonical))
            .collect();
    }

    /// Cancel every stream opened through this view
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn resolve(&self, name: &str) -> Option<&NzbFile> {
        let name = name.trim_matches('/');
        if let Some(file) = self.nzb.find_file(name) {
            return Some(file);
        }
        let canonical = self.aliases.get(&name.to_ascii_lowercase())?;
        self.nzb.find_file(canonical)
    }
}

#[async_trait]
impl Vfs for NzbFs {
    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let file = self
            .resolve(name)
            .ok_or_else(|| Error::NotFound(format!("no file matching '{name}' in NZB")))?;

        trace!(requested = name, resolved = file.name(), "nzb fs open");

        let stream = FileStream::open(
            self.pool.clone(),
            Arc::new(file.clone()),
            self.buffer_size,
            &self.cancel,
        )
        .await?;
        Ok(Box::new(stream))
    }

    async fn stat(&self, name: &str) -> Result<FileStat> {
        let file = self
            .resolve(name)
            .ok_or_else(|| Error::NotFound(format!("no file matching '{name}' in NZB")))?;
        // The declared size is encoded; the first segment carries the
        // authoritative decoded size (and is almost always cached).
        let first = self.pool.fetch_first_segment(file).await?;
        Ok(FileStat {
            size: first.file_size,
        })
    }

    fn names(&self) -> Vec<String> {
        self.nzb
            .files
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }
}

/// View over a list of archive entries opened through a parent archive
///
/// Lets the resolver hand multi-volume inner archives to a fresh adapter
/// as if the volumes were ordinary files.
pub struct ArchiveFs {
    entries: Vec<Arc<dyn ArchiveFile>>,
}

impl ArchiveFs {
    /// Create a view over already-listed archive entries
    pub fn new(entries: Vec<Arc<dyn ArchiveFile>>) -> Self {
        Self { entries }
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn ArchiveFile>> {
        let name = name.trim_matches('/');
        self.entries
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
    }
}

#[async_trait]
impl Vfs for ArchiveFs {
    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>> {
        let entry = self
            .find(name)
            .ok_or_else(|| Error::NotFound(format!("no entry matching '{name}' in archive")))?;
        entry.open().await
    }

    async fn stat(&self, name: &str) -> Result<FileStat> {
        let entry = self
            .find(name)
            .ok_or_else(|| Error::NotFound(format!("no entry matching '{name}' in archive")))?;
        Ok(FileStat { size: entry.size() })
    }

    fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }
}
