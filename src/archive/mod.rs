//! Archive adapters over the virtual filesystem
//!
//! RAR and 7z decoding is adapted to segment-addressed reads: decoders
//! see [`crate::vfs::Vfs`] handles instead of local files. Only stored
//! (uncompressed), non-solid, unencrypted entries are streamable, which
//! reduces entry reads to raw byte ranges — possibly spanning several
//! volumes — over the underlying handles.

pub mod rar;
pub mod sevenz;
pub mod volume;

use crate::detect;
use crate::error::Result;
use crate::types::FileType;
use crate::vfs::VfsFile;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf, SeekFrom};

/// One entry listed inside an archive
#[async_trait]
pub trait ArchiveFile: Send + Sync {
    /// Entry name as declared by the archive header
    fn name(&self) -> &str;

    /// Unpacked size in bytes
    fn size(&self) -> u64;

    /// Packed size in bytes (equal to `size` for stored entries)
    fn packed_size(&self) -> u64;

    /// Volume number of the volume this entry starts in, -1 if unknown
    fn volume(&self) -> i32;

    /// Container classification of the entry itself, by extension
    fn file_type(&self) -> FileType {
        detect::detect_archive_type_by_extension(self.name())
    }

    /// Whether the entry can be streamed (stored, not solid, not encrypted)
    fn is_streamable(&self) -> bool;

    /// Open a seekable reader over the entry's unpacked bytes
    async fn open(&self) -> Result<Box<dyn VfsFile>>;
}

/// An opened archive container
#[async_trait]
pub trait Archive: Send + Sync {
    /// Parse the archive header; a second call is a no-op
    ///
    /// Multi-volume archives open subsequent volumes through the virtual
    /// filesystem they were constructed over.
    async fn open(&mut self, password: &str) -> Result<()>;

    /// Whether the archive as a whole can be streamed
    ///
    /// False for solid archives and for archives whose headers could not
    /// be read (encrypted headers, malformed data).
    fn is_streamable(&self) -> bool;

    /// Entries listed by the archive header
    fn files(&self) -> Result<Vec<Arc<dyn ArchiveFile>>>;

    /// Close the decoder and the underlying virtual filesystem
    fn close(&mut self) -> Result<()>;
}

/// A window `[start, start+len)` over an inner handle, itself seekable
///
/// The inner handle is repositioned lazily, on the first read after
/// construction or a seek.
pub struct RangeReader {
    inner: Box<dyn VfsFile>,
    start: u64,
    len: u64,
    pos: u64,
    state: RangeState,
}

enum RangeState {
    NeedSeek,
    Seeking,
    Ready,
}

impl RangeReader {
    /// Window `[start, start+len)` over `inner`
    pub fn new(inner: Box<dyn VfsFile>, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            len,
            pos: 0,
            state: RangeState::NeedSeek,
        }
    }

    /// Current logical position within the window
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl AsyncRead for RangeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos >= this.len {
                return Poll::Ready(Ok(())); // window exhausted
            }

            match this.state {
                RangeState::NeedSeek => {
                    Pin::new(&mut this.inner)
                        .start_seek(SeekFrom::Start(this.start + this.pos))?;
                    this.state = RangeState::Seeking;
                }
                RangeState::Seeking => match Pin::new(&mut this.inner).poll_complete(cx) {
                    Poll::Ready(Ok(_)) => this.state = RangeState::Ready,
                    Poll::Ready(Err(err)) => {
                        this.state = RangeState::NeedSeek;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                RangeState::Ready => {
                    let max = (this.len - this.pos).min(buf.remaining() as u64) as usize;
                    if max == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let dst = buf.initialize_unfilled_to(max);
                    let mut sub = ReadBuf::new(dst);
                    return match Pin::new(&mut this.inner).poll_read(cx, &mut sub) {
                        Poll::Ready(Ok(())) => {
                            let n = sub.filled().len();
                            buf.advance(n);
                            this.pos += n as u64;
                            Poll::Ready(Ok(()))
                        }
                        other => other,
                    };
                }
            }
        }
    }
}

impl AsyncSeek for RangeReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let new_pos = match position {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => this.pos as i64 + offset,
            SeekFrom::End(offset) => this.len as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("negative position: {new_pos}"),
            ));
        }
        let new_pos = (new_pos as u64).min(this.len);
        if new_pos != this.pos {
            this.pos = new_pos;
            this.state = RangeState::NeedSeek;
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

impl VfsFile for RangeReader {
    fn size(&self) -> u64 {
        self.len
    }
}

/// Concatenation of several [`RangeReader`] windows into one seekable
/// stream; multi-volume entry data and raw volume splits both reduce to
/// this.
pub struct ChainReader {
    parts: Vec<RangeReader>,
    offsets: Vec<u64>,
    total: u64,
    pos: u64,
    active: usize,
}

impl ChainReader {
    /// Concatenate `parts` in order
    pub fn new(parts: Vec<RangeReader>) -> Self {
        let mut offsets = Vec::with_capacity(parts.len());
        let mut total = 0u64;
        for part in &parts {
            offsets.push(total);
            total += part.size();
        }
        Self {
            parts,
            offsets,
            total,
            pos: 0,
            active: 0,
        }
    }

    fn part_for(&self, pos: u64) -> usize {
        match self.offsets.binary_search(&pos) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        }
    }
}

impl AsyncRead for ChainReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos >= this.total || this.active >= this.parts.len() {
                return Poll::Ready(Ok(())); // EOF
            }

            let local = this.pos - this.offsets[this.active];
            let part = &mut this.parts[this.active];

            if local >= part.size() {
                this.active += 1;
                continue;
            }
            if part.position() != local {
                Pin::new(&mut *part).start_seek(SeekFrom::Start(local))?;
            }

            let before = buf.filled().len();
            match Pin::new(part).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len() - before;
                    if n == 0 {
                        this.active += 1;
                        continue;
                    }
                    this.pos += n as u64;
                    return Poll::Ready(Ok(()));
                }
                other => return other,
            }
        }
    }
}

impl AsyncSeek for ChainReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let new_pos = match position {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => this.pos as i64 + offset,
            SeekFrom::End(offset) => this.total as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("negative position: {new_pos}"),
            ));
        }
        this.pos = (new_pos as u64).min(this.total);
        this.active = this.part_for(this.pos);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

impl VfsFile for ChainReader {
    fn size(&self) -> u64 {
        self.total
    }
}
