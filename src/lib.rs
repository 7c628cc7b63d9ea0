//! # nzb-streamer
//!
//! On-demand streaming gateway for content stored across Usenet
//! newsgroups: given an NZB index file describing a payload split into
//! many yEnc-encoded segments, it produces a seekable byte stream of a
//! caller-selected file inside that payload — including files nested
//! inside (possibly multi-volume) RAR or 7z archives — without ever
//! materialising the payload on disk.
//!
//! ## Design
//!
//! - Segments are fetched by a parallel worker pool but delivered in
//!   strict order, under a byte-budget backpressure scheme
//!   ([`stream::SegmentsStream`]).
//! - A file is exposed as a seekable reader; byte offsets map to
//!   segments through an interpolation search over observed decoded
//!   ranges ([`stream::FileStream`]).
//! - Archive decoders read through a virtual filesystem over the NZB
//!   ([`vfs::NzbFs`]), so RAR/7z entries — stored, non-solid ones —
//!   stream as raw byte ranges, recursively for nested archives.
//! - The NNTP connection pool is an external collaborator behind the
//!   [`pool::SegmentFetcher`] trait: fetch one article body by
//!   message-id, failover included.
//!
//! ## Quick start
//!
//! ```no_run
//! use nzb_streamer::{Config, Nzb, Pool, SegmentFetcher, StreamOptions};
//! use std::sync::Arc;
//!
//! # async fn example(fetcher: Arc<dyn SegmentFetcher>) -> nzb_streamer::Result<()> {
//! let config = Config::default();
//! let pool = Pool::new(fetcher, &config);
//!
//! let nzb = Arc::new(Nzb::parse(&std::fs::read("movie.nzb")?)?);
//! let path = vec!["Movie.rar".to_string(), "video.mkv".to_string()];
//! let mut stream = pool
//!     .stream_by_content_path(&nzb, &path, &StreamOptions::default())
//!     .await?;
//!
//! use tokio::io::{AsyncReadExt, AsyncSeekExt};
//! stream.seek(std::io::SeekFrom::Start(1024)).await?;
//! let mut buf = vec![0u8; 4096];
//! stream.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API server module
pub mod api;
/// Archive adapters (RAR, 7z) and volume grouping
pub mod archive;
/// Configuration types
pub mod config;
/// Persistence for NZB records
pub mod db;
/// File-type detection and MIME mapping
pub mod detect;
/// Error types
pub mod error;
/// NZB file retrieval and caching
pub mod fetch;
/// NZB document model and parser
pub mod nzb;
/// Segment fetch layer and cache
pub mod pool;
/// Content-path resolution and the public stream API
pub mod resolver;
/// Ordered and seekable byte streams over segments
pub mod stream;
/// Core shared types
pub mod types;
/// Virtual filesystems backing the archive decoders
pub mod vfs;
/// yEnc encoding and decoding
pub mod yenc;

// Re-export the common surface
pub use config::Config;
pub use error::{ApiError, Error, Result, ToHttpStatus};
pub use fetch::{NzbFetcher, hash_link};
pub use nzb::{Nzb, NzbFile, NzbSegment};
pub use pool::{Pool, SegmentFetcher};
pub use resolver::{NzbContent, Stream, StreamOptions};
pub use stream::{FileStream, SegmentsStream};
pub use types::{ByteRange, ContentFile, FileType, SegmentData};
