//! Segment fetch layer
//!
//! The NNTP connection pool itself is an external collaborator; this crate
//! only depends on its one primitive, expressed as [`SegmentFetcher`]:
//! fetch one raw article body by message-id, trying the given newsgroups,
//! with provider failover handled inside the pool.
//!
//! [`Pool`] layers the streaming engine's needs on top of that primitive:
//! yEnc decoding, derivation of the decoded byte range each segment
//! occupies within its file, and the shared segment cache.

pub mod cache;

pub use cache::SegmentCache;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nzb::{NzbFile, NzbSegment};
use crate::types::{ByteRange, SegmentData};
use crate::yenc;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// The NNTP pool's fetch primitive
///
/// Implementations fetch the raw (yEnc-encoded) body of one article.
/// Retry and per-provider failover are the implementation's concern;
/// failures that survive it should surface as [`Error::Provider`].
#[async_trait]
pub trait SegmentFetcher: Send + Sync + 'static {
    /// Fetch the raw article body for `message_id`, trying `groups`
    async fn fetch(&self, message_id: &str, groups: &[String]) -> Result<Bytes>;
}

/// Segment access point shared by all streams
///
/// Owns the fetcher handle, the process-wide segment cache, and the
/// per-stream limits from configuration. Cloning is cheap (reference
/// counts and two integers) and every clone shares the same cache.
#[derive(Clone)]
pub struct Pool {
    fetcher: Arc<dyn SegmentFetcher>,
    cache: SegmentCache,
    max_connections_per_stream: usize,
    buffer_size: u64,
}

impl Pool {
    /// Create a pool over the given fetcher, sized by `config`
    pub fn new(fetcher: Arc<dyn SegmentFetcher>, config: &Config) -> Self {
        Self {
            fetcher,
            cache: SegmentCache::new(config.cache.segment_cache_size),
            max_connections_per_stream: config.stream.max_connections_per_stream.max(1),
            buffer_size: config.stream.buffer_size,
        }
    }

    /// Per-stream worker cap from configuration
    pub fn max_connections_per_stream(&self) -> usize {
        self.max_connections_per_stream
    }

    /// Default stream buffer budget from configuration
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Fetch and decode one segment
    ///
    /// Consults the cache first. The decoded byte range comes from the
    /// yEnc part metadata (`=ypart begin/end`); single-part articles span
    /// `[0, size)`. The range length is pinned to the decoded body length
    /// so ranges always tile exactly.
    pub async fn fetch_segment(
        &self,
        segment: &NzbSegment,
        groups: &[String],
    ) -> Result<SegmentData> {
        let message_id = segment.message_id.trim();

        if let Some(data) = self.cache.get(message_id) {
            trace!(message_id, "segment cache hit");
            return Ok(data);
        }

        let raw = self.fetcher.fetch(message_id, groups).await?;
        let decoded = yenc::decode(&raw)?;

        let size = decoded.data.len() as u64;
        let range = match decoded.part {
            Some(part) => {
                if part.begin == 0 {
                    return Err(Error::Yenc(format!(
                        "segment {message_id}: =ypart begin is 0 (must be 1-based)"
                    )));
                }
                ByteRange::from_size(part.begin - 1, size)
            }
            None => ByteRange::from_size(0, size),
        };

        let data = SegmentData {
            body: Bytes::from(decoded.data),
            range,
            file_size: decoded.header.size.max(range.end),
        };

        trace!(
            message_id,
            range = %data.range,
            file_size = data.file_size,
            "segment fetched"
        );

        self.cache.insert(message_id, data.clone());
        Ok(data)
    }

    /// Fetch the first segment of a file
    ///
    /// The first segment's `file_size` field is authoritative for the
    /// whole file, and its body prefix is what magic-byte type detection
    /// sniffs.
    pub async fn fetch_first_segment(&self, file: &NzbFile) -> Result<SegmentData> {
        let first = file
            .segments
            .first()
            .ok_or_else(|| Error::NotFound(format!("file '{}' has no segments", file.name())))?;
        self.fetch_segment(first, &file.groups).await
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted fetcher: serves yEnc-encoded bodies from a map
    struct MapFetcher {
        articles: std::collections::HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SegmentFetcher for MapFetcher {
        async fn fetch(&self, message_id: &str, _groups: &[String]) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.articles
                .get(message_id)
                .cloned()
                .map(Bytes::from)
                .ok_or_else(|| Error::Provider(format!("430 no such article: {message_id}")))
        }
    }

    fn pool_with(articles: Vec<(&str, Vec<u8>)>) -> (Pool, Arc<MapFetcher>) {
        let fetcher = Arc::new(MapFetcher {
            articles: articles
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let pool = Pool::new(fetcher.clone(), &Config::default());
        (pool, fetcher)
    }

    fn segment(number: u32, bytes: u64, message_id: &str) -> NzbSegment {
        NzbSegment {
            bytes,
            number,
            message_id: message_id.to_string(),
        }
    }

    #[tokio::test]
    async fn decodes_multipart_range() {
        let body = vec![7u8; 700];
        let article = yenc::encode(&body, "file.bin", Some((2, 3, 1001, 1700, 2400)));
        let (pool, _) = pool_with(vec![("seg2@test", article)]);

        let data = pool
            .fetch_segment(&segment(2, 900, "seg2@test"), &[])
            .await
            .unwrap();
        assert_eq!(data.range, ByteRange { start: 1000, end: 1700 });
        assert_eq!(data.file_size, 2400);
        assert_eq!(data.size(), 700);
    }

    #[tokio::test]
    async fn caches_by_message_id() {
        let article = yenc::encode(&[1, 2, 3], "file.bin", None);
        let (pool, fetcher) = pool_with(vec![("only@test", article)]);

        let seg = segment(1, 10, "only@test");
        pool.fetch_segment(&seg, &[]).await.unwrap();
        pool.fetch_segment(&seg, &[]).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trims_message_id_whitespace() {
        let article = yenc::encode(&[9u8; 10], "file.bin", None);
        let (pool, _) = pool_with(vec![("padded@test", article)]);

        let data = pool
            .fetch_segment(&segment(1, 20, " padded@test \n"), &[])
            .await
            .unwrap();
        assert_eq!(data.size(), 10);
    }

    #[tokio::test]
    async fn provider_error_surfaces() {
        let (pool, _) = pool_with(vec![]);
        let err = pool
            .fetch_segment(&segment(1, 10, "missing@test"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn first_segment_of_empty_file_is_not_found() {
        let (pool, _) = pool_with(vec![]);
        let file = NzbFile::default();
        let err = pool.fetch_first_segment(&file).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
