//! Seekable stream over one NZB file
//!
//! Segments only declare their *encoded* size; the decoded byte range a
//! segment occupies is discovered by fetching it. Mapping a byte offset to
//! a segment therefore costs round trips, and the locator keeps them low
//! with an interpolation search over observed ranges: O(log log n) probes
//! on well-behaved (near-constant yEnc ratio) files.
//!
//! `Read`/`Seek` share a single position and an on-demand
//! [`SegmentsStream`] that is torn down and re-created whenever the
//! position moves, so they are not safe to call concurrently.
//! [`FileStream::read_at`] is stateless (it builds a private segments
//! stream per call) and is the only concurrent-safe entry point.

use crate::error::{Error, Result};
use crate::nzb::NzbFile;
use crate::pool::Pool;
use crate::stream::SegmentsStream;
use crate::types::ByteRange;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Shared, immutable facts about the file being streamed
struct FileInner {
    pool: Pool,
    file: Arc<NzbFile>,
    file_size: u64,
    avg_segment_size: u64,
    size_ratio: f64,
    buffer_size: u64,
    cancel: CancellationToken,
}

enum StreamState {
    /// No segments stream; one is created on the next read
    Idle,
    /// Segments stream creation (locator probes included) in flight
    Opening(Pin<Box<dyn Future<Output = Result<SegmentsStream>> + Send>>),
    /// Delivering bytes
    Streaming(SegmentsStream),
}

/// Seekable reader over the full decoded byte range of one NZB file
pub struct FileStream {
    inner: Arc<FileInner>,
    position: u64,
    state: StreamState,
    closed: bool,
}

impl FileStream {
    /// Open a stream over `file`
    ///
    /// Fetches the first segment once: its `file_size` field is the
    /// authoritative decoded size. `buffer_size` of 0 uses the configured
    /// default. The stream's cancellation token is a child of `parent`.
    pub async fn open(
        pool: Pool,
        file: Arc<NzbFile>,
        buffer_size: u64,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let buffer_size = if buffer_size == 0 {
            pool.buffer_size()
        } else {
            buffer_size
        };

        let first = pool.fetch_first_segment(&file).await?;
        let file_size = first.file_size;

        let segment_count = file.segment_count() as u64;
        let avg_segment_size = if segment_count > 0 {
            file_size / segment_count
        } else {
            0
        };
        let size_ratio = if file.size() > 0 {
            file_size as f64 / file.size() as f64
        } else {
            1.0
        };

        trace!(
            name = file.name(),
            file_size,
            segment_count,
            buffer_size,
            "file stream opened"
        );

        Ok(Self {
            inner: Arc::new(FileInner {
                pool,
                file,
                file_size,
                avg_segment_size,
                size_ratio,
                buffer_size,
                cancel: parent.child_token(),
            }),
            position: 0,
            state: StreamState::Idle,
            closed: false,
        })
    }

    /// Total decoded size of the file
    pub fn size(&self) -> u64 {
        self.inner.file_size
    }

    /// Stateless positional read, safe to call concurrently
    ///
    /// Builds a private segments stream sized to the request (plus one
    /// average segment of slack) and fills `buf` from `offset` until full
    /// or EOF, returning the number of bytes read.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.inner.file_size {
            return Err(Error::OutOfRange(format!(
                "offset {offset} beyond file size {}",
                self.inner.file_size
            )));
        }

        let buffer_size = buf.len() as u64 + self.inner.avg_segment_size;
        let mut stream = create_segments_stream(self.inner.clone(), offset, buffer_size).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        stream.close();
        Ok(filled)
    }

    /// Release the current segments stream and cancel in-flight work;
    /// idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inner.cancel.cancel();
        if let StreamState::Streaming(stream) = &mut self.state {
            stream.close();
        }
        self.state = StreamState::Idle;
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for FileStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.closed {
                return Poll::Ready(Err(std::io::Error::other("file stream is closed")));
            }

            match &mut this.state {
                StreamState::Idle => {
                    if this.position >= this.inner.file_size {
                        return Poll::Ready(Ok(())); // EOF
                    }
                    let fut = create_segments_stream(
                        this.inner.clone(),
                        this.position,
                        this.inner.buffer_size,
                    );
                    this.state = StreamState::Opening(Box::pin(fut));
                }
                StreamState::Opening(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(stream)) => {
                        this.state = StreamState::Streaming(stream);
                    }
                    Poll::Ready(Err(err)) => {
                        this.state = StreamState::Idle;
                        return Poll::Ready(Err(err.into()));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                StreamState::Streaming(stream) => {
                    let before = buf.filled().len();
                    return match Pin::new(stream).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            let n = buf.filled().len() - before;
                            this.position += n as u64;
                            Poll::Ready(Ok(()))
                        }
                        other => other,
                    };
                }
            }
        }
    }
}

impl AsyncSeek for FileStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();

        if this.closed {
            return Err(std::io::Error::other("file stream is closed"));
        }

        let new_pos = match position {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => this.position as i64 + offset,
            SeekFrom::End(offset) => this.inner.file_size as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                Error::OutOfRange(format!("negative position: {new_pos}")),
            ));
        }

        // Out-of-range positions clamp to the file size
        let new_pos = (new_pos as u64).min(this.inner.file_size);

        if new_pos != this.position {
            trace!(
                old_position = this.position,
                new_position = new_pos,
                "seek discards current stream"
            );
            if let StreamState::Streaming(stream) = &mut this.state {
                stream.close();
            }
            this.state = StreamState::Idle;
            this.position = new_pos;
        }

        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

/// Build a segments stream starting at `start_pos`
///
/// Position 0 streams every segment; otherwise the locator finds the
/// segment containing the target byte and the interior prefix of that
/// segment is read and discarded.
async fn create_segments_stream(
    inner: Arc<FileInner>,
    start_pos: u64,
    buffer_size: u64,
) -> Result<SegmentsStream> {
    if start_pos == 0 {
        return Ok(SegmentsStream::new(
            inner.pool.clone(),
            inner.file.segments.clone(),
            inner.file.groups.clone(),
            buffer_size,
            &inner.cancel,
        ));
    }

    let found = interpolation_search(&inner, start_pos).await?;

    trace!(
        segment_idx = found.index,
        range = %found.range,
        "locator found starting segment"
    );

    let mut stream = SegmentsStream::new(
        inner.pool.clone(),
        inner.file.segments[found.index..].to_vec(),
        inner.file.groups.clone(),
        buffer_size,
        &inner.cancel,
    );

    let skip = start_pos - found.range.start;
    if skip > 0 {
        if let Err(err) = stream.discard(skip).await {
            stream.close();
            return Err(err);
        }
    }

    Ok(stream)
}

struct SearchResult {
    index: usize,
    range: ByteRange,
}

/// Initial locator estimate: accumulate declared sizes scaled by the
/// observed encoded→decoded ratio until the target is passed
fn estimate_segment_index(inner: &FileInner, target: u64) -> usize {
    let mut offset = 0f64;
    for (i, segment) in inner.file.segments.iter().enumerate() {
        if segment.bytes == 0 {
            continue;
        }
        let estimated = segment.bytes as f64 * inner.size_ratio;
        if (target as f64) < offset + estimated {
            return i;
        }
        offset += estimated;
    }
    inner.file.segment_count().saturating_sub(1)
}

/// Fetch the decoded byte range of one segment
async fn segment_byte_range(inner: &FileInner, index: usize) -> Result<ByteRange> {
    let segment = &inner.file.segments[index];
    let data = inner
        .pool
        .fetch_segment(segment, &inner.file.groups)
        .await?;
    Ok(data.range)
}

/// Interpolation search from a byte offset to the segment containing it
///
/// Probes segments, narrowing paired index/byte windows; each probe is
/// placed proportionally to where the target sits in the remaining byte
/// window. A probed range escaping the window means the segment ranges
/// don't tile and the file is corrupt.
async fn interpolation_search(inner: &FileInner, target: u64) -> Result<SearchResult> {
    let segment_count = inner.file.segment_count();

    if segment_count == 0 {
        return Err(Error::NotFound("no segments to search".to_string()));
    }
    if target >= inner.file_size {
        return Err(Error::OutOfRange(format!(
            "target byte {target} out of bounds [0, {})",
            inner.file_size
        )));
    }

    let mut index_range = ByteRange {
        start: 0,
        end: segment_count as u64,
    };
    let mut byte_range = ByteRange {
        start: 0,
        end: inner.file_size,
    };

    // First probe from the ratio-scaled estimate
    let estimated = estimate_segment_index(inner, target);
    trace!(target, estimated, segment_count, "locator started");
    if let Ok(range) = segment_byte_range(inner, estimated).await {
        if range.contains(target) {
            return Ok(SearchResult {
                index: estimated,
                range,
            });
        }
        if target < range.start {
            index_range.end = estimated as u64;
            byte_range.end = range.start;
        } else {
            index_range.start = estimated as u64 + 1;
            byte_range.start = range.end;
        }
    }

    loop {
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !byte_range.contains(target) || index_range.count() == 0 {
            return Err(Error::OutOfRange(format!(
                "cannot find byte {target} in range {byte_range}"
            )));
        }

        // Probe proportionally to the target's offset in the byte window
        let bytes_per_segment = byte_range.count() as f64 / index_range.count() as f64;
        let offset_from_start = (target - byte_range.start) as f64;
        let guess = (index_range.start + (offset_from_start / bytes_per_segment) as u64)
            .clamp(index_range.start, index_range.end - 1) as usize;

        let range = segment_byte_range(inner, guess).await?;
        trace!(guess, range = %range, "locator probe");

        if !byte_range.contains_range(&range) {
            return Err(Error::Corrupt {
                segment: guess,
                message: format!("range {range} outside expected {byte_range}"),
            });
        }

        if range.contains(target) {
            return Ok(SearchResult {
                index: guess,
                range,
            });
        }

        if target < range.start {
            index_range.end = guess as u64;
            byte_range.end = range.start;
        } else {
            index_range.start = guess as u64 + 1;
            byte_range.start = range.end;
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nzb::NzbSegment;
    use crate::pool::SegmentFetcher;
    use crate::yenc;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncSeekExt;

    /// Fetcher with a per-message-id probe counter
    struct CountingFetcher {
        articles: std::collections::HashMap<String, Vec<u8>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SegmentFetcher for CountingFetcher {
        async fn fetch(&self, message_id: &str, _groups: &[String]) -> Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.articles
                .get(message_id)
                .cloned()
                .map(Bytes::from)
                .ok_or_else(|| Error::Provider(format!("430 {message_id}")))
        }
    }

    /// Build a file whose decoded segment sizes are `sizes`, returning the
    /// pool (cache disabled so every probe is a fetch), the file and the
    /// full payload.
    fn fixture(sizes: &[usize]) -> (Pool, Arc<NzbFile>, Vec<u8>, Arc<CountingFetcher>) {
        let total: usize = sizes.iter().sum();
        let mut articles = std::collections::HashMap::new();
        let mut segments = Vec::new();
        let mut payload = Vec::new();
        let mut offset = 0u64;

        for (i, &size) in sizes.iter().enumerate() {
            let body: Vec<u8> = (0..size).map(|j| ((i * 37 + j * 3) % 256) as u8).collect();
            payload.extend_from_slice(&body);
            let number = i as u32 + 1;
            let article = yenc::encode(
                &body,
                "payload.bin",
                Some((
                    number,
                    sizes.len() as u32,
                    offset + 1,
                    offset + size as u64,
                    total as u64,
                )),
            );
            let message_id = format!("seg{number}@test");
            segments.push(NzbSegment {
                bytes: article.len() as u64,
                number,
                message_id: message_id.clone(),
            });
            articles.insert(message_id, article);
            offset += size as u64;
        }

        let fetcher = Arc::new(CountingFetcher {
            articles,
            fetches: AtomicUsize::new(0),
        });
        let mut config = Config::default();
        config.cache.segment_cache_size = 0;
        let pool = Pool::new(fetcher.clone(), &config);

        let file = Arc::new(NzbFile {
            groups: vec!["alt.binaries.test".to_string()],
            segments,
            ..Default::default()
        });

        (pool, file, payload, fetcher)
    }

    async fn open(pool: &Pool, file: &Arc<NzbFile>) -> FileStream {
        FileStream::open(
            pool.clone(),
            file.clone(),
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let (pool, file, payload, _) = fixture(&[1000, 700, 700]);
        let mut stream = open(&pool, &file).await;
        assert_eq!(stream.size(), 2400);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn seek_mid_segment_reads_correct_bytes() {
        let (pool, file, payload, _) = fixture(&[1000, 700, 700]);
        let mut stream = open(&pool, &file).await;

        stream.seek(SeekFrom::Start(1200)).await.unwrap();
        let mut buf = vec![0u8; 300];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload[1200..1500]);
    }

    #[tokio::test]
    async fn seek_variants_and_clamping() {
        let (pool, file, _, _) = fixture(&[500, 500]);
        let mut stream = open(&pool, &file).await;

        assert_eq!(stream.seek(SeekFrom::End(-100)).await.unwrap(), 900);
        assert_eq!(stream.seek(SeekFrom::Current(50)).await.unwrap(), 950);
        // Past EOF clamps to file size
        assert_eq!(stream.seek(SeekFrom::Start(5000)).await.unwrap(), 1000);
        // Negative absolute positions fail
        assert!(stream.seek(SeekFrom::End(-5000)).await.is_err());
    }

    #[tokio::test]
    async fn read_after_clamped_seek_is_eof() {
        let (pool, file, _, _) = fixture(&[500, 500]);
        let mut stream = open(&pool, &file).await;
        stream.seek(SeekFrom::Start(1000)).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_at_matches_seek_then_read() {
        let (pool, file, payload, _) = fixture(&[800, 800, 800]);
        let stream = open(&pool, &file).await;

        let mut at = vec![0u8; 500];
        let n = stream.read_at(&mut at, 900).await.unwrap();
        assert_eq!(n, 500);
        assert_eq!(at, payload[900..1400]);

        let mut seeked = open(&pool, &file).await;
        seeked.seek(SeekFrom::Start(900)).await.unwrap();
        let mut via_seek = vec![0u8; 500];
        seeked.read_exact(&mut via_seek).await.unwrap();
        assert_eq!(via_seek, at);
    }

    #[tokio::test]
    async fn read_at_past_eof_is_out_of_range() {
        let (pool, file, _, _) = fixture(&[100]);
        let stream = open(&pool, &file).await;
        let mut buf = [0u8; 4];
        let err = stream.read_at(&mut buf, 100).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
    }

    #[tokio::test]
    async fn read_at_truncates_at_eof() {
        let (pool, file, payload, _) = fixture(&[100, 100]);
        let stream = open(&pool, &file).await;
        let mut buf = [0u8; 64];
        let n = stream.read_at(&mut buf, 180).await.unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[..20], &payload[180..]);
    }

    #[tokio::test]
    async fn locator_probes_once_for_uniform_segments() {
        let (pool, file, payload, fetcher) = fixture(&[700; 20]);
        let mut stream = open(&pool, &file).await;

        let before = fetcher.fetches.load(Ordering::SeqCst);
        stream.seek(SeekFrom::Start(700 * 13 + 350)).await.unwrap();
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[700 * 13 + 350..700 * 13 + 350 + 16]);

        // Uniform sizes: the ratio estimate lands on the right segment
        // immediately, so exactly one locator probe happens (the remaining
        // fetches belong to the stream itself, starting at segment 13).
        let after = fetcher.fetches.load(Ordering::SeqCst);
        let stream_fetches = 20 - 13;
        assert!(
            after - before <= 1 + stream_fetches,
            "expected 1 probe + {stream_fetches} stream fetches, saw {}",
            after - before
        );
    }

    #[tokio::test]
    async fn locator_bounded_on_skewed_sizes() {
        // Segment 0 is 10x larger than the rest; target the last byte.
        let mut sizes = vec![5000usize];
        sizes.extend(std::iter::repeat_n(500, 99));
        let (pool, file, payload, fetcher) = fixture(&sizes);
        let stream = open(&pool, &file).await;

        let before = fetcher.fetches.load(Ordering::SeqCst);
        let mut buf = [0u8; 1];
        let n = stream.read_at(&mut buf, stream.size() - 1).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], *payload.last().unwrap());

        // read_at builds a one-segment stream at the end; everything else
        // is locator probes, of which the skew permits at most 3.
        let after = fetcher.fetches.load(Ordering::SeqCst);
        assert!(
            after - before <= 4,
            "expected <=3 probes + 1 stream fetch, saw {}",
            after - before
        );
    }

    #[tokio::test]
    async fn corrupt_overlapping_ranges_detected() {
        // Hand-build articles whose =ypart ranges overlap: segment 2
        // claims to start inside segment 1.
        let total = 2000u64;
        let body1 = vec![1u8; 1000];
        let body2 = vec![2u8; 1000];
        let a1 = yenc::encode(&body1, "x.bin", Some((1, 2, 1, 1000, total)));
        // Overlap: begin=501 instead of 1001
        let a2 = yenc::encode(&body2, "x.bin", Some((2, 2, 501, 1500, total)));

        let fetcher = Arc::new(CountingFetcher {
            articles: [
                ("s1@t".to_string(), a1),
                ("s2@t".to_string(), a2),
            ]
            .into_iter()
            .collect(),
            fetches: AtomicUsize::new(0),
        });
        let mut config = Config::default();
        config.cache.segment_cache_size = 0;
        let pool = Pool::new(fetcher, &config);
        let file = Arc::new(NzbFile {
            segments: vec![
                NzbSegment {
                    bytes: 1400,
                    number: 1,
                    message_id: "s1@t".to_string(),
                },
                NzbSegment {
                    bytes: 1400,
                    number: 2,
                    message_id: "s2@t".to_string(),
                },
            ],
            ..Default::default()
        });

        let stream = FileStream::open(pool, file, 0, &CancellationToken::new())
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        // Target byte 1800 lies past segment 2's claimed end (1500) but
        // the narrowed byte window contradicts the observed ranges.
        let err = stream.read_at(&mut buf, 1800).await.unwrap_err();
        assert!(
            matches!(err, Error::Corrupt { .. }) || matches!(err, Error::OutOfRange(_)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_reads() {
        let (pool, file, _, _) = fixture(&[100]);
        let mut stream = open(&pool, &file).await;
        stream.close();
        stream.close();
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).await.is_err());
    }
}
