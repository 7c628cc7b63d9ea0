//! Shared fixtures for the end-to-end scenarios: a scripted segment
//! fetcher, NZB/article synthesis, and stored-archive builders.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use nzb_streamer::error::{Error, Result};
use nzb_streamer::pool::{Pool, SegmentFetcher};
use nzb_streamer::{Config, Nzb, yenc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Scripted fetcher serving yEnc articles from memory
pub struct MockFetcher {
    articles: Mutex<HashMap<String, Vec<u8>>>,
    fail: Mutex<HashSet<String>>,
    pub latency: Duration,
    pub total_fetches: AtomicUsize,
    per_id: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            articles: Mutex::new(HashMap::new()),
            fail: Mutex::new(HashSet::new()),
            latency,
            total_fetches: AtomicUsize::new(0),
            per_id: Mutex::new(HashMap::new()),
        })
    }

    pub async fn add_article(&self, message_id: &str, article: Vec<u8>) {
        self.articles
            .lock()
            .await
            .insert(message_id.to_string(), article);
    }

    pub async fn fail_segment(&self, message_id: &str) {
        self.fail.lock().await.insert(message_id.to_string());
    }

    pub fn fetches(&self) -> usize {
        self.total_fetches.load(Ordering::SeqCst)
    }

    pub async fn fetches_for(&self, message_id: &str) -> usize {
        self.per_id
            .lock()
            .await
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SegmentFetcher for MockFetcher {
    async fn fetch(&self, message_id: &str, _groups: &[String]) -> Result<Bytes> {
        self.total_fetches.fetch_add(1, Ordering::SeqCst);
        *self
            .per_id
            .lock()
            .await
            .entry(message_id.to_string())
            .or_default() += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail.lock().await.contains(message_id) {
            return Err(Error::Provider(format!("430 no such article: {message_id}")));
        }
        self.articles
            .lock()
            .await
            .get(message_id)
            .cloned()
            .map(Bytes::from)
            .ok_or_else(|| Error::Provider(format!("430 no such article: {message_id}")))
    }
}

/// One file to be posted into the synthetic NZB
pub struct PostedFile {
    pub name: String,
    pub payload: Vec<u8>,
    pub segment_size: usize,
}

impl PostedFile {
    pub fn new(name: &str, payload: Vec<u8>, segment_size: usize) -> Self {
        Self {
            name: name.to_string(),
            payload,
            segment_size,
        }
    }
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 131 + seed as u64 * 251 + i as u64 / 7919) % 256) as u8)
        .collect()
}

/// Post files as yEnc articles and an NZB document
///
/// Returns the parsed NZB; articles land in the fetcher keyed by
/// `<name>.<segment>@test`.
pub async fn post_nzb(fetcher: &MockFetcher, files: &[PostedFile]) -> Arc<Nzb> {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><nzb>"#);

    for (file_idx, file) in files.iter().enumerate() {
        let chunks: Vec<&[u8]> = file.payload.chunks(file.segment_size).collect();
        let total = chunks.len() as u32;
        let subject = format!(
            "[{}/{}] - \"{}\" yEnc (1/{total})",
            file_idx + 1,
            files.len(),
            file.name
        );

        xml.push_str(&format!(
            r#"<file poster="tester@example.com" date="1700000000" subject="{}"><groups><group>alt.binaries.test</group></groups><segments>"#,
            subject.replace('"', "&quot;")
        ));

        let mut offset = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            let number = i as u32 + 1;
            let message_id = format!("{}.{number}@test", file.name);
            let article = yenc::encode(
                chunk,
                &file.name,
                Some((
                    number,
                    total,
                    offset + 1,
                    offset + chunk.len() as u64,
                    file.payload.len() as u64,
                )),
            );
            xml.push_str(&format!(
                r#"<segment bytes="{}" number="{number}">{message_id}</segment>"#,
                article.len()
            ));
            fetcher.add_article(&message_id, article).await;
            offset += chunk.len() as u64;
        }
        xml.push_str("</segments></file>");
    }

    xml.push_str("</nzb>");
    Arc::new(Nzb::parse(xml.as_bytes()).expect("fixture NZB parses"))
}

/// Pool over a mock fetcher with default configuration
pub fn make_pool(fetcher: Arc<MockFetcher>) -> Pool {
    Pool::new(fetcher, &Config::default())
}

/// Pool with the segment cache disabled (every probe is a real fetch)
pub fn make_uncached_pool(fetcher: Arc<MockFetcher>) -> Pool {
    let mut config = Config::default();
    config.cache.segment_cache_size = 0;
    Pool::new(fetcher, &config)
}

// ============================================================================
// Stored-archive builders
// ============================================================================

/// RAR4 file header flags
pub const RAR_SPLIT_BEFORE: u16 = 0x0001;
pub const RAR_SPLIT_AFTER: u16 = 0x0002;
pub const RAR_MAIN_SOLID: u16 = 0x0008;
pub const RAR_END_NEXT_VOLUME: u16 = 0x0001;

pub struct RarEntrySpec<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    pub unpacked: u64,
    pub method: u8,
    pub flags: u16,
}

impl<'a> RarEntrySpec<'a> {
    /// A stored entry whose data is complete in this volume
    pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
        Self {
            name,
            data,
            unpacked: data.len() as u64,
            method: 0x30,
            flags: 0,
        }
    }
}

/// Minimal RAR4 volume writer (stored entries, enough for streaming)
pub struct RarVolumeBuilder {
    data: Vec<u8>,
}

impl RarVolumeBuilder {
    pub fn new() -> Self {
        Self {
            data: b"Rar!\x1A\x07\x00".to_vec(),
        }
    }

    pub fn main_header(mut self, flags: u16) -> Self {
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.push(0x73);
        self.data.extend_from_slice(&flags.to_le_bytes());
        self.data.extend_from_slice(&13u16.to_le_bytes());
        self.data.extend_from_slice(&[0u8; 6]);
        self
    }

    pub fn file(mut self, entry: RarEntrySpec<'_>) -> Self {
        let name_bytes = entry.name.as_bytes();
        let head_size = 32 + name_bytes.len() as u16;
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.push(0x74);
        self.data
            .extend_from_slice(&(entry.flags | 0x8000).to_le_bytes());
        self.data.extend_from_slice(&head_size.to_le_bytes());
        self.data
            .extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(entry.unpacked as u32).to_le_bytes());
        self.data.push(0);
        self.data
            .extend_from_slice(&crc32fast_hash(entry.data).to_le_bytes());
        self.data.extend_from_slice(&0u32.to_le_bytes());
        self.data.push(29);
        self.data.push(entry.method);
        self.data
            .extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        self.data.extend_from_slice(&0u32.to_le_bytes());
        self.data.extend_from_slice(name_bytes);
        self.data.extend_from_slice(entry.data);
        self
    }

    pub fn end_header(mut self, flags: u16) -> Self {
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.push(0x7B);
        self.data.extend_from_slice(&flags.to_le_bytes());
        self.data.extend_from_slice(&7u16.to_le_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

// The parser ignores header CRCs; data CRC is still filled in properly.
fn crc32fast_hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Single-volume stored RAR with one entry
pub fn rar_stored(entry_name: &str, payload: &[u8]) -> Vec<u8> {
    RarVolumeBuilder::new()
        .main_header(0)
        .file(RarEntrySpec::stored(entry_name, payload))
        .end_header(0)
        .build()
}

/// Stored (Copy) 7z archive with one entry, written by zesven
pub fn sevenz_stored(entry_name: &str, payload: &[u8]) -> Vec<u8> {
    use zesven::write::{WriteOptions, Writer};

    let mut writer = Writer::create(std::io::Cursor::new(Vec::new()))
        .expect("create 7z writer")
        .options(WriteOptions::new().method(zesven::codec::CodecMethod::Copy));
    writer
        .add_bytes(
            zesven::ArchivePath::new(entry_name).expect("entry path"),
            payload,
        )
        .expect("add entry");
    let (_, cursor) = writer.finish_into_inner().expect("finish 7z");
    cursor.into_inner()
}
