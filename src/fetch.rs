//! NZB file retrieval and caching
//!
//! NZB documents are fetched over HTTP from indexers, cached by the MD5
//! of their cleaned link (query and fragment stripped), and failures are
//! negatively cached for a few minutes so a dead link doesn't hammer the
//! indexer. Concurrent fetches of the same link are deduplicated: only
//! one HTTP GET goes out, the rest wait for its result.

use crate::config::Config;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A fetched NZB document
#[derive(Clone, Debug)]
pub struct NzbFileBlob {
    /// Raw XML bytes
    pub blob: Bytes,
    /// Filename, always ending in `.nzb`
    pub name: String,
    /// The link it was fetched from
    pub link: String,
    /// When the blob was fetched or uploaded
    pub fetched_at: DateTime<Utc>,
}

/// Strip query and fragment from a link
pub fn clean_link(link: &str) -> &str {
    let link = link.split_once('?').map(|(l, _)| l).unwrap_or(link);
    link.split_once('#').map(|(l, _)| l).unwrap_or(link)
}

/// Cache key for a link: MD5 of the cleaned form
pub fn hash_link(link: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(clean_link(link).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// HTTP fetcher with blob cache, negative cache, and request collapsing
pub struct NzbFetcher {
    client: reqwest::Client,
    blobs: Cache<String, NzbFileBlob>,
    failures: Cache<String, String>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_size: u64,
}

impl NzbFetcher {
    /// Build a fetcher sized by `config`
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch.fetch_timeout)
            .build()?;

        let blobs = Cache::builder()
            .max_capacity(config.cache.nzb_file_cache_size)
            .time_to_live(config.cache.nzb_file_cache_ttl)
            .weigher(|key: &String, blob: &NzbFileBlob| {
                (key.len() + blob.blob.len()).try_into().unwrap_or(u32::MAX)
            })
            .build();

        let failures = Cache::builder()
            .time_to_live(config.cache.fetch_failure_ttl)
            .build();

        Ok(Self {
            client,
            blobs,
            failures,
            inflight: Mutex::new(HashMap::new()),
            max_size: config.fetch.nzb_file_max_size,
        })
    }

    /// Whether a blob is cached under `hash`
    pub fn is_cached(&self, hash: &str) -> bool {
        self.blobs.contains_key(hash)
    }

    /// Cached blob by hash, if present
    pub fn get_cached(&self, hash: &str) -> Option<NzbFileBlob> {
        self.blobs.get(hash)
    }

    /// Store an uploaded blob directly (no HTTP involved)
    pub fn cache_blob(&self, hash: &str, blob: NzbFileBlob) {
        self.blobs.insert(hash.to_string(), blob);
    }

    /// Evict the blob cached for `link`
    pub fn delete(&self, link: &str) {
        self.blobs.invalidate(&hash_link(link));
    }

    /// Fetch the NZB at `link`, collapsing concurrent requests
    ///
    /// `name` is the fallback filename when neither the response headers
    /// nor the link supply one.
    pub async fn fetch(&self, link: &str, name: &str) -> Result<NzbFileBlob> {
        let key = hash_link(link);

        if let Some(blob) = self.blobs.get(&key) {
            debug!(link = clean_link(link), "nzb fetch cache hit");
            return Ok(blob);
        }
        if let Some(message) = self.failures.get(&key) {
            debug!(link = clean_link(link), "nzb fetch cached failure");
            return Err(Error::Provider(format!("cached failure: {message}")));
        }

        // Collapse concurrent fetches of the same link onto one GET
        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };
        let _guard = gate.lock().await;

        // The winner may have populated either cache while we waited
        if let Some(blob) = self.blobs.get(&key) {
            return Ok(blob);
        }
        if let Some(message) = self.failures.get(&key) {
            return Err(Error::Provider(format!("cached failure: {message}")));
        }

        let result = self.fetch_uncached(link, name).await;

        match &result {
            Ok(blob) => {
                self.blobs.insert(key.clone(), blob.clone());
            }
            Err(err) => {
                warn!(link = clean_link(link), error = %err, "nzb fetch failed");
                self.failures.insert(key.clone(), err.to_string());
            }
        }

        let mut inflight = self.inflight.lock().await;
        inflight.remove(&key);

        result
    }

    async fn fetch_uncached(&self, link: &str, name: &str) -> Result<NzbFileBlob> {
        debug!(link = clean_link(link), "fetching nzb");

        let response = self.client.get(link).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Provider(format!(
                "failed to fetch nzb: status {status}"
            )));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_size {
                return Err(Error::TooLarge {
                    size: declared,
                    max: self.max_size,
                });
            }
        }

        let disposition_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);

        // Read incrementally so an oversized body bails out early
        let mut blob = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            blob.extend_from_slice(&chunk);
            if blob.len() as u64 > self.max_size {
                return Err(Error::TooLarge {
                    size: blob.len() as u64,
                    max: self.max_size,
                });
            }
        }
        if blob.is_empty() {
            return Err(Error::Provider("empty response body".to_string()));
        }

        let filename = resolve_filename(disposition_name, link, name);

        debug!(link = clean_link(link), size = blob.len(), "nzb fetched");

        Ok(NzbFileBlob {
            blob: Bytes::from(blob),
            name: filename,
            link: link.to_string(),
            fetched_at: Utc::now(),
        })
    }
}

/// Extract the `filename` parameter from a Content-Disposition value
fn parse_disposition_filename(value: &str) -> Option<String> {
    let start = value.find("filename=")? + "filename=".len();
    let rest = value[start..].trim();
    let filename = rest
        .strip_prefix('"')
        .and_then(|r| r.split('"').next())
        .unwrap_or_else(|| rest.split(';').next().unwrap_or(rest).trim());
    (!filename.is_empty()).then(|| filename.to_string())
}

/// Pick the filename: Content-Disposition, then the link basename when
/// it already looks like an NZB, then the caller's fallback; always with
/// a `.nzb` suffix
fn resolve_filename(disposition: Option<String>, link: &str, fallback: &str) -> String {
    let mut filename = disposition.unwrap_or_else(|| {
        let base = clean_link(link).rsplit('/').next().unwrap_or_default();
        if base.ends_with(".nzb") {
            base.to_string()
        } else if fallback.is_empty() {
            "unknown.nzb".to_string()
        } else {
            fallback.to_string()
        }
    });
    if !filename.ends_with(".nzb") {
        filename.push_str(".nzb");
    }
    filename
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_link_strips_query_and_fragment() {
        assert_eq!(
            clean_link("https://indexer/api?t=get&id=1#frag"),
            "https://indexer/api"
        );
        assert_eq!(clean_link("https://indexer/a.nzb"), "https://indexer/a.nzb");
    }

    #[test]
    fn hash_ignores_query() {
        assert_eq!(
            hash_link("https://indexer/a.nzb?apikey=one"),
            hash_link("https://indexer/a.nzb?apikey=two")
        );
        assert_ne!(
            hash_link("https://indexer/a.nzb"),
            hash_link("https://indexer/b.nzb")
        );
    }

    #[test]
    fn disposition_filename_variants() {
        assert_eq!(
            parse_disposition_filename(r#"attachment; filename="My Show.nzb""#),
            Some("My Show.nzb".to_string())
        );
        assert_eq!(
            parse_disposition_filename("inline; filename=plain.nzb"),
            Some("plain.nzb".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn filename_resolution_enforces_suffix() {
        assert_eq!(
            resolve_filename(None, "https://x/path/show.nzb?k=1", "fallback"),
            "show.nzb"
        );
        assert_eq!(
            resolve_filename(None, "https://x/api", "My Download"),
            "My Download.nzb"
        );
        assert_eq!(resolve_filename(None, "https://x/api", ""), "unknown.nzb");
        assert_eq!(
            resolve_filename(Some("given".to_string()), "https://x/a.nzb", "f"),
            "given.nzb"
        );
    }

    #[tokio::test]
    async fn cache_round_trip_and_delete() {
        let fetcher = NzbFetcher::new(&Config::default()).unwrap();
        let hash = hash_link("https://x/a.nzb");
        assert!(!fetcher.is_cached(&hash));

        fetcher.cache_blob(
            &hash,
            NzbFileBlob {
                blob: Bytes::from_static(b"<nzb/>"),
                name: "a.nzb".to_string(),
                link: "https://x/a.nzb".to_string(),
                fetched_at: Utc::now(),
            },
        );
        // moka sync cache: make the write visible immediately
        fetcher.blobs.run_pending_tasks();
        assert!(fetcher.is_cached(&hash));
        assert_eq!(fetcher.get_cached(&hash).unwrap().name, "a.nzb");

        fetcher.delete("https://x/a.nzb?key=1");
        fetcher.blobs.run_pending_tasks();
        assert!(!fetcher.is_cached(&hash));
    }
}
