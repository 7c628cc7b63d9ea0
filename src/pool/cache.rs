//! Process-wide segment cache
//!
//! Decoded segment bodies are cached by message-id with size-weighted
//! eviction, so probe-heavy operations (interpolation search, archive
//! header reads) and overlapping streams don't refetch the same articles.
//! Writes are atomic per key; a late write overwriting an identical earlier
//! one is harmless.

use crate::types::SegmentData;
use moka::sync::Cache;

/// Shared segment cache keyed by message-id
#[derive(Clone)]
pub enum SegmentCache {
    /// Size-weighted in-memory cache
    Weighted(Cache<String, SegmentData>),
    /// Caching disabled (`segment_cache_size == 0`)
    Disabled,
}

impl SegmentCache {
    /// Create a cache bounded by `max_size` total decoded bytes
    ///
    /// A `max_size` of 0 disables caching.
    pub fn new(max_size: u64) -> Self {
        if max_size == 0 {
            return SegmentCache::Disabled;
        }
        let cache = Cache::builder()
            .max_capacity(max_size)
            .weigher(|key: &String, value: &SegmentData| {
                (key.len() + value.body.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .build();
        SegmentCache::Weighted(cache)
    }

    /// Look up a decoded segment by message-id
    pub fn get(&self, message_id: &str) -> Option<SegmentData> {
        match self {
            SegmentCache::Weighted(cache) => cache.get(message_id),
            SegmentCache::Disabled => None,
        }
    }

    /// Store a decoded segment
    pub fn insert(&self, message_id: &str, data: SegmentData) {
        if let SegmentCache::Weighted(cache) = self {
            cache.insert(message_id.to_string(), data);
        }
    }
}
