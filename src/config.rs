//! Configuration types for nzb-streamer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

/// Top-level configuration
///
/// Every section has sensible defaults; `Config::default()` produces a
/// working setup for an in-memory deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Streaming behavior (concurrency, buffering)
    #[serde(default)]
    pub stream: StreamConfig,

    /// Cache sizing and lifetimes
    #[serde(default)]
    pub cache: CacheConfig,

    /// NZB file retrieval limits
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Streaming behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct StreamConfig {
    /// Maximum parallel segment fetches per stream (default: 4)
    ///
    /// This is the per-stream connection cap; the NNTP pool multiplexes
    /// connections across streams, and each stream spawns at most this
    /// many fetch workers.
    #[serde(default = "default_max_connections_per_stream")]
    pub max_connections_per_stream: usize,

    /// Read-ahead buffer budget per stream, in bytes (default: 16 MiB)
    ///
    /// The dispatcher stops handing out segments once this much declared
    /// segment data is in flight or waiting to be consumed.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_connections_per_stream: default_max_connections_per_stream(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Cache sizing configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CacheConfig {
    /// Maximum total decoded bytes held by the segment cache (default: 256 MiB)
    ///
    /// Set to 0 to disable segment caching entirely.
    #[serde(default = "default_segment_cache_size")]
    pub segment_cache_size: u64,

    /// Maximum total bytes held by the NZB file blob cache (default: 64 MiB)
    #[serde(default = "default_nzb_file_cache_size")]
    pub nzb_file_cache_size: u64,

    /// Lifetime of cached NZB file blobs (default: 24 hours)
    #[serde(default = "default_nzb_file_cache_ttl", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub nzb_file_cache_ttl: Duration,

    /// Lifetime of negatively cached NZB fetch failures (default: 5 minutes)
    #[serde(default = "default_fetch_failure_ttl", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub fetch_failure_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            segment_cache_size: default_segment_cache_size(),
            nzb_file_cache_size: default_nzb_file_cache_size(),
            nzb_file_cache_ttl: default_nzb_file_cache_ttl(),
            fetch_failure_ttl: default_fetch_failure_ttl(),
        }
    }
}

/// NZB file retrieval configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct FetchConfig {
    /// Maximum accepted NZB file size in bytes (default: 25 MiB)
    #[serde(default = "default_nzb_file_max_size")]
    pub nzb_file_max_size: u64,

    /// HTTP timeout for NZB downloads (default: 60 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub fetch_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            nzb_file_max_size: default_nzb_file_max_size(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DatabaseConfig {
    /// SQLite connection string (default: "sqlite::memory:")
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_max_connections_per_stream() -> usize {
    4
}

fn default_buffer_size() -> u64 {
    16 * 1024 * 1024
}

fn default_segment_cache_size() -> u64 {
    256 * 1024 * 1024
}

fn default_nzb_file_cache_size() -> u64 {
    64 * 1024 * 1024
}

fn default_nzb_file_cache_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_fetch_failure_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_nzb_file_max_size() -> u64 {
    25 * 1024 * 1024
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

/// Serialize durations as whole seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.stream.max_connections_per_stream, 4);
        assert_eq!(config.stream.buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.cache.fetch_failure_ttl, Duration::from_secs(300));
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"stream": {"max_connections_per_stream": 8}}"#).unwrap();
        assert_eq!(config.stream.max_connections_per_stream, 8);
        assert_eq!(config.stream.buffer_size, 16 * 1024 * 1024);
    }

    #[test]
    fn durations_round_trip_as_seconds() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache.nzb_file_cache_ttl, config.cache.nzb_file_cache_ttl);
    }
}
