//! Error types for nzb-streamer
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error kinds (parse, locator, archive, network)
//! - HTTP status code mapping for API integration
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for nzb-streamer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-streamer
#[derive(Debug, Error)]
pub enum Error {
    /// NZB XML document could not be decoded
    #[error("failed to parse NZB: {message}")]
    Parse {
        /// Human-readable description of the parse failure
        message: String,
        /// The underlying XML decoder error, if any
        #[source]
        source: Option<quick_xml::DeError>,
    },

    /// Seek or positional read past the end of the stream, or an invalid
    /// path/index supplied by the caller
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Content path element not matched in the NZB or inside an archive
    #[error("not found: {0}")]
    NotFound(String),

    /// Archive is solid, or an entry is compressed/encrypted, or the
    /// container type is unsupported for streaming
    #[error("not streamable: {0}")]
    NotStreamable(String),

    /// Segment data contradicts previously observed byte ranges
    #[error("corrupt file: segment {segment}: {message}")]
    Corrupt {
        /// Index of the offending segment
        segment: usize,
        /// What the invariant violation was
        message: String,
    },

    /// Upstream provider failure: an NNTP fetch that survived failover,
    /// or an indexer fetch failure (including negatively cached ones)
    #[error("provider error: {0}")]
    Provider(String),

    /// HTTP failure while retrieving an NZB file
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The operation was cancelled or the stream was closed
    #[error("cancelled")]
    Cancelled,

    /// NZB file exceeds the configured maximum size
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge {
        /// Observed (or declared) size in bytes
        size: u64,
        /// Configured limit in bytes
        max: u64,
    },

    /// yEnc article body is malformed
    #[error("invalid yEnc data: {0}")]
    Yenc(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construct a parse error wrapping an XML decoder failure
    pub fn parse(message: impl Into<String>, source: quick_xml::DeError) -> Self {
        Error::Parse {
            message: message.into(),
            source: Some(source),
        }
    }

    /// True when the error was caused by cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Convert a stream error into the `std::io::Error` required by the
/// `AsyncRead`/`AsyncSeek` traits, preserving the original as the source.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            Error::Cancelled => std::io::Error::new(std::io::ErrorKind::Interrupted, err),
            Error::OutOfRange(_) => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err),
            other => std::io::Error::other(other),
        }
    }
}

/// Mapping from domain errors to HTTP responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed or oversized input, not retried
            Error::Parse { .. } => 400,
            Error::TooLarge { .. } => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,

            // 408 Request Timeout - the caller went away
            Error::Cancelled => 408,

            // 416 Range Not Satisfiable
            Error::OutOfRange(_) => 416,

            // 422 Unprocessable Entity - the content cannot be streamed
            Error::NotStreamable(_) => 422,
            Error::Corrupt { .. } => 422,
            Error::Yenc(_) => 422,

            // 502 Bad Gateway - upstream failures
            Error::Provider(_) => 502,
            Error::Network(_) => 502,

            // 500 Internal Server Error
            Error::Database(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Parse { .. } => "parse_error",
            Error::OutOfRange(_) => "out_of_range",
            Error::NotFound(_) => "not_found",
            Error::NotStreamable(_) => "not_streamable",
            Error::Corrupt { .. } => "corrupt",
            Error::Provider(_) => "provider_error",
            Error::Network(_) => "network_error",
            Error::Cancelled => "cancelled",
            Error::TooLarge { .. } => "too_large",
            Error::Yenc(_) => "invalid_yenc",
            Error::Database(_) => "database_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
        }
    }
}

/// Structured error response body returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "parse_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::new(err.error_code(), err.to_string())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_is_bad_request() {
        let err = Error::Parse {
            message: "truncated document".to_string(),
            source: None,
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_code(), "parse_error");
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = Error::NotFound("inner.mkv".to_string());
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn not_streamable_maps_to_422() {
        let err = Error::NotStreamable("solid RAR archive".to_string());
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.error_code(), "not_streamable");
    }

    #[test]
    fn corrupt_mentions_segment_index() {
        let err = Error::Corrupt {
            segment: 17,
            message: "range outside window".to_string(),
        };
        assert!(err.to_string().contains("segment 17"));
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn cancelled_converts_to_interrupted_io() {
        let io: std::io::Error = Error::Cancelled.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Interrupted);
    }

    #[test]
    fn api_error_carries_code_and_message() {
        let api: ApiError = Error::NotFound("movie.rar".to_string()).into();
        assert_eq!(api.error.code, "not_found");
        assert!(api.error.message.contains("movie.rar"));
    }
}
