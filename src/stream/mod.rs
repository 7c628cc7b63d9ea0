//! Ordered byte streams over NZB segments
//!
//! Two layers:
//! - [`SegmentsStream`]: a read-only stream concatenating the decoded
//!   bodies of a contiguous slice of segments, fetched by a parallel
//!   worker pool but delivered strictly in order.
//! - [`FileStream`]: a seekable reader over one NZB file, built on
//!   segments streams that are re-created on seek, with an
//!   interpolation-search locator mapping byte offsets to segments.

mod file;
mod segments;

pub use file::FileStream;
pub use segments::SegmentsStream;
