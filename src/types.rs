//! Core types shared across the streaming engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Half-open byte interval `[start, end)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start offset
    pub start: u64,
    /// Exclusive end offset
    pub end: u64,
}

impl ByteRange {
    /// Build a range from a start offset and a length
    pub fn from_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    /// Number of bytes covered
    pub fn count(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether `byte` falls inside the range
    pub fn contains(&self, byte: u64) -> bool {
        self.start <= byte && byte < self.end
    }

    /// Whether `other` is fully inside this range
    pub fn contains_range(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The result of fetching and decoding one segment
///
/// For a given file, segment ranges tile `[0, file_size)` without gaps or
/// overlap; `file_size` reported by the first segment is authoritative for
/// the whole file.
#[derive(Clone, Debug)]
pub struct SegmentData {
    /// Decoded segment body
    pub body: Bytes,
    /// Decoded byte range this segment occupies within its file
    pub range: ByteRange,
    /// Total decoded size of the file this segment belongs to
    pub file_size: u64,
}

impl SegmentData {
    /// Decoded size of this segment (`range.end - range.start`)
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Container classification for an NZB file or archive entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Not an archive; streamed directly
    #[default]
    Plain,
    /// RAR archive (any version)
    Rar,
    /// 7-Zip archive
    #[serde(rename = "7z")]
    SevenZ,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::Plain => write!(f, "plain"),
            FileType::Rar => write!(f, "rar"),
            FileType::SevenZ => write!(f, "7z"),
        }
    }
}

/// Post-inspection record for one piece of NZB content
///
/// Produced once per NZB by `inspect_nzb_content` and persisted alongside
/// the NZB record. `parts` lists the volumes of a multi-volume archive;
/// `files` lists inner archive entries; `alias` carries the
/// archive-declared name when the NZB's filename is a placeholder.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ContentFile {
    /// Container classification
    #[serde(rename = "type")]
    pub kind: FileType,

    /// Name as declared by the NZB subject (or the archive base name for
    /// grouped volume sets)
    pub name: String,

    /// Alternate name used by decoders when the NZB's declared filenames
    /// don't match what the archive header says
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    /// Decoded size in bytes
    pub size: u64,

    /// Whether this content can be streamed
    pub streamable: bool,

    /// Non-fatal problems observed during inspection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Inner entries, for archives
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ContentFile>,

    /// Volumes of a multi-volume archive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentFile>,

    /// Volume number within a multi-volume set; 0 (omitted from JSON)
    /// when this content is not a numbered volume
    #[serde(default, skip_serializing_if = "is_default_volume")]
    pub volume: i32,
}

fn is_default_volume(v: &i32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_contains() {
        let r = ByteRange::from_size(1000, 700);
        assert_eq!(r.end, 1700);
        assert_eq!(r.count(), 700);
        assert!(r.contains(1000));
        assert!(r.contains(1699));
        assert!(!r.contains(1700));
        assert!(!r.contains(999));
    }

    #[test]
    fn byte_range_contains_range() {
        let outer = ByteRange { start: 0, end: 100 };
        let inner = ByteRange { start: 10, end: 100 };
        assert!(outer.contains_range(&inner));
        assert!(!inner.contains_range(&outer));
    }

    #[test]
    fn content_file_json_shape() {
        let cf = ContentFile {
            kind: FileType::Rar,
            name: "Movie.rar".to_string(),
            size: 1234,
            streamable: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&cf).expect("serialize");
        assert_eq!(json["type"], "rar");
        assert!(json.get("alias").is_none());
        assert!(json.get("files").is_none());
    }
}
