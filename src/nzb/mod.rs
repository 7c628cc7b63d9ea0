//! NZB document model and parser
//!
//! An NZB is an XML index of a binary payload posted to Usenet: a list of
//! files, each split into yEnc-encoded segments addressed by message-id.
//! The parser is permissive about character sets (the XML prolog decides;
//! Latin-1 and UTF-8 both occur in the wild) and normalises the document
//! into a stable order: files by the order number derived from their
//! subject, segments by their `number` attribute.

pub mod subject;

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One segment of a file: a single Usenet article
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NzbSegment {
    /// Declared *encoded* size in bytes; the decoded body is smaller
    pub bytes: u64,
    /// 1-based position within the file
    pub number: u32,
    /// Message-id by which the article is retrieved from any provider
    pub message_id: String,
}

/// One file of the payload
#[derive(Debug, Default)]
pub struct NzbFile {
    /// Poster address from the `poster` attribute
    pub poster: String,
    /// Post date as unix seconds; may be 0
    pub date: i64,
    /// Raw subject line
    pub subject: String,
    /// Newsgroups carrying the segments
    pub groups: Vec<String>,
    /// Segments in ascending `number` order
    pub segments: Vec<NzbSegment>,

    pub(crate) name: String,
    pub(crate) order: usize,
    pub(crate) total_size: OnceLock<u64>,
    pub(crate) message_ids: OnceLock<Vec<String>>,
}

impl NzbFile {
    /// Filename derived from the subject (see [`subject`])
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sort key derived from the subject, or the document index
    pub fn order(&self) -> usize {
        self.order
    }

    /// Sum of declared (encoded) segment sizes
    pub fn size(&self) -> u64 {
        *self
            .total_size
            .get_or_init(|| self.segments.iter().map(|s| s.bytes).sum())
    }

    /// Trimmed message-ids of all segments, in segment order
    pub fn message_ids(&self) -> &[String] {
        self.message_ids.get_or_init(|| {
            self.segments
                .iter()
                .map(|s| s.message_id.trim().to_string())
                .collect()
        })
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl Clone for NzbFile {
    fn clone(&self) -> Self {
        Self {
            poster: self.poster.clone(),
            date: self.date,
            subject: self.subject.clone(),
            groups: self.groups.clone(),
            segments: self.segments.clone(),
            name: self.name.clone(),
            order: self.order,
            total_size: OnceLock::new(),
            message_ids: OnceLock::new(),
        }
    }
}

/// A parsed NZB document, immutable after parsing
#[derive(Clone, Debug, Default)]
pub struct Nzb {
    /// Head metadata, `type → value`; duplicate types keep the last value
    pub meta: HashMap<String, String>,
    /// Files in derived order
    pub files: Vec<NzbFile>,
}

impl Nzb {
    /// Parse an NZB document from raw bytes
    ///
    /// The character set is whatever the XML prolog declares. Failures are
    /// reported as [`Error::Parse`] so API callers can map them to 400.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let raw: RawNzb = quick_xml::de::from_reader(input)
            .map_err(|e| Error::parse("invalid NZB document", e))?;

        let mut meta = HashMap::new();
        if let Some(head) = raw.head {
            for m in head.meta {
                meta.insert(m.kind, m.value.trim().to_string());
            }
        }

        let mut files: Vec<NzbFile> = raw
            .files
            .into_iter()
            .enumerate()
            .map(|(idx, f)| {
                let subject_line = f.subject.unwrap_or_default();
                let parsed = subject::parse(&subject_line);
                let mut segments = f.segments.map(|s| s.segments).unwrap_or_default();
                segments.sort_by_key(|s| s.number);
                NzbFile {
                    poster: f.poster.unwrap_or_default(),
                    date: f.date.unwrap_or_default(),
                    name: parsed.name,
                    order: parsed.order.unwrap_or(idx),
                    subject: subject_line,
                    groups: f.groups.map(|g| g.groups).unwrap_or_default(),
                    segments: segments
                        .into_iter()
                        .map(|s| NzbSegment {
                            bytes: s.bytes,
                            number: s.number,
                            message_id: s.id,
                        })
                        .collect(),
                    total_size: OnceLock::new(),
                    message_ids: OnceLock::new(),
                }
            })
            .collect();

        files.sort_by_key(|f| f.order);

        Ok(Nzb { meta, files })
    }

    /// Head metadata value for `kind`, if present
    pub fn meta(&self, kind: &str) -> Option<&str> {
        self.meta.get(kind).map(String::as_str)
    }

    /// Sum of declared sizes across all files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size()).sum()
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Index of the largest file not excluded by `skip`
    pub fn largest_file_idx(&self, skip: impl Fn(&str) -> bool) -> Option<usize> {
        let mut largest: Option<(usize, u64)> = None;
        for (idx, file) in self.files.iter().enumerate() {
            if skip(file.name()) {
                continue;
            }
            let size = file.size();
            if largest.is_none_or(|(_, s)| size > s) {
                largest = Some((idx, size));
            }
        }
        largest.map(|(idx, _)| idx)
    }

    /// First file whose derived name equals `name`, case-insensitively
    pub fn find_file(&self, name: &str) -> Option<&NzbFile> {
        self.files
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    /// Content identity hash over the first and last message-id of each
    /// file, in file order
    ///
    /// Stable against permutation of interior segments, which is exactly
    /// the property wanted for deduplicating re-indexed posts.
    pub fn hash_by_file_boundary_segment_ids(&self) -> String {
        let mut hasher = Md5::new();
        for file in &self.files {
            let ids = file.message_ids();
            if let Some(first) = ids.first() {
                hasher.update(first.as_bytes());
                if ids.len() > 1 {
                    if let Some(last) = ids.last() {
                        hasher.update(last.as_bytes());
                    }
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

// Raw document shape as decoded by quick-xml; normalised into the public
// model immediately after decoding.

#[derive(Debug, Deserialize)]
struct RawNzb {
    head: Option<RawHead>,
    #[serde(rename = "file", default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    #[serde(rename = "meta", default)]
    meta: Vec<RawMeta>,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "$value", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "@poster")]
    poster: Option<String>,
    #[serde(rename = "@date")]
    date: Option<i64>,
    #[serde(rename = "@subject")]
    subject: Option<String>,
    groups: Option<RawGroups>,
    segments: Option<RawSegments>,
}

#[derive(Debug, Deserialize)]
struct RawGroups {
    #[serde(rename = "group", default)]
    groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSegments {
    #[serde(rename = "segment", default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(rename = "@bytes", default)]
    bytes: u64,
    #[serde(rename = "@number", default)]
    number: u32,
    #[serde(rename = "$value", default)]
    id: String,
}
