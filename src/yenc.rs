//! yEnc binary encoding for Usenet article bodies
//!
//! Decodes `=ybegin`/`=ypart`/`=yend` framed article bodies into raw bytes
//! plus the part metadata the streaming engine needs: multi-part articles
//! declare the decoded byte range they occupy within the whole file
//! (`=ypart begin/end`, 1-based inclusive) and the total file size
//! (`=ybegin size`), which is how segment byte ranges are discovered
//! without downloading the entire file.
//!
//! CRC32 checksums (`pcrc32` for parts, `crc32` for single-part articles)
//! are verified when present.

use crate::error::{Error, Result};

/// Parsed `=ybegin` line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YencHeader {
    /// Filename declared by the poster
    pub name: String,
    /// Total decoded size of the complete file
    pub size: u64,
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// Total number of parts, when declared
    pub total: Option<u32>,
}

/// Parsed `=ypart` line: the decoded byte range of this part,
/// 1-based inclusive as transmitted on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YencPart {
    /// First byte of the part within the file (1-based)
    pub begin: u64,
    /// Last byte of the part within the file (inclusive)
    pub end: u64,
}

/// Parsed `=yend` line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct YencTrailer {
    /// Decoded size declared by the trailer
    pub size: u64,
    /// Whole-file CRC32 (single-part posts)
    pub crc32: Option<u32>,
    /// Part CRC32 (multi-part posts)
    pub pcrc32: Option<u32>,
}

/// A fully decoded yEnc article body
#[derive(Clone, Debug)]
pub struct YencDecoded {
    /// The `=ybegin` metadata
    pub header: YencHeader,
    /// The `=ypart` metadata, absent for single-part posts
    pub part: Option<YencPart>,
    /// The `=yend` metadata
    pub trailer: YencTrailer,
    /// Decoded bytes
    pub data: Vec<u8>,
}

impl YencDecoded {
    /// True when the article is one part of a multi-part post
    pub fn is_multipart(&self) -> bool {
        self.part.is_some()
    }
}

/// Decode a raw yEnc article body
///
/// Tolerates leading article headers before `=ybegin`, CRLF or LF line
/// endings, and NNTP dot-stuffing. Fails on missing framing lines, a
/// trailer/data size mismatch, or a CRC32 mismatch.
pub fn decode(input: &[u8]) -> Result<YencDecoded> {
    let mut lines = input.split(|&b| b == b'\n').map(strip_cr);

    let mut header = None;
    for line in lines.by_ref() {
        if line.starts_with(b"=ybegin ") {
            header = Some(parse_header(line)?);
            break;
        }
    }
    let header = header.ok_or_else(|| Error::Yenc("missing =ybegin header".to_string()))?;

    let mut part = None;
    let mut data = Vec::with_capacity(header.size.min(1 << 22) as usize);
    let mut trailer = None;
    let mut first_data_line = true;

    for line in lines {
        if first_data_line && line.starts_with(b"=ypart ") {
            part = Some(parse_part(line)?);
            continue;
        }
        first_data_line = false;

        if line.starts_with(b"=yend") {
            trailer = Some(parse_trailer(line, header.part.is_some() || part.is_some()));
            break;
        }

        decode_line(line, &mut data);
    }

    let trailer = trailer.ok_or_else(|| Error::Yenc("missing =yend trailer".to_string()))?;

    if trailer.size != data.len() as u64 {
        return Err(Error::Yenc(format!(
            "size mismatch: trailer declares {}, decoded {}",
            trailer.size,
            data.len()
        )));
    }

    if let Some(expected) = trailer.pcrc32.or(trailer.crc32) {
        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(Error::Yenc(format!(
                "crc32 mismatch: expected {expected:08x}, actual {actual:08x}"
            )));
        }
    }

    Ok(YencDecoded {
        header,
        part,
        trailer,
        data,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Decode one data line, handling escape bytes and dot-stuffing
fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    // NNTP doubles a leading dot; undo before decoding
    let line = if line.starts_with(b"..") { &line[1..] } else { line };

    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'=' {
            i += 1;
            if i >= line.len() {
                break;
            }
            out.push(line[i].wrapping_sub(64).wrapping_sub(42));
        } else {
            out.push(b.wrapping_sub(42));
        }
        i += 1;
    }
}

fn parse_header(line: &[u8]) -> Result<YencHeader> {
    let text = String::from_utf8_lossy(line);
    let size = param(&text, "size")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Yenc("missing size parameter in =ybegin".to_string()))?;
    Ok(YencHeader {
        name: name_param(&text).unwrap_or_default(),
        size,
        part: param(&text, "part").and_then(|v| v.parse().ok()),
        total: param(&text, "total").and_then(|v| v.parse().ok()),
    })
}

fn parse_part(line: &[u8]) -> Result<YencPart> {
    let text = String::from_utf8_lossy(line);
    let begin = param(&text, "begin")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Yenc("missing begin parameter in =ypart".to_string()))?;
    let end = param(&text, "end")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Yenc("missing end parameter in =ypart".to_string()))?;
    if end < begin {
        return Err(Error::Yenc(format!("invalid =ypart range {begin}-{end}")));
    }
    Ok(YencPart { begin, end })
}

fn parse_trailer(line: &[u8], multipart: bool) -> YencTrailer {
    let text = String::from_utf8_lossy(line);
    let size = param(&text, "size")
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    let mut trailer = YencTrailer {
        size,
        ..Default::default()
    };
    if multipart {
        trailer.pcrc32 = param(&text, "pcrc32").and_then(|v| u32::from_str_radix(v, 16).ok());
    } else {
        trailer.crc32 = param(&text, "crc32").and_then(|v| u32::from_str_radix(v, 16).ok());
    }
    trailer
}

/// Extract a `key=value` parameter from a metadata line
fn param<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!(" {key}=");
    let start = line.find(&pattern)? + pattern.len();
    let rest = &line[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// The `name` parameter is always last and may contain spaces
fn name_param(line: &str) -> Option<String> {
    let start = line.find(" name=")? + " name=".len();
    Some(line[start..].trim().to_string())
}

/// Encode bytes as a yEnc article body
///
/// `part` carries `(part_number, total_parts, begin, end, file_size)` for
/// multi-part posts; pass `None` for single-part articles. Used by posters
/// and heavily by the test suite to synthesize realistic segments.
pub fn encode(data: &[u8], name: &str, part: Option<(u32, u32, u64, u64, u64)>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 256);
    let crc = crc32fast::hash(data);

    match part {
        Some((number, total, begin, end, file_size)) => {
            out.extend_from_slice(
                format!(
                    "=ybegin part={number} total={total} line=128 size={file_size} name={name}\r\n"
                )
                .as_bytes(),
            );
            out.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
        }
        None => {
            out.extend_from_slice(
                format!("=ybegin line=128 size={} name={name}\r\n", data.len()).as_bytes(),
            );
        }
    }

    let mut column = 0;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let must_escape = matches!(encoded, 0x00 | 0x0A | 0x0D | b'=') || (column == 0 && encoded == b'.');
        if must_escape {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            column += 2;
        } else {
            out.push(encoded);
            column += 1;
        }
        if column >= 128 {
            out.extend_from_slice(b"\r\n");
            column = 0;
        }
    }
    if column > 0 {
        out.extend_from_slice(b"\r\n");
    }

    match part {
        Some((number, _, _, _, _)) => {
            out.extend_from_slice(
                format!(
                    "=yend size={} part={number} pcrc32={crc:08x}\r\n",
                    data.len()
                )
                .as_bytes(),
            );
        }
        None => {
            out.extend_from_slice(
                format!("=yend size={} crc32={crc:08x}\r\n", data.len()).as_bytes(),
            );
        }
    }

    out
}
