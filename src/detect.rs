//! File-type detection and MIME mapping
//!
//! Classification order: magic bytes from the first segment's decoded
//! body win; extension conventions break ties; everything else is plain.

use crate::types::FileType;
use regex::Regex;
use std::sync::LazyLock;

/// RAR 4.x signature
const RAR4_MAGIC: &[u8] = b"Rar!\x1A\x07\x00";
/// RAR 5.x signature
const RAR5_MAGIC: &[u8] = b"Rar!\x1A\x07\x01\x00";
/// 7-Zip signature
const SEVENZ_MAGIC: &[u8] = &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// `.part01.rar` style volume
static RAR_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.part(\d+)\.rar$").expect("static regex"));
/// `.r00`, `.r01` style volume (`.rar` is the first part)
static RAR_RNN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.r(\d+)$").expect("static regex"));
/// Plain `.rar`
static RAR_FIRST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.rar$").expect("static regex"));
/// `.7z.001` style volume
static SEVENZ_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.7z\.(\d+)$").expect("static regex"));
/// Plain `.7z`
static SEVENZ_FIRST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.7z$").expect("static regex"));

/// Classify content by magic bytes, falling back to the filename
pub fn detect_file_type(first_bytes: &[u8], filename: &str) -> FileType {
    if first_bytes.starts_with(RAR4_MAGIC) || first_bytes.starts_with(RAR5_MAGIC) {
        return FileType::Rar;
    }
    if first_bytes.starts_with(SEVENZ_MAGIC) {
        return FileType::SevenZ;
    }
    detect_archive_type_by_extension(filename)
}

/// Classify by extension conventions alone
pub fn detect_archive_type_by_extension(filename: &str) -> FileType {
    if RAR_PART_RE.is_match(filename)
        || RAR_RNN_RE.is_match(filename)
        || RAR_FIRST_RE.is_match(filename)
    {
        return FileType::Rar;
    }
    if SEVENZ_PART_RE.is_match(filename) || SEVENZ_FIRST_RE.is_match(filename) {
        return FileType::SevenZ;
    }
    FileType::Plain
}

/// True when the filename looks like any archive volume
pub fn is_archive_file(filename: &str) -> bool {
    detect_archive_type_by_extension(filename) != FileType::Plain
}

/// RAR volume number: `.partN.rar` → N, `.rNN` → NN+1, `.rar` → 0,
/// anything else → -1
pub fn rar_volume_number(filename: &str) -> i32 {
    if let Some(caps) = RAR_PART_RE.captures(filename) {
        return caps[1].parse().unwrap_or(-1);
    }
    if let Some(caps) = RAR_RNN_RE.captures(filename) {
        return caps[1].parse::<i32>().map(|n| n + 1).unwrap_or(-1);
    }
    if RAR_FIRST_RE.is_match(filename) {
        return 0;
    }
    -1
}

/// 7z volume number: `.7z.NNN` → NNN, `.7z` → 0, anything else → -1
pub fn sevenz_volume_number(filename: &str) -> i32 {
    if let Some(caps) = SEVENZ_PART_RE.captures(filename) {
        return caps[1].parse().unwrap_or(-1);
    }
    if SEVENZ_FIRST_RE.is_match(filename) {
        return 0;
    }
    -1
}

/// Strip the volume suffix, returning the base name and detected type
///
/// `video.part02.rar` → (`video`, Rar); names without an archive suffix
/// return `None`.
pub fn archive_base_name(filename: &str) -> Option<(String, FileType)> {
    for re in [&*RAR_PART_RE, &*RAR_RNN_RE, &*RAR_FIRST_RE] {
        if let Some(m) = re.find(filename) {
            return Some((filename[..m.start()].to_string(), FileType::Rar));
        }
    }
    for re in [&*SEVENZ_PART_RE, &*SEVENZ_FIRST_RE] {
        if let Some(m) = re.find(filename) {
            return Some((filename[..m.start()].to_string(), FileType::SevenZ));
        }
    }
    None
}

/// Video container extensions recognised for payload selection
const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "ts", "m2ts", "webm", "mpg", "mpeg", "vob", "flv",
];

/// True when the filename has a known video container extension
pub fn is_video_file(filename: &str) -> bool {
    extension(filename)
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// MIME type from a closed mapping of common media extensions
pub fn content_type(filename: &str) -> &'static str {
    match extension(filename).as_deref() {
        Some("mkv") => "video/x-matroska",
        Some("mp4" | "m4v") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("wmv") => "video/x-ms-wmv",
        Some("ts" | "m2ts") => "video/mp2t",
        Some("webm") => "video/webm",
        Some("mpg" | "mpeg" | "vob") => "video/mpeg",
        Some("flv") => "video/x-flv",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("aac") => "audio/aac",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/x-wav",
        Some("srt") => "application/x-subrip",
        Some("vtt") => "text/vtt",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("nfo" | "txt") => "text/plain",
        Some("nzb" | "xml") => "application/xml",
        Some("iso") => "application/x-iso9660-image",
        Some("rar") => "application/vnd.rar",
        Some("7z") => "application/x-7z-compressed",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}
