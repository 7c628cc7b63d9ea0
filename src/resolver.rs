//! Content-path resolution and the public streaming API
//!
//! A content path is a `::`-separated list of names: the first names a
//! file in the NZB (declared name or persisted alias), each further
//! element names an entry inside the archive opened at the previous
//! step. Resolution descends through adapters over virtual filesystems,
//! and every nesting level it opens travels with the returned [`Stream`]
//! so a single close tears the whole chain down, leaves first.

use crate::archive::rar::RarArchive;
use crate::archive::sevenz::SevenZArchive;
use crate::archive::volume::{VolumeCandidate, VolumeGroup, group_archive_volumes};
use crate::archive::{Archive, ArchiveFile};
use crate::detect;
use crate::error::{Error, Result};
use crate::nzb::{Nzb, NzbFile};
use crate::pool::Pool;
use crate::stream::FileStream;
use crate::types::{ContentFile, FileType};
use crate::vfs::{ArchiveFs, NzbFs, Vfs, VfsFile};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Per-request streaming options
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    /// Archive password, when known
    pub password: String,
    /// Per-stream buffer budget override; 0 uses the configured default
    pub segment_buffer_size: u64,
    /// Persisted content records for alias resolution
    pub content_files: Vec<ContentFile>,
}

/// Resources a stream must release on close, innermost first
enum StreamGuard {
    Archive(Box<dyn Archive>),
    Fs(Arc<NzbFs>),
}

/// A resolved byte stream plus its response metadata
///
/// Implements `AsyncRead`/`AsyncSeek` by delegation; closing (or
/// dropping) releases every archive adapter and virtual filesystem the
/// resolution opened, joining any errors instead of hiding them.
pub struct Stream {
    /// Name of the streamed file
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// MIME type derived from the name
    pub content_type: String,
    reader: Box<dyn VfsFile>,
    guards: Vec<StreamGuard>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl Stream {
    fn plain(name: String, reader: Box<dyn VfsFile>) -> Self {
        let size = reader.size();
        let content_type = detect::content_type(&name).to_string();
        Self {
            name,
            size,
            content_type,
            reader,
            guards: Vec::new(),
        }
    }

    /// Close the reader and every nested archive/filesystem, innermost
    /// first, returning all failures joined
    pub fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for guard in &mut self.guards {
            if let StreamGuard::Archive(archive) = guard {
                if let Err(err) = archive.close() {
                    failures.push(err.to_string());
                }
            } else if let StreamGuard::Fs(fs) = guard {
                fs.close();
            }
        }
        self.guards.clear();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::other(failures.join("; "))))
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.reader).poll_read(cx, buf)
    }
}

impl AsyncSeek for Stream {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut *self.reader).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut *self.reader).poll_complete(cx)
    }
}

/// Inspection result for a whole NZB
#[derive(Clone, Debug, Default)]
pub struct NzbContent {
    /// Top-level content records (archives grouped, then plain files)
    pub files: Vec<ContentFile>,
    /// Whether every piece of content can be streamed
    pub streamable: bool,
}

/// Match a path element against the NZB and the persisted records
///
/// Content records are consulted first (by name or alias); the winning
/// record's canonical name is then looked up among the NZB's files.
fn find_file_by_name<'a>(
    nzb: &'a Nzb,
    content_files: &'a [ContentFile],
    name: &str,
) -> Option<(&'a NzbFile, Option<&'a ContentFile>)> {
    let name = name.trim_matches('/');

    let mut lookup = name;
    let mut matched_record = None;
    for record in content_files {
        if record.name.eq_ignore_ascii_case(name)
            || (!record.alias.is_empty() && record.alias.eq_ignore_ascii_case(name))
        {
            matched_record = Some(record);
            lookup = &record.name;
            break;
        }
    }

    nzb.find_file(lookup).map(|file| (file, matched_record))
}

impl Pool {
    /// Stream the file addressed by a content path
    ///
    /// `path[0]` names a file in the NZB; each further element names an
    /// entry of the archive opened from the previous step. Names compare
    /// case-insensitively after trimming slashes.
    pub async fn stream_by_content_path(
        &self,
        nzb: &Arc<Nzb>,
        path: &[String],
        opts: &StreamOptions,
    ) -> Result<Stream> {
        if path.is_empty() || path[0].is_empty() {
            return Err(Error::OutOfRange(format!(
                "invalid content path: {}",
                path.join("::")
            )));
        }

        let name = path[0].trim_matches('/');
        let (file, record) = find_file_by_name(nzb, &opts.content_files, name)
            .ok_or_else(|| Error::NotFound(format!("no file matching '{name}' found")))?;

        if path.len() == 1 {
            return self.stream_plain_file(file, opts).await;
        }

        // The archive may live under a placeholder filename; prefer the
        // persisted record's naming. A missing record falls back to the
        // NZB file's declared name.
        let archive_name = match record {
            Some(record) if !record.alias.is_empty() => record.alias.clone(),
            Some(record) => record.name.clone(),
            None => file.name().to_string(),
        };

        let first = self.fetch_first_segment(file).await?;
        let file_type = detect::detect_file_type(&first.body, &archive_name);

        debug!(
            name,
            archive = archive_name,
            ?file_type,
            "descending into archive"
        );

        let cancel = CancellationToken::new();
        let mut fs = NzbFs::new(nzb.clone(), self.clone(), opts.segment_buffer_size, &cancel);
        if let Some(record) = record {
            let aliases: HashMap<String, String> = record
                .parts
                .iter()
                .filter(|part| !part.alias.is_empty())
                .map(|part| (part.alias.clone(), part.name.clone()))
                .collect();
            if !aliases.is_empty() {
                fs.set_aliases(aliases);
            }
        }
        let fs = Arc::new(fs);

        let mut archive: Box<dyn Archive> = match file_type {
            FileType::Rar => Box::new(RarArchive::new(fs.clone(), archive_name)),
            FileType::SevenZ => Box::new(SevenZArchive::new(fs.clone(), archive_name)),
            FileType::Plain => {
                fs.close();
                return Err(Error::NotStreamable(format!(
                    "file '{name}' is not an archive"
                )));
            }
        };

        if let Err(err) = archive.open(&opts.password).await {
            fs.close();
            return Err(err);
        }
        if !archive.is_streamable() {
            let _ = archive.close();
            fs.close();
            return Err(Error::NotStreamable(format!(
                "non-streamable {file_type} archive"
            )));
        }

        match stream_target_from_archive(archive.as_ref(), &path[1..]).await {
            Ok(mut stream) => {
                stream.guards.push(StreamGuard::Archive(archive));
                stream.guards.push(StreamGuard::Fs(fs));
                Ok(stream)
            }
            Err(err) => {
                let _ = archive.close();
                fs.close();
                Err(err)
            }
        }
    }

    /// Convenience: stream a single NZB file by name
    pub async fn stream_file_by_name(
        &self,
        nzb: &Arc<Nzb>,
        name: &str,
        opts: &StreamOptions,
    ) -> Result<Stream> {
        self.stream_by_content_path(nzb, &[name.to_string()], opts)
            .await
    }

    /// Stream the main payload without a content path
    ///
    /// Picks the largest file that looks like media or an archive and
    /// routes by sniffed type: plain files stream directly, archives are
    /// searched for nested archives first, then for their largest video
    /// entry.
    pub async fn stream_largest_file(
        &self,
        nzb: &Arc<Nzb>,
        opts: &StreamOptions,
    ) -> Result<Stream> {
        if nzb.files.is_empty() {
            return Err(Error::NotFound("NZB has no files".to_string()));
        }

        let idx = nzb
            .largest_file_idx(|name| !detect::is_video_file(name) && !detect::is_archive_file(name))
            .ok_or_else(|| Error::NotFound("no media or archive files in NZB".to_string()))?;
        let file = &nzb.files[idx];

        trace!(idx, name = file.name(), "largest candidate selected");

        let first = self.fetch_first_segment(file).await?;
        let file_type = detect::detect_file_type(&first.body, file.name());

        match file_type {
            FileType::Plain => self.stream_plain_file(file, opts).await,
            FileType::Rar | FileType::SevenZ => {
                let cancel = CancellationToken::new();
                let fs = Arc::new(NzbFs::new(
                    nzb.clone(),
                    self.clone(),
                    opts.segment_buffer_size,
                    &cancel,
                ));
                let mut archive: Box<dyn Archive> = match file_type {
                    FileType::Rar => Box::new(RarArchive::from_vfs(fs.clone())),
                    _ => Box::new(SevenZArchive::from_vfs(fs.clone())),
                };
                if let Err(err) = archive.open(&opts.password).await {
                    fs.close();
                    return Err(err);
                }
                match stream_payload_from_archive(archive.as_ref(), file_type).await {
                    Ok(mut stream) => {
                        stream.guards.push(StreamGuard::Archive(archive));
                        stream.guards.push(StreamGuard::Fs(fs));
                        Ok(stream)
                    }
                    Err(err) => {
                        let _ = archive.close();
                        fs.close();
                        Err(err)
                    }
                }
            }
        }
    }

    async fn stream_plain_file(
        &self,
        file: &NzbFile,
        opts: &StreamOptions,
    ) -> Result<Stream> {
        trace!(
            filename = file.name(),
            segment_count = file.segment_count(),
            "creating plain stream"
        );
        let stream = FileStream::open(
            self.clone(),
            Arc::new(file.clone()),
            opts.segment_buffer_size,
            &CancellationToken::new(),
        )
        .await?;
        Ok(Stream::plain(file.name().to_string(), Box::new(stream)))
    }

    /// Inspect an NZB once, producing the persistent content records
    ///
    /// Classifies every file by first-segment sniff, groups multi-volume
    /// archives, opens each archive to list its entries and judge
    /// streamability. Problems are recorded per content file rather than
    /// failing the inspection.
    pub async fn inspect_nzb_content(
        &self,
        nzb: &Arc<Nzb>,
        password: &str,
    ) -> Result<NzbContent> {
        let mut sniffed: Vec<SniffedFile> = Vec::new();

        for file in &nzb.files {
            match self.fetch_first_segment(file).await {
                Ok(first) => sniffed.push(SniffedFile {
                    name: file.name().to_string(),
                    size: first.file_size,
                    kind: detect::detect_file_type(&first.body, file.name()),
                    error: None,
                }),
                Err(err) => sniffed.push(SniffedFile {
                    name: file.name().to_string(),
                    size: file.size(),
                    kind: detect::detect_archive_type_by_extension(file.name()),
                    error: Some(err.to_string()),
                }),
            }
        }

        let groups = group_archive_volumes(&sniffed);
        let mut grouped_names: Vec<String> = Vec::new();
        let mut files = Vec::new();
        let mut streamable = true;

        for group in &groups {
            grouped_names.extend(group.files.iter().map(|f| f.name.clone()));
            let record = self
                .inspect_archive_group(nzb, group, password)
                .await;
            streamable &= record.streamable;
            files.push(record);
        }

        for file in &sniffed {
            if grouped_names.iter().any(|n| n.eq_ignore_ascii_case(&file.name)) {
                continue;
            }
            let record = ContentFile {
                kind: FileType::Plain,
                name: file.name.clone(),
                size: file.size,
                streamable: file.error.is_none(),
                errors: file.error.clone().into_iter().collect(),
                ..Default::default()
            };
            streamable &= record.streamable;
            files.push(record);
        }

        Ok(NzbContent { files, streamable })
    }

    /// Open one grouped archive and describe it
    async fn inspect_archive_group(
        &self,
        nzb: &Arc<Nzb>,
        group: &VolumeGroup<SniffedFile>,
        password: &str,
    ) -> ContentFile {
        let extension = match group.file_type {
            FileType::SevenZ => "7z",
            _ => "rar",
        };
        let display_name = format!("{}.{extension}", group.base_name);
        let first_name = group.files[0].name.clone();

        let mut record = ContentFile {
            kind: group.file_type,
            name: first_name.clone(),
            alias: if display_name.eq_ignore_ascii_case(&first_name) {
                String::new()
            } else {
                display_name
            },
            size: group.total_size,
            streamable: false,
            ..Default::default()
        };

        // Volume list; aliased sets get synthesised decoder-facing names
        // so the adapters can walk them by convention. The adapter-level
        // "unknown volume" sentinel (-1) is normalised to 0 here: the
        // persisted record omits the field for anything that is not a
        // numbered volume.
        for (file, &volume) in group.files.iter().zip(&group.volumes) {
            let volume = volume.max(0);
            let alias = if group.aliased && volume > 0 {
                match group.file_type {
                    FileType::SevenZ => {
                        format!("{}.7z.{volume:03}", group.base_name)
                    }
                    _ => format!("{}.part{volume:02}.rar", group.base_name),
                }
            } else {
                String::new()
            };
            record.parts.push(ContentFile {
                kind: group.file_type,
                name: file.name.clone(),
                alias,
                size: file.size,
                streamable: true,
                volume,
                ..Default::default()
            });
        }

        if let Some(err) = group.files.iter().find_map(|f| f.error.clone()) {
            record.errors.push(err);
            return record;
        }

        let cancel = CancellationToken::new();
        let mut fs = NzbFs::new(nzb.clone(), self.clone(), 0, &cancel);
        let aliases: HashMap<String, String> = record
            .parts
            .iter()
            .filter(|part| !part.alias.is_empty())
            .map(|part| (part.alias.clone(), part.name.clone()))
            .collect();
        if !aliases.is_empty() {
            fs.set_aliases(aliases);
        }
        let fs = Arc::new(fs);

        let archive_name = record
            .parts
            .first()
            .map(|part| {
                if part.alias.is_empty() {
                    part.name.clone()
                } else {
                    part.alias.clone()
                }
            })
            .unwrap_or_else(|| record.name.clone());

        let mut archive: Box<dyn Archive> = match group.file_type {
            FileType::SevenZ => Box::new(SevenZArchive::new(fs.clone(), archive_name)),
            _ => Box::new(RarArchive::new(fs.clone(), archive_name)),
        };

        match archive.open(password).await {
            Ok(()) => {
                record.streamable = archive.is_streamable();
                match archive.files() {
                    Ok(entries) => {
                        for entry in entries {
                            record.streamable &= entry.is_streamable();
                            record.files.push(ContentFile {
                                kind: entry.file_type(),
                                name: entry.name().to_string(),
                                size: entry.size(),
                                streamable: entry.is_streamable(),
                                volume: entry.volume().max(0),
                                ..Default::default()
                            });
                        }
                    }
                    Err(err) => {
                        record.streamable = false;
                        record.errors.push(err.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(name = record.name, error = %err, "archive inspection failed");
                record.errors.push(err.to_string());
            }
        }

        let _ = archive.close();
        fs.close();
        record
    }
}

/// A file with its sniffed classification, as grouped during inspection
#[derive(Clone, Debug)]
struct SniffedFile {
    name: String,
    size: u64,
    kind: FileType,
    error: Option<String>,
}

impl VolumeCandidate for SniffedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn file_type_hint(&self) -> FileType {
        self.kind
    }
}

impl VolumeCandidate for Arc<dyn ArchiveFile> {
    fn name(&self) -> &str {
        ArchiveFile::name(self.as_ref())
    }

    fn size(&self) -> u64 {
        ArchiveFile::size(self.as_ref())
    }
}

fn base_entry_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Descend one archive level toward the target
///
/// Terminal path elements open the matched entry; non-terminal elements
/// must name an inner archive, whose volumes (located among this
/// archive's entries) become an [`ArchiveFs`] for the next level.
async fn stream_target_from_archive(archive: &dyn Archive, parts: &[String]) -> Result<Stream> {
    let files = archive.files()?;

    let target = parts[0].trim_matches('/');
    let remaining = &parts[1..];

    let entry = files
        .iter()
        .find(|f| f.name().eq_ignore_ascii_case(target))
        .ok_or_else(|| Error::NotFound(format!("no file matching '{target}' found in archive")))?;

    if remaining.is_empty() {
        if !entry.is_streamable() {
            return Err(Error::NotStreamable(format!(
                "file '{}' is not streamable",
                entry.name()
            )));
        }
        let reader = entry.open().await?;
        return Ok(Stream::plain(entry.name().to_string(), reader));
    }

    if !entry.is_streamable() {
        return Err(Error::NotStreamable(format!(
            "inner archive '{}' is not streamable",
            entry.name()
        )));
    }

    // Locate the multi-volume group containing the target, if any
    let groups = group_archive_volumes(&files);
    let matched = groups.into_iter().find(|group| {
        group
            .files
            .iter()
            .any(|f| f.name().eq_ignore_ascii_case(target))
    });

    let (volumes, inner_type) = match matched {
        Some(group) => {
            for volume in &group.files {
                if !volume.is_streamable() {
                    return Err(Error::NotStreamable(format!(
                        "inner archive part '{}' is not streamable",
                        volume.name()
                    )));
                }
            }
            (group.files, group.file_type)
        }
        None => (
            vec![entry.clone()],
            detect::detect_archive_type_by_extension(entry.name()),
        ),
    };

    let first_name = base_entry_name(volumes[0].name()).to_string();
    let inner_fs: Arc<dyn Vfs> = Arc::new(ArchiveFs::new(volumes));

    let mut inner: Box<dyn Archive> = match inner_type {
        FileType::Rar => Box::new(RarArchive::new(inner_fs, first_name)),
        FileType::SevenZ => Box::new(SevenZArchive::new(inner_fs, first_name)),
        FileType::Plain => {
            return Err(Error::NotStreamable(format!(
                "unsupported inner archive type for '{target}'"
            )));
        }
    };

    if let Err(err) = inner.open("").await {
        let _ = inner.close();
        return Err(err);
    }
    if !inner.is_streamable() {
        let _ = inner.close();
        return Err(Error::NotStreamable(format!(
            "non-streamable inner {inner_type} archive"
        )));
    }

    match Box::pin(stream_target_from_archive(inner.as_ref(), remaining)).await {
        Ok(mut stream) => {
            stream.guards.push(StreamGuard::Archive(inner));
            Ok(stream)
        }
        Err(err) => {
            let _ = inner.close();
            Err(err)
        }
    }
}

/// Legacy payload selection inside an archive: nested archive groups by
/// descending size first, then the largest video entry
async fn stream_payload_from_archive(
    archive: &dyn Archive,
    archive_type: FileType,
) -> Result<Stream> {
    if !archive.is_streamable() {
        return Err(Error::NotStreamable(format!(
            "non-streamable {archive_type} archive"
        )));
    }

    let files = archive.files()?;

    let groups = group_archive_volumes(&files);
    let mut last_err = None;
    for group in groups {
        trace!(
            base_name = group.base_name,
            parts = group.files.len(),
            "trying nested archive group"
        );
        match try_nested_group(group).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(error = %err, "nested archive group failed");
                last_err = Some(err);
            }
        }
    }

    let videos: Vec<_> = files
        .iter()
        .filter(|f| detect::is_video_file(f.name()))
        .collect();
    let Some(video) = videos.iter().max_by_key(|f| f.size()) else {
        return Err(last_err.unwrap_or_else(|| {
            Error::NotFound(format!(
                "no video files or nested archives found in {archive_type} archive"
            ))
        }));
    };

    if !video.is_streamable() {
        return Err(Error::NotStreamable(format!(
            "non-streamable file in {archive_type} archive"
        )));
    }
    let reader = video.open().await?;
    Ok(Stream::plain(video.name().to_string(), reader))
}

async fn try_nested_group(group: VolumeGroup<Arc<dyn ArchiveFile>>) -> Result<Stream> {
    for file in &group.files {
        if !file.is_streamable() {
            return Err(Error::NotStreamable(format!(
                "inner archive part '{}' is not streamable",
                file.name()
            )));
        }
    }

    let first_name = base_entry_name(group.files[0].name()).to_string();
    let inner_fs: Arc<dyn Vfs> = Arc::new(ArchiveFs::new(group.files));
    let mut inner: Box<dyn Archive> = match group.file_type {
        FileType::Rar => Box::new(RarArchive::new(inner_fs, first_name)),
        FileType::SevenZ => Box::new(SevenZArchive::new(inner_fs, first_name)),
        FileType::Plain => {
            return Err(Error::NotStreamable(
                "unsupported inner archive type".to_string(),
            ));
        }
    };

    if let Err(err) = inner.open("").await {
        let _ = inner.close();
        return Err(err);
    }

    match stream_video_from_inner(inner.as_ref(), group.file_type).await {
        Ok(mut stream) => {
            stream.guards.push(StreamGuard::Archive(inner));
            Ok(stream)
        }
        Err(err) => {
            let _ = inner.close();
            Err(err)
        }
    }
}

async fn stream_video_from_inner(inner: &dyn Archive, inner_type: FileType) -> Result<Stream> {
    if !inner.is_streamable() {
        return Err(Error::NotStreamable(format!(
            "non-streamable inner {inner_type} archive"
        )));
    }
    let files = inner.files()?;
    let video = files
        .iter()
        .filter(|f| detect::is_video_file(f.name()))
        .max_by_key(|f| f.size())
        .ok_or_else(|| {
            Error::NotFound(format!("no video files found in inner {inner_type} archive"))
        })?;
    if !video.is_streamable() {
        return Err(Error::NotStreamable(format!(
            "non-streamable file in inner {inner_type} archive"
        )));
    }
    let reader = video.open().await?;
    Ok(Stream::plain(video.name().to_string(), reader))
}
