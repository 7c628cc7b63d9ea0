//! 7z adapter over the virtual filesystem
//!
//! Header decoding is delegated to `zesven`; the volumes (`.7z.001`,
//! `.7z.002`, ... are a raw byte split of one archive) are concatenated
//! into a single seekable stream and handed to the synchronous decoder
//! on a blocking thread, the same way extraction tools are bridged
//! elsewhere in the ecosystem. The decoder must seek (the 7z header
//! lives at the end of the archive), so the bridge implements both
//! `Read` and `Seek` over the async chain.
//!
//! Streamable entries are those in non-solid, Copy-coded, unencrypted
//! folders: their unpacked bytes are a raw range of the packed stream,
//! which maps back to ranges of the underlying volumes.

use crate::archive::{Archive, ArchiveFile, ChainReader, RangeReader};
use crate::detect;
use crate::error::{Error, Result};
use crate::vfs::{Vfs, VfsFile};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use zesven::format::SIGNATURE_HEADER_SIZE;
use zesven::format::parser::ArchiveHeader;

/// Blocking `Read + Seek` over an async [`ChainReader`]
///
/// `zesven` reads headers through `std::io` traits and seeks to the
/// end-of-archive header, so a forward-only bridge is not enough. Each
/// call drives the underlying async handle to completion on the
/// captured runtime handle; instances must only be used from a blocking
/// thread (`spawn_blocking`).
struct BlockingChain {
    handle: tokio::runtime::Handle,
    inner: ChainReader,
}

impl BlockingChain {
    /// Capture the current runtime; call from async context, use the
    /// value inside `spawn_blocking`
    fn new(inner: ChainReader) -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            inner,
        }
    }
}

impl std::io::Read for BlockingChain {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.handle.block_on(self.inner.read(buf))
    }
}

impl std::io::Seek for BlockingChain {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.handle.block_on(self.inner.seek(pos))
    }
}

/// Entry facts extracted from the decoded header, in crate-local form
#[derive(Clone, Debug, PartialEq, Eq)]
struct EntrySpec {
    name: String,
    size: u64,
    packed_size: u64,
    /// Absolute offset of the entry's bytes in the concatenated archive
    /// stream, for stored entries
    offset: Option<u64>,
    streamable: bool,
    directory: bool,
}

/// One volume of the archive with its observed size
#[derive(Clone, Debug)]
struct Volume {
    name: String,
    size: u64,
}

struct SevenZEntry {
    vfs: Arc<dyn Vfs>,
    volumes: Arc<Vec<Volume>>,
    spec: EntrySpec,
    volume_number: i32,
}

#[async_trait]
impl ArchiveFile for SevenZEntry {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn size(&self) -> u64 {
        self.spec.size
    }

    fn packed_size(&self) -> u64 {
        self.spec.packed_size
    }

    fn volume(&self) -> i32 {
        self.volume_number
    }

    fn is_streamable(&self) -> bool {
        self.spec.streamable
    }

    async fn open(&self) -> Result<Box<dyn VfsFile>> {
        let offset = match (self.spec.streamable, self.spec.offset) {
            (true, Some(offset)) => offset,
            _ => {
                return Err(Error::NotStreamable(format!(
                    "7z entry '{}' is not stored/streamable",
                    self.spec.name
                )));
            }
        };

        let mut parts = Vec::new();
        for (volume_start, volume) in volume_offsets(&self.volumes) {
            let entry_range = offset..offset + self.spec.size;
            let volume_range = volume_start..volume_start + volume.size;
            let start = entry_range.start.max(volume_range.start);
            let end = entry_range.end.min(volume_range.end);
            if start >= end {
                continue;
            }
            let handle = self.vfs.open(&volume.name).await?;
            parts.push(RangeReader::new(handle, start - volume_start, end - start));
        }
        Ok(Box::new(ChainReader::new(parts)))
    }
}

fn volume_offsets(volumes: &[Volume]) -> impl Iterator<Item = (u64, &Volume)> {
    let mut offset = 0u64;
    volumes.iter().map(move |v| {
        let start = offset;
        offset += v.size;
        (start, v)
    })
}

/// 7z archive adapter
pub struct SevenZArchive {
    vfs: Arc<dyn Vfs>,
    first_volume: String,
    opened: bool,
    solid: bool,
    readable: bool,
    entries: Vec<Arc<dyn ArchiveFile>>,
}

impl SevenZArchive {
    /// Adapter over `vfs`, starting at the named first volume
    pub fn new(vfs: Arc<dyn Vfs>, first_volume: impl Into<String>) -> Self {
        Self {
            vfs,
            first_volume: first_volume.into(),
            opened: false,
            solid: false,
            readable: false,
            entries: Vec::new(),
        }
    }

    /// Adapter over `vfs`, deriving the first volume from the listing
    pub fn from_vfs(vfs: Arc<dyn Vfs>) -> Self {
        let mut volumes: Vec<(i32, String)> = vfs
            .names()
            .into_iter()
            .filter_map(|name| {
                let n = detect::sevenz_volume_number(&name);
                (n >= 0).then_some((n, name))
            })
            .collect();
        volumes.sort_by(|a, b| a.0.cmp(&b.0));
        let first = volumes
            .into_iter()
            .next()
            .map(|(_, name)| name)
            .unwrap_or_default();
        Self::new(vfs, first)
    }

    /// Resolve the ordered volume list, following the `.7z.NNN` raw
    /// split convention from the first volume's name
    async fn collect_volumes(&self) -> Result<Vec<Volume>> {
        let mut name = self.first_volume.clone();
        let mut volumes = Vec::new();

        loop {
            let stat = match self.vfs.stat(&name).await {
                Ok(stat) => stat,
                Err(err) if volumes.is_empty() => return Err(err),
                Err(_) => break,
            };
            volumes.push(Volume {
                name: name.clone(),
                size: stat.size,
            });

            // Only numbered splits continue; a plain .7z is the whole archive
            let Some(next) = next_split_name(&name) else {
                break;
            };
            name = next;
        }

        Ok(volumes)
    }
}

#[async_trait]
impl Archive for SevenZArchive {
    async fn open(&mut self, password: &str) -> Result<()> {
        if self.opened {
            return Ok(());
        }

        let volumes = self.collect_volumes().await?;

        let mut parts = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            let handle = self.vfs.open(&volume.name).await?;
            parts.push(RangeReader::new(handle, 0, volume.size));
        }
        let chain = ChainReader::new(parts);

        // zesven's header reader is synchronous and seeks: bridge the
        // async chain onto a blocking thread for the duration of the
        // parse.
        let bridge = BlockingChain::new(chain);
        let password = password.to_string();
        let header = tokio::task::spawn_blocking(move || {
            let mut reader = bridge;
            let parsed = if password.is_empty() {
                zesven::format::parser::read_archive_header(&mut reader, None)
            } else {
                zesven::format::parser::read_archive_header_with_password(
                    &mut reader,
                    None,
                    Some(zesven::Password::new(&password)),
                )
            };
            parsed.map(|(_, header)| header)
        })
        .await
        .map_err(|e| Error::NotStreamable(format!("7z header task failed: {e}")))?
        .map_err(|e| Error::NotStreamable(format!("failed to read 7z header: {e}")))?;

        self.readable = !header.header_encrypted || header.files_info.is_some();
        self.solid = is_solid(&header);

        let volumes = Arc::new(volumes);
        let specs = classify_entries(&header);
        self.entries = specs
            .into_iter()
            .map(|spec| {
                let volume_number = spec
                    .offset
                    .and_then(|offset| {
                        volume_offsets(&volumes)
                            .find(|(start, v)| offset >= *start && offset < *start + v.size)
                            .map(|(_, v)| detect::sevenz_volume_number(&v.name))
                    })
                    .unwrap_or(-1);
                Arc::new(SevenZEntry {
                    vfs: self.vfs.clone(),
                    volumes: volumes.clone(),
                    spec,
                    volume_number,
                }) as Arc<dyn ArchiveFile>
            })
            .collect();
        self.opened = true;

        debug!(
            entries = self.entries.len(),
            solid = self.solid,
            "7z archive opened"
        );
        Ok(())
    }

    fn is_streamable(&self) -> bool {
        self.opened && self.readable && !self.solid
    }

    fn files(&self) -> Result<Vec<Arc<dyn ArchiveFile>>> {
        if !self.opened {
            return Err(Error::NotStreamable("7z archive not opened".to_string()));
        }
        Ok(self.entries.clone())
    }

    fn close(&mut self) -> Result<()> {
        self.entries.clear();
        self.opened = false;
        Ok(())
    }
}

/// `.7z.NNN` → `.7z.(NNN+1)`, width preserved; plain `.7z` has no split
fn next_split_name(name: &str) -> Option<String> {
    let (stem, digits) = name.rsplit_once('.')?;
    if !stem.to_ascii_lowercase().ends_with(".7z") {
        return None;
    }
    let next: u64 = digits.parse().ok()?;
    Some(format!("{stem}.{:0width$}", next + 1, width = digits.len()))
}

/// Solid when any folder packs more than one substream
fn is_solid(header: &ArchiveHeader) -> bool {
    header
        .substreams_info
        .as_ref()
        .is_some_and(|ss| ss.num_unpack_streams_in_folders.iter().any(|&n| n > 1))
}

/// Walk header entries, assigning folders and computing raw offsets for
/// stored entries
fn classify_entries(header: &ArchiveHeader) -> Vec<EntrySpec> {
    let Some(files_info) = header.files_info.as_ref() else {
        return Vec::new();
    };

    let folders = header
        .unpack_info
        .as_ref()
        .map(|ui| ui.folders.as_slice())
        .unwrap_or_default();
    let pack_sizes = header
        .pack_info
        .as_ref()
        .map(|pi| pi.pack_sizes.as_slice())
        .unwrap_or_default();
    let pack_pos = header.pack_info.as_ref().map(|pi| pi.pack_pos).unwrap_or(0);
    let streams_per_folder: Vec<u64> = match header.substreams_info.as_ref() {
        Some(ss) => ss.num_unpack_streams_in_folders.clone(),
        None => vec![1; folders.len()],
    };
    let solid = streams_per_folder.iter().any(|&n| n > 1);

    let data_start = SIGNATURE_HEADER_SIZE + pack_pos;

    let mut specs = Vec::with_capacity(files_info.entries.len());
    let mut folder_idx = 0usize;
    let mut stream_in_folder = 0u64;

    for entry in &files_info.entries {
        if entry.is_directory || !entry.has_stream {
            specs.push(EntrySpec {
                name: entry.name.clone(),
                size: 0,
                packed_size: 0,
                offset: None,
                streamable: false,
                directory: entry.is_directory,
            });
            continue;
        }

        let folder = folders.get(folder_idx);
        let packed_size = pack_sizes.get(folder_idx).copied().unwrap_or(0);
        let folder_offset: u64 =
            data_start + pack_sizes.iter().take(folder_idx).sum::<u64>();

        // Stored entries sit in single-coder Copy folders holding one
        // substream; anything else needs decompression state.
        let copy_folder = folder.is_some_and(|f| {
            f.coders.len() == 1
                && f.coders[0].method_id.as_slice() == zesven::codec::method::COPY
        });
        let exclusive = streams_per_folder.get(folder_idx).copied().unwrap_or(1) == 1;
        let streamable = copy_folder && exclusive && !solid;

        specs.push(EntrySpec {
            name: entry.name.clone(),
            size: entry.size,
            packed_size: if exclusive { packed_size } else { 0 },
            offset: streamable.then_some(folder_offset),
            streamable,
            directory: false,
        });

        // Advance the folder walk
        stream_in_folder += 1;
        if stream_in_folder >= streams_per_folder.get(folder_idx).copied().unwrap_or(1) {
            stream_in_folder = 0;
            folder_idx += 1;
        }
    }

    specs
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use zesven::format::files::{ArchiveEntry, FilesInfo};
    use zesven::format::streams::{Coder, Folder, PackInfo, SubStreamsInfo, UnpackInfo};

    fn file_entry(name: &str, size: u64) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            has_stream: true,
            size,
            ..Default::default()
        }
    }

    fn copy_coder() -> Coder {
        Coder {
            method_id: vec![0x00],
            num_in_streams: 1,
            num_out_streams: 1,
            properties: None,
        }
    }

    fn lzma_coder() -> Coder {
        Coder {
            method_id: vec![0x03, 0x01, 0x01],
            num_in_streams: 1,
            num_out_streams: 1,
            properties: None,
        }
    }

    fn folder(coder: Coder, unpack_size: u64) -> Folder {
        Folder {
            coders: vec![coder],
            bind_pairs: Vec::new(),
            packed_streams: vec![0],
            unpack_sizes: vec![unpack_size],
            unpack_crc: None,
        }
    }

    fn header(
        entries: Vec<ArchiveEntry>,
        folders: Vec<Folder>,
        pack_sizes: Vec<u64>,
        streams_per_folder: Option<Vec<u64>>,
    ) -> ArchiveHeader {
        ArchiveHeader {
            pack_info: Some(PackInfo {
                pack_pos: 0,
                pack_sizes,
                pack_crcs: Vec::new(),
            }),
            unpack_info: Some(UnpackInfo { folders }),
            substreams_info: streams_per_folder.map(|n| SubStreamsInfo {
                num_unpack_streams_in_folders: n,
                unpack_sizes: Vec::new(),
                digests: Vec::new(),
            }),
            files_info: Some(FilesInfo {
                entries,
                comment: None,
            }),
            header_encrypted: false,
        }
    }

    #[test]
    fn stored_entries_get_sequential_offsets() {
        let h = header(
            vec![file_entry("a.mkv", 100), file_entry("b.mkv", 200)],
            vec![folder(copy_coder(), 100), folder(copy_coder(), 200)],
            vec![100, 200],
            None,
        );
        let specs = classify_entries(&h);
        assert_eq!(specs.len(), 2);
        assert!(specs[0].streamable);
        assert_eq!(specs[0].offset, Some(SIGNATURE_HEADER_SIZE));
        assert!(specs[1].streamable);
        assert_eq!(specs[1].offset, Some(SIGNATURE_HEADER_SIZE + 100));
        assert_eq!(specs[1].packed_size, 200);
    }

    #[test]
    fn compressed_entry_is_not_streamable() {
        let h = header(
            vec![file_entry("packed.bin", 500)],
            vec![folder(lzma_coder(), 500)],
            vec![220],
            None,
        );
        let specs = classify_entries(&h);
        assert!(!specs[0].streamable);
        assert_eq!(specs[0].offset, None);
    }

    #[test]
    fn solid_folder_disqualifies_all_members() {
        let h = header(
            vec![file_entry("a.bin", 100), file_entry("b.bin", 100)],
            vec![folder(copy_coder(), 200)],
            vec![200],
            Some(vec![2]),
        );
        assert!(is_solid(&h));
        let specs = classify_entries(&h);
        assert!(specs.iter().all(|s| !s.streamable));
    }

    #[test]
    fn directories_and_empty_files_are_skipped_in_folder_walk() {
        let dir = ArchiveEntry {
            name: "sub".to_string(),
            is_directory: true,
            ..Default::default()
        };
        let h = header(
            vec![dir, file_entry("data.bin", 50)],
            vec![folder(copy_coder(), 50)],
            vec![50],
            None,
        );
        let specs = classify_entries(&h);
        assert!(specs[0].directory);
        assert!(!specs[0].streamable);
        assert!(specs[1].streamable);
        assert_eq!(specs[1].offset, Some(SIGNATURE_HEADER_SIZE));
    }

    #[test]
    fn split_names_follow_the_numeric_convention() {
        assert_eq!(
            next_split_name("Season.7z.001").as_deref(),
            Some("Season.7z.002")
        );
        assert_eq!(
            next_split_name("Season.7z.009").as_deref(),
            Some("Season.7z.010")
        );
        assert_eq!(next_split_name("Season.7z"), None);
        assert_eq!(next_split_name("Season.rar"), None);
    }

    #[test]
    fn volume_offsets_accumulate() {
        let volumes = vec![
            Volume {
                name: "a.7z.001".to_string(),
                size: 100,
            },
            Volume {
                name: "a.7z.002".to_string(),
                size: 50,
            },
        ];
        let offsets: Vec<u64> = volume_offsets(&volumes).map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 100]);
    }
}
