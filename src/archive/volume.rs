//! Multi-volume archive grouping
//!
//! Given a flat file list, volumes of the same archive are grouped by
//! `(base name, archive type)` — `video.part01.rar` and `video.part02.rar`
//! belong together — and ordered by volume number. Files without an
//! archive suffix can still join a group when the caller pre-classified
//! them (first-segment sniffing says "spam.001" is really RAR data);
//! those groups are marked `aliased` and keyed by the name stripped of
//! its trailing numeric suffix.

use crate::detect;
use crate::types::FileType;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static TRAILING_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(\d+)$").expect("static regex"));

/// A file that may be one volume of a multi-volume archive
pub trait VolumeCandidate {
    /// Filename used for suffix classification
    fn name(&self) -> &str;

    /// Size contribution to the group total
    fn size(&self) -> u64;

    /// Pre-classified container type for names without archive suffixes
    fn file_type_hint(&self) -> FileType {
        FileType::Plain
    }
}

/// One multi-volume set
#[derive(Clone, Debug)]
pub struct VolumeGroup<T> {
    /// Common prefix, e.g. `video` for `video.part01.rar`
    pub base_name: String,
    /// True when membership came from pre-classification rather than a
    /// standard archive extension
    pub aliased: bool,
    /// Archive type of the set
    pub file_type: FileType,
    /// Volumes in ascending volume order
    pub files: Vec<T>,
    /// Volume numbers matching `files`
    pub volumes: Vec<i32>,
    /// Sum of member sizes
    pub total_size: u64,
}

/// Group archive volumes out of a flat file list
///
/// Returns groups ordered by descending total size; non-archive files are
/// dropped. The union of all groups' members equals the archive-classified
/// subset of the input.
pub fn group_archive_volumes<T: VolumeCandidate + Clone>(files: &[T]) -> Vec<VolumeGroup<T>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, VolumeGroup<T>> = HashMap::new();

    for file in files {
        let (base_name, file_type, aliased) = match detect::archive_base_name(file.name()) {
            Some((base, kind)) => (base, kind, false),
            None => {
                let hint = file.file_type_hint();
                if hint == FileType::Plain {
                    continue;
                }
                (strip_trailing_numbers(file.name()), hint, true)
            }
        };

        let key = format!("{base_name}:{file_type}");
        match groups.get_mut(&key) {
            Some(group) => {
                group.total_size += file.size();
                group.files.push(file.clone());
            }
            None => {
                order.push(key.clone());
                groups.insert(
                    key,
                    VolumeGroup {
                        base_name,
                        aliased,
                        file_type,
                        total_size: file.size(),
                        files: vec![file.clone()],
                        volumes: Vec::new(),
                    },
                );
            }
        }
    }

    let mut result: Vec<VolumeGroup<T>> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|mut group| {
            let mut indexed: Vec<(usize, i32)> = group
                .files
                .iter()
                .enumerate()
                .map(|(i, f)| (i, file_volume(f, &group)))
                .collect();
            indexed.sort_by_key(|&(_, volume)| volume);

            let mut files = Vec::with_capacity(group.files.len());
            let mut volumes = Vec::with_capacity(group.files.len());
            for (idx, volume) in indexed {
                files.push(group.files[idx].clone());
                volumes.push(volume);
            }
            group.files = files;
            group.volumes = volumes;
            group
        })
        .collect();

    result.sort_by(|a, b| b.total_size.cmp(&a.total_size));
    result
}

fn file_volume<T: VolumeCandidate>(file: &T, group: &VolumeGroup<T>) -> i32 {
    let by_suffix = match group.file_type {
        FileType::Rar => detect::rar_volume_number(file.name()),
        FileType::SevenZ => detect::sevenz_volume_number(file.name()),
        FileType::Plain => -1,
    };
    if by_suffix >= 0 {
        return by_suffix;
    }
    // Aliased volumes carry a bare numeric suffix ("spam.003")
    TRAILING_NUMBERS
        .captures(file.name())
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(-1)
}

fn strip_trailing_numbers(filename: &str) -> String {
    TRAILING_NUMBERS.replace(filename, "").to_string()
}
