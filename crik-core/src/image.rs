// SPDX-License-Identifier: Apache-2.0

//! Image-directory inspection.
//!
//! Two concerns live here: deciding whether a directory holds a restorable
//! checkpoint at all, and reading the captured file-descriptor table out of
//! `files.img` so the cgroup resolver can find the kubepods control files
//! that must be re-opened under the new container's cgroup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use prost::Message;

use crate::error::{ImageDirError, RestoreError};

/// Magic value shared by all of the engine's image files.
pub const IMG_COMMON_MAGIC: u32 = 0x5456_4319;

/// Name of the image file holding the captured file descriptor table.
pub const FILES_IMAGE_NAME: &str = "files.img";

/// Directory inside the image bundle mirroring the configured additional
/// paths.
pub const EXTRA_FILES_DIR: &str = "extraFiles";

const KUBEPODS_PREFIX: &str = "/sys/fs/cgroup/kubepods.slice";

/// Returns true when `image_dir` contains at least one direct entry whose
/// name ends in `.img`. A missing directory means "nothing to restore".
pub fn has_restorable_image(image_dir: &Path) -> Result<bool, ImageDirError> {
    let entries = match fs::read_dir(image_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(ImageDirError::Read {
                path: image_dir.to_path_buf(),
                source,
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| ImageDirError::Read {
            path: image_dir.to_path_buf(),
            source,
        })?;
        if entry.file_name().to_string_lossy().ends_with(".img") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Kind of a captured file descriptor, as recorded in `files.img`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum FdType {
    Und = 0,
    Reg = 1,
    Pipe = 2,
    Fifo = 3,
    InetSk = 4,
    UnixSk = 5,
    EventFd = 6,
    EventPoll = 7,
    Inotify = 8,
    SignalFd = 9,
    PacketSk = 10,
    Tty = 11,
    Fanotify = 12,
    NetlinkSk = 13,
    Ext = 14,
    TimerFd = 15,
    MemFd = 16,
}

/// A regular-file entry inside `files.img`. Only the fields this crate reads
/// or writes are declared; the engine's remaining fields are skipped on
/// decode.
#[derive(Clone, PartialEq, Message)]
pub struct RegFileEntry {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
    #[prost(uint64, tag = "3")]
    pub pos: u64,
    #[prost(string, tag = "6")]
    pub name: String,
    #[prost(uint32, optional, tag = "10")]
    pub mode: Option<u32>,
}

/// One captured file descriptor.
#[derive(Clone, PartialEq, Message)]
pub struct FileEntry {
    #[prost(enumeration = "FdType", tag = "1")]
    pub ty: i32,
    #[prost(uint32, tag = "2")]
    pub id: u32,
    #[prost(message, optional, tag = "3")]
    pub reg: Option<RegFileEntry>,
}

/// Map of kubepods control files captured in the checkpoint, keyed by
/// basename, valued by the full captured path. Sorted by basename so the
/// inherit-fd list the caller builds from it is deterministic.
///
/// On cgroup v1 hosts the captured table typically has no kubepods entries
/// and the result is empty; that is not an error.
pub fn kubepods_file_paths(image_dir: &Path) -> Result<BTreeMap<String, String>, RestoreError> {
    let path = image_dir.join(FILES_IMAGE_NAME);
    let bytes = fs::read(&path).map_err(|source| RestoreError::FilesImage {
        path: path.clone(),
        source,
    })?;

    let mut result = BTreeMap::new();
    for entry in decode_file_entries(&bytes, &path)? {
        let Some(reg) = entry.reg else { continue };
        if entry.ty != FdType::Reg as i32 || !reg.name.starts_with(KUBEPODS_PREFIX) {
            continue;
        }
        if let Some(basename) = Path::new(&reg.name).file_name() {
            result.insert(basename.to_string_lossy().into_owned(), reg.name);
        }
    }
    Ok(result)
}

/// Decode the size-delimited entries that follow the 8-byte magic header.
fn decode_file_entries(bytes: &[u8], path: &Path) -> Result<Vec<FileEntry>, RestoreError> {
    if bytes.len() < 8 {
        return Err(RestoreError::FilesImageMagic {
            path: path.to_path_buf(),
        });
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != IMG_COMMON_MAGIC {
        return Err(RestoreError::FilesImageMagic {
            path: path.to_path_buf(),
        });
    }

    let mut entries = Vec::new();
    let mut offset = 8;
    while bytes.len() - offset >= 4 {
        let size = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| RestoreError::FilesImageMagic {
                path: path.to_path_buf(),
            })?;
        let entry =
            FileEntry::decode(&bytes[offset..end]).map_err(|source| {
                RestoreError::FilesImageDecode {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        entries.push(entry);
        offset = end;
    }
    Ok(entries)
}
