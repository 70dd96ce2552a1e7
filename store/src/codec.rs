// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use log::warn;
use serde::{Deserialize, Serialize};
use zerocopy::{
    little_endian::U16, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::id::SectorId;
use crate::{PERSIST_HEADER, PERSIST_VERSION, SECTOR_METADATA_DISK_SIZE};

/// One slot of the metadata file: the sector id followed by its reference
/// count. The record is 14 bytes, record *i* lives at offset `i * 14`.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct SectorMeta {
    pub id: [u8; 12],
    pub count: U16,
}

impl SectorMeta {
    pub fn new(id: SectorId, count: u16) -> Self {
        Self {
            id: id.0,
            count: U16::new(count),
        }
    }
}

pub(crate) fn metadata_offset(slot: u32) -> u64 {
    slot as u64 * SECTOR_METADATA_DISK_SIZE
}

/// File identification written as the first frame of every log file and as
/// the first two fields of the settings file.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub(crate) struct PersistMetadata {
    pub header: String,
    pub version: String,
}

impl PersistMetadata {
    pub fn current() -> Self {
        Self {
            header: PERSIST_HEADER.into(),
            version: PERSIST_VERSION.into(),
        }
    }
}

/// One folder as persisted in the settings body and in folder-addition log
/// records.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub(crate) struct SavedStorageFolder {
    pub index: u16,
    pub path: PathBuf,
    pub usage: Vec<u64>,
}

/// The settings file: header, the per-host sector salt, and every folder with
/// its usage bitmap. Everything else is reconstructed from the folder files
/// and the log.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub(crate) struct SavedSettings {
    pub header: String,
    pub version: String,
    #[serde(with = "hex::serde")]
    pub sector_salt: [u8; 32],
    pub storage_folders: Vec<SavedStorageFolder>,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub(crate) struct SectorUpdate {
    pub id: SectorId,
    pub folder: u16,
    pub index: u32,
    pub count: u16,
}

/// Folder index paired with a slot count; the list it appears in decides
/// whether the count is the old size (unfinished, errored) or the new size
/// (committed).
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub(crate) struct FolderExtension {
    pub folder: u16,
    pub sector_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub(crate) struct FolderReduction {
    pub folder: u16,
    pub new_sector_count: u32,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub(crate) struct FolderRemoval {
    pub folder: u16,
    pub path: PathBuf,
}

/// One log record. Any subset of the lists may be populated.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub(crate) struct StateChange {
    pub sector_updates: Vec<SectorUpdate>,
    pub unfinished_folder_additions: Vec<SavedStorageFolder>,
    pub folder_additions: Vec<SavedStorageFolder>,
    pub errored_folder_additions: Vec<u16>,
    pub unfinished_folder_extensions: Vec<FolderExtension>,
    pub folder_extensions: Vec<FolderExtension>,
    pub errored_folder_extensions: Vec<FolderExtension>,
    pub folder_reductions: Vec<FolderReduction>,
    pub folder_removals: Vec<FolderRemoval>,
}

impl StateChange {
    pub fn is_empty(&self) -> bool {
        self.sector_updates.is_empty()
            && self.unfinished_folder_additions.is_empty()
            && self.folder_additions.is_empty()
            && self.errored_folder_additions.is_empty()
            && self.unfinished_folder_extensions.is_empty()
            && self.folder_extensions.is_empty()
            && self.errored_folder_extensions.is_empty()
            && self.folder_reductions.is_empty()
            && self.folder_removals.is_empty()
    }
}

/// Frames larger than this are treated as corruption; the largest legitimate
/// record is a folder addition carrying a full usage bitmap.
const MAX_FRAME_LEN: u32 = 1 << 26;

/// Write one self-delimited frame: little-endian length, crc32 of the body,
/// then the body.
pub(crate) fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(body).to_le_bytes())?;
    writer.write_all(body)
}

/// Read the next frame. Returns `Ok(None)` at a clean end of file and on any
/// torn or corrupt tail, which ends replay with everything before it intact.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut head = [0; 8];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(head[..4].try_into().unwrap());
    let crc = u32::from_le_bytes(head[4..].try_into().unwrap());
    if len > MAX_FRAME_LEN {
        warn!("log frame of {len} bytes exceeds the frame limit, discarding tail");
        return Ok(None);
    }
    let mut body = vec![0; len as usize];
    match reader.read_exact(&mut body) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            warn!("log ends mid-frame, discarding tail");
            return Ok(None);
        }
        Err(err) => return Err(err),
    }
    if crc32fast::hash(&body) != crc {
        warn!("log frame checksum mismatch, discarding tail");
        return Ok(None);
    }
    Ok(Some(body))
}

/// Write the identification frame a fresh log file starts with.
pub(crate) fn write_wal_metadata<W: Write>(writer: &mut W) -> io::Result<()> {
    let body = bincode::serialize(&PersistMetadata::current())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &body)
}

/// Decode a whole log file. Replay stops at the first torn or undecodable
/// frame; everything before it is returned.
pub(crate) fn read_wal(path: &Path) -> io::Result<Vec<StateChange>> {
    let mut reader = BufReader::new(File::open(path)?);
    let Some(head) = read_frame(&mut reader)? else {
        warn!("log {} has no identification frame", path.display());
        return Ok(Vec::new());
    };
    match bincode::deserialize::<PersistMetadata>(&head) {
        Ok(meta) if meta == PersistMetadata::current() => {}
        _ => {
            warn!("log {} has an unrecognized identification frame", path.display());
            return Ok(Vec::new());
        }
    }

    let mut changes = Vec::new();
    while let Some(body) = read_frame(&mut reader)? {
        match bincode::deserialize::<StateChange>(&body) {
            Ok(change) => changes.push(change),
            Err(err) => {
                warn!("log {} has an undecodable record, discarding tail: {err}", path.display());
                break;
            }
        }
    }
    Ok(changes)
}

/// Load the settings file, promoting a leftover temporary file when the
/// target itself is missing.
pub(crate) fn load_settings(persist_dir: &Path) -> io::Result<Option<SavedSettings>> {
    let path = persist_dir.join(crate::SETTINGS_FILE);
    let tmp_path = persist_dir.join(crate::SETTINGS_TMP_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if !tmp_path.exists() {
                return Ok(None);
            }
            std::fs::rename(&tmp_path, &path)?;
            std::fs::read(&path)?
        }
        Err(err) => return Err(err),
    };
    let settings: SavedSettings = serde_json::from_slice(&bytes)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if settings.header != PERSIST_HEADER || settings.version != PERSIST_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognized settings header {:?} {:?}", settings.header, settings.version),
        ));
    }
    Ok(Some(settings))
}

/// Write the settings through a temporary file, fsync, and rename it over
/// the live file.
pub(crate) fn write_settings_blocking(persist_dir: &Path, settings: &SavedSettings) -> io::Result<()> {
    let tmp_path = persist_dir.join(crate::SETTINGS_TMP_FILE);
    let mut file = File::create(&tmp_path)?;
    serde_json::to_writer_pretty(&mut file, settings)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, persist_dir.join(crate::SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn change_with_update() -> StateChange {
        StateChange {
            sector_updates: vec![SectorUpdate {
                id: SectorId([3; 12]),
                folder: 2,
                index: 190,
                count: 7,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn sector_meta_is_fourteen_bytes() {
        assert_eq!(std::mem::size_of::<SectorMeta>(), 14);
        let meta = SectorMeta::new(SectorId([9; 12]), 0x0102);
        assert_eq!(&meta.as_bytes()[..12], &[9; 12]);
        assert_eq!(&meta.as_bytes()[12..], &[0x02, 0x01]);
    }

    #[test]
    fn frame_round_trip() {
        let body = bincode::serialize(&change_with_update()).unwrap();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &body).unwrap();

        let mut reader = Cursor::new(buffer);
        let read = read_frame(&mut reader).unwrap().unwrap();
        let decoded: StateChange = bincode::deserialize(&read).unwrap();
        assert_eq!(decoded, change_with_update());
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn torn_frame_ends_replay() {
        let body = bincode::serialize(&change_with_update()).unwrap();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &body).unwrap();
        buffer.truncate(buffer.len() - 3);

        let mut reader = Cursor::new(buffer);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn corrupt_frame_ends_replay() {
        let body = bincode::serialize(&change_with_update()).unwrap();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &body).unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xff;

        let mut reader = Cursor::new(buffer);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn settings_tmp_file_is_promoted_when_the_target_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SavedSettings {
            header: PERSIST_HEADER.into(),
            version: PERSIST_VERSION.into(),
            sector_salt: [3; 32],
            storage_folders: Vec::new(),
        };
        std::fs::write(
            dir.path().join(crate::SETTINGS_TMP_FILE),
            serde_json::to_vec(&settings).unwrap(),
        )
        .unwrap();

        let loaded = load_settings(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, settings);
        assert!(dir.path().join(crate::SETTINGS_FILE).exists());
        assert!(!dir.path().join(crate::SETTINGS_TMP_FILE).exists());
    }

    #[test]
    fn settings_write_is_loadable_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SavedSettings {
            header: PERSIST_HEADER.into(),
            version: PERSIST_VERSION.into(),
            sector_salt: [5; 32],
            storage_folders: Vec::new(),
        };
        write_settings_blocking(dir.path(), &settings).unwrap();
        assert!(!dir.path().join(crate::SETTINGS_TMP_FILE).exists());
        assert_eq!(load_settings(dir.path()).unwrap().unwrap(), settings);
    }

    #[test]
    fn settings_round_trip() {
        let settings = SavedSettings {
            header: PERSIST_HEADER.into(),
            version: PERSIST_VERSION.into(),
            sector_salt: [0xaa; 32],
            storage_folders: vec![SavedStorageFolder {
                index: 1,
                path: "/mnt/storage".into(),
                usage: vec![0, u64::MAX],
            }],
        };
        let encoded = serde_json::to_vec(&settings).unwrap();
        assert!(String::from_utf8_lossy(&encoded).contains(&"aa".repeat(32)));
        let decoded: SavedSettings = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, settings);
    }
}
