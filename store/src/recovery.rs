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
    collections::HashMap,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;
use silo_ds::{DataStorage, StorageBackend};
use silo_err::Result;
use zerocopy::{FromBytes, IntoBytes};

use crate::codec::{self, SectorMeta, StateChange};
use crate::folder::{FolderFiles, StorageFolder};
use crate::group::ThreadGroup;
use crate::id::SectorId;
use crate::lock::SectorLocks;
use crate::wal::{self, SectorLocation, Wal};
use crate::{Config, Engine, SECTOR_METADATA_DISK_SIZE};

/// Load the engine: settings, folder files, log replay, rollback of
/// interrupted folder jobs, the sector location index, and a fresh log.
pub(crate) fn open_engine<B: StorageBackend>(
    backend: B,
    persist_dir: PathBuf,
    cfg: Config,
) -> Result<Arc<Engine<B>>> {
    std::fs::create_dir_all(&persist_dir)?;

    let settings = codec::load_settings(&persist_dir)?;
    let salt = match &settings {
        Some(settings) => settings.sector_salt,
        None => {
            let mut salt = [0; 32];
            rand::thread_rng().fill(&mut salt);
            salt
        }
    };

    let (sync_tx, sync_rx) = crossbeam_channel::unbounded();
    let engine = Arc::new(Engine {
        cfg,
        persist_dir,
        backend,
        salt,
        wal: Mutex::new(Wal {
            folders: HashMap::new(),
            locations: HashMap::new(),
            uncommitted: Vec::new(),
            wal_file: None,
            settings_stage: None,
            committed_settings: codec::SavedSettings {
                header: crate::PERSIST_HEADER.into(),
                version: crate::PERSIST_VERSION.into(),
                sector_salt: salt,
                storage_folders: Vec::new(),
            },
            _sync_tx: sync_tx,
            sync_rx,
        }),
        locks: SectorLocks::new(),
        gate: ThreadGroup::new(),
    });

    let mut wal = engine.wal.lock();
    if let Some(settings) = settings {
        for saved in settings.storage_folders {
            let folder = Arc::new(StorageFolder::new(saved.index, saved.path, saved.usage));
            engine.open_folder(&folder);
            wal.folders.insert(folder.index, folder);
        }
    }

    // Replay the committed log; fall back to the in-progress file when no
    // rotation has ever completed.
    let wal_path = engine.persist_dir.join(crate::WAL_FILE);
    let wal_tmp_path = engine.persist_dir.join(crate::WAL_TMP_FILE);
    let recovered = if wal_path.exists() {
        codec::read_wal(&wal_path)?
    } else if wal_tmp_path.exists() {
        codec::read_wal(&wal_tmp_path)?
    } else {
        Vec::new()
    };
    for change in &recovered {
        engine.apply_recovered(&mut wal, change);
    }

    // Folder jobs that were still running at the crash are rolled back and
    // recorded as errored.
    let mut unwound = StateChange::default();
    for unfinished in wal::unresolved_additions(&recovered) {
        info!(
            "rolling back the unfinished addition of storage folder {}",
            unfinished.path.display()
        );
        for leftover in [
            unfinished.path.join(format!("{}{}", crate::METADATA_FILE, crate::TMP_SUFFIX)),
            unfinished.path.join(format!("{}{}", crate::SECTOR_FILE, crate::TMP_SUFFIX)),
            unfinished.path.join(crate::METADATA_FILE),
            unfinished.path.join(crate::SECTOR_FILE),
        ] {
            let _ = engine.backend.remove(&leftover);
        }
        wal.folders.remove(&unfinished.index);
        unwound.errored_folder_additions.push(unfinished.index);
    }
    for unfinished in wal::unresolved_extensions(&recovered) {
        if let Some(folder) = wal.folders.get(&unfinished.folder).cloned() {
            info!(
                "rolling back the unfinished growth of storage folder {}",
                folder.path.display()
            );
            engine.truncate_folder(&folder, unfinished.sector_count);
        }
        unwound.errored_folder_extensions.push(unfinished);
    }

    // The location index is rebuilt from the metadata files.
    let folders: Vec<_> = wal.folders.values().cloned().collect();
    for folder in &folders {
        engine.load_sector_locations(&mut wal, folder);
    }

    // Persist the recovered state and open a fresh log.
    let snapshot = engine.saved_settings(&wal);
    codec::write_settings_blocking(&engine.persist_dir, &snapshot)?;
    wal.committed_settings = snapshot;
    engine.create_wal_file(&mut wal)?;
    if !unwound.is_empty() {
        wal.append_change(unwound);
    }
    info!(
        "sector store loaded: {} folder(s), {} sector(s)",
        wal.folders.len(),
        wal.locations.len()
    );
    drop(wal);
    Ok(engine)
}

impl<B: StorageBackend> Engine<B> {
    /// Open both folder files, deleting stray temporaries first. A folder
    /// whose files cannot be opened stays in the catalogue as unavailable,
    /// with sentinel health counters, until the recheck loop revives it.
    pub(crate) fn open_folder(&self, folder: &Arc<StorageFolder<B::Storage>>) {
        for leftover in [folder.metadata_tmp_path(), folder.sector_tmp_path()] {
            if leftover.exists() {
                let _ = self.backend.remove(&leftover);
            }
        }
        let opened = self.backend.open(&folder.metadata_path()).and_then(|metadata| {
            Ok(FolderFiles {
                metadata,
                sector: self.backend.open(&folder.sector_path())?,
            })
        });
        match opened {
            Ok(files) => {
                folder.state.lock().files = Some(Arc::new(files));
                folder.mark_available();
            }
            Err(err) => {
                warn!("storage folder {} is unavailable: {err}", folder.path.display());
                folder.state.lock().files = None;
                folder.mark_unavailable();
            }
        }
    }

    /// Replay one committed record. Every branch tolerates being applied to
    /// state that already reflects it.
    fn apply_recovered(&self, wal: &mut Wal<B::Storage>, change: &StateChange) {
        for addition in &change.folder_additions {
            if wal.folders.contains_key(&addition.index) {
                continue;
            }
            let folder = Arc::new(StorageFolder::new(
                addition.index,
                addition.path.clone(),
                addition.usage.clone(),
            ));
            self.open_folder(&folder);
            wal.folders.insert(addition.index, folder);
        }
        for extension in &change.folder_extensions {
            if let Some(folder) = wal.folders.get(&extension.folder) {
                let mut state = folder.state.lock();
                let words = (extension.sector_count / 64) as usize;
                if state.usage.len() < words {
                    state.usage.resize(words, 0);
                }
                let files = state.files.clone();
                drop(state);
                if let Some(files) = files {
                    let slots = extension.sector_count as u64;
                    let _ = files.metadata.truncate(slots * SECTOR_METADATA_DISK_SIZE);
                    let _ = files.sector.truncate(slots * self.cfg.sector_size);
                }
            }
        }
        for reduction in &change.folder_reductions {
            if let Some(folder) = wal.folders.get(&reduction.folder).cloned() {
                self.truncate_folder(&folder, reduction.new_sector_count);
            }
        }
        for removal in &change.folder_removals {
            wal.folders.remove(&removal.folder);
            for leftover in [
                removal.path.join(crate::METADATA_FILE),
                removal.path.join(crate::SECTOR_FILE),
            ] {
                let _ = self.backend.remove(&leftover);
            }
        }
        for update in &change.sector_updates {
            let Some(folder) = wal.folders.get(&update.folder).cloned() else {
                continue;
            };
            let mut state = folder.state.lock();
            if update.index as u64 >= state.num_sectors() {
                // The folder has since been reduced past this slot.
                continue;
            }
            if update.count > 0 {
                state.set_usage(update.index);
                let files = state.files.clone();
                drop(state);
                if let Some(files) = files {
                    let meta = SectorMeta::new(update.id, update.count);
                    if let Err(err) = files
                        .metadata
                        .write(codec::metadata_offset(update.index), meta.as_bytes())
                    {
                        folder.failed_writes.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "replaying sector {} onto {} failed: {err}",
                            update.id,
                            folder.path.display()
                        );
                    }
                }
            } else {
                state.clear_usage(update.index);
            }
        }
    }

    /// Read every used slot's metadata record and register the live ones in
    /// the location index. A set bit with a zero count is a reservation that
    /// never committed; its bit is released.
    pub(crate) fn load_sector_locations(
        &self,
        wal: &mut Wal<B::Storage>,
        folder: &Arc<StorageFolder<B::Storage>>,
    ) {
        let (files, usage) = {
            let state = folder.state.lock();
            let Some(files) = state.files.clone() else {
                return;
            };
            (files, state.usage.clone())
        };
        let mut buffer = vec![0; usage.len() * 64 * SECTOR_METADATA_DISK_SIZE as usize];
        if let Err(err) = files.metadata.read(0, &mut buffer) {
            warn!("reading the metadata of {} failed: {err}", folder.path.display());
            folder.state.lock().files = None;
            folder.mark_unavailable();
            return;
        }
        for (word_index, word) in usage.iter().enumerate() {
            if *word == 0 {
                continue;
            }
            for bit in 0..64 {
                if word & (1 << bit) == 0 {
                    continue;
                }
                let slot = word_index as u32 * 64 + bit;
                let offset = codec::metadata_offset(slot) as usize;
                let Ok(meta) = SectorMeta::read_from_bytes(
                    &buffer[offset..offset + SECTOR_METADATA_DISK_SIZE as usize],
                ) else {
                    continue;
                };
                let count = meta.count.get();
                if count == 0 {
                    folder.state.lock().clear_usage(slot);
                    continue;
                }
                wal.locations.insert(
                    SectorId(meta.id),
                    SectorLocation {
                        folder: folder.index,
                        index: slot,
                        count,
                    },
                );
            }
        }
    }
}
