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
    path::Path,
    sync::{atomic::Ordering, Arc},
};

use log::{error, info};
use silo_ds::{DataStorage, StorageBackend};
use silo_err::{FolderError, Result};

use crate::codec::{
    FolderExtension, FolderReduction, FolderRemoval, SavedStorageFolder, StateChange,
};
use crate::folder::{FolderFiles, StorageFolder};
use crate::wal;
use crate::{
    Engine, StorageFolderInfo, FOLDER_ALLOCATION_STEP_SIZE, MAX_SECTORS_PER_FOLDER,
    MAX_STORAGE_FOLDERS, MIN_SECTORS_PER_FOLDER, SECTOR_METADATA_DISK_SIZE,
    STORAGE_FOLDER_GRANULARITY,
};

impl<B: StorageBackend> Engine<B> {
    pub(crate) fn add_storage_folder(&self, path: &Path, size: u64) -> Result<()> {
        let _gate = self.gate.enter()?;
        let sectors = self.check_folder_size(size)?;
        if !path.is_absolute() {
            return Err(FolderError::RelativePath(path.into()).into());
        }
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(FolderError::NotAFolder(path.into()).into()),
        }

        // Register the addition as in flight before any file work happens,
        // so a crash rolls the half-built folder back.
        let folder = {
            let mut wal = self.wal.lock();
            let pending = wal::unresolved_additions(&wal.uncommitted);
            if wal.folders.values().any(|folder| folder.path == path)
                || pending.iter().any(|unfinished| unfinished.path == path)
            {
                return Err(FolderError::Repeat(path.into()).into());
            }
            if wal.folders.len() + pending.len() >= MAX_STORAGE_FOLDERS {
                return Err(FolderError::MaxFolders(MAX_STORAGE_FOLDERS).into());
            }
            let mut index = 0u16;
            while wal.folders.contains_key(&index)
                || pending.iter().any(|unfinished| unfinished.index == index)
            {
                index += 1;
            }
            let folder = Arc::new(StorageFolder::new(
                index,
                path.to_path_buf(),
                vec![0; (sectors / 64) as usize],
            ));
            wal.append_change(StateChange {
                unfinished_folder_additions: vec![folder_snapshot(&folder)],
                ..Default::default()
            });
            folder
        };

        match self.build_folder_files(&folder, sectors) {
            Ok(files) => {
                folder.state.lock().files = Some(Arc::new(files));
                let chan = {
                    let mut wal = self.wal.lock();
                    wal.folders.insert(folder.index, folder.clone());
                    wal.append_change(StateChange {
                        folder_additions: vec![folder_snapshot(&folder)],
                        ..Default::default()
                    })
                };
                let _ = chan.recv();
                folder.reset_progress();
                info!("storage folder {} added with {sectors} slots", path.display());
                Ok(())
            }
            Err(err) => {
                error!("adding storage folder {} failed: {err}", path.display());
                for leftover in [
                    folder.metadata_tmp_path(),
                    folder.sector_tmp_path(),
                    folder.metadata_path(),
                    folder.sector_path(),
                ] {
                    let _ = self.backend.remove(&leftover);
                }
                let chan = self.wal.lock().append_change(StateChange {
                    errored_folder_additions: vec![folder.index],
                    ..Default::default()
                });
                let _ = chan.recv();
                folder.reset_progress();
                Err(err.into())
            }
        }
    }

    pub(crate) fn resize_storage_folder(&self, index: u16, new_size: u64, force: bool) -> Result<()> {
        let _gate = self.gate.enter()?;
        let new_sectors = self.check_folder_size(new_size)?;
        let folder = self
            .wal
            .lock()
            .folders
            .get(&index)
            .cloned()
            .ok_or(FolderError::NotFound(index))?;

        let _exclusive = folder.lock.write();
        let (files, current) = {
            let state = folder.state.lock();
            (state.files.clone(), state.num_sectors())
        };
        let Some(files) = files else {
            return Err(FolderError::BadIndex(index).into());
        };
        if new_sectors == current {
            return Err(FolderError::NoResize.into());
        }
        if new_sectors > current {
            self.grow_storage_folder(&folder, &files, current, new_sectors)
        } else {
            self.shrink_storage_folder(&folder, new_sectors as u32, force)
        }
    }

    pub(crate) fn remove_storage_folder(&self, index: u16, force: bool) -> Result<()> {
        let _gate = self.gate.enter()?;
        let folder = self
            .wal
            .lock()
            .folders
            .get(&index)
            .cloned()
            .ok_or(FolderError::NotFound(index))?;

        let _exclusive = folder.lock.write();
        let (failed, failed_ids) = self.empty_region(&folder, 0);
        if failed > 0 && !force {
            return Err(FolderError::PartialRelocation { failed }.into());
        }
        // The relocations must be durable before the removal is logged.
        self.wait_for_commit();

        let chan = {
            let mut wal = self.wal.lock();
            for id in &failed_ids {
                wal.locations.remove(id);
            }
            wal.folders.remove(&index);
            wal.append_change(StateChange {
                folder_removals: vec![FolderRemoval {
                    folder: index,
                    path: folder.path.clone(),
                }],
                ..Default::default()
            })
        };
        let _ = chan.recv();
        info!("storage folder {} removed", folder.path.display());
        Ok(())
    }

    pub(crate) fn storage_folders(&self) -> Vec<StorageFolderInfo> {
        let wal = self.wal.lock();
        let mut infos: Vec<StorageFolderInfo> = wal
            .folders
            .values()
            .map(|folder| {
                let state = folder.state.lock();
                let slots = state.num_sectors();
                StorageFolderInfo {
                    index: folder.index,
                    path: folder.path.clone(),
                    capacity: slots * self.cfg.sector_size,
                    capacity_remaining: (slots - state.sectors) * self.cfg.sector_size,
                    failed_reads: folder.failed_reads.load(Ordering::Relaxed),
                    failed_writes: folder.failed_writes.load(Ordering::Relaxed),
                    successful_reads: folder.successful_reads.load(Ordering::Relaxed),
                    successful_writes: folder.successful_writes.load(Ordering::Relaxed),
                    progress_numerator: folder.progress_numerator.load(Ordering::Relaxed),
                    progress_denominator: folder.progress_denominator.load(Ordering::Relaxed),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.index);
        infos
    }

    fn check_folder_size(&self, size: u64) -> Result<u64> {
        let sectors = size / self.cfg.sector_size;
        if sectors < MIN_SECTORS_PER_FOLDER {
            return Err(FolderError::Small {
                size,
                min: MIN_SECTORS_PER_FOLDER * self.cfg.sector_size,
            }
            .into());
        }
        if sectors > MAX_SECTORS_PER_FOLDER {
            return Err(FolderError::Large {
                size,
                max: MAX_SECTORS_PER_FOLDER * self.cfg.sector_size,
            }
            .into());
        }
        if sectors % STORAGE_FOLDER_GRANULARITY != 0 {
            return Err(FolderError::Granularity {
                chunk: STORAGE_FOLDER_GRANULARITY * self.cfg.sector_size,
            }
            .into());
        }
        Ok(sectors)
    }

    /// Create both folder files under temporary names, preallocate the
    /// payload file chunk by chunk, fsync, and rename them into place.
    fn build_folder_files(
        &self,
        folder: &StorageFolder<B::Storage>,
        sectors: u64,
    ) -> silo_ds::Result<FolderFiles<B::Storage>> {
        let metadata = self.backend.create(&folder.metadata_tmp_path())?;
        let sector_file = self.backend.create(&folder.sector_tmp_path())?;
        metadata.truncate(sectors * SECTOR_METADATA_DISK_SIZE)?;

        let total = sectors * self.cfg.sector_size;
        folder.progress_denominator.store(total, Ordering::Relaxed);
        let zeros = vec![0; FOLDER_ALLOCATION_STEP_SIZE.min(total) as usize];
        let mut written = 0;
        while written < total {
            let chunk = zeros.len().min((total - written) as usize);
            sector_file.write(written, &zeros[..chunk])?;
            written += chunk as u64;
            folder.progress_numerator.store(written, Ordering::Relaxed);
        }

        metadata.sync()?;
        sector_file.sync()?;
        self.backend
            .rename(&folder.metadata_tmp_path(), &folder.metadata_path())?;
        self.backend
            .rename(&folder.sector_tmp_path(), &folder.sector_path())?;
        Ok(FolderFiles {
            metadata,
            sector: sector_file,
        })
    }

    fn grow_storage_folder(
        &self,
        folder: &Arc<StorageFolder<B::Storage>>,
        files: &Arc<FolderFiles<B::Storage>>,
        old_sectors: u64,
        new_sectors: u64,
    ) -> Result<()> {
        // The rollback point goes into the log first.
        self.wal.lock().append_change(StateChange {
            unfinished_folder_extensions: vec![FolderExtension {
                folder: folder.index,
                sector_count: old_sectors as u32,
            }],
            ..Default::default()
        });

        let grown = (|| -> silo_ds::Result<()> {
            let old_size = old_sectors * self.cfg.sector_size;
            let new_size = new_sectors * self.cfg.sector_size;
            folder.progress_denominator.store(new_size, Ordering::Relaxed);
            folder.progress_numerator.store(old_size, Ordering::Relaxed);
            let mut size = old_size;
            while size < new_size {
                size = (size + FOLDER_ALLOCATION_STEP_SIZE).min(new_size);
                files.sector.truncate(size)?;
                folder.progress_numerator.store(size, Ordering::Relaxed);
            }
            files.metadata.truncate(new_sectors * SECTOR_METADATA_DISK_SIZE)?;
            files.sector.sync()?;
            files.metadata.sync()?;
            Ok(())
        })();

        let result = match grown {
            Ok(()) => {
                let chan = self.wal.lock().append_change(StateChange {
                    folder_extensions: vec![FolderExtension {
                        folder: folder.index,
                        sector_count: new_sectors as u32,
                    }],
                    ..Default::default()
                });
                // The usage bitmap grows in the commit's post-sync step,
                // once the new region is durably accounted for.
                let _ = chan.recv();
                info!(
                    "storage folder {} grown from {old_sectors} to {new_sectors} slots",
                    folder.path.display()
                );
                Ok(())
            }
            Err(err) => {
                folder.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!("growing storage folder {} failed: {err}", folder.path.display());
                let _ = files.sector.truncate(old_sectors * self.cfg.sector_size);
                let _ = files.metadata.truncate(old_sectors * SECTOR_METADATA_DISK_SIZE);
                let chan = self.wal.lock().append_change(StateChange {
                    errored_folder_extensions: vec![FolderExtension {
                        folder: folder.index,
                        sector_count: old_sectors as u32,
                    }],
                    ..Default::default()
                });
                let _ = chan.recv();
                Err(err.into())
            }
        };
        folder.reset_progress();
        result
    }

    fn shrink_storage_folder(
        &self,
        folder: &Arc<StorageFolder<B::Storage>>,
        new_sector_count: u32,
        force: bool,
    ) -> Result<()> {
        let (failed, failed_ids) = self.empty_region(folder, new_sector_count);
        if failed > 0 && !force {
            return Err(FolderError::PartialRelocation { failed }.into());
        }
        // The relocations must be durable before the reduction is logged.
        self.wait_for_commit();
        if self.cfg.disruptor.disrupt("shrink-reduction") {
            return Ok(());
        }

        let chan = {
            let mut wal = self.wal.lock();
            // A forced shrink gives up on the sectors that would not move;
            // dropping their locations keeps the capacity accounting true
            // to the readable set.
            for id in &failed_ids {
                wal.locations.remove(id);
            }
            wal.append_change(StateChange {
                folder_reductions: vec![FolderReduction {
                    folder: folder.index,
                    new_sector_count,
                }],
                ..Default::default()
            })
        };
        // Usage bits beyond the boundary are cleared and the files truncated
        // in the commit's post-sync step.
        let _ = chan.recv();
        info!(
            "storage folder {} shrunk to {new_sector_count} slots",
            folder.path.display()
        );
        Ok(())
    }
}

fn folder_snapshot<S>(folder: &StorageFolder<S>) -> SavedStorageFolder {
    SavedStorageFolder {
        index: folder.index,
        path: folder.path.clone(),
        usage: folder.state.lock().usage.clone(),
    }
}
