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

use std::sync::{atomic::Ordering, Arc};

use log::error;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;
use rand::{seq::SliceRandom, Rng};
use silo_ds::{DataStorage, StorageBackend};
use silo_err::{Result, SectorError};
use zerocopy::IntoBytes;

use crate::codec::{self, SectorMeta, SectorUpdate, StateChange};
use crate::folder::{self, FolderFiles, StorageFolder};
use crate::id::{SectorId, SectorRoot};
use crate::wal::{SectorLocation, Wal};
use crate::{Engine, MAX_VIRTUAL_SECTORS};

/// A slot reserved for a sector that is about to be written: the usage bit
/// is set, the overlay entry exists, and the folder's shared lock is held
/// until the caller has waited out the commit.
pub(crate) struct Reservation<S> {
    pub folder: Arc<StorageFolder<S>>,
    pub files: Arc<FolderFiles<S>>,
    pub slot: u32,
    pub _shared: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl<B: StorageBackend> Engine<B> {
    pub(crate) fn add_sector(&self, root: &SectorRoot, data: &[u8]) -> Result<()> {
        let _gate = self.gate.enter()?;
        if data.len() as u64 != self.cfg.sector_size {
            return Err(SectorError::Malformed {
                got: data.len() as u64,
                want: self.cfg.sector_size,
            }
            .into());
        }
        let id = SectorId::derive(root, &self.salt);
        let _sector = self.locks.lock(id);

        let existing = self.wal.lock().locations.get(&id).copied();
        match existing {
            Some(location) => self.add_virtual_sector(id, location),
            None => self.add_physical_sector(id, data, 1),
        }
    }

    /// The sector already exists; take another reference against its
    /// physical copy.
    fn add_virtual_sector(&self, id: SectorId, mut location: SectorLocation) -> Result<()> {
        if location.count == MAX_VIRTUAL_SECTORS {
            return Err(SectorError::MaxVirtualSectors { id: id.to_string() }.into());
        }
        location.count += 1;

        let (folder, files) = self.locate_files(&location, &id)?;
        // The record is rewritten before the change is logged; a failed
        // write leaves the committed state untouched.
        let meta = SectorMeta::new(id, location.count);
        if let Err(err) = files
            .metadata
            .write(codec::metadata_offset(location.index), meta.as_bytes())
        {
            folder.failed_writes.fetch_add(1, Ordering::Relaxed);
            error!("updating sector {id} on {} failed: {err}", folder.path.display());
            return Err(SectorError::DiskTrouble { id: id.to_string() }.into());
        }
        folder.successful_writes.fetch_add(1, Ordering::Relaxed);

        let chan = {
            let mut wal = self.wal.lock();
            wal.locations.insert(id, location);
            wal.append_change(StateChange {
                sector_updates: vec![SectorUpdate {
                    id,
                    folder: location.folder,
                    index: location.index,
                    count: location.count,
                }],
                ..Default::default()
            })
        };
        let _ = chan.recv();
        Ok(())
    }

    /// Store a brand-new physical sector, trying folders until one takes the
    /// write.
    pub(crate) fn add_physical_sector(&self, id: SectorId, data: &[u8], count: u16) -> Result<()> {
        let mut rng = rand::thread_rng();
        let mut candidates = self.available_folder_indexes();
        let mut disk_trouble = false;

        loop {
            let reservation = {
                let wal = self.wal.lock();
                self.reserve_slot(&wal, &mut candidates, None, id, &mut rng)
            };
            let Some(reservation) = reservation else {
                return Err(if disk_trouble {
                    SectorError::DiskTrouble { id: id.to_string() }
                } else {
                    SectorError::InsufficientStorage { id: id.to_string() }
                }
                .into());
            };

            let folder = reservation.folder.clone();
            let written = reservation
                .files
                .sector
                .write(reservation.slot as u64 * self.cfg.sector_size, data)
                .and_then(|()| {
                    let meta = SectorMeta::new(id, count);
                    reservation
                        .files
                        .metadata
                        .write(codec::metadata_offset(reservation.slot), meta.as_bytes())
                });
            if let Err(err) = written {
                folder.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!("writing sector {id} to {} failed: {err}", folder.path.display());
                self.release_reservation(&folder, id, reservation.slot);
                candidates.retain(|&candidate| candidate != folder.index);
                disk_trouble = true;
                continue;
            }
            folder.successful_writes.fetch_add(1, Ordering::Relaxed);

            let chan = {
                let mut wal = self.wal.lock();
                wal.locations.insert(
                    id,
                    SectorLocation {
                        folder: folder.index,
                        index: reservation.slot,
                        count,
                    },
                );
                wal.append_change(StateChange {
                    sector_updates: vec![SectorUpdate {
                        id,
                        folder: folder.index,
                        index: reservation.slot,
                        count,
                    }],
                    ..Default::default()
                })
            };
            // The folder's shared lock stays held until durability.
            let _ = chan.recv();

            let _wal = self.wal.lock();
            folder.state.lock().available_sectors.remove(&id);
            return Ok(());
        }
    }

    pub(crate) fn read_sector(&self, root: &SectorRoot) -> Result<Vec<u8>> {
        let _gate = self.gate.enter()?;
        let id = SectorId::derive(root, &self.salt);
        let _sector = self.locks.lock(id);

        let (folder, files, location) = {
            let wal = self.wal.lock();
            let Some(location) = wal.locations.get(&id).copied() else {
                return Err(SectorError::NotFound { id: id.to_string() }.into());
            };
            let Some(folder) = wal.folders.get(&location.folder).cloned() else {
                return Err(SectorError::NotFound { id: id.to_string() }.into());
            };
            let Some(files) = folder.state.lock().files.clone() else {
                return Err(SectorError::NotFound { id: id.to_string() }.into());
            };
            (folder, files, location)
        };

        let mut data = vec![0; self.cfg.sector_size as usize];
        match files
            .sector
            .read(location.index as u64 * self.cfg.sector_size, &mut data)
        {
            Ok(()) => {
                folder.successful_reads.fetch_add(1, Ordering::Relaxed);
                Ok(data)
            }
            Err(err) => {
                folder.failed_reads.fetch_add(1, Ordering::Relaxed);
                error!("reading sector {id} from {} failed: {err}", folder.path.display());
                Err(err.into())
            }
        }
    }

    pub(crate) fn remove_sector(&self, root: &SectorRoot) -> Result<()> {
        let _gate = self.gate.enter()?;
        let id = SectorId::derive(root, &self.salt);
        let _sector = self.locks.lock(id);
        self.release_sector(id, false)
    }

    /// Evict a sector outright, no matter how many references it holds.
    pub(crate) fn delete_sector(&self, root: &SectorRoot) -> Result<()> {
        let _gate = self.gate.enter()?;
        let id = SectorId::derive(root, &self.salt);
        let _sector = self.locks.lock(id);
        self.release_sector(id, true)
    }

    fn release_sector(&self, id: SectorId, force: bool) -> Result<()> {
        let (folder, location, chan) = {
            let mut wal = self.wal.lock();
            let Some(mut location) = wal.locations.get(&id).copied() else {
                return Err(SectorError::NotFound { id: id.to_string() }.into());
            };
            let Some(folder) = wal.folders.get(&location.folder).cloned() else {
                return Err(SectorError::NotFound { id: id.to_string() }.into());
            };
            location.count = if force { 0 } else { location.count - 1 };
            if location.count == 0 {
                wal.locations.remove(&id);
            } else {
                wal.locations.insert(id, location);
            }
            let chan = wal.append_change(StateChange {
                sector_updates: vec![SectorUpdate {
                    id,
                    folder: location.folder,
                    index: location.index,
                    count: location.count,
                }],
                ..Default::default()
            });
            (folder, location, chan)
        };

        if location.count > 0 {
            // Only the reference count changed; rewrite the record.
            if let Some(files) = folder.state.lock().files.clone() {
                let meta = SectorMeta::new(id, location.count);
                if let Err(err) = files
                    .metadata
                    .write(codec::metadata_offset(location.index), meta.as_bytes())
                {
                    // The logged record is authoritative; recovery rewrites
                    // the slot on replay.
                    folder.failed_writes.fetch_add(1, Ordering::Relaxed);
                    error!("updating sector {id} on {} failed: {err}", folder.path.display());
                }
            }
            let _ = chan.recv();
            return Ok(());
        }

        // Wait for the deletion to be durable before the slot can be
        // reused; clearing the bit earlier would let a concurrent add
        // overwrite a payload the committed history still contains.
        let _ = chan.recv();
        let chan = {
            let wal = self.wal.lock();
            folder.state.lock().clear_usage(location.index);
            wal.sync_chan()
        };
        let _ = chan.recv();
        Ok(())
    }

    /// Indexes of every folder that currently has open files.
    pub(crate) fn available_folder_indexes(&self) -> Vec<u16> {
        let wal = self.wal.lock();
        wal.folders
            .values()
            .filter(|folder| folder.state.lock().files.is_some())
            .map(|folder| folder.index)
            .collect()
    }

    /// Scan the candidate folders in random order for one that can take a
    /// sector right now: available, not full, and not write-locked by a
    /// resize. On success the slot is reserved in usage and the overlay.
    pub(crate) fn reserve_slot(
        &self,
        wal: &Wal<B::Storage>,
        candidates: &mut Vec<u16>,
        exclude: Option<u16>,
        id: SectorId,
        rng: &mut impl Rng,
    ) -> Option<Reservation<B::Storage>> {
        candidates.shuffle(rng);
        for &candidate in candidates.iter() {
            if Some(candidate) == exclude {
                continue;
            }
            let Some(folder) = wal.folders.get(&candidate) else {
                continue;
            };
            let Some(shared) = folder.lock.try_read_arc() else {
                continue;
            };
            let mut state = folder.state.lock();
            let Some(files) = state.files.clone() else {
                continue;
            };
            let Some(slot) = folder::random_free_slot(&state.usage, rng) else {
                continue;
            };
            debug_assert!(!state.is_usage_set(slot));
            state.set_usage(slot);
            state.available_sectors.insert(id, slot);
            drop(state);
            return Some(Reservation {
                folder: folder.clone(),
                files,
                slot,
                _shared: shared,
            });
        }
        None
    }

    /// Undo a reservation whose write failed.
    pub(crate) fn release_reservation(
        &self,
        folder: &Arc<StorageFolder<B::Storage>>,
        id: SectorId,
        slot: u32,
    ) {
        let _wal = self.wal.lock();
        let mut state = folder.state.lock();
        state.clear_usage(slot);
        state.available_sectors.remove(&id);
    }

    fn locate_files(
        &self,
        location: &SectorLocation,
        id: &SectorId,
    ) -> Result<(Arc<StorageFolder<B::Storage>>, Arc<FolderFiles<B::Storage>>)> {
        let wal = self.wal.lock();
        let Some(folder) = wal.folders.get(&location.folder).cloned() else {
            return Err(SectorError::NotFound { id: id.to_string() }.into());
        };
        let Some(files) = folder.state.lock().files.clone() else {
            return Err(SectorError::DiskTrouble { id: id.to_string() }.into());
        };
        Ok((folder, files))
    }
}
