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

use log::{error, info, warn};
use parking_lot::Mutex;
use silo_ds::{DataStorage, StorageBackend};
use silo_err::{Result, SectorError};
use zerocopy::{FromBytes, IntoBytes};

use crate::codec::{self, SectorMeta, SectorUpdate, StateChange};
use crate::folder::StorageFolder;
use crate::id::SectorId;
use crate::wal::SectorLocation;
use crate::{Engine, SECTOR_METADATA_DISK_SIZE};

impl<B: StorageBackend> Engine<B> {
    /// Move every live sector at or beyond `new_sector_count` off the folder.
    /// The caller holds the folder's exclusive lock. Returns how many sectors
    /// could not be moved, and which ones.
    pub(crate) fn empty_region(
        &self,
        folder: &Arc<StorageFolder<B::Storage>>,
        new_sector_count: u32,
    ) -> (u64, Vec<SectorId>) {
        let (files, usage) = {
            let state = folder.state.lock();
            let Some(files) = state.files.clone() else {
                // An unavailable folder holds no live locations to move.
                return (0, Vec::new());
            };
            (files, state.usage.clone())
        };

        // The bulk metadata read happens without the log mutex; the live set
        // is settled against the location index afterwards, and move_sector
        // re-checks each id under its sector lock anyway.
        let mut buffer = vec![0; usage.len() * 64 * SECTOR_METADATA_DISK_SIZE as usize];
        let slots_read = match files.metadata.read(0, &mut buffer) {
            Ok(()) => true,
            Err(err) => {
                folder.failed_reads.fetch_add(1, Ordering::Relaxed);
                error!(
                    "reading the metadata of {} failed: {err}",
                    folder.path.display()
                );
                false
            }
        };

        let candidates: Vec<SectorId> = {
            let wal = self.wal.lock();
            if slots_read {
                let mut ids = Vec::new();
                for word_index in (new_sector_count / 64) as usize..usage.len() {
                    let word = usage[word_index];
                    if word == 0 {
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
                        let id = SectorId(meta.id);
                        let live = wal.locations.get(&id).is_some_and(|location| {
                            location.folder == folder.index && location.index == slot
                        });
                        if live {
                            ids.push(id);
                        }
                    }
                }
                ids
            } else {
                // The location index knows the same set.
                wal.locations
                    .iter()
                    .filter(|(_, location)| {
                        location.folder == folder.index && location.index >= new_sector_count
                    })
                    .map(|(id, _)| *id)
                    .collect()
            }
        };
        if candidates.is_empty() {
            return (0, Vec::new());
        }
        info!(
            "relocating {} sector(s) off {}",
            candidates.len(),
            folder.path.display()
        );

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for id in &candidates {
            let _ = job_tx.send(*id);
        }
        drop(job_tx);

        let workers = self.cfg.migration_workers.clamp(1, candidates.len());
        let failures = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let failures = &failures;
                scope.spawn(move || {
                    while let Ok(id) = job_rx.recv() {
                        if let Err(err) = self.move_sector(id, folder) {
                            warn!("sector {id} could not be relocated: {err}");
                            failures.lock().push(id);
                        }
                    }
                });
            }
        });
        let failed = failures.into_inner();
        (failed.len() as u64, failed)
    }

    /// Move one sector off its folder onto any other with room. The new
    /// location and the release of the old slot are logged as one record, so
    /// a replay lands on exactly one of the two placements.
    fn move_sector(&self, id: SectorId, source: &Arc<StorageFolder<B::Storage>>) -> Result<()> {
        let _sector = self.locks.lock(id);

        let (location, source_files) = {
            let wal = self.wal.lock();
            let Some(location) = wal.locations.get(&id).copied() else {
                // Removed while the job was queued.
                return Ok(());
            };
            if location.folder != source.index {
                return Ok(());
            }
            let Some(files) = source.state.lock().files.clone() else {
                return Err(silo_ds::Error::Unavailable.into());
            };
            (location, files)
        };

        let mut data = vec![0; self.cfg.sector_size as usize];
        match source_files
            .sector
            .read(location.index as u64 * self.cfg.sector_size, &mut data)
        {
            Ok(()) => {
                source.successful_reads.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                source.failed_reads.fetch_add(1, Ordering::Relaxed);
                error!(
                    "reading sector {id} from {} failed: {err}",
                    source.path.display()
                );
                return Err(err.into());
            }
        }

        let mut rng = rand::thread_rng();
        let mut candidates = self.available_folder_indexes();
        loop {
            let reservation = {
                let wal = self.wal.lock();
                self.reserve_slot(&wal, &mut candidates, Some(source.index), id, &mut rng)
            };
            let Some(reservation) = reservation else {
                return Err(SectorError::InsufficientStorage { id: id.to_string() }.into());
            };

            let destination = reservation.folder.clone();
            let meta = SectorMeta::new(id, location.count);
            let written = reservation
                .files
                .sector
                .write(reservation.slot as u64 * self.cfg.sector_size, &data)
                .and_then(|()| {
                    reservation
                        .files
                        .metadata
                        .write(codec::metadata_offset(reservation.slot), meta.as_bytes())
                });
            if let Err(err) = written {
                destination.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!(
                    "writing sector {id} to {} failed: {err}",
                    destination.path.display()
                );
                self.release_reservation(&destination, id, reservation.slot);
                candidates.retain(|&candidate| candidate != destination.index);
                continue;
            }
            destination.successful_writes.fetch_add(1, Ordering::Relaxed);

            let mut wal = self.wal.lock();
            wal.append_change(StateChange {
                sector_updates: vec![
                    SectorUpdate {
                        id,
                        folder: location.folder,
                        index: location.index,
                        count: 0,
                    },
                    SectorUpdate {
                        id,
                        folder: destination.index,
                        index: reservation.slot,
                        count: location.count,
                    },
                ],
                ..Default::default()
            });
            // The old slot frees immediately: the folder is being emptied or
            // reduced, and the batched record commits the new placement.
            source.state.lock().clear_usage(location.index);
            wal.locations.insert(
                id,
                SectorLocation {
                    folder: destination.index,
                    index: reservation.slot,
                    count: location.count,
                },
            );
            destination.state.lock().available_sectors.remove(&id);
            return Ok(());
        }
    }
}
