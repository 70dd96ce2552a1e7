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
    collections::{HashMap, HashSet},
    fs::File,
    sync::Arc,
};

use crossbeam_channel::{Receiver, Sender};
use log::error;
use silo_ds::{DataStorage, StorageBackend};

use crate::codec::{
    self, FolderExtension, SavedSettings, SavedStorageFolder, StateChange,
};
use crate::folder::StorageFolder;
use crate::id::SectorId;
use crate::Engine;

/// Where one reference-counted sector lives.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct SectorLocation {
    pub folder: u16,
    pub index: u32,
    pub count: u16,
}

/// Settings snapshot written to the temporary file but not yet fsynced; the
/// next commit makes it live.
pub(crate) struct SettingsStage {
    pub file: File,
    pub snapshot: SavedSettings,
}

/// Everything guarded by the log mutex: the folder catalogue, the sector
/// location index, the in-progress log file and the changes appended to it
/// since the last rotation.
pub(crate) struct Wal<S> {
    pub folders: HashMap<u16, Arc<StorageFolder<S>>>,
    pub locations: HashMap<SectorId, SectorLocation>,
    pub uncommitted: Vec<StateChange>,
    pub wal_file: Option<File>,
    pub settings_stage: Option<SettingsStage>,
    pub committed_settings: SavedSettings,
    /// Keeps the current sync channel open; replacing it during commit
    /// disconnects every receiver cloned from `sync_rx`, which is how
    /// waiters learn their records are durable.
    pub _sync_tx: Sender<()>,
    pub sync_rx: Receiver<()>,
}

impl<S> Wal<S> {
    /// Handle a caller blocks on to wait out the next commit.
    pub fn sync_chan(&self) -> Receiver<()> {
        self.sync_rx.clone()
    }

    /// Record a state change: encode it into the in-progress log file and
    /// remember it for the commit's post-sync work. An append that cannot
    /// reach the log file forfeits every durability promise, so it halts
    /// the process.
    pub fn append_change(&mut self, change: StateChange) -> Receiver<()> {
        let body = match bincode::serialize(&change) {
            Ok(body) => body,
            Err(err) => {
                error!("state change does not encode: {err}");
                panic!("write-ahead log append failed: {err}");
            }
        };
        let Some(file) = self.wal_file.as_mut() else {
            panic!("write-ahead log is not open");
        };
        if let Err(err) = codec::write_frame(file, &body) {
            error!("write-ahead log append failed: {err}");
            panic!("write-ahead log append failed: {err}");
        }
        self.uncommitted.push(change);
        self.sync_rx.clone()
    }
}

/// Folder additions that have started but are not yet resolved by a
/// committed or errored record in the same batch.
pub(crate) fn unresolved_additions(changes: &[StateChange]) -> Vec<SavedStorageFolder> {
    let resolved: HashSet<u16> = changes
        .iter()
        .flat_map(|change| {
            change
                .folder_additions
                .iter()
                .map(|addition| addition.index)
                .chain(change.errored_folder_additions.iter().copied())
        })
        .collect();
    changes
        .iter()
        .flat_map(|change| change.unfinished_folder_additions.iter())
        .filter(|unfinished| !resolved.contains(&unfinished.index))
        .cloned()
        .collect()
}

/// Folder extensions still in flight, carrying the slot count to roll back
/// to.
pub(crate) fn unresolved_extensions(changes: &[StateChange]) -> Vec<FolderExtension> {
    let resolved: HashSet<u16> = changes
        .iter()
        .flat_map(|change| {
            change
                .folder_extensions
                .iter()
                .chain(change.errored_folder_extensions.iter())
                .map(|extension| extension.folder)
        })
        .collect();
    changes
        .iter()
        .flat_map(|change| change.unfinished_folder_extensions.iter())
        .filter(|unfinished| !resolved.contains(&unfinished.folder))
        .copied()
        .collect()
}

impl<B: StorageBackend> Engine<B> {
    /// Snapshot of what the settings file should contain right now.
    pub(crate) fn saved_settings(&self, wal: &Wal<B::Storage>) -> SavedSettings {
        let mut folders: Vec<&Arc<StorageFolder<B::Storage>>> = wal.folders.values().collect();
        folders.sort_by_key(|folder| folder.index);
        SavedSettings {
            header: crate::PERSIST_HEADER.into(),
            version: crate::PERSIST_VERSION.into(),
            sector_salt: self.salt,
            storage_folders: folders
                .iter()
                .map(|folder| SavedStorageFolder {
                    index: folder.index,
                    path: folder.path.clone(),
                    usage: folder.state.lock().usage.clone(),
                })
                .collect(),
        }
    }

    /// Block until a commit has run, unless there is nothing pending, in
    /// which case the durable state is already current.
    pub(crate) fn wait_for_commit(&self) {
        let chan = {
            let wal = self.wal.lock();
            if wal.uncommitted.is_empty()
                && wal.settings_stage.is_none()
                && self.saved_settings(&wal) == wal.committed_settings
            {
                return;
            }
            wal.sync_chan()
        };
        let _ = chan.recv();
    }

    /// Make every appended record durable and apply its post-sync effects.
    /// Runs with the log mutex held, off the sync loop's timer.
    pub(crate) fn commit(&self, wal: &mut Wal<B::Storage>) {
        if wal.uncommitted.is_empty()
            && wal.settings_stage.is_none()
            && self.saved_settings(wal) == wal.committed_settings
        {
            return;
        }

        self.sync_resources(wal);
        let changes = std::mem::take(&mut wal.uncommitted);
        self.apply_post_sync(wal, &changes);

        // Wake every waiter of this batch and open a channel for the next.
        let (sync_tx, sync_rx) = crossbeam_channel::unbounded();
        wal._sync_tx = sync_tx;
        wal.sync_rx = sync_rx;

        self.stage_settings(wal);
        self.rotate_wal(wal, &changes);
    }

    /// Flush the staged settings, every folder file and the in-progress log,
    /// then rename the log into place. The rename is the point at which the
    /// batch becomes durable.
    fn sync_resources(&self, wal: &mut Wal<B::Storage>) {
        if let Some(stage) = wal.settings_stage.take() {
            if let Err(err) = stage.file.sync_all() {
                error!("settings sync failed: {err}");
                panic!("settings sync failed: {err}");
            }
            drop(stage.file);
            let tmp_path = self.persist_dir.join(crate::SETTINGS_TMP_FILE);
            let path = self.persist_dir.join(crate::SETTINGS_FILE);
            if let Err(err) = std::fs::rename(&tmp_path, &path) {
                error!("settings rename failed: {err}");
                panic!("settings rename failed: {err}");
            }
            wal.committed_settings = stage.snapshot;
        }

        let folders: Vec<Arc<StorageFolder<B::Storage>>> = wal.folders.values().cloned().collect();
        std::thread::scope(|scope| {
            for folder in &folders {
                scope.spawn(move || {
                    if let Err(err) = folder.sync() {
                        folder
                            .failed_writes
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        error!("storage folder {} sync failed: {err}", folder.path.display());
                    }
                });
            }
        });

        if let Some(file) = wal.wal_file.take() {
            if let Err(err) = file.sync_all() {
                error!("write-ahead log sync failed: {err}");
                panic!("write-ahead log sync failed: {err}");
            }
        }
        let tmp_path = self.persist_dir.join(crate::WAL_TMP_FILE);
        let path = self.persist_dir.join(crate::WAL_FILE);
        if let Err(err) = std::fs::rename(&tmp_path, &path) {
            error!("write-ahead log rename failed: {err}");
            panic!("write-ahead log rename failed: {err}");
        }
    }

    /// Effects that must wait until the batch is durable: growing usage into
    /// freshly extended files, truncating reduced folders, and deleting the
    /// files of removed folders.
    fn apply_post_sync(&self, wal: &mut Wal<B::Storage>, changes: &[StateChange]) {
        for change in changes {
            for extension in &change.folder_extensions {
                if let Some(folder) = wal.folders.get(&extension.folder) {
                    let mut state = folder.state.lock();
                    let words = (extension.sector_count / 64) as usize;
                    if state.usage.len() < words {
                        state.usage.resize(words, 0);
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
                for path in [
                    removal.path.join(crate::METADATA_FILE),
                    removal.path.join(crate::SECTOR_FILE),
                ] {
                    if let Err(err) = self.backend.remove(&path) {
                        error!("removing {} failed: {err}", path.display());
                    }
                }
            }
        }
    }

    /// Shrink a folder's usage bitmap and both files to `new_sector_count`
    /// slots. Idempotent, so recovery can replay it.
    pub(crate) fn truncate_folder(&self, folder: &Arc<StorageFolder<B::Storage>>, new_sector_count: u32) {
        let mut state = folder.state.lock();
        let words = (new_sector_count / 64) as usize;
        if state.usage.len() > words {
            let removed: u64 = state.usage[words..]
                .iter()
                .map(|word| word.count_ones() as u64)
                .sum();
            state.usage.truncate(words);
            state.sectors -= removed;
        }
        let files = state.files.clone();
        drop(state);
        if let Some(files) = files {
            let slots = new_sector_count as u64;
            if let Err(err) = files
                .metadata
                .truncate(slots * crate::SECTOR_METADATA_DISK_SIZE)
                .and_then(|()| files.sector.truncate(slots * self.cfg.sector_size))
            {
                folder
                    .failed_writes
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                error!(
                    "truncating storage folder {} failed: {err}",
                    folder.path.display()
                );
            }
        }
    }

    /// Stage a settings rewrite when the in-memory state has drifted from
    /// the last committed file. The temporary file is fsynced and renamed by
    /// the next commit.
    fn stage_settings(&self, wal: &mut Wal<B::Storage>) {
        let snapshot = self.saved_settings(wal);
        if snapshot == wal.committed_settings {
            return;
        }
        let tmp_path = self.persist_dir.join(crate::SETTINGS_TMP_FILE);
        let mut file = match File::create(&tmp_path) {
            Ok(file) => file,
            Err(err) => {
                error!("staging settings failed: {err}");
                return;
            }
        };
        match serde_json::to_writer_pretty(&mut file, &snapshot) {
            Ok(()) => wal.settings_stage = Some(SettingsStage { file, snapshot }),
            Err(err) => error!("staging settings failed: {err}"),
        }
    }

    /// Open a fresh in-progress log and carry the still-running folder jobs
    /// into it so a crash can roll them back.
    fn rotate_wal(&self, wal: &mut Wal<B::Storage>, changes: &[StateChange]) {
        if let Err(err) = self.create_wal_file(wal) {
            error!("write-ahead log rotation failed: {err}");
            panic!("write-ahead log rotation failed: {err}");
        }
        let carried = StateChange {
            unfinished_folder_additions: unresolved_additions(changes),
            unfinished_folder_extensions: unresolved_extensions(changes),
            ..Default::default()
        };
        if !carried.is_empty() {
            wal.append_change(carried);
        }
    }

    pub(crate) fn create_wal_file(&self, wal: &mut Wal<B::Storage>) -> std::io::Result<()> {
        let mut file = File::create(self.persist_dir.join(crate::WAL_TMP_FILE))?;
        codec::write_wal_metadata(&mut file)?;
        wal.wal_file = Some(file);
        Ok(())
    }
}
