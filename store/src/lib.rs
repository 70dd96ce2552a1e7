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

//! Crash-safe sector storage engine for a storage host. Sectors are
//! fixed-size payloads stored across operator-mounted storage folders, with
//! every mutation logged ahead of time so a crash leaves a consistent prefix
//! of the acknowledged history.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

pub use silo_ds::{DataStorage, StorageBackend};
pub use silo_ds_std::{FileBackend, FileStorage};
pub use silo_err::{Error, FolderError, Result, SectorError};

mod codec;
mod folder;
mod folders;
mod group;
mod id;
mod lock;
mod maintenance;
mod migrate;
mod recovery;
mod sectors;
mod wal;

pub use id::{SectorId, SectorRoot};

/// Bytes in one sector payload.
pub const SECTOR_SIZE: u64 = 4 * 1024 * 1024;
/// Slots per usage word; folder sizes are a multiple of this.
pub const STORAGE_FOLDER_GRANULARITY: u64 = 64;
/// Bytes in one metadata record: a 12-byte id and a 2-byte reference count.
pub const SECTOR_METADATA_DISK_SIZE: u64 = 14;
pub const MIN_SECTORS_PER_FOLDER: u64 = 64;
pub const MAX_SECTORS_PER_FOLDER: u64 = 262_144;
pub const MAX_STORAGE_FOLDERS: usize = 256;
/// References one physical sector can hold.
pub const MAX_VIRTUAL_SECTORS: u16 = u16::MAX;

pub(crate) const FOLDER_ALLOCATION_STEP_SIZE: u64 = 4 * 1024 * 1024;
pub(crate) const METADATA_FILE: &str = "siahostmetadata.dat";
pub(crate) const SECTOR_FILE: &str = "siahostdata.dat";
pub(crate) const TMP_SUFFIX: &str = ".tmp";
pub(crate) const SETTINGS_FILE: &str = "siahostmanager.json";
pub(crate) const SETTINGS_TMP_FILE: &str = "siahostmanager.json.tmp";
pub(crate) const WAL_FILE: &str = "contractmanager.wal";
pub(crate) const WAL_TMP_FILE: &str = "contractmanager.wal.tmp";
pub(crate) const PERSIST_HEADER: &str = "Sia Contract Manager";
pub(crate) const PERSIST_VERSION: &str = "1.1.0";

/// Fault-injection seam for crash-consistency tests. The engine asks before
/// a handful of fragile transitions; answering `true` skips the transition.
pub trait Disruptor: Send + Sync + 'static {
    fn disrupt(&self, point: &str) -> bool {
        let _ = point;
        false
    }
}

/// The production disruptor: nothing ever fires.
pub struct NoDisruption;

impl Disruptor for NoDisruption {}

#[derive(Clone)]
pub struct Config {
    /// Bytes per sector. Every folder file offset and size derives from it.
    pub sector_size: u64,
    /// Cadence of the batched fsync; mutating calls block for at most about
    /// one interval.
    pub sync_interval: Duration,
    pub folder_recheck_initial_interval: Duration,
    pub folder_recheck_max_interval: Duration,
    /// Parallelism bound for the sector migration engine.
    pub migration_workers: usize,
    pub disruptor: Arc<dyn Disruptor>,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|threads| threads.get())
            .unwrap_or(4);
        Self {
            sector_size: SECTOR_SIZE,
            sync_interval: Duration::from_millis(500),
            folder_recheck_initial_interval: Duration::from_secs(10),
            folder_recheck_max_interval: Duration::from_secs(300),
            migration_workers: (parallelism * 8).min(256),
            disruptor: Arc::new(NoDisruption),
        }
    }
}

/// Health and capacity of one storage folder, as reported to the operator.
#[derive(Clone, Debug)]
pub struct StorageFolderInfo {
    pub index: u16,
    pub path: PathBuf,
    pub capacity: u64,
    pub capacity_remaining: u64,
    /// `u64::MAX` flags a folder whose files could not be opened.
    pub failed_reads: u64,
    pub failed_writes: u64,
    pub successful_reads: u64,
    pub successful_writes: u64,
    pub progress_numerator: u64,
    pub progress_denominator: u64,
}

/// Shared engine state behind the facade.
pub(crate) struct Engine<B: StorageBackend> {
    pub(crate) cfg: Config,
    pub(crate) persist_dir: PathBuf,
    pub(crate) backend: B,
    pub(crate) salt: [u8; 32],
    pub(crate) wal: Mutex<wal::Wal<B::Storage>>,
    pub(crate) locks: lock::SectorLocks,
    pub(crate) gate: group::ThreadGroup,
}

/// The sector store. All operations are safe to call from many threads;
/// mutating operations return once their log record is durable.
pub struct SectorStore<B: StorageBackend = FileBackend> {
    engine: Arc<Engine<B>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: Mutex<Option<Sender<()>>>,
}

impl SectorStore<FileBackend> {
    /// Open (or create) a sector store persisting under `persist_dir`.
    pub fn open(persist_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(FileBackend, persist_dir, Config::default())
    }

    pub fn open_with_config(persist_dir: impl AsRef<Path>, cfg: Config) -> Result<Self> {
        Self::open_with(FileBackend, persist_dir, cfg)
    }
}

impl<B: StorageBackend> SectorStore<B> {
    /// Open the store over an arbitrary storage backend.
    pub fn open_with(backend: B, persist_dir: impl AsRef<Path>, cfg: Config) -> Result<Self> {
        let engine = recovery::open_engine(backend, persist_dir.as_ref().to_path_buf(), cfg)?;
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();

        let mut threads = Vec::new();
        let sync_engine = engine.clone();
        let sync_stop = stop_rx.clone();
        threads.push(
            std::thread::Builder::new()
                .name("silo-sync".into())
                .spawn(move || maintenance::run_sync_loop(sync_engine, sync_stop))?,
        );
        let recheck_engine = engine.clone();
        threads.push(
            std::thread::Builder::new()
                .name("silo-recheck".into())
                .spawn(move || maintenance::run_folder_recheck_loop(recheck_engine, stop_rx))?,
        );

        Ok(Self {
            engine,
            threads: Mutex::new(threads),
            stop: Mutex::new(Some(stop_tx)),
        })
    }

    /// Store a sector. Re-adding an existing root takes another virtual
    /// reference against the same physical copy.
    pub fn add_sector(&self, root: &SectorRoot, data: &[u8]) -> Result<()> {
        self.engine.add_sector(root, data)
    }

    pub fn read_sector(&self, root: &SectorRoot) -> Result<Vec<u8>> {
        self.engine.read_sector(root)
    }

    /// Release one reference; the physical copy goes away with the last one.
    pub fn remove_sector(&self, root: &SectorRoot) -> Result<()> {
        self.engine.remove_sector(root)
    }

    /// Evict a sector regardless of its reference count.
    pub fn delete_sector(&self, root: &SectorRoot) -> Result<()> {
        self.engine.delete_sector(root)
    }

    pub fn add_storage_folder(&self, path: impl AsRef<Path>, size: u64) -> Result<()> {
        self.engine.add_storage_folder(path.as_ref(), size)
    }

    pub fn remove_storage_folder(&self, index: u16, force: bool) -> Result<()> {
        self.engine.remove_storage_folder(index, force)
    }

    pub fn resize_storage_folder(&self, index: u16, new_size: u64, force: bool) -> Result<()> {
        self.engine.resize_storage_folder(index, new_size, force)
    }

    pub fn storage_folders(&self) -> Vec<StorageFolderInfo> {
        self.engine.storage_folders()
    }

    /// Refuse new operations, wait for in-flight ones to finish (the sync
    /// loop keeps committing while they drain), then stop the background
    /// loops after one final commit.
    pub fn close(&self) -> Result<()> {
        {
            let mut stop = self.stop.lock();
            if stop.is_none() {
                return Ok(());
            }
            self.engine.gate.begin_stop();
            self.engine.gate.wait_drained();
            *stop = None;
        }
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
        Ok(())
    }
}

impl<B: StorageBackend> Drop for SectorStore<B> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
