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
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use silo_ds::{DataStorage, StorageBackend};
use silo_store::{
    Config, Disruptor, Error, FileBackend, FileStorage, FolderError, SectorError, SectorRoot,
    SectorStore,
};

const SECTOR_SIZE: u64 = 4096;

fn config() -> Config {
    Config {
        sector_size: SECTOR_SIZE,
        sync_interval: Duration::from_millis(10),
        folder_recheck_initial_interval: Duration::from_millis(50),
        folder_recheck_max_interval: Duration::from_millis(200),
        migration_workers: 4,
        ..Config::default()
    }
}

fn root(seed: u64) -> SectorRoot {
    let mut root = [0; 32];
    root[..8].copy_from_slice(&seed.to_le_bytes());
    root
}

fn payload(seed: u64) -> Vec<u8> {
    (0..SECTOR_SIZE)
        .map(|offset| (offset.wrapping_mul(31) ^ seed) as u8)
        .collect()
}

fn slots(count: u64) -> u64 {
    count * SECTOR_SIZE
}

fn used_bytes<B: StorageBackend>(store: &SectorStore<B>) -> u64 {
    store
        .storage_folders()
        .iter()
        .map(|folder| folder.capacity - folder.capacity_remaining)
        .sum()
}

fn total_capacity<B: StorageBackend>(store: &SectorStore<B>) -> u64 {
    store.storage_folders().iter().map(|folder| folder.capacity).sum()
}

#[test]
fn add_read_remove_round_trip() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();

    store.add_storage_folder(folder.path(), slots(64)).unwrap();
    assert_eq!(total_capacity(&store), slots(64));
    assert_eq!(used_bytes(&store), 0);

    store.add_sector(&root(1), &payload(1)).unwrap();
    assert_eq!(store.read_sector(&root(1)).unwrap(), payload(1));
    assert_eq!(used_bytes(&store), SECTOR_SIZE);

    store.remove_sector(&root(1)).unwrap();
    assert_eq!(used_bytes(&store), 0);
    assert!(matches!(
        store.read_sector(&root(1)),
        Err(Error::Sector(SectorError::NotFound { .. }))
    ));
    store.close().unwrap();
}

#[test]
fn virtual_sectors_share_one_physical_slot() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    store.add_sector(&root(2), &payload(2)).unwrap();
    store.add_sector(&root(2), &payload(2)).unwrap();
    assert_eq!(used_bytes(&store), SECTOR_SIZE);

    store.remove_sector(&root(2)).unwrap();
    assert_eq!(used_bytes(&store), SECTOR_SIZE);
    assert_eq!(store.read_sector(&root(2)).unwrap(), payload(2));

    store.remove_sector(&root(2)).unwrap();
    assert_eq!(used_bytes(&store), 0);
    assert!(store.read_sector(&root(2)).is_err());
    store.close().unwrap();
}

#[test]
fn repeated_references_return_to_the_initial_state() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    for _ in 0..5 {
        store.add_sector(&root(3), &payload(3)).unwrap();
    }
    assert_eq!(used_bytes(&store), SECTOR_SIZE);
    for _ in 0..5 {
        store.remove_sector(&root(3)).unwrap();
    }
    assert_eq!(used_bytes(&store), 0);
    assert!(store.read_sector(&root(3)).is_err());
    store.close().unwrap();
}

#[test]
fn delete_sector_ignores_references() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    store.add_sector(&root(4), &payload(4)).unwrap();
    store.add_sector(&root(4), &payload(4)).unwrap();
    store.delete_sector(&root(4)).unwrap();
    assert_eq!(used_bytes(&store), 0);
    assert!(store.read_sector(&root(4)).is_err());
    store.close().unwrap();
}

#[test]
fn malformed_payloads_are_rejected() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    let short = vec![0; SECTOR_SIZE as usize - 1];
    assert!(matches!(
        store.add_sector(&root(5), &short),
        Err(Error::Sector(SectorError::Malformed { .. }))
    ));
    store.close().unwrap();
}

#[test]
fn full_folder_rejects_new_sectors() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    for seed in 0..64 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    assert_eq!(used_bytes(&store), slots(64));
    assert!(matches!(
        store.add_sector(&root(64), &payload(64)),
        Err(Error::Sector(SectorError::InsufficientStorage { .. }))
    ));
    store.close().unwrap();
}

#[test]
fn sectors_survive_restart() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    {
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        store.add_storage_folder(folder.path(), slots(64)).unwrap();
        for seed in 0..10 {
            store.add_sector(&root(seed), &payload(seed)).unwrap();
        }
        store.close().unwrap();
    }
    // Loading twice in a row must land on the same state.
    for _ in 0..2 {
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        assert_eq!(used_bytes(&store), slots(10));
        for seed in 0..10 {
            assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
        }
        store.close().unwrap();
    }
}

#[test]
fn folder_validation_errors() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();

    assert!(matches!(
        store.add_storage_folder("relative/path", slots(64)),
        Err(Error::Folder(FolderError::RelativePath(_)))
    ));
    assert!(matches!(
        store.add_storage_folder(folder.path().join("missing"), slots(64)),
        Err(Error::Folder(FolderError::NotAFolder(_)))
    ));
    assert!(matches!(
        store.add_storage_folder(folder.path(), slots(32)),
        Err(Error::Folder(FolderError::Small { .. }))
    ));
    assert!(matches!(
        store.add_storage_folder(folder.path(), slots(262_144 + 64)),
        Err(Error::Folder(FolderError::Large { .. }))
    ));
    assert!(matches!(
        store.add_storage_folder(folder.path(), slots(65)),
        Err(Error::Folder(FolderError::Granularity { .. }))
    ));

    store.add_storage_folder(folder.path(), slots(64)).unwrap();
    assert!(matches!(
        store.add_storage_folder(folder.path(), slots(64)),
        Err(Error::Folder(FolderError::Repeat(_)))
    ));
    assert!(matches!(
        store.resize_storage_folder(0, slots(64), false),
        Err(Error::Folder(FolderError::NoResize))
    ));
    assert!(matches!(
        store.resize_storage_folder(7, slots(128), false),
        Err(Error::Folder(FolderError::NotFound(7)))
    ));
    assert!(matches!(
        store.remove_storage_folder(7, false),
        Err(Error::Folder(FolderError::NotFound(7)))
    ));
    store.close().unwrap();
}

#[test]
fn growing_a_folder_adds_capacity() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();
    for seed in 0..64 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }

    store.resize_storage_folder(0, slots(192), false).unwrap();
    assert_eq!(total_capacity(&store), slots(192));
    store.add_sector(&root(64), &payload(64)).unwrap();
    for seed in 0..=64 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn shrink_relocates_sectors() {
    let persist = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();

    store.add_storage_folder(first.path(), slots(512)).unwrap();
    for seed in 0..192 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    store.add_storage_folder(second.path(), slots(192)).unwrap();

    store.resize_storage_folder(0, slots(128), false).unwrap();

    assert_eq!(total_capacity(&store), slots(128 + 192));
    assert_eq!(used_bytes(&store), slots(192));
    for seed in 0..192 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();

    // The layout must hold across a restart.
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    assert_eq!(total_capacity(&store), slots(128 + 192));
    for seed in 0..192 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn remove_folder_relocates_sectors() {
    let persist = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();

    store.add_storage_folder(first.path(), slots(64)).unwrap();
    for seed in 0..32 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    store.add_storage_folder(second.path(), slots(64)).unwrap();

    store.remove_storage_folder(0, false).unwrap();
    assert_eq!(total_capacity(&store), slots(64));
    assert_eq!(used_bytes(&store), slots(32));
    for seed in 0..32 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    assert!(!first.path().join("siahostdata.dat").exists());
    assert!(!first.path().join("siahostmetadata.dat").exists());
    store.close().unwrap();
}

#[test]
fn forced_removal_of_the_only_folder_loses_its_sectors() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();
    for seed in 0..8 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }

    // With nowhere to put the sectors the removal must be forced.
    assert!(matches!(
        store.remove_storage_folder(0, false),
        Err(Error::Folder(FolderError::PartialRelocation { failed: 8 }))
    ));
    store.remove_storage_folder(0, true).unwrap();
    assert!(store.storage_folders().is_empty());
    for seed in 0..8 {
        assert!(store.read_sector(&root(seed)).is_err());
    }
    store.close().unwrap();

    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    assert!(store.storage_folders().is_empty());
    store.close().unwrap();
}

/// Fires at one named point once armed, standing in for a crash between the
/// relocation and the reduction record.
#[derive(Default)]
struct SkipReduction {
    armed: AtomicBool,
}

impl Disruptor for SkipReduction {
    fn disrupt(&self, point: &str) -> bool {
        point == "shrink-reduction" && self.armed.load(Ordering::Relaxed)
    }
}

#[test]
fn shrink_interrupted_before_the_reduction_record_keeps_the_old_layout() {
    let persist = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let skip = Arc::new(SkipReduction::default());
    let mut cfg = config();
    cfg.disruptor = skip.clone();

    let store = SectorStore::open_with_config(persist.path(), cfg).unwrap();
    store.add_storage_folder(first.path(), slots(512)).unwrap();
    for seed in 0..192 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    store.add_storage_folder(second.path(), slots(192)).unwrap();

    skip.armed.store(true, Ordering::Relaxed);
    store.resize_storage_folder(0, slots(128), false).unwrap();
    store.close().unwrap();

    // The moves are durable, the reduction never happened: the folder keeps
    // its old size and every sector is readable somewhere.
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    assert_eq!(total_capacity(&store), slots(512 + 192));
    assert_eq!(used_bytes(&store), slots(192));
    for seed in 0..192 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

/// Write-failure injection on everything under one directory, with a budget
/// of allowed writes before failures begin. Truncations can be failed
/// outright.
#[derive(Default)]
struct FailPlan {
    armed: AtomicBool,
    fail_truncate: AtomicBool,
    budget: AtomicI64,
    guarded: Mutex<Option<PathBuf>>,
}

impl FailPlan {
    fn arm(&self, dir: &Path, allowed_writes: i64) {
        *self.guarded.lock().unwrap() = Some(dir.to_path_buf());
        self.budget.store(allowed_writes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn arm_truncate(&self, dir: &Path) {
        *self.guarded.lock().unwrap() = Some(dir.to_path_buf());
        self.budget.store(i64::MAX, Ordering::SeqCst);
        self.fail_truncate.store(true, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.fail_truncate.store(false, Ordering::SeqCst);
    }

    fn guards(&self, path: &Path) -> bool {
        if !self.armed.load(Ordering::SeqCst) {
            return false;
        }
        let guarded = self.guarded.lock().unwrap();
        guarded.as_ref().is_some_and(|dir| path.starts_with(dir))
    }

    fn should_fail(&self, path: &Path) -> bool {
        self.guards(path) && self.budget.fetch_sub(1, Ordering::SeqCst) <= 0
    }

    fn should_fail_truncate(&self, path: &Path) -> bool {
        self.fail_truncate.load(Ordering::SeqCst) && self.guards(path)
    }
}

#[derive(Clone, Default)]
struct FlakyBackend {
    plan: Arc<FailPlan>,
}

struct FlakyStorage {
    inner: FileStorage,
    path: PathBuf,
    plan: Arc<FailPlan>,
}

impl DataStorage for FlakyStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> silo_ds::Result<()> {
        self.inner.read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> silo_ds::Result<()> {
        if self.plan.should_fail(&self.path) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        self.inner.write(offset, buffer)
    }

    fn truncate(&self, length: u64) -> silo_ds::Result<()> {
        if self.plan.should_fail_truncate(&self.path) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected truncate failure").into());
        }
        self.inner.truncate(length)
    }

    fn sync(&self) -> silo_ds::Result<()> {
        self.inner.sync()
    }

    fn length(&self) -> silo_ds::Result<u64> {
        self.inner.length()
    }
}

impl StorageBackend for FlakyBackend {
    type Storage = FlakyStorage;

    fn create(&self, path: &Path) -> silo_ds::Result<Self::Storage> {
        Ok(FlakyStorage {
            inner: FileBackend.create(path)?,
            path: path.to_path_buf(),
            plan: self.plan.clone(),
        })
    }

    fn open(&self, path: &Path) -> silo_ds::Result<Self::Storage> {
        Ok(FlakyStorage {
            inner: FileBackend.open(path)?,
            path: path.to_path_buf(),
            plan: self.plan.clone(),
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> silo_ds::Result<()> {
        FileBackend.rename(from, to)
    }

    fn remove(&self, path: &Path) -> silo_ds::Result<()> {
        FileBackend.remove(path)
    }
}

#[test]
fn failed_writes_fall_back_to_another_folder() {
    let persist = tempfile::tempdir().unwrap();
    let healthy = tempfile::tempdir().unwrap();
    let broken = tempfile::tempdir().unwrap();
    let backend = FlakyBackend::default();
    let plan = backend.plan.clone();

    let store = SectorStore::open_with(backend, persist.path(), config()).unwrap();
    store.add_storage_folder(healthy.path(), slots(64)).unwrap();
    store.add_storage_folder(broken.path(), slots(64)).unwrap();

    plan.arm(broken.path(), 0);
    for seed in 0..20 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    plan.disarm();

    for seed in 0..20 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    let folders = store.storage_folders();
    let broken_info = folders
        .iter()
        .find(|info| info.path == broken.path())
        .unwrap();
    assert_eq!(broken_info.capacity, broken_info.capacity_remaining);
    assert!(broken_info.failed_writes >= 1);
    store.close().unwrap();
}

#[test]
fn forced_shrink_gives_up_unmovable_sectors_consistently() {
    let persist = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let backend = FlakyBackend::default();
    let plan = backend.plan.clone();

    let store = SectorStore::open_with(backend.clone(), persist.path(), config()).unwrap();
    store.add_storage_folder(first.path(), slots(512)).unwrap();
    for seed in 0..192 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    store.add_storage_folder(second.path(), slots(192)).unwrap();

    // At least 64 sectors have to leave the folder, at two writes each; a
    // budget of 100 guarantees both survivors and casualties.
    plan.arm(second.path(), 100);
    assert!(matches!(
        store.resize_storage_folder(0, slots(128), false),
        Err(Error::Folder(FolderError::PartialRelocation { .. }))
    ));
    store.resize_storage_folder(0, slots(128), true).unwrap();
    plan.disarm();

    let readable: Vec<u64> = (0..192)
        .filter(|seed| store.read_sector(&root(*seed)).is_ok())
        .collect();
    assert!(!readable.is_empty());
    assert!(readable.len() < 192);
    assert_eq!(total_capacity(&store), slots(128 + 192));
    assert_eq!(used_bytes(&store), readable.len() as u64 * SECTOR_SIZE);
    store.close().unwrap();

    // Restarting loses nothing further.
    let store = SectorStore::open_with(backend, persist.path(), config()).unwrap();
    for seed in &readable {
        assert_eq!(store.read_sector(&root(*seed)).unwrap(), payload(*seed));
    }
    assert_eq!(used_bytes(&store), readable.len() as u64 * SECTOR_SIZE);
    store.close().unwrap();
}

#[test]
fn virtual_references_survive_restart() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    {
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        store.add_storage_folder(folder.path(), slots(64)).unwrap();
        store.add_sector(&root(6), &payload(6)).unwrap();
        store.add_sector(&root(6), &payload(6)).unwrap();
        store.close().unwrap();
    }
    {
        // The reference count comes back from the metadata records.
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        store.remove_sector(&root(6)).unwrap();
        assert_eq!(store.read_sector(&root(6)).unwrap(), payload(6));
        assert_eq!(used_bytes(&store), SECTOR_SIZE);
        store.close().unwrap();
    }
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.remove_sector(&root(6)).unwrap();
    assert_eq!(used_bytes(&store), 0);
    assert!(store.read_sector(&root(6)).is_err());
    store.close().unwrap();
}

#[test]
fn concurrent_adds_land_every_sector() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(192)).unwrap();

    std::thread::scope(|scope| {
        for thread in 0..8u64 {
            let store = &store;
            scope.spawn(move || {
                for offset in 0..16 {
                    let seed = thread * 16 + offset;
                    store.add_sector(&root(seed), &payload(seed)).unwrap();
                }
            });
        }
    });

    assert_eq!(used_bytes(&store), slots(128));
    for seed in 0..128 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn adds_proceed_while_a_folder_shrinks() {
    let persist = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();

    store.add_storage_folder(first.path(), slots(512)).unwrap();
    for seed in 0..64 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }
    store.add_storage_folder(second.path(), slots(192)).unwrap();

    // The vacancy scan skips the write-locked folder instead of blocking on
    // it, so adds keep landing while the resize runs.
    std::thread::scope(|scope| {
        let resizer = scope.spawn(|| store.resize_storage_folder(0, slots(128), false));
        for seed in 64..96 {
            store.add_sector(&root(seed), &payload(seed)).unwrap();
        }
        resizer.join().unwrap().unwrap();
    });

    assert_eq!(used_bytes(&store), slots(96));
    for seed in 0..96 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn removing_a_missing_sector_fails() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();

    assert!(matches!(
        store.remove_sector(&root(77)),
        Err(Error::Sector(SectorError::NotFound { .. }))
    ));
    assert!(matches!(
        store.delete_sector(&root(77)),
        Err(Error::Sector(SectorError::NotFound { .. }))
    ));
    store.close().unwrap();
}

#[test]
fn corrupt_log_tail_is_discarded_on_load() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    {
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        store.add_storage_folder(folder.path(), slots(64)).unwrap();
        for seed in 0..5 {
            store.add_sector(&root(seed), &payload(seed)).unwrap();
        }
        store.close().unwrap();
    }

    // A torn append at the end of the committed log must not take the intact
    // records with it.
    let wal_path = persist.path().join("contractmanager.wal");
    let mut bytes = std::fs::read(&wal_path).unwrap();
    bytes.extend_from_slice(&[0x17, 0x00, 0x00, 0x00, 0xde, 0xad]);
    std::fs::write(&wal_path, bytes).unwrap();

    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    for seed in 0..5 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn failed_growth_rolls_the_folder_back() {
    let persist = tempfile::tempdir().unwrap();
    let folder = tempfile::tempdir().unwrap();
    let backend = FlakyBackend::default();
    let plan = backend.plan.clone();

    let store = SectorStore::open_with(backend.clone(), persist.path(), config()).unwrap();
    store.add_storage_folder(folder.path(), slots(64)).unwrap();
    for seed in 0..8 {
        store.add_sector(&root(seed), &payload(seed)).unwrap();
    }

    plan.arm_truncate(folder.path());
    assert!(store.resize_storage_folder(0, slots(192), false).is_err());
    plan.disarm();

    assert_eq!(total_capacity(&store), slots(64));
    for seed in 0..8 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();

    // The rollback is durable: the folder comes back at its old size.
    let store = SectorStore::open_with(backend, persist.path(), config()).unwrap();
    assert_eq!(total_capacity(&store), slots(64));
    for seed in 0..8 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    store.close().unwrap();
}

#[test]
fn unavailable_folder_is_flagged_and_recovers() {
    let persist = tempfile::tempdir().unwrap();
    let parent = tempfile::tempdir().unwrap();
    let folder = parent.path().join("folder");
    std::fs::create_dir(&folder).unwrap();

    {
        let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
        store.add_storage_folder(&folder, slots(64)).unwrap();
        for seed in 0..4 {
            store.add_sector(&root(seed), &payload(seed)).unwrap();
        }
        store.close().unwrap();
    }

    let hidden = parent.path().join("hidden");
    std::fs::rename(&folder, &hidden).unwrap();

    let store = SectorStore::open_with_config(persist.path(), config()).unwrap();
    let folders = store.storage_folders();
    assert_eq!(folders[0].failed_reads, u64::MAX);
    assert_eq!(folders[0].failed_writes, u64::MAX);
    assert!(matches!(
        store.read_sector(&root(0)),
        Err(Error::Sector(SectorError::NotFound { .. }))
    ));
    assert!(matches!(
        store.add_sector(&root(9), &payload(9)),
        Err(Error::Sector(SectorError::InsufficientStorage { .. }))
    ));
    assert!(matches!(
        store.resize_storage_folder(0, slots(128), false),
        Err(Error::Folder(FolderError::BadIndex(0)))
    ));

    // Restoring the directory lets the recheck loop revive the folder.
    std::fs::rename(&hidden, &folder).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if store.read_sector(&root(0)).is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "folder never became available");
        std::thread::sleep(Duration::from_millis(25));
    }
    for seed in 0..4 {
        assert_eq!(store.read_sector(&root(seed)).unwrap(), payload(seed));
    }
    assert!(store.storage_folders()[0].failed_reads < u64::MAX);
    store.add_sector(&root(9), &payload(9)).unwrap();
    store.close().unwrap();
}
