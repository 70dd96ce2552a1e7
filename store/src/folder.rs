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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use silo_ds::DataStorage;

use crate::id::SectorId;
use crate::{METADATA_FILE, SECTOR_FILE, TMP_SUFFIX};

/// The two files backing one storage folder.
pub(crate) struct FolderFiles<S> {
    pub metadata: S,
    pub sector: S,
}

/// State guarded by the engine's locking discipline: mutated only while the
/// log mutex is held. `files` is `None` while the folder is unavailable.
pub(crate) struct FolderState<S> {
    pub files: Option<Arc<FolderFiles<S>>>,
    pub usage: Vec<u64>,
    /// Slots that are reserved in `usage` but whose owning record has not
    /// synced yet. The only legitimate source of a set bit without a
    /// matching location entry.
    pub available_sectors: HashMap<SectorId, u32>,
    pub sectors: u64,
}

pub(crate) struct StorageFolder<S> {
    pub index: u16,
    pub path: PathBuf,
    /// Folder add/remove/resize hold this exclusively; a sector write holds
    /// it shared. Vacancy scans only ever `try_read` so a folder being
    /// resized is skipped instead of waited on.
    pub lock: Arc<RwLock<()>>,
    pub state: Mutex<FolderState<S>>,

    pub failed_reads: AtomicU64,
    pub failed_writes: AtomicU64,
    pub successful_reads: AtomicU64,
    pub successful_writes: AtomicU64,
    pub progress_numerator: AtomicU64,
    pub progress_denominator: AtomicU64,
}

impl<S> StorageFolder<S> {
    pub fn new(index: u16, path: PathBuf, usage: Vec<u64>) -> Self {
        let sectors = usage.iter().map(|word| word.count_ones() as u64).sum();
        Self {
            index,
            path,
            lock: Arc::new(RwLock::new(())),
            state: Mutex::new(FolderState {
                files: None,
                usage,
                available_sectors: HashMap::new(),
                sectors,
            }),
            failed_reads: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            successful_reads: AtomicU64::new(0),
            successful_writes: AtomicU64::new(0),
            progress_numerator: AtomicU64::new(0),
            progress_denominator: AtomicU64::new(0),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }

    pub fn sector_path(&self) -> PathBuf {
        self.path.join(SECTOR_FILE)
    }

    pub fn metadata_tmp_path(&self) -> PathBuf {
        self.path.join(format!("{METADATA_FILE}{TMP_SUFFIX}"))
    }

    pub fn sector_tmp_path(&self) -> PathBuf {
        self.path.join(format!("{SECTOR_FILE}{TMP_SUFFIX}"))
    }

    /// Flag the folder as unavailable. The sentinel counter values make the
    /// failure obvious to an operator watching folder health.
    pub fn mark_unavailable(&self) {
        self.failed_reads.store(u64::MAX, Ordering::Relaxed);
        self.failed_writes.store(u64::MAX, Ordering::Relaxed);
    }

    pub fn mark_available(&self) {
        self.failed_reads.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
    }

    pub fn reset_progress(&self) {
        self.progress_numerator.store(0, Ordering::Relaxed);
        self.progress_denominator.store(0, Ordering::Relaxed);
    }
}

impl<S: DataStorage> StorageFolder<S> {
    /// Fsync both folder files, charging failures to the folder's health
    /// counters.
    pub fn sync(&self) -> silo_ds::Result<()> {
        let files = {
            let state = self.state.lock();
            match &state.files {
                Some(files) => files.clone(),
                None => return Ok(()),
            }
        };
        files.metadata.sync()?;
        files.sector.sync()?;
        Ok(())
    }
}

impl<S> FolderState<S> {
    pub fn num_sectors(&self) -> u64 {
        self.usage.len() as u64 * 64
    }

    pub fn is_usage_set(&self, slot: u32) -> bool {
        self.usage[slot as usize / 64] & (1 << (slot % 64)) != 0
    }

    /// Set the usage bit for `slot`. The sector count moves only on an
    /// actual bit transition, which keeps replaying a committed record twice
    /// harmless.
    pub fn set_usage(&mut self, slot: u32) {
        let word = &mut self.usage[slot as usize / 64];
        let mask = 1u64 << (slot % 64);
        if *word & mask == 0 {
            *word |= mask;
            self.sectors += 1;
        }
    }

    pub fn clear_usage(&mut self, slot: u32) {
        let word = &mut self.usage[slot as usize / 64];
        let mask = 1u64 << (slot % 64);
        if *word & mask != 0 {
            *word &= !mask;
            self.sectors -= 1;
        }
    }
}

/// Index of the highest set bit of `x != 0`.
pub(crate) fn most_significant_bit(x: u64) -> u32 {
    63 - x.leading_zeros()
}

/// Pick a free slot: scan forward from a random word for one that is not
/// full, wrapping around once, and take the most significant zero bit of the
/// chosen word. The random start spreads allocations across the folder.
pub(crate) fn random_free_slot(usage: &[u64], rng: &mut impl Rng) -> Option<u32> {
    if usage.is_empty() {
        return None;
    }
    let start = rng.gen_range(0..usage.len());
    let scan = |lo: usize, hi: usize| {
        (lo..hi).find_map(|word_index| {
            let word = usage[word_index];
            (word != u64::MAX)
                .then(|| word_index as u32 * 64 + most_significant_bit(!word))
        })
    };
    scan(start, usage.len()).or_else(|| scan(0, start))
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    fn state(usage: Vec<u64>) -> FolderState<()> {
        let sectors = usage.iter().map(|word| word.count_ones() as u64).sum();
        FolderState {
            files: None,
            usage,
            available_sectors: HashMap::new(),
            sectors,
        }
    }

    #[test]
    fn most_significant_bit_positions() {
        assert_eq!(most_significant_bit(1), 0);
        assert_eq!(most_significant_bit(2), 1);
        assert_eq!(most_significant_bit(3), 1);
        assert_eq!(most_significant_bit(u64::MAX), 63);
        assert_eq!(most_significant_bit(1 << 40), 40);
    }

    #[test]
    fn usage_transitions_track_sector_count() {
        let mut state = state(vec![0; 2]);
        state.set_usage(3);
        state.set_usage(3);
        state.set_usage(100);
        assert_eq!(state.sectors, 2);
        assert!(state.is_usage_set(3));
        assert!(state.is_usage_set(100));

        state.clear_usage(3);
        state.clear_usage(3);
        assert_eq!(state.sectors, 1);
        assert!(!state.is_usage_set(3));
    }

    #[test]
    fn free_slot_comes_from_a_partial_word() {
        let usage = vec![u64::MAX, !(1 << 17), u64::MAX];
        for _ in 0..32 {
            assert_eq!(random_free_slot(&usage, &mut thread_rng()), Some(64 + 17));
        }
    }

    #[test]
    fn free_slot_wraps_around() {
        let mut usage = vec![u64::MAX; 8];
        usage[0] = !(1 << 5);
        for _ in 0..32 {
            assert_eq!(random_free_slot(&usage, &mut thread_rng()), Some(5));
        }
    }

    #[test]
    fn full_folder_has_no_free_slot() {
        assert_eq!(random_free_slot(&[u64::MAX; 4], &mut thread_rng()), None);
        assert_eq!(random_free_slot(&[], &mut thread_rng()), None);
    }

    #[test]
    fn allocation_fills_a_folder_exactly() {
        let mut state = state(vec![0; 2]);
        for _ in 0..128 {
            let slot = random_free_slot(&state.usage, &mut thread_rng()).unwrap();
            assert!(!state.is_usage_set(slot));
            state.set_usage(slot);
        }
        assert_eq!(state.sectors, 128);
        assert_eq!(random_free_slot(&state.usage, &mut thread_rng()), None);
    }
}
