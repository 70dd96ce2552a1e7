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

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::info;
use silo_ds::StorageBackend;

use crate::Engine;

/// Commit on a fixed cadence until shutdown, then once more so no waiter is
/// left behind.
pub(crate) fn run_sync_loop<B: StorageBackend>(engine: Arc<Engine<B>>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(engine.cfg.sync_interval) {
            Err(RecvTimeoutError::Timeout) => {
                if engine.cfg.disruptor.disrupt("sync-loop") {
                    continue;
                }
                let mut wal = engine.wal.lock();
                engine.commit(&mut wal);
            }
            _ => break,
        }
    }
    let mut wal = engine.wal.lock();
    engine.commit(&mut wal);
}

/// Periodically retry folders that failed to open, with exponential backoff.
pub(crate) fn run_folder_recheck_loop<B: StorageBackend>(engine: Arc<Engine<B>>, stop: Receiver<()>) {
    let mut interval = engine.cfg.folder_recheck_initial_interval;
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                engine.recheck_unavailable_folders();
                interval = (interval * 2).min(engine.cfg.folder_recheck_max_interval);
            }
            _ => break,
        }
    }
}

impl<B: StorageBackend> Engine<B> {
    /// Try to reopen every unavailable folder. A folder that comes back has
    /// its live records re-registered in the location index and its health
    /// counters cleared.
    pub(crate) fn recheck_unavailable_folders(&self) {
        let mut wal = self.wal.lock();
        let folders: Vec<_> = wal.folders.values().cloned().collect();
        for folder in folders {
            if folder.state.lock().files.is_some() {
                continue;
            }
            self.open_folder(&folder);
            if folder.state.lock().files.is_some() {
                info!("storage folder {} is available again", folder.path.display());
                self.load_sector_locations(&mut wal, &folder);
            }
        }
    }
}
