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

use std::{collections::HashMap, sync::Arc};

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

use crate::id::SectorId;

struct LockEntry {
    mu: Arc<Mutex<()>>,
    waiters: usize,
}

/// One mutex per in-use sector id. Holding the guard serializes every public
/// operation on that id; the entry disappears once the last holder is done.
#[derive(Default)]
pub(crate) struct SectorLocks {
    table: Mutex<HashMap<SectorId, LockEntry>>,
}

pub(crate) struct SectorGuard<'a> {
    locks: &'a SectorLocks,
    id: SectorId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl SectorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, id: SectorId) -> SectorGuard<'_> {
        let mu = {
            let mut table = self.table.lock();
            let entry = table.entry(id).or_insert_with(|| LockEntry {
                mu: Arc::new(Mutex::new(())),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.mu.clone()
        };
        // Block outside the table lock so contention on one sector does not
        // stall every other sector.
        let guard = mu.lock_arc();
        SectorGuard {
            locks: self,
            id,
            guard: Some(guard),
        }
    }
}

impl Drop for SectorGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table.lock();
        if let Some(entry) = table.get_mut(&self.id) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                table.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_removed_once_released() {
        let locks = SectorLocks::new();
        let id = SectorId([1; 12]);
        {
            let _guard = locks.lock(id);
            assert_eq!(locks.table.lock().len(), 1);
        }
        assert!(locks.table.lock().is_empty());
    }

    #[test]
    fn same_id_is_mutually_exclusive() {
        let locks = Arc::new(SectorLocks::new());
        let id = SectorId([2; 12]);
        let counter = Arc::new(Mutex::new(0u32));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let locks = &locks;
                let counter = &counter;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let _guard = locks.lock(id);
                        let mut value = counter.lock();
                        *value += 1;
                    }
                });
            }
        });
        assert_eq!(*counter.lock(), 800);
        assert!(locks.table.lock().is_empty());
    }

    #[test]
    fn distinct_ids_do_not_contend() {
        let locks = SectorLocks::new();
        let _a = locks.lock(SectorId([3; 12]));
        let _b = locks.lock(SectorId([4; 12]));
        assert_eq!(locks.table.lock().len(), 2);
    }
}
