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

use parking_lot::{Condvar, Mutex};
use silo_err::{Error, Result};

struct GateState {
    stopped: bool,
    active: usize,
}

/// Admission gate for shutdown: every public operation enters on the way in,
/// and shutdown first closes the gate, then waits for the active count to
/// drain before tearing anything down.
pub(crate) struct ThreadGroup {
    state: Mutex<GateState>,
    drained: Condvar,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a ThreadGroup,
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                stopped: false,
                active: 0,
            }),
            drained: Condvar::new(),
        }
    }

    pub fn enter(&self) -> Result<GateGuard<'_>> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::Shutdown);
        }
        state.active += 1;
        Ok(GateGuard { gate: self })
    }

    /// Refuse new entries. Does not wait; in-flight operations continue.
    pub fn begin_stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Block until every admitted operation has left the gate.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while state.active > 0 {
            self.drained.wait(&mut state);
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.gate.drained.notify_all();
        }
    }
}
