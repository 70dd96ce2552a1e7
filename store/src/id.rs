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

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content hash a sector is addressed by in the outside world.
pub type SectorRoot = [u8; 32];

/// Internal sector identifier: the salted hash of the sector root, truncated
/// to 12 bytes. The salt keeps an adversary from choosing roots that collide
/// in the truncated space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId(pub(crate) [u8; 12]);

impl SectorId {
    pub(crate) fn derive(root: &SectorRoot, salt: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(root);
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut id = [0; 12];
        id.copy_from_slice(&digest[..12]);
        Self(id)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let root = [7; 32];
        let salt = [1; 32];
        assert_eq!(SectorId::derive(&root, &salt), SectorId::derive(&root, &salt));
    }

    #[test]
    fn derivation_depends_on_salt() {
        let root = [7; 32];
        assert_ne!(
            SectorId::derive(&root, &[1; 32]),
            SectorId::derive(&root, &[2; 32])
        );
    }

    #[test]
    fn display_is_lowercase_hex() {
        let id = SectorId([0xab; 12]);
        assert_eq!(id.to_string(), "ab".repeat(12));
    }
}
