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

use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Data storage is unavailable")]
    Unavailable,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Positional access to a single storage file. All methods take `&self`;
/// implementations must support concurrent calls on one handle.
pub trait DataStorage: Send + Sync {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    fn truncate(&self, length: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn length(&self) -> Result<u64>;
}

/// Creates, opens and manipulates storage files by path. The engine is
/// generic over this seam so tests can substitute failing storage.
pub trait StorageBackend: Send + Sync + 'static {
    type Storage: DataStorage + 'static;

    /// Create a new empty file, truncating any existing one.
    fn create(&self, path: &Path) -> Result<Self::Storage>;

    /// Open an existing file for reading and writing.
    fn open(&self, path: &Path) -> Result<Self::Storage>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;
}
