use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Shutdown in progress")]
    Shutdown,
    #[error("Sector: {0}")]
    Sector(#[from] SectorError),
    #[error("Storage folder: {0}")]
    Folder(#[from] FolderError),
    #[error("Storage: {0}")]
    Storage(#[from] silo_ds::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SectorError {
    #[error("Payload is {got} bytes, sectors are {want} bytes")]
    Malformed { got: u64, want: u64 },
    #[error("Sector {id} already has the maximum number of virtual references")]
    MaxVirtualSectors { id: String },
    #[error("Not enough storage remaining to hold sector {id}")]
    InsufficientStorage { id: String },
    #[error("Sector {id} not found")]
    NotFound { id: String },
    #[error("Disk failure while storing sector {id}")]
    DiskTrouble { id: String },
}

#[derive(thiserror::Error, Debug)]
pub enum FolderError {
    #[error("No storage folder with index {0}")]
    NotFound(u16),
    #[error("Storage folder {0} is unavailable")]
    BadIndex(u16),
    #[error("A storage folder at {0} is already in use")]
    Repeat(PathBuf),
    #[error("Storage folder of {size} bytes is below the {min} byte minimum")]
    Small { size: u64, min: u64 },
    #[error("Storage folder of {size} bytes is above the {max} byte maximum")]
    Large { size: u64, max: u64 },
    #[error("Storage folder size must be a multiple of {chunk} bytes")]
    Granularity { chunk: u64 },
    #[error("Storage folder already has the requested size")]
    NoResize,
    #[error("Storage folder path {0} is not absolute")]
    RelativePath(PathBuf),
    #[error("Storage folder path {0} is not a directory")]
    NotAFolder(PathBuf),
    #[error("Cannot add more than {0} storage folders")]
    MaxFolders(usize),
    #[error("{failed} sector(s) could not be relocated")]
    PartialRelocation { failed: u64 },
}

pub type Result<T> = core::result::Result<T, Error>;
