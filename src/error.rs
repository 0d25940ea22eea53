//! Per-layer error enums, mirroring `sixcy`'s `CodecError` / `SuperblockError`
//! split: each concern gets its own `thiserror` enum with an `Io` escape
//! hatch, rather than one flat error type.

use std::io;
use thiserror::Error;

use crate::codec::DataItemError;

#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("block file not found")]
    NotFound,
    #[error("block file already exists")]
    AlreadyExists,
    #[error("block checksum mismatch")]
    Integrity,
    #[error("malformed settings block: {0}")]
    Format(String),
    #[error("item does not fit in one block ({len} bytes, {available} available)")]
    TooLarge { len: usize, available: usize },
    #[error("another process holds the writer lock")]
    Locked,
    #[error(transparent)]
    Item(#[from] DataItemError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ContentStoreError {
    #[error(transparent)]
    BlockFile(#[from] BlockFileError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("a snapshot already exists for this start time")]
    AlreadyExists,
    #[error("no snapshot found with that name")]
    NotFound,
    #[error("path contains a name with an embedded LF")]
    Format(String),
    #[error(transparent)]
    BlockFile(#[from] BlockFileError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage root already exists at this path")]
    AlreadyExists,
    #[error("no storage root found at this path")]
    NotFound,
    #[error(transparent)]
    BlockFile(#[from] BlockFileError),
    #[error(transparent)]
    ContentStore(#[from] ContentStoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single error type for callers (the CLI) that want one exit path instead
/// of matching every layer's enum individually.
#[derive(Error, Debug)]
pub enum EbakupError {
    #[error(transparent)]
    BlockFile(#[from] BlockFileError),
    #[error(transparent)]
    ContentStore(#[from] ContentStoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Item(#[from] DataItemError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
