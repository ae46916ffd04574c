//! Piece data storage.
//!
//! The engine only ever addresses storage by byte offset into the torrent's
//! concatenated content; mapping that onto files is the backend's business.
//! [`FileStorage`] is the on-disk backend, [`MemoryStorage`] keeps everything
//! in RAM.

mod error;
mod file;
mod memory;
mod verify;

pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use verify::{hash_matches, verify_existing};

use crate::metainfo::TorrentInfo;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates the backing store. Returns `true` when some content was
    /// already present and is worth hash-checking.
    async fn allocate(&self) -> Result<bool, StorageError>;

    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError>;

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;
}

/// Builds the storage for a torrent once its metadata is known.
pub type StorageFactory =
    Arc<dyn Fn(&Path, &TorrentInfo) -> Result<Arc<dyn Storage>, StorageError> + Send + Sync>;

pub fn file_storage_factory() -> StorageFactory {
    Arc::new(|root, info| Ok(Arc::new(FileStorage::new(root, info)?) as Arc<dyn Storage>))
}

pub fn memory_storage_factory() -> StorageFactory {
    Arc::new(|_, info| Ok(Arc::new(MemoryStorage::new(info.total_length)) as Arc<dyn Storage>))
}

#[cfg(test)]
mod tests;
