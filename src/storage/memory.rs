use super::error::StorageError;
use super::Storage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

/// Content held in memory, for streaming sessions that should leave nothing
/// on disk.
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(total_length: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; total_length as usize]),
        }
    }

    fn check(&self, offset: u64, length: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let total = self.data.read().len() as u64;
        let end = offset + length as u64;
        if end > total {
            return Err(StorageError::OutOfBounds {
                offset,
                length: length as u64,
                total,
            });
        }
        Ok(offset as usize..end as usize)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn allocate(&self) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let range = self.check(offset, length)?;
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let range = self.check(offset, data.len())?;
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
