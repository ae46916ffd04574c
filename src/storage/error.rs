use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk full")]
    DiskFull,

    #[error("range {offset}+{length} outside of {total} bytes")]
    OutOfBounds { offset: u64, length: u64, total: u64 },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("hashing task failed: {0}")]
    Hashing(String),
}

impl StorageError {
    /// Maps an I/O error, singling out a full disk.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        const ENOSPC: i32 = 28;
        if err.raw_os_error() == Some(ENOSPC) {
            StorageError::DiskFull
        } else {
            StorageError::Io(err)
        }
    }
}
