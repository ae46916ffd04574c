use crate::storage::StorageError;
use crate::torrent::TorrentState;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("timed out waiting for data")]
    StreamTimeout,

    #[error("stream stopped")]
    StreamStopped,

    #[error("torrent is {0}")]
    InvalidTorrentState(TorrentState),

    #[error("no file with index {0}")]
    UnknownFile(usize),

    #[error("offset {offset} is past the end of the file ({length} bytes)")]
    OutOfBounds { offset: u64, length: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        let kind = match &e {
            StreamError::StreamTimeout => io::ErrorKind::TimedOut,
            StreamError::StreamStopped => io::ErrorKind::BrokenPipe,
            StreamError::OutOfBounds { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
