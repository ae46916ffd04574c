use super::state::TorrentState;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetainfoError),

    #[error("operation not valid in state {0}")]
    InvalidTorrentState(TorrentState),

    #[error("no file with index {0}")]
    UnknownFile(usize),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("torrent task has stopped")]
    Closed,
}
