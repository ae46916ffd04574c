use crate::metainfo::MetainfoError;
use crate::torrent::TorrentId;
use crate::tracker::TrackerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetainfoError),

    #[error("unknown torrent {0}")]
    UnknownTorrent(TorrentId),

    #[error("torrent already added as {0}")]
    DuplicateTorrent(TorrentId),

    #[error("session is not running")]
    NotRunning,

    #[error("session has been shut down")]
    SessionStopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker client error: {0}")]
    Tracker(#[from] TrackerError),
}
