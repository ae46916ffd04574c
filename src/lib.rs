//! torrent-stream - BitTorrent downloads that can be watched while they
//! download.
//!
//! A [`Session`] owns torrents created from magnet links or `.torrent`
//! files. Each torrent downloads rarest-first until a [`TorrentStream`] is
//! opened on one of its files; the stream then pulls the pieces under its
//! read position to the front of the queue and blocks readers until those
//! bytes are verified. [`StreamServer`] exposes streams to media players
//! over HTTP with byte-range support.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - BEP-3/9 torrent metainfo and BEP-53 magnet links
//! - [`peer`] - BEP-3/6/10/20 peer wire protocol
//! - [`tracker`] - BEP-3/15 HTTP and UDP tracker announces
//! - [`storage`] - Piece data on disk or in memory
//! - [`piece_map`] - Per-piece download state
//! - [`scheduler`] - Piece selection with streaming priority windows
//! - [`torrent`] - Torrent state machine and handles
//! - [`stream`] - Seekable reads over a downloading file
//! - [`server`] - HTTP range-serving endpoint
//! - [`session`] - Torrent registry and inbound listener

pub mod bencode;
pub mod config;
pub mod constants;
pub mod events;
pub mod metainfo;
pub mod peer;
pub mod piece_map;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;
pub mod stream;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ServerConfig, SessionConfig, StreamConfig};
pub use events::{StreamEvent, TorrentEvent};
pub use metainfo::{FileEntry, InfoHash, MagnetLink, Metainfo, MetainfoError};
pub use peer::{Bitfield, PeerConnection, PeerError, PeerId};
pub use piece_map::{PieceMap, PieceMapError, PieceState};
pub use server::{RangeError, ServerError, StreamServer};
pub use session::{Session, SessionError, SessionState, TorrentSource};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError, StorageFactory};
pub use stream::{StreamError, StreamState, TorrentStream};
pub use torrent::{Health, TorrentError, TorrentHandle, TorrentId, TorrentState, TorrentStatus};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, Announcer, TrackerClient, TrackerError, TrackerEvent,
};
