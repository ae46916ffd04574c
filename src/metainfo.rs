//! Torrent metadata: `.torrent` files ([BEP-3]) and magnet URIs ([BEP-9], [BEP-53]).
//!
//! [`Metainfo::from_bytes`] validates the piece layout as well as the syntax:
//! a torrent whose piece count does not match its total length, or whose file
//! paths escape the download directory, is rejected up front rather than
//! failing later on disk.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-53]: http://bittorrent.org/beps/bep_0053.html

mod error;
mod info_hash;
mod magnet;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
pub use torrent::{FileEntry, Metainfo, TorrentInfo};
