//! Peer wire protocol ([BEP-3]) with the fast extension ([BEP-6]), the
//! extension protocol ([BEP-10]) and metadata exchange ([BEP-9]).
//!
//! A [`PeerConnection`] owns one TCP session after the handshake has
//! succeeded. It tracks choke and interest flags and byte counts but makes no
//! scheduling decisions; the torrent's peer worker drives it.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

mod bitfield;
mod connection;
mod error;
mod extension;
mod message;
mod metadata;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use connection::{PeerConnection, PeerTimeouts};
pub use error::PeerError;
pub use extension::{ExtensionHandshake, UT_METADATA, UT_METADATA_LOCAL_ID};
pub use message::{BlockRef, Handshake, Message, MessageId, EXTENDED_HANDSHAKE_ID};
pub use metadata::{metadata_piece_count, MetadataMessage, MetadataMessageType, METADATA_PIECE_SIZE};
pub use peer_id::PeerId;
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
