use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors raised while parsing torrent metadata or magnet URIs.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The field is present but has the wrong type or an impossible value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("piece count {actual} does not match {expected} expected from the total length")]
    PieceCountMismatch { expected: usize, actual: usize },

    #[error("unsafe file path: {0}")]
    UnsafePath(String),

    #[error("invalid info hash")]
    InvalidInfoHash,

    #[error("info dictionary does not hash to the expected info hash")]
    InfoHashMismatch,

    #[error("invalid magnet link: {0}")]
    InvalidMagnetLink(String),
}
