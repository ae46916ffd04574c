use super::error::StorageError;
use super::Storage;
use crate::metainfo::TorrentInfo;
use crate::peer::Bitfield;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

/// Hashes `data` off the async runtime and compares it to `expected`.
pub async fn hash_matches(data: Bytes, expected: [u8; 20]) -> Result<bool, StorageError> {
    tokio::task::spawn_blocking(move || <[u8; 20]>::from(Sha1::digest(&data)) == expected)
        .await
        .map_err(|e| StorageError::Hashing(e.to_string()))
}

/// Checks every piece already on disk. Pieces that cannot be read count as
/// missing.
pub async fn verify_existing(
    storage: &dyn Storage,
    info: &TorrentInfo,
) -> Result<Bitfield, StorageError> {
    let mut verified = Bitfield::new(info.pieces.len());
    for piece in 0..info.piece_count() {
        let data = match storage
            .read(info.piece_offset(piece), info.piece_size(piece) as usize)
            .await
        {
            Ok(data) => data,
            Err(StorageError::Io(_)) => continue,
            Err(e) => return Err(e),
        };
        if hash_matches(data, info.pieces[piece as usize]).await? {
            verified.set(piece as usize);
        }
    }
    debug!(
        verified = verified.count(),
        total = info.piece_count(),
        "checked existing data"
    );
    Ok(verified)
}
