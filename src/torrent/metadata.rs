use crate::metainfo::{InfoHash, Metainfo, MetainfoError};
use crate::peer::{metadata_piece_count, METADATA_PIECE_SIZE};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Collects the info dictionary of a magnet torrent from ut_metadata pieces.
pub(crate) struct MetadataAssembler {
    info_hash: InfoHash,
    size: usize,
    pieces: Vec<Option<Bytes>>,
    requested: HashMap<u32, (SocketAddr, Instant)>,
}

impl MetadataAssembler {
    /// `None` when the advertised size is zero or beyond `max_size`.
    pub fn new(info_hash: InfoHash, size: usize, max_size: usize) -> Option<Self> {
        if size == 0 || size > max_size {
            return None;
        }
        Some(Self {
            info_hash,
            size,
            pieces: vec![None; metadata_piece_count(size)],
            requested: HashMap::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Missing pieces nobody is fetching, assigned to `peer`.
    pub fn next_requests(&mut self, peer: SocketAddr, now: Instant, max: usize) -> Vec<u32> {
        let mut picked = Vec::new();
        for (index, piece) in self.pieces.iter().enumerate() {
            if picked.len() == max {
                break;
            }
            let index = index as u32;
            let stale = self
                .requested
                .get(&index)
                .is_none_or(|(_, at)| now.saturating_duration_since(*at) >= REQUEST_TIMEOUT);
            if piece.is_none() && stale {
                picked.push(index);
            }
        }
        for &index in &picked {
            self.requested.insert(index, (peer, now));
        }
        picked
    }

    fn expected_len(&self, piece: u32) -> usize {
        let start = piece as usize * METADATA_PIECE_SIZE;
        METADATA_PIECE_SIZE.min(self.size - start)
    }

    /// Stores a piece. Returns `false` for pieces that do not fit.
    pub fn receive(&mut self, piece: u32, data: Bytes) -> bool {
        if piece as usize >= self.pieces.len() || data.len() != self.expected_len(piece) {
            return false;
        }
        self.requested.remove(&piece);
        self.pieces[piece as usize] = Some(data);
        true
    }

    pub fn rejected(&mut self, piece: u32) {
        self.requested.remove(&piece);
    }

    pub fn peer_gone(&mut self, peer: SocketAddr) {
        self.requested.retain(|_, (holder, _)| *holder != peer);
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Joins the pieces and checks them against the info hash.
    pub fn finish(&self, trackers: Vec<String>) -> Result<Metainfo, MetainfoError> {
        let mut raw = BytesMut::with_capacity(self.size);
        for piece in self.pieces.iter().flatten() {
            raw.extend_from_slice(piece);
        }
        Metainfo::from_info_bytes(raw.freeze(), self.info_hash, trackers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;
    use crate::testing::{content, single_file_info};

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6881))
    }

    #[test]
    fn test_assemble_and_verify() {
        let data = content(1 << 20);
        let raw = Bytes::from(encode(&single_file_info("big.bin", 1024, &data)));
        assert!(raw.len() > METADATA_PIECE_SIZE);
        let info_hash = InfoHash::of_info(&raw);

        let mut assembler = MetadataAssembler::new(info_hash, raw.len(), 1 << 24).unwrap();
        let now = Instant::now();
        let pieces = assembler.next_requests(peer(), now, 100);
        assert_eq!(pieces.len(), metadata_piece_count(raw.len()));
        assert!(assembler.next_requests(peer(), now, 100).is_empty());

        assert!(!assembler.receive(0, raw.slice(0..10)));
        for piece in pieces {
            let start = piece as usize * METADATA_PIECE_SIZE;
            let end = (start + METADATA_PIECE_SIZE).min(raw.len());
            assert!(assembler.receive(piece, raw.slice(start..end)));
        }
        assert!(assembler.is_complete());

        let metainfo = assembler.finish(vec![]).unwrap();
        assert_eq!(metainfo.info.name, "big.bin");
        assert_eq!(metainfo.info_hash, info_hash);
    }

    #[test]
    fn test_wrong_hash_is_rejected() {
        let raw = Bytes::from(encode(&single_file_info("a.bin", 16384, &content(100))));
        let mut assembler = MetadataAssembler::new(InfoHash([0; 20]), raw.len(), 1 << 24).unwrap();
        assembler.next_requests(peer(), Instant::now(), 1);
        assert!(assembler.receive(0, raw.clone()));
        assert!(matches!(
            assembler.finish(vec![]),
            Err(MetainfoError::InfoHashMismatch)
        ));
    }

    #[test]
    fn test_rejected_pieces_are_requested_again() {
        let mut assembler = MetadataAssembler::new(InfoHash([0; 20]), 100, 1 << 24).unwrap();
        let now = Instant::now();
        assert_eq!(assembler.next_requests(peer(), now, 1), vec![0]);
        assembler.rejected(0);
        assert_eq!(assembler.next_requests(peer(), now, 1), vec![0]);
        assert!(MetadataAssembler::new(InfoHash([0; 20]), 0, 1 << 24).is_none());
    }
}
