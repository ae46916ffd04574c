use super::error::PeerError;
use bytes::Bytes;

/// Which pieces a peer holds, in wire order: piece 0 is the high bit of the
/// first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses a bitfield message body. The length must match the piece count
    /// exactly and spare trailing bits must be zero.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        if bytes.len() != piece_count.div_ceil(8) {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield of {} bytes for {} pieces",
                bytes.len(),
                piece_count
            )));
        }
        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        let mut cleared = bf.clone();
        cleared.clear_spare_bits();
        if cleared != bf {
            return Err(PeerError::InvalidMessage("bitfield spare bits set".into()));
        }
        Ok(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.piece_count && (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Indices of the pieces that are set, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if let Some(last) = self.bits.last_mut() {
            *last &= 0xFFu8.checked_shl(spare as u32).unwrap_or(0);
        }
    }
}
