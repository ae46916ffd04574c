//! Per-piece download state for one torrent.
//!
//! The map is the single source of truth shared by the scheduler, which picks
//! requests from it, and by streams, which read from it to decide what is
//! readable. A transition is applied under the write lock and only then
//! announced on the watch channel, so a waiter woken by the announcement
//! always sees the new state.

use crate::peer::Bitfield;
use parking_lot::RwLock;
use std::ops::Range;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceState {
    Missing,
    Requested,
    Verified,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceMapError {
    #[error("piece {0} out of range")]
    OutOfRange(u32),

    #[error("piece {piece}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        piece: u32,
        from: PieceState,
        to: PieceState,
    },
}

pub struct PieceMap {
    states: RwLock<Vec<PieceState>>,
    changes: watch::Sender<u64>,
}

impl PieceMap {
    pub fn new(piece_count: u32) -> Self {
        Self::from_states(vec![PieceState::Missing; piece_count as usize])
    }

    /// Starts from pieces already verified on disk.
    pub fn with_verified(verified: &Bitfield) -> Self {
        Self::from_states(
            (0..verified.len())
                .map(|i| {
                    if verified.has(i) {
                        PieceState::Verified
                    } else {
                        PieceState::Missing
                    }
                })
                .collect(),
        )
    }

    fn from_states(states: Vec<PieceState>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            states: RwLock::new(states),
            changes,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.states.read().len() as u32
    }

    pub fn state(&self, piece: u32) -> Option<PieceState> {
        self.states.read().get(piece as usize).copied()
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.state(piece) == Some(PieceState::Verified)
    }

    /// True when every piece in `range` is verified. An empty range is.
    pub fn all_verified(&self, range: Range<u32>) -> bool {
        let states = self.states.read();
        range
            .into_iter()
            .all(|p| states.get(p as usize) == Some(&PieceState::Verified))
    }

    pub fn verified_count(&self) -> u32 {
        self.states
            .read()
            .iter()
            .filter(|s| **s == PieceState::Verified)
            .count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.states.read().iter().all(|s| *s == PieceState::Verified)
    }

    pub fn snapshot(&self) -> Vec<PieceState> {
        self.states.read().clone()
    }

    /// Verified pieces as a wire bitfield.
    pub fn bitfield(&self) -> Bitfield {
        let states = self.states.read();
        let mut bf = Bitfield::new(states.len());
        for (i, _) in states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceState::Verified)
        {
            bf.set(i);
        }
        bf
    }

    /// Missing -> Requested. Already requested is fine; endgame requests a
    /// piece from several peers.
    pub fn mark_requested(&self, piece: u32) -> Result<(), PieceMapError> {
        self.transition(piece, PieceState::Requested, |from| {
            matches!(from, PieceState::Missing | PieceState::Requested)
        })
    }

    /// Requested -> Verified, once the piece has been hashed and written.
    pub fn mark_verified(&self, piece: u32) -> Result<(), PieceMapError> {
        self.transition(piece, PieceState::Verified, |from| {
            from == PieceState::Requested
        })
    }

    /// Requested -> Missing after a failed hash check.
    pub fn reset(&self, piece: u32) -> Result<(), PieceMapError> {
        self.transition(piece, PieceState::Missing, |from| {
            from == PieceState::Requested
        })
    }

    fn transition(
        &self,
        piece: u32,
        to: PieceState,
        allowed: impl Fn(PieceState) -> bool,
    ) -> Result<(), PieceMapError> {
        {
            let mut states = self.states.write();
            let slot = states
                .get_mut(piece as usize)
                .ok_or(PieceMapError::OutOfRange(piece))?;
            let from = *slot;
            if !allowed(from) {
                return Err(PieceMapError::InvalidTransition { piece, from, to });
            }
            if from == to {
                return Ok(());
            }
            *slot = to;
        }
        self.changes.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Generation counter bumped after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let map = PieceMap::new(3);
        map.mark_requested(1).unwrap();
        map.mark_requested(1).unwrap();
        assert_eq!(map.state(1), Some(PieceState::Requested));
        map.mark_verified(1).unwrap();
        assert!(map.is_verified(1));
        assert_eq!(map.verified_count(), 1);
        assert!(!map.is_complete());
    }

    #[test]
    fn test_verified_is_final() {
        let map = PieceMap::new(2);
        map.mark_requested(0).unwrap();
        map.mark_verified(0).unwrap();

        assert!(map.reset(0).is_err());
        assert!(map.mark_requested(0).is_err());
        assert!(map.mark_verified(0).is_err());
        assert!(map.is_verified(0));
    }

    #[test]
    fn test_reset_only_from_requested() {
        let map = PieceMap::new(2);
        assert_eq!(
            map.reset(0),
            Err(PieceMapError::InvalidTransition {
                piece: 0,
                from: PieceState::Missing,
                to: PieceState::Missing,
            })
        );
        map.mark_requested(0).unwrap();
        map.reset(0).unwrap();
        assert_eq!(map.state(0), Some(PieceState::Missing));
        assert!(map.mark_verified(0).is_err());
        assert_eq!(map.mark_requested(5), Err(PieceMapError::OutOfRange(5)));
    }

    #[test]
    fn test_with_verified_and_bitfield() {
        let mut bf = Bitfield::new(4);
        bf.set(0);
        bf.set(3);
        let map = PieceMap::with_verified(&bf);
        assert!(map.all_verified(0..1));
        assert!(!map.all_verified(0..4));
        assert!(map.all_verified(2..2));
        assert_eq!(map.bitfield(), bf);
    }

    #[tokio::test]
    async fn test_subscribers_see_committed_state() {
        let map = std::sync::Arc::new(PieceMap::new(1));
        let mut rx = map.subscribe();
        let writer = map.clone();
        tokio::spawn(async move {
            writer.mark_requested(0).unwrap();
            writer.mark_verified(0).unwrap();
        });

        while !map.is_verified(0) {
            rx.changed().await.unwrap();
        }
        assert_eq!(map.verified_count(), 1);
    }
}
