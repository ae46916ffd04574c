//! Piece selection.
//!
//! The scheduler is a plain state machine owned by the torrent task. It keeps
//! two things the piece map does not: how many connected peers advertise each
//! piece, and which peers currently hold an outstanding request for it. It
//! never changes the piece map itself; the caller marks picked pieces as
//! requested.
//!
//! Selection order for one peer:
//!
//! 1. Pieces inside the merged priority windows of attached streams, in
//!    ascending index order.
//! 2. Every other piece the peer has, rarest first, ties broken by index.
//!
//! Outside endgame a piece is held by at most one peer. Once fewer than
//! `endgame_threshold` pieces remain unverified, up to `endgame_duplicates`
//! peers may race for the same piece. A peer is never handed a piece it
//! already holds.

use crate::peer::Bitfield;
use crate::piece_map::PieceState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Inflight {
    peer: SocketAddr,
    since: Instant,
}

#[derive(Debug)]
pub struct Scheduler {
    availability: Vec<u32>,
    inflight: HashMap<u32, Vec<Inflight>>,
    endgame_threshold: u32,
    endgame_duplicates: usize,
}

impl Scheduler {
    pub fn new(piece_count: u32, endgame_threshold: u32, endgame_duplicates: usize) -> Self {
        Self {
            availability: vec![0; piece_count as usize],
            inflight: HashMap::new(),
            endgame_threshold,
            endgame_duplicates: endgame_duplicates.max(1),
        }
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    pub fn peer_has(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    pub fn peer_bitfield(&mut self, has: &Bitfield) {
        for piece in has.iter() {
            self.peer_has(piece as u32);
        }
    }

    /// Forgets a disconnected peer. Returns the pieces it was holding.
    pub fn peer_gone(&mut self, peer: SocketAddr, has: &Bitfield) -> Vec<u32> {
        for piece in has.iter() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }

        self.release_peer(peer)
    }

    /// Releases every piece `peer` holds. Returns them in ascending order.
    pub fn release_peer(&mut self, peer: SocketAddr) -> Vec<u32> {
        let mut released = Vec::new();
        self.inflight.retain(|&piece, holders| {
            let before = holders.len();
            holders.retain(|h| h.peer != peer);
            if holders.len() != before {
                released.push(piece);
            }
            !holders.is_empty()
        });
        released.sort_unstable();
        released
    }

    pub fn is_endgame(&self, states: &[PieceState]) -> bool {
        let remaining = states
            .iter()
            .filter(|s| **s != PieceState::Verified)
            .count() as u32;
        remaining > 0 && remaining < self.endgame_threshold
    }

    pub fn holders(&self, piece: u32) -> Vec<SocketAddr> {
        self.inflight
            .get(&piece)
            .map(|h| h.iter().map(|i| i.peer).collect())
            .unwrap_or_default()
    }

    pub fn assigned_to(&self, peer: SocketAddr) -> usize {
        self.inflight
            .values()
            .filter(|holders| holders.iter().any(|h| h.peer == peer))
            .count()
    }

    /// Picks up to `max` pieces for `peer` and records them as in flight.
    pub fn pick(
        &mut self,
        peer: SocketAddr,
        has: &Bitfield,
        states: &[PieceState],
        windows: &[Range<u32>],
        max: usize,
        now: Instant,
    ) -> Vec<u32> {
        if max == 0 {
            return Vec::new();
        }

        let limit = if self.is_endgame(states) {
            self.endgame_duplicates
        } else {
            1
        };
        let eligible = |piece: u32, inflight: &HashMap<u32, Vec<Inflight>>| {
            let holders = inflight.get(&piece).map(Vec::as_slice).unwrap_or_default();
            has.has(piece as usize)
                && states.get(piece as usize).is_some_and(|s| *s != PieceState::Verified)
                && holders.len() < limit
                && !holders.iter().any(|h| h.peer == peer)
        };

        let windows = merge_windows(windows);
        let mut picked = Vec::with_capacity(max);

        for window in &windows {
            for piece in window.clone() {
                if picked.len() == max {
                    break;
                }
                if eligible(piece, &self.inflight) {
                    picked.push(piece);
                }
            }
        }

        if picked.len() < max {
            let in_window = |piece: u32| windows.iter().any(|w| w.contains(&piece));
            let mut rest: Vec<u32> = has
                .iter()
                .map(|p| p as u32)
                .filter(|&p| !in_window(p) && eligible(p, &self.inflight))
                .collect();
            rest.sort_by_key(|&p| (self.availability(p), p));
            picked.extend(rest.into_iter().take(max - picked.len()));
        }

        for &piece in &picked {
            self.inflight
                .entry(piece)
                .or_default()
                .push(Inflight { peer, since: now });
        }
        picked
    }

    /// Clears a verified piece. Returns the peers still holding duplicate
    /// requests for it, which should be cancelled.
    pub fn complete(&mut self, piece: u32, by: SocketAddr) -> Vec<SocketAddr> {
        self.inflight
            .remove(&piece)
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.peer)
            .filter(|p| *p != by)
            .collect()
    }

    /// Returns a piece to the pool for `peer` (rejected, failed, or given up).
    pub fn release(&mut self, piece: u32, peer: SocketAddr) {
        if let Some(holders) = self.inflight.get_mut(&piece) {
            holders.retain(|h| h.peer != peer);
            if holders.is_empty() {
                self.inflight.remove(&piece);
            }
        }
    }

    /// Releases every assignment on a piece that lies in `closed` but in none
    /// of `kept`. Returns the released `(piece, peer)` pairs.
    pub fn release_uncovered(
        &mut self,
        closed: &[Range<u32>],
        kept: &[Range<u32>],
    ) -> Vec<(u32, SocketAddr)> {
        let covered = |windows: &[Range<u32>], piece: u32| windows.iter().any(|w| w.contains(&piece));
        let mut released = Vec::new();
        self.inflight.retain(|&piece, holders| {
            if !covered(closed, piece) || covered(kept, piece) {
                return true;
            }
            released.extend(holders.drain(..).map(|h| (piece, h.peer)));
            false
        });
        released.sort_unstable();
        released
    }

    /// Releases and returns every assignment older than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(u32, SocketAddr)> {
        let mut expired = Vec::new();
        self.inflight.retain(|&piece, holders| {
            holders.retain(|h| {
                let stale = now.saturating_duration_since(h.since) >= timeout;
                if stale {
                    expired.push((piece, h.peer));
                }
                !stale
            });
            !holders.is_empty()
        });
        expired.sort_unstable();
        expired
    }
}

/// Sorts and coalesces overlapping or adjacent windows so that two streams
/// watching the same region ask for each piece once.
pub fn merge_windows(windows: &[Range<u32>]) -> Vec<Range<u32>> {
    let mut sorted: Vec<Range<u32>> = windows.iter().filter(|w| !w.is_empty()).cloned().collect();
    sorted.sort_by_key(|w| w.start);

    let mut merged: Vec<Range<u32>> = Vec::with_capacity(sorted.len());
    for window in sorted {
        match merged.last_mut() {
            Some(last) if window.start <= last.end => last.end = last.end.max(window.end),
            _ => merged.push(window),
        }
    }
    merged
}
