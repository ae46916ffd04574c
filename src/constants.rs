//! Protocol constants and tuning defaults.
//!
//! Defaults follow what mainstream clients (libtorrent, qBittorrent,
//! Transmission) ship with, adjusted where streaming wants lower latency.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-TS0001-";

/// Client name sent in the BEP-10 extension handshake
pub const CLIENT_NAME: &str = "torrent-stream/0.1.0";

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum connected peers per torrent
pub const MAX_PEERS_PER_TORRENT: usize = 50;

/// Upload slots: peers we keep unchoked at once
pub const DEFAULT_UPLOAD_SLOTS: usize = 4;

/// Attempts before a peer candidate is dropped
pub const MAX_PEER_RETRY_ATTEMPTS: u32 = 5;

/// Consecutive failures tolerated per tracker before it counts as exhausted
pub const MAX_TRACKER_FAILURES: u32 = 5;

/// Block requests in flight per peer (our `reqq`)
pub const PIPELINE_DEPTH: usize = 16;

/// Pieces a single peer may be downloading at once
pub const PIECES_PER_PEER: usize = 4;

// ============================================================================
// Piece and block sizes
// ============================================================================

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block request we serve
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Remaining-piece count below which endgame duplication starts
pub const ENDGAME_PIECES_THRESHOLD: u32 = 10;

/// Peers that may hold the same piece during endgame
pub const ENDGAME_DUPLICATES: usize = 2;

/// Upper bound on an info dictionary fetched over ut_metadata
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connect timeout for outbound peers
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Time allowed for the BitTorrent handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence after which a peer is dropped
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(180);

/// An assigned piece not finished within this time goes back to the pool
pub const PIECE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the best-effort `stopped` announce at removal
pub const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Intervals
// ============================================================================

/// Announce interval used until a tracker tells us otherwise
pub const TRACKER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Floor for tracker-provided intervals
pub const TRACKER_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before retrying a tracker that failed
pub const TRACKER_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Base delay for peer reconnect backoff (doubles per attempt)
pub const PEER_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Keep-alive after this much send idleness
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Torrent housekeeping tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Window over which transfer rates are averaged
pub const RATE_CALC_WINDOW: Duration = Duration::from_secs(5);

// ============================================================================
// Streaming
// ============================================================================

/// Pieces prepared from the read position at minimum
pub const MIN_PREPARE_PIECES: u32 = 8;

/// Fraction of a file's pieces prepared ahead of playback
pub const PREPARE_FRACTION: f64 = 0.08;

/// Pieces at the end of the file fetched during preparation
pub const TAIL_PIECES: u32 = 3;

/// Default `read_at` timeout
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Size of chunks yielded by stream readers and HTTP bodies
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;

// ============================================================================
// HTTP endpoint
// ============================================================================

/// Route prefix for served files
pub const VIDEO_ROUTE_PREFIX: &str = "/video/";

/// User agents that expect `200 OK` for partial content
pub const FULL_STATUS_AGENTS: &[&str] = &["Java"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_azureus_style() {
        assert_eq!(CLIENT_PREFIX.len(), 8);
        assert!(CLIENT_PREFIX.starts_with('-') && CLIENT_PREFIX.ends_with('-'));
    }

    #[test]
    fn test_block_fits_request_limit() {
        assert!(BLOCK_SIZE <= MAX_REQUEST_LENGTH);
        assert!(TRACKER_MIN_INTERVAL < TRACKER_ANNOUNCE_INTERVAL);
    }
}
